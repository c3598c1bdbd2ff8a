//! Job control surface: everything a transport needs, in one place.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tickd_core::{EventKind, EventLog};
use tracing::{error, info};

use crate::error::{Result, SchedulerError};
use crate::jobfile::serialize_job_file;
use crate::jobs::{self, JobInput};
use crate::process::{send_signal, ProcessSignal};
use crate::scheduler::{Dispatch, Scheduler};
use crate::store::JobStore;
use crate::sync::{ApplySummary, JobFileSync};
use crate::types::{Job, Run, RunStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertOutcome {
    pub job: Job,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStarted {
    pub job_id: String,
    pub run_id: String,
    /// True when the overlap policy recorded a skipped run instead.
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogs {
    pub run_id: String,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
}

pub struct JobControl {
    store: Arc<JobStore>,
    scheduler: Scheduler,
    sync: Arc<JobFileSync>,
    events: Arc<EventLog>,
    /// Mirror every mutation into the job file.
    write_back: bool,
}

impl JobControl {
    pub fn new(
        scheduler: Scheduler,
        sync: Arc<JobFileSync>,
        events: Arc<EventLog>,
        write_back: bool,
    ) -> Self {
        Self {
            store: Arc::clone(scheduler.store()),
            scheduler,
            sync,
            events,
            write_back,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn upsert_job(&self, input: &JobInput) -> Result<UpsertOutcome> {
        let (job, created) = jobs::upsert_job(&self.store, &self.events, input, None)?;
        self.scheduler.upsert(&job)?;
        let job = self.reload(job)?;
        self.write_back();
        Ok(UpsertOutcome { job, created })
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        self.store.list_jobs()
    }

    pub fn get_job(&self, name: &str) -> Result<Job> {
        self.store.require_job_by_name(name)
    }

    pub fn pause(&self, name: &str) -> Result<Job> {
        // Disarm first so an in-flight trigger cannot restore next_run_at.
        let current = self.store.require_job_by_name(name)?;
        self.scheduler.remove(&current.id);
        let job = self.store.set_paused(name, true)?;
        self.write_back();
        self.emit(EventKind::JobPaused, &job);
        info!(job_id = %job.id, name = %job.name, "job paused");
        Ok(job)
    }

    pub fn resume(&self, name: &str) -> Result<Job> {
        let job = self.store.set_paused(name, false)?;
        self.scheduler.upsert(&job)?;
        let job = self.reload(job)?;
        self.write_back();
        self.emit(EventKind::JobResumed, &job);
        info!(job_id = %job.id, name = %job.name, "job resumed");
        Ok(job)
    }

    /// Drop the job's run history and re-arm it from scratch.
    pub fn reset(&self, name: &str) -> Result<Job> {
        let job = self.store.reset_job(name)?;
        self.scheduler.upsert(&job)?;
        let job = self.reload(job)?;
        self.write_back();
        self.emit(EventKind::JobReset, &job);
        info!(job_id = %job.id, name = %job.name, "job reset");
        Ok(job)
    }

    /// Delete the job and its runs. Returns the deleted job's id.
    pub fn delete(&self, name: &str) -> Result<String> {
        let job_id = jobs::delete_job_by_name(&self.store, &self.events, name)?.ok_or_else(|| {
            SchedulerError::JobNotFound {
                name: name.to_string(),
            }
        })?;
        self.scheduler.remove(&job_id);
        self.write_back();
        info!(job_id = %job_id, name = %name, "job deleted");
        Ok(job_id)
    }

    pub fn run_now(&self, name: &str) -> Result<RunStarted> {
        let job = self.store.require_job_by_name(name)?;
        let dispatch = self.scheduler.run_now(&job)?;
        Ok(RunStarted {
            job_id: job.id,
            run_id: dispatch.run_id().to_string(),
            skipped: matches!(dispatch, Dispatch::Skipped { .. }),
        })
    }

    /// SIGTERM the job's latest run. Returns its run id.
    pub fn stop(&self, name: &str) -> Result<String> {
        self.signal_latest(name, ProcessSignal::Terminate)
    }

    /// SIGKILL the job's latest run. Returns its run id.
    pub fn kill(&self, name: &str) -> Result<String> {
        self.signal_latest(name, ProcessSignal::Kill)
    }

    fn signal_latest(&self, name: &str, signal: ProcessSignal) -> Result<String> {
        let job = self.store.require_job_by_name(name)?;
        let not_running = || SchedulerError::RunNotRunning {
            name: name.to_string(),
        };
        let run = self.store.latest_run(&job.id)?.ok_or_else(not_running)?;
        if run.status != RunStatus::Running {
            return Err(not_running());
        }
        let pid = run.pid.ok_or_else(not_running)?;

        send_signal(pid, signal).map_err(|e| SchedulerError::SignalFailed {
            pid,
            reason: e.to_string(),
        })?;
        info!(job_id = %job.id, run_id = %run.id, pid, ?signal, "signal sent");
        Ok(run.id)
    }

    pub fn list_runs(&self, name: &str, limit: usize) -> Result<Vec<Run>> {
        let job = self.store.require_job_by_name(name)?;
        self.store.list_runs(&job.id, limit)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Run> {
        self.store
            .get_run(run_id)?
            .ok_or_else(|| SchedulerError::RunNotFound {
                id: run_id.to_string(),
            })
    }

    pub fn run_logs(&self, run_id: &str) -> Result<RunLogs> {
        let run = self.get_run(run_id)?;
        Ok(RunLogs {
            run_id: run.id,
            stdout_path: run.stdout_path,
            stderr_path: run.stderr_path,
        })
    }

    /// Render the store as a job file. The file on disk is refreshed too.
    pub fn export(&self) -> Result<String> {
        let text = serialize_job_file(&self.store.list_jobs()?)?;
        self.sync.write_from_db()?;
        Ok(text)
    }

    /// Replace the job set with the contents of `text`.
    pub fn import(&self, text: &str) -> Result<ApplySummary> {
        self.sync
            .apply_from_text(text)
            .map_err(|e| SchedulerError::ImportFailed(e.to_string()))
    }

    fn reload(&self, job: Job) -> Result<Job> {
        Ok(self.store.get_job(&job.id)?.unwrap_or(job))
    }

    fn emit(&self, kind: EventKind, job: &Job) {
        self.events
            .emit(kind, json!({ "jobId": job.id, "name": job.name }));
    }

    /// The store is authoritative; a failed file write is logged, not
    /// returned.
    fn write_back(&self) {
        if !self.write_back {
            return;
        }
        if let Err(e) = self.sync.write_from_db() {
            error!(path = %self.sync.path().display(), "job file write-back failed: {e}");
        }
    }
}
