//! Trigger arming and overlap-aware dispatch.
//!
//! All bookkeeping lives in one [`SchedulerState`] behind a `std::sync::Mutex`.
//! The lock is only ever held for synchronous sections, never across an
//! `.await`, so every transition (check running count, bump it, swap a
//! trigger) is atomic with respect to the others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::runner::Runner;
use crate::store::JobStore;
use crate::trigger::{self, Trigger, TriggerHandle};
use crate::types::{Job, OverlapPolicy};

/// Per-instance scheduler bookkeeping.
#[derive(Default)]
pub struct SchedulerState {
    /// Armed trigger per job id.
    scheduled: HashMap<String, TriggerHandle>,
    /// Active run count per job id. A job is running while its count is > 0.
    running: HashMap<String, usize>,
}

struct Inner {
    runner: Runner,
    state: Mutex<SchedulerState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Outcome of an overlap-aware dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Started { run_id: String },
    /// A previous run was active under the `skip` policy.
    Skipped { run_id: String },
}

impl Dispatch {
    pub fn run_id(&self) -> &str {
        match self {
            Dispatch::Started { run_id } | Dispatch::Skipped { run_id } => run_id,
        }
    }
}

/// Releases one slot of a job's running count when dropped.
struct RunningGuard {
    inner: Arc<Inner>,
    job_id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        if let Some(count) = state.running.get_mut(&self.job_id) {
            *count -= 1;
            if *count == 0 {
                state.running.remove(&self.job_id);
            }
        }
    }
}

/// Cheaply clonable scheduler handle.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(runner: Runner) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    pub fn runner(&self) -> &Runner {
        &self.inner.runner
    }

    pub fn store(&self) -> &Arc<JobStore> {
        self.inner.runner.store()
    }

    /// Re-arm every job from the store. Jobs with an unusable schedule are
    /// logged and left unarmed.
    pub fn start(&self) -> Result<()> {
        self.cancel_all();
        let jobs = self.store().list_jobs()?;
        for job in &jobs {
            if let Err(e) = self.arm(job) {
                warn!(job_id = %job.id, name = %job.name, "job not armed: {e}");
            }
        }
        let armed = self.inner.state().scheduled.len();
        info!(jobs = jobs.len(), armed, "scheduler started");
        Ok(())
    }

    /// Cancel every trigger. Runs already in flight keep going and are still
    /// recorded when they exit.
    pub fn stop(&self) {
        self.cancel_all();
        info!("scheduler stopped");
    }

    /// Replace the trigger for `job` with one built from its current
    /// definition.
    pub fn upsert(&self, job: &Job) -> Result<()> {
        self.remove(&job.id);
        self.arm(job)
    }

    pub fn remove(&self, job_id: &str) {
        let handle = self.inner.state().scheduled.remove(job_id);
        if let Some(handle) = handle {
            handle.cancel();
            debug!(job_id = %job_id, "trigger cancelled");
        }
    }

    /// Start `job` now through the same overlap check a trigger uses.
    pub fn run_now(&self, job: &Job) -> Result<Dispatch> {
        info!(job_id = %job.id, name = %job.name, "manual run requested");
        self.dispatch(job)
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.active_runs(job_id) > 0
    }

    pub fn active_runs(&self, job_id: &str) -> usize {
        self.inner
            .state()
            .running
            .get(job_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_scheduled(&self, job_id: &str) -> bool {
        self.inner.state().scheduled.contains_key(job_id)
    }

    fn cancel_all(&self) {
        let handles: Vec<TriggerHandle> = self
            .inner
            .state()
            .scheduled
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.cancel();
        }
    }

    /// Arm a trigger for `job` and persist its `next_run_at`. Paused jobs and
    /// schedules with no future occurrence persist `NULL` and stay unarmed.
    fn arm(&self, job: &Job) -> Result<()> {
        if job.paused {
            self.store().update_next_run_at(&job.id, None)?;
            return Ok(());
        }
        let trigger = match Trigger::for_job(job) {
            Ok(trigger) => trigger,
            Err(e) => {
                self.store().update_next_run_at(&job.id, None)?;
                return Err(e);
            }
        };
        let Some(next) = trigger.next_after(Utc::now()) else {
            self.store().update_next_run_at(&job.id, None)?;
            debug!(job_id = %job.id, name = %job.name, "no future occurrence, not armed");
            return Ok(());
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let job_id = job.id.clone();
        let handle = trigger::arm(trigger, move |at| {
            if let Some(inner) = weak.upgrade() {
                Scheduler { inner }.fire(&job_id, at);
            }
        });

        let previous = self.inner.state().scheduled.insert(job.id.clone(), handle);
        if let Some(previous) = previous {
            previous.cancel();
        }
        self.store().update_next_run_at(&job.id, Some(next))?;
        info!(job_id = %job.id, name = %job.name, next_run_at = %next, "job armed");
        Ok(())
    }

    fn fire(&self, job_id: &str, at: DateTime<Utc>) {
        let job = match self.store().get_job(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %job_id, "armed job vanished, disarming");
                self.remove(job_id);
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, "failed to load job for trigger: {e}");
                return;
            }
        };
        if job.paused {
            self.remove(job_id);
            return;
        }

        info!(job_id = %job.id, name = %job.name, occurrence = %at, "trigger fired");
        if let Err(e) = self.dispatch(&job) {
            error!(job_id = %job.id, name = %job.name, "dispatch failed: {e}");
        }
        self.refresh_next_run(job_id);
    }

    fn dispatch(&self, job: &Job) -> Result<Dispatch> {
        let guard = {
            let mut state = self.inner.state();
            let active = state.running.get(&job.id).copied().unwrap_or(0);
            if active > 0 && job.overlap_policy == OverlapPolicy::Skip {
                None
            } else {
                *state.running.entry(job.id.clone()).or_insert(0) += 1;
                Some(RunningGuard {
                    inner: Arc::clone(&self.inner),
                    job_id: job.id.clone(),
                })
            }
        };

        let Some(guard) = guard else {
            let run_id = self.inner.runner.record_skipped_run(job)?;
            return Ok(Dispatch::Skipped { run_id });
        };

        // On Err the guard drops here and releases the slot.
        let handle = self.inner.runner.run_job(job)?;
        let run_id = handle.run_id.clone();

        let scheduler = self.clone();
        let job_id = job.id.clone();
        let settled_run = run_id.clone();
        tokio::spawn(async move {
            let completion = handle.completion.await;
            drop(guard);
            if let Err(e) = completion {
                error!(job_id = %job_id, run_id = %settled_run, "exit watcher failed: {e}");
            }
            scheduler.refresh_next_run(&job_id);
        });

        Ok(Dispatch::Started { run_id })
    }

    /// Persist the next occurrence of the armed trigger. An exhausted trigger
    /// is cancelled and `next_run_at` cleared; unarmed jobs are left alone.
    /// The write happens under the state lock so it cannot land after a
    /// concurrent `remove`.
    fn refresh_next_run(&self, job_id: &str) {
        let mut state = self.inner.state();
        let next = match state.scheduled.get(job_id).map(TriggerHandle::next_run) {
            None => return,
            Some(Some(next)) => Some(next),
            Some(None) => {
                if let Some(handle) = state.scheduled.remove(job_id) {
                    handle.cancel();
                }
                None
            }
        };
        if let Err(e) = self.store().update_next_run_at(job_id, next) {
            error!(job_id = %job_id, "failed to persist next_run_at: {e}");
        }
    }
}
