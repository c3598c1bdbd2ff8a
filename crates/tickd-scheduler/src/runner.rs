use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::json;
use tickd_core::{EventKind, EventLog, Paths, RunOutputPaths};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::process::{ExitOutcome, SpawnRequest, SpawnedProcess, Spawner};
use crate::store::{JobStore, RunCompletion};
use crate::types::{now_timestamp, Job, RunStatus};

/// A started run. `completion` resolves with the final status once the exit
/// has been persisted.
pub struct RunHandle {
    pub run_id: String,
    pub completion: JoinHandle<RunStatus>,
}

/// Turns a job into a Run row plus a process.
pub struct Runner {
    store: Arc<JobStore>,
    events: Arc<EventLog>,
    paths: Paths,
    spawner: Arc<dyn Spawner>,
}

impl Runner {
    pub fn new(
        store: Arc<JobStore>,
        events: Arc<EventLog>,
        paths: Paths,
        spawner: Arc<dyn Spawner>,
    ) -> Self {
        Self {
            store,
            events,
            paths,
            spawner,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    /// Start one run of `job`.
    ///
    /// A spawn failure is not an `Err`: the run is recorded as `failed` and
    /// the handle resolves immediately. `Err` means the store itself failed.
    /// Must be called from within a tokio runtime.
    pub fn run_job(&self, job: &Job) -> Result<RunHandle> {
        let run_id = Uuid::now_v7().to_string();
        let started_at = now_timestamp();
        let outputs = self.paths.run_output_paths(&job.id, &run_id)?;

        self.store.insert_running_run(
            &run_id,
            &job.id,
            &started_at,
            &outputs.stdout.to_string_lossy(),
            &outputs.stderr.to_string_lossy(),
        )?;
        self.events.emit(
            EventKind::RunStarted,
            json!({ "jobId": job.id, "runId": run_id, "name": job.name }),
        );
        self.store.touch_last_run_at(&job.id, &started_at)?;

        let spawned = match self.start_process(job, &outputs) {
            Ok(spawned) => spawned,
            Err(e) => {
                let message = e.to_string();
                warn!(job_id = %job.id, run_id = %run_id, name = %job.name, "spawn failed: {message}");
                self.store.fail_run(&run_id, &message)?;
                self.events.emit(
                    EventKind::RunFailed,
                    json!({
                        "jobId": job.id,
                        "runId": run_id,
                        "name": job.name,
                        "status": RunStatus::Failed,
                        "error": message,
                    }),
                );
                return Ok(RunHandle {
                    run_id,
                    completion: tokio::spawn(async { RunStatus::Failed }),
                });
            }
        };

        if let Err(e) = self.store.set_run_pid(&run_id, spawned.pid) {
            error!(job_id = %job.id, run_id = %run_id, pid = spawned.pid, "failed to record pid: {e}");
        }
        info!(job_id = %job.id, run_id = %run_id, name = %job.name, pid = spawned.pid, "run started");

        let completion = tokio::spawn(watch_exit(
            Arc::clone(&self.store),
            Arc::clone(&self.events),
            job.clone(),
            run_id.clone(),
            spawned.exit,
        ));
        Ok(RunHandle { run_id, completion })
    }

    /// Output handles live only as long as this call; the spawner moves them
    /// into the child's stdio, and on error they drop here.
    fn start_process(&self, job: &Job, outputs: &RunOutputPaths) -> io::Result<SpawnedProcess> {
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&outputs.stdout)?;
        let stderr = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&outputs.stderr)?;
        self.spawner.spawn(SpawnRequest {
            argv: job.command.clone(),
            cwd: job.cwd.as_ref().map(PathBuf::from),
            env: job.env.clone(),
            timeout: job.timeout_ms.map(Duration::from_millis),
            stdout,
            stderr,
        })
    }

    /// Record a `skipped` run for `job`. Returns the run id.
    pub fn record_skipped_run(&self, job: &Job) -> Result<String> {
        let run_id = Uuid::now_v7().to_string();
        self.store
            .insert_skipped_run(&run_id, &job.id, &now_timestamp())?;
        self.events.emit(
            EventKind::RunSkipped,
            json!({ "jobId": job.id, "runId": run_id, "name": job.name }),
        );
        warn!(job_id = %job.id, run_id = %run_id, name = %job.name, "run skipped: previous run still active");
        Ok(run_id)
    }
}

/// `killed` if a signal ended it, `success` on exit 0, `failed` otherwise.
pub fn classify(outcome: &ExitOutcome) -> RunStatus {
    if outcome.signal.is_some() {
        RunStatus::Killed
    } else if outcome.exit_code == Some(0) && outcome.error.is_none() {
        RunStatus::Success
    } else {
        RunStatus::Failed
    }
}

async fn watch_exit(
    store: Arc<JobStore>,
    events: Arc<EventLog>,
    job: Job,
    run_id: String,
    exit: BoxFuture<'static, ExitOutcome>,
) -> RunStatus {
    let outcome = exit.await;
    let status = classify(&outcome);
    let completion = RunCompletion {
        status,
        exit_code: outcome.exit_code,
        signal: outcome.signal.clone(),
        error_message: outcome.error.clone(),
    };

    match store.finish_run(&run_id, &completion) {
        Ok(true) => {
            let kind = match status {
                RunStatus::Success => EventKind::RunFinished,
                RunStatus::Killed => EventKind::RunKilled,
                _ => EventKind::RunFailed,
            };
            events.emit(
                kind,
                json!({
                    "jobId": job.id,
                    "runId": run_id,
                    "name": job.name,
                    "status": status,
                    "exitCode": outcome.exit_code,
                    "signal": outcome.signal,
                }),
            );
            info!(
                job_id = %job.id,
                run_id = %run_id,
                name = %job.name,
                %status,
                exit_code = ?outcome.exit_code,
                "run finished"
            );
        }
        Ok(false) => {
            warn!(job_id = %job.id, run_id = %run_id, "run already terminal, exit not recorded");
        }
        Err(e) => {
            error!(job_id = %job.id, run_id = %run_id, "failed to record run exit: {e}");
        }
    }
    status
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use futures_util::future::FutureExt;
    use tokio::sync::oneshot;

    use super::*;
    use crate::store::tests::{cron_job, memory_store};

    /// Spawner whose children exit only when the test says so.
    #[derive(Default)]
    pub(crate) struct FakeSpawner {
        next_pid: Mutex<u32>,
        exits: Mutex<Vec<(u32, oneshot::Sender<ExitOutcome>)>>,
        pub fail_with: Mutex<Option<String>>,
    }

    impl FakeSpawner {
        pub(crate) fn spawned(&self) -> usize {
            *self.next_pid.lock().unwrap() as usize
        }

        /// Finish the oldest still-running child with `exit_code`.
        pub(crate) fn finish_next(&self, exit_code: i32) {
            let (_, tx) = self.exits.lock().unwrap().remove(0);
            let _ = tx.send(ExitOutcome {
                exit_code: Some(exit_code),
                ..Default::default()
            });
        }
    }

    impl Spawner for FakeSpawner {
        fn spawn(&self, _request: SpawnRequest) -> io::Result<SpawnedProcess> {
            if let Some(msg) = self.fail_with.lock().unwrap().clone() {
                return Err(io::Error::new(io::ErrorKind::NotFound, msg));
            }
            let pid = {
                let mut next = self.next_pid.lock().unwrap();
                *next += 1;
                10_000 + *next
            };
            let (tx, rx) = oneshot::channel();
            self.exits.lock().unwrap().push((pid, tx));
            let exit = rx
                .map(|r| {
                    r.unwrap_or(ExitOutcome {
                        error: Some("fake child dropped".to_string()),
                        ..Default::default()
                    })
                })
                .boxed();
            Ok(SpawnedProcess { pid, exit })
        }
    }

    pub(crate) fn fake_runner(dir: &std::path::Path, spawner: Arc<FakeSpawner>) -> Runner {
        let paths = Paths::under(dir);
        paths.ensure().unwrap();
        Runner::new(
            Arc::new(memory_store()),
            Arc::new(EventLog::new(paths.events_file.clone())),
            paths,
            spawner,
        )
    }

    #[test]
    fn classification() {
        let ok = ExitOutcome {
            exit_code: Some(0),
            ..Default::default()
        };
        assert_eq!(classify(&ok), RunStatus::Success);
        let bad = ExitOutcome {
            exit_code: Some(3),
            ..Default::default()
        };
        assert_eq!(classify(&bad), RunStatus::Failed);
        let killed = ExitOutcome {
            signal: Some("SIGKILL".to_string()),
            ..Default::default()
        };
        assert_eq!(classify(&killed), RunStatus::Killed);
    }

    #[tokio::test]
    async fn run_records_pid_and_exit() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = Arc::new(FakeSpawner::default());
        let runner = fake_runner(dir.path(), Arc::clone(&spawner));
        let (job, _) = runner.store().upsert_job(&cron_job("ping", "* * * * *"), None).unwrap();

        let handle = runner.run_job(&job).unwrap();
        let run = runner.store().get_run(&handle.run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.pid, Some(10_001));
        assert!(run.stdout_path.unwrap().ends_with(&format!("{}.out", handle.run_id)));
        assert!(runner.store().get_job(&job.id).unwrap().unwrap().last_run_at.is_some());

        spawner.finish_next(0);
        assert_eq!(handle.completion.await.unwrap(), RunStatus::Success);
        let run = runner.store().get_run(&run.id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.exit_code, Some(0));
        assert!(run.ended_at.is_some());

        let kinds: Vec<EventKind> = runner
            .events()
            .read_all()
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::RunStarted, EventKind::RunFinished]);
    }

    #[tokio::test]
    async fn spawn_failure_marks_run_failed() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = Arc::new(FakeSpawner::default());
        *spawner.fail_with.lock().unwrap() = Some("no such file".to_string());
        let runner = fake_runner(dir.path(), Arc::clone(&spawner));
        let (job, _) = runner.store().upsert_job(&cron_job("ping", "* * * * *"), None).unwrap();

        let handle = runner.run_job(&job).unwrap();
        assert_eq!(handle.completion.await.unwrap(), RunStatus::Failed);

        let run = runner.store().get_run(&handle.run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.pid.is_none());
        assert_eq!(run.error_message.as_deref(), Some("no such file"));
    }

    #[tokio::test]
    async fn skipped_run_starts_and_ends_together() {
        let dir = tempfile::tempdir().unwrap();
        let runner = fake_runner(dir.path(), Arc::new(FakeSpawner::default()));
        let (job, _) = runner.store().upsert_job(&cron_job("ping", "* * * * *"), None).unwrap();

        let run_id = runner.record_skipped_run(&job).unwrap();
        let run = runner.store().get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Skipped);
        assert_eq!(run.started_at, run.ended_at);
    }
}
