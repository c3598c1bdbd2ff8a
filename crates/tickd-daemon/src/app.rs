use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tickd_core::{DaemonState, EventKind, EventLog, Paths, TickdConfig};
use tickd_scheduler::process::is_process_alive;
use tickd_scheduler::types::now_timestamp;
use tickd_scheduler::{
    db, recover_running_runs, JobControl, JobFileSync, JobStore, Runner, Scheduler, ShellSpawner,
};
use tracing::{info, warn};

/// Everything a running daemon holds. A control transport would be handed
/// `Arc<AppState>` and talk to `control`.
pub struct AppState {
    pub paths: Paths,
    pub events: Arc<EventLog>,
    pub scheduler: Scheduler,
    pub sync: Arc<JobFileSync>,
    pub control: JobControl,
}

impl AppState {
    /// Bring the daemon up. Storage failures are fatal.
    ///
    /// Must be called inside a tokio runtime: arming triggers spawns tasks.
    pub fn boot(config: TickdConfig) -> anyhow::Result<Arc<Self>> {
        let paths = Paths::resolve(&config.paths);
        paths.ensure().context("creating tickd directories")?;
        info!(
            config_dir = %paths.config_dir.display(),
            state_dir = %paths.state_dir.display(),
            "directories ready"
        );

        info!(path = %paths.db_file.display(), "opening SQLite database");
        let conn = db::open(&paths.db_file).context("opening database")?;
        db::init_db(&conn).context("migrating database")?;
        let store = Arc::new(JobStore::new(conn));
        let events = Arc::new(EventLog::new(paths.events_file.clone()));

        // Orphans must be settled before any trigger can start a new run.
        let lost = recover_running_runs(&store, &events, is_process_alive)
            .context("recovering orphaned runs")?;
        if lost > 0 {
            warn!(count = lost, "runs from a previous daemon were lost");
        }

        let spawner = ShellSpawner::from_config(&config.runner);
        let runner = Runner::new(
            Arc::clone(&store),
            Arc::clone(&events),
            paths.clone(),
            Arc::new(spawner),
        );
        let scheduler = Scheduler::new(runner);
        scheduler.start().context("starting scheduler")?;

        let sync = Arc::new(JobFileSync::new(
            scheduler.clone(),
            Arc::clone(&events),
            paths.jobs_file.clone(),
            Duration::from_millis(config.sync.self_write_window_ms),
        ));
        if config.sync.enabled {
            sync.init().context("starting job file sync")?;
            info!(path = %paths.jobs_file.display(), "job file sync enabled");
        } else {
            info!("job file sync disabled");
        }

        let control = JobControl::new(
            scheduler.clone(),
            Arc::clone(&sync),
            Arc::clone(&events),
            config.sync.enabled,
        );

        DaemonState {
            pid: std::process::id(),
            started_at: now_timestamp(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
        .write(&paths.daemon_state_file)
        .context("writing daemon state file")?;
        events.emit(
            EventKind::DaemonStarted,
            json!({ "pid": std::process::id(), "version": env!("CARGO_PKG_VERSION") }),
        );

        Ok(Arc::new(Self {
            paths,
            events,
            scheduler,
            sync,
            control,
        }))
    }

    /// Stop triggers and the watcher. Running processes are left alone;
    /// the next boot's recovery settles them.
    pub fn shutdown(&self) {
        self.scheduler.stop();
        self.sync.stop();
        self.events.emit(EventKind::DaemonStopped, json!({}));
        if let Err(e) = DaemonState::remove(&self.paths.daemon_state_file) {
            warn!("failed to remove daemon state file: {e}");
        }
        info!("tickd stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickd_scheduler::JobInput;

    fn sandbox_config(root: &std::path::Path) -> TickdConfig {
        let mut config = TickdConfig::default();
        config.paths.root = Some(root.to_string_lossy().into_owned());
        config.runner.login_shell = false;
        config
    }

    #[tokio::test]
    async fn boot_writes_state_and_shutdown_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let app = AppState::boot(sandbox_config(dir.path())).unwrap();

        let state = DaemonState::read(&app.paths.daemon_state_file)
            .unwrap()
            .unwrap();
        assert_eq!(state.pid, std::process::id());
        assert!(app.paths.jobs_file.exists());

        app.shutdown();
        assert!(DaemonState::read(&app.paths.daemon_state_file)
            .unwrap()
            .is_none());

        let kinds: Vec<_> = app
            .events
            .read_all()
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds.first(), Some(&EventKind::DaemonStarted));
        assert_eq!(kinds.last(), Some(&EventKind::DaemonStopped));
    }

    #[tokio::test]
    async fn jobs_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let app = AppState::boot(sandbox_config(dir.path())).unwrap();
        let created = app
            .control
            .upsert_job(&JobInput {
                name: "nightly".to_string(),
                command: vec!["true".to_string()],
                schedule: Some("0 3 * * *".to_string()),
                ..Default::default()
            })
            .unwrap()
            .job;
        app.shutdown();
        drop(app);

        let app = AppState::boot(sandbox_config(dir.path())).unwrap();
        let job = app.control.get_job("nightly").unwrap();
        assert_eq!(job.id, created.id);
        assert!(job.next_run_at.is_some());
        assert!(app.scheduler.is_scheduled(&job.id));
        app.shutdown();
    }

    #[tokio::test]
    async fn sync_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sandbox_config(dir.path());
        config.sync.enabled = false;
        let app = AppState::boot(config).unwrap();
        assert!(!app.paths.jobs_file.exists());
        app.shutdown();
    }
}
