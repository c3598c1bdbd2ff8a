//! Two-way synchronisation between the store and `jobs.toml`.
//!
//! The store is written back to the file after every mutation; edits made to
//! the file by hand are picked up by a `notify` watcher and applied to the
//! store. Our own writes are told apart from external edits by a short
//! suppression window that opens when a write finishes. An external edit
//! landing inside that window is missed until the next change to the file.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use notify::{RecursiveMode, Watcher};
use tickd_core::EventLog;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::jobfile::{parse_job_file, read_job_file, write_job_file, JobSpec};
use crate::jobs::{delete_job_by_name, upsert_valid_job};
use crate::scheduler::Scheduler;
use crate::store::JobStore;

/// Quiet period after the first file event before the file is read, so a
/// truncate-then-write from an editor is applied once, fully written.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(100);

/// What an apply changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub upserted: usize,
    pub deleted: usize,
}

pub struct JobFileSync {
    store: Arc<JobStore>,
    events: Arc<EventLog>,
    scheduler: Scheduler,
    path: PathBuf,
    self_write_window: Duration,
    /// File events before this instant are our own writes.
    ignore_until: Mutex<Option<Instant>>,
    write_lock: Mutex<()>,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl JobFileSync {
    pub fn new(
        scheduler: Scheduler,
        events: Arc<EventLog>,
        path: impl Into<PathBuf>,
        self_write_window: Duration,
    ) -> Self {
        Self {
            store: Arc::clone(scheduler.store()),
            events,
            scheduler,
            path: path.into(),
            self_write_window,
            ignore_until: Mutex::new(None),
            write_lock: Mutex::new(()),
            watcher: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reconcile once, then start watching.
    ///
    /// An existing file is applied to the store (a bad file is logged and the
    /// store left untouched); otherwise the file is created from the store.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        if self.path.exists() {
            if let Err(e) = self.apply_from_file() {
                error!(path = %self.path.display(), "job file not applied: {e}");
            }
        } else {
            self.write_from_db()?;
        }
        self.watch()
    }

    /// Stop watching. Safe to call more than once.
    pub fn stop(&self) {
        lock(&self.watcher).take();
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        debug!("job file watcher stopped");
    }

    /// Write every store job to the file.
    pub fn write_from_db(&self) -> Result<()> {
        let _guard = lock(&self.write_lock);
        let jobs = self.store.list_jobs()?;
        // Cover the write itself, then restart the window once it is done.
        self.open_suppression_window();
        let written = write_job_file(&self.path, &jobs);
        self.open_suppression_window();
        written?;
        debug!(path = %self.path.display(), jobs = jobs.len(), "job file written");
        Ok(())
    }

    /// Parse `text` as a job file, apply it, and write the result back.
    /// A parse failure leaves the store untouched.
    pub fn apply_from_text(&self, text: &str) -> Result<ApplySummary> {
        let specs = parse_job_file(text)?;
        let summary = self.apply(&specs)?;
        self.write_from_db()?;
        Ok(summary)
    }

    pub fn apply_from_file(&self) -> Result<ApplySummary> {
        let specs = read_job_file(&self.path)?;
        self.apply(&specs)
    }

    fn apply(&self, specs: &[JobSpec]) -> Result<ApplySummary> {
        let existing = self.store.list_jobs()?;
        let by_name: HashMap<&str, &str> = existing
            .iter()
            .map(|job| (job.name.as_str(), job.id.as_str()))
            .collect();
        let mut taken_ids: HashSet<&str> = existing.iter().map(|job| job.id.as_str()).collect();

        // Settle every identity before the first write. A file id already
        // owned by another job (e.g. after a rename) is ignored and the job
        // gets a fresh one.
        let mut plan = Vec::with_capacity(specs.len());
        for spec in specs {
            let id_hint = match by_name.get(spec.job.name.as_str()) {
                Some(id) => Some(*id),
                None => spec.id.as_deref().filter(|id| taken_ids.insert(*id)),
            };
            plan.push((spec, id_hint));
        }

        let mut summary = ApplySummary::default();
        let mut seen = HashSet::new();
        for (spec, id_hint) in plan {
            let (job, _) = upsert_valid_job(&self.store, &self.events, &spec.job, id_hint)?;
            if let Err(e) = self.scheduler.upsert(&job) {
                warn!(job_id = %job.id, name = %job.name, "job not armed: {e}");
            }
            seen.insert(job.name);
            summary.upserted += 1;
        }

        for job in &existing {
            if seen.contains(&job.name) {
                continue;
            }
            self.scheduler.remove(&job.id);
            if delete_job_by_name(&self.store, &self.events, &job.name)?.is_some() {
                summary.deleted += 1;
            }
        }

        info!(
            upserted = summary.upserted,
            deleted = summary.deleted,
            "job file applied"
        );
        Ok(summary)
    }

    fn open_suppression_window(&self) {
        *lock(&self.ignore_until) = Some(Instant::now() + self.self_write_window);
    }

    fn in_suppression_window(&self) -> bool {
        lock(&self.ignore_until).is_some_and(|until| Instant::now() < until)
    }

    fn watch(self: &Arc<Self>) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = self.path.file_name().map(|n| n.to_os_string());

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if matches!(event.kind, notify::EventKind::Access(_)) {
                        return;
                    }
                    let touches_file = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if touches_file {
                        let _ = tx.send(());
                    }
                }
                Err(e) => warn!("job file watch error: {e}"),
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let sync = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let own_write = match sync.upgrade() {
                    Some(sync) => sync.in_suppression_window(),
                    None => break,
                };
                if own_write {
                    while rx.try_recv().is_ok() {}
                    debug!("ignoring job file event from our own write");
                    continue;
                }
                tokio::time::sleep(WATCH_DEBOUNCE).await;
                while rx.try_recv().is_ok() {}

                let Some(sync) = sync.upgrade() else { break };
                info!(path = %sync.path.display(), "job file changed on disk");
                if let Err(e) = sync.apply_from_file() {
                    error!(path = %sync.path.display(), "job file not applied: {e}");
                }
            }
        });

        if let Some(old) = lock(&self.watcher).replace(watcher) {
            drop(old);
        }
        if let Some(old) = lock(&self.task).replace(task) {
            old.abort();
        }
        info!(path = %self.path.display(), "watching job file");
        Ok(())
    }
}

impl Drop for JobFileSync {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::tests::{fake_runner, FakeSpawner};

    const TWO_JOBS: &str = r#"
[jobs.alpha]
command = ["echo", "a"]
schedule = "0 0 1 1 *"

[jobs.beta]
command = ["echo", "b"]
schedule = "0 0 1 1 *"
overlap_policy = "allow"
"#;

    fn setup(dir: &Path) -> Arc<JobFileSync> {
        let runner = fake_runner(dir, Arc::new(FakeSpawner::default()));
        let events = Arc::clone(runner.events());
        let scheduler = Scheduler::new(runner);
        Arc::new(JobFileSync::new(
            scheduler,
            events,
            dir.join("jobs.toml"),
            Duration::from_millis(50),
        ))
    }

    #[tokio::test]
    async fn apply_creates_arms_and_writes_back() {
        let dir = tempfile::tempdir().unwrap();
        let sync = setup(dir.path());

        let summary = sync.apply_from_text(TWO_JOBS).unwrap();
        assert_eq!(summary, ApplySummary { upserted: 2, deleted: 0 });

        let jobs = sync.store.list_jobs().unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| sync.scheduler.is_scheduled(&j.id)));

        let written = std::fs::read_to_string(sync.path()).unwrap();
        for job in &jobs {
            assert!(written.contains(&job.id));
        }
    }

    #[tokio::test]
    async fn round_trip_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sync = setup(dir.path());
        sync.apply_from_text(TWO_JOBS).unwrap();
        let before = sync.store.list_jobs().unwrap();

        let exported = std::fs::read_to_string(sync.path()).unwrap();
        sync.apply_from_text(&exported).unwrap();
        let after = sync.store.list_jobs().unwrap();

        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(&after) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.name, b.name);
            assert_eq!(a.created_at, b.created_at);
        }
        assert_eq!(std::fs::read_to_string(sync.path()).unwrap(), exported);
    }

    #[tokio::test]
    async fn removed_entries_are_deleted_with_their_runs() {
        let dir = tempfile::tempdir().unwrap();
        let sync = setup(dir.path());
        sync.apply_from_text(TWO_JOBS).unwrap();
        let beta = sync.store.require_job_by_name("beta").unwrap();
        sync.store
            .insert_skipped_run("r1", &beta.id, "2026-01-01T00:00:00.000Z")
            .unwrap();

        let only_alpha = r#"
[jobs.alpha]
command = ["echo", "a"]
schedule = "0 0 1 1 *"
"#;
        let summary = sync.apply_from_text(only_alpha).unwrap();
        assert_eq!(summary, ApplySummary { upserted: 1, deleted: 1 });
        assert!(sync.store.get_job_by_name("beta").unwrap().is_none());
        assert!(sync.store.get_run("r1").unwrap().is_none());
        assert!(!sync.scheduler.is_scheduled(&beta.id));
    }

    #[tokio::test]
    async fn bad_text_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let sync = setup(dir.path());
        sync.apply_from_text(TWO_JOBS).unwrap();

        let err = sync.apply_from_text("[jobs.alpha]\ncommand = []\n").unwrap_err();
        assert_eq!(err.code(), "invalid_job_file");
        assert_eq!(sync.store.list_jobs().unwrap().len(), 2);
    }

    const OLD: &str = r#"
[jobs.old]
id = "0190f3c2-0000-7000-8000-0000000000aa"
command = ["true"]
schedule = "0 0 1 1 *"
"#;

    fn store_names(sync: &JobFileSync) -> Vec<String> {
        let mut names: Vec<_> = sync
            .store
            .list_jobs()
            .unwrap()
            .into_iter()
            .map(|job| job.name)
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn shared_file_ids_fail_without_partial_apply() {
        let dir = tempfile::tempdir().unwrap();
        let sync = setup(dir.path());
        sync.apply_from_text(OLD).unwrap();

        let text = r#"
[jobs.a]
id = "0190f3c2-0000-7000-8000-0000000000d0"
command = ["true"]
schedule = "0 0 1 1 *"

[jobs.b]
id = "0190f3c2-0000-7000-8000-0000000000d0"
command = ["true"]
schedule = "0 0 1 1 *"
"#;
        let err = sync.apply_from_text(text).unwrap_err();
        assert_eq!(err.code(), "invalid_job_file");
        assert_eq!(store_names(&sync), vec!["old"]);
    }

    #[tokio::test]
    async fn escaping_file_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sync = setup(dir.path());
        sync.apply_from_text(OLD).unwrap();

        let outside = tempfile::tempdir().unwrap();
        let text = format!(
            "[jobs.evil]\nid = {:?}\ncommand = [\"true\"]\nschedule = \"0 0 1 1 *\"\n",
            outside.path().to_string_lossy()
        );
        let err = sync.apply_from_text(&text).unwrap_err();
        assert_eq!(err.code(), "invalid_job_file");
        assert_eq!(store_names(&sync), vec!["old"]);
    }

    #[tokio::test]
    async fn file_id_owned_by_a_deleted_job_is_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let sync = setup(dir.path());
        sync.apply_from_text(OLD).unwrap();

        // `old` renamed to `new` by hand, id carried along.
        let renamed = OLD.replace("[jobs.old]", "[jobs.new]");
        let summary = sync.apply_from_text(&renamed).unwrap();
        assert_eq!(summary, ApplySummary { upserted: 1, deleted: 1 });
        assert_eq!(store_names(&sync), vec!["new"]);
        let new = sync.store.require_job_by_name("new").unwrap();
        assert_ne!(new.id, "0190f3c2-0000-7000-8000-0000000000aa");
    }

    #[tokio::test]
    async fn file_ids_are_kept_for_new_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let sync = setup(dir.path());
        let text = r#"
[jobs.pinned]
id = "0190f3c2-0000-7000-8000-00000000abcd"
command = ["true"]
schedule = "0 0 1 1 *"
"#;
        sync.apply_from_text(text).unwrap();
        let job = sync.store.require_job_by_name("pinned").unwrap();
        assert_eq!(job.id, "0190f3c2-0000-7000-8000-00000000abcd");
    }

    #[tokio::test]
    async fn init_writes_missing_file_then_applies_external_edits() {
        let dir = tempfile::tempdir().unwrap();
        let sync = setup(dir.path());
        sync.init().unwrap();
        assert!(sync.path().exists());

        // Let the suppression window for our own write lapse.
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(sync.path(), TWO_JOBS).unwrap();

        for _ in 0..150 {
            if sync.store.list_jobs().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(sync.store.list_jobs().unwrap().len(), 2);
        sync.stop();
    }

    #[tokio::test]
    async fn init_applies_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("jobs.toml"), TWO_JOBS).unwrap();
        let sync = setup(dir.path());

        sync.init().unwrap();
        let beta = sync.store.require_job_by_name("beta").unwrap();
        assert!(sync.scheduler.is_scheduled(&beta.id));
        assert!(sync.store.latest_run(&beta.id).unwrap().is_none());
        sync.stop();
    }

    #[tokio::test]
    async fn init_with_broken_file_keeps_store() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("jobs.toml"), "[jobs.x\n").unwrap();
        let sync = setup(dir.path());

        sync.init().unwrap();
        assert!(sync.store.list_jobs().unwrap().is_empty());
        sync.stop();
    }
}
