//! SQLite persistence for jobs and runs.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::jobs::ValidJob;
use crate::types::{format_timestamp, now_timestamp, Job, OverlapPolicy, Run, RunStatus, Schedule};

const JOB_COLUMNS: &str = "id, name, description, command, cwd, env, schedule_type, cron, run_at,
     timezone, overlap_policy, timeout_ms, paused, created_at, updated_at, last_run_at, next_run_at";

const RUN_COLUMNS: &str = "id, job_id, status, pid, exit_code, signal, started_at, ended_at,
     stdout_path, stderr_path, error_message";

/// Final state of a run as reported by the exit watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub error_message: Option<String>,
}

/// Thread-safe store for jobs and runs.
///
/// Wraps a single SQLite connection in a `Mutex`; every method holds the lock
/// for exactly one statement or one transaction, so callers on different
/// tasks are serialised the same way callback turns would be.
pub struct JobStore {
    db: Mutex<Connection>,
}

impl JobStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Return all jobs ordered by creation time.
    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at, name"
        ))?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let db = self.conn();
        let job = db
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    pub fn get_job_by_name(&self, name: &str) -> Result<Option<Job>> {
        let db = self.conn();
        let job = db
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = ?1"),
                [name],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Insert or update the job keyed by `job.name`.
    ///
    /// An existing row keeps its id, `created_at`, `last_run_at` and
    /// `next_run_at`; a new row takes `id_hint` or a fresh UUIDv7. Returns the
    /// saved job and whether it was created.
    pub fn upsert_job(&self, job: &ValidJob, id_hint: Option<&str>) -> Result<(Job, bool)> {
        let db = self.conn();
        let existing_id: Option<String> = db
            .query_row("SELECT id FROM jobs WHERE name = ?1", [&job.name], |row| {
                row.get(0)
            })
            .optional()?;
        let created = existing_id.is_none();
        let id = existing_id
            .or_else(|| id_hint.map(str::to_string))
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        let now = now_timestamp();
        let command = serde_json::to_string(&job.command)?;
        let env = job.env.as_ref().map(serde_json::to_string).transpose()?;
        let run_at = job.schedule.run_at().map(format_timestamp);

        db.execute(
            "INSERT INTO jobs
             (id, name, description, command, cwd, env, schedule_type, cron, run_at,
              timezone, overlap_policy, timeout_ms, paused, created_at, updated_at,
              last_run_at, next_run_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?14,NULL,NULL)
             ON CONFLICT(name) DO UPDATE SET
               description = excluded.description,
               command = excluded.command,
               cwd = excluded.cwd,
               env = excluded.env,
               schedule_type = excluded.schedule_type,
               cron = excluded.cron,
               run_at = excluded.run_at,
               timezone = excluded.timezone,
               overlap_policy = excluded.overlap_policy,
               timeout_ms = excluded.timeout_ms,
               paused = excluded.paused,
               updated_at = excluded.updated_at",
            params![
                id,
                job.name,
                job.description,
                command,
                job.cwd,
                env,
                job.schedule.schedule_type(),
                job.schedule.cron_expression(),
                run_at,
                job.timezone,
                job.overlap_policy.to_string(),
                job.timeout_ms.map(|ms| ms as i64),
                job.paused,
                now,
            ],
        )?;

        let saved = db.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = ?1"),
            [&job.name],
            row_to_job,
        )?;
        debug!(job_id = %saved.id, name = %saved.name, created, "job upserted");
        Ok((saved, created))
    }

    /// Delete a job and every run referencing it in one transaction.
    /// Returns `false` if no such job existed.
    pub fn delete_job(&self, id: &str) -> Result<bool> {
        let mut db = self.conn();
        let tx = db.transaction()?;
        let runs = tx.execute("DELETE FROM runs WHERE job_id = ?1", [id])?;
        let n = tx.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        tx.commit()?;
        if n > 0 {
            info!(job_id = %id, runs_deleted = runs, "job deleted");
        }
        Ok(n > 0)
    }

    /// Set the paused flag. Pausing also clears `next_run_at`.
    pub fn set_paused(&self, name: &str, paused: bool) -> Result<Job> {
        let now = now_timestamp();
        let n = {
            let db = self.conn();
            if paused {
                db.execute(
                    "UPDATE jobs SET paused = 1, next_run_at = NULL, updated_at = ?1 WHERE name = ?2",
                    params![now, name],
                )?
            } else {
                db.execute(
                    "UPDATE jobs SET paused = 0, updated_at = ?1 WHERE name = ?2",
                    params![now, name],
                )?
            }
        };
        if n == 0 {
            return Err(SchedulerError::JobNotFound {
                name: name.to_string(),
            });
        }
        self.require_job_by_name(name)
    }

    /// Drop all runs of the job and clear its run timestamps, atomically.
    pub fn reset_job(&self, name: &str) -> Result<Job> {
        let job = self.require_job_by_name(name)?;
        let now = now_timestamp();
        {
            let mut db = self.conn();
            let tx = db.transaction()?;
            tx.execute("DELETE FROM runs WHERE job_id = ?1", [&job.id])?;
            tx.execute(
                "UPDATE jobs SET last_run_at = NULL, next_run_at = NULL, updated_at = ?1
                 WHERE id = ?2",
                params![now, job.id],
            )?;
            tx.commit()?;
        }
        self.require_job_by_name(name)
    }

    pub fn update_next_run_at(&self, id: &str, next: Option<DateTime<Utc>>) -> Result<()> {
        let next = next.map(format_timestamp);
        self.conn().execute(
            "UPDATE jobs SET next_run_at = ?1 WHERE id = ?2",
            params![next, id],
        )?;
        Ok(())
    }

    pub fn touch_last_run_at(&self, id: &str, at: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE jobs SET last_run_at = ?1 WHERE id = ?2",
            params![at, id],
        )?;
        Ok(())
    }

    pub fn require_job_by_name(&self, name: &str) -> Result<Job> {
        self.get_job_by_name(name)?
            .ok_or_else(|| SchedulerError::JobNotFound {
                name: name.to_string(),
            })
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    pub fn insert_running_run(
        &self,
        run_id: &str,
        job_id: &str,
        started_at: &str,
        stdout_path: &str,
        stderr_path: &str,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO runs (id, job_id, status, started_at, stdout_path, stderr_path)
             VALUES (?1, ?2, 'running', ?3, ?4, ?5)",
            params![run_id, job_id, started_at, stdout_path, stderr_path],
        )?;
        Ok(())
    }

    pub fn set_run_pid(&self, run_id: &str, pid: u32) -> Result<()> {
        self.conn().execute(
            "UPDATE runs SET pid = ?1 WHERE id = ?2",
            params![pid, run_id],
        )?;
        Ok(())
    }

    /// Move a `running` row to its terminal state. Returns `false` when the
    /// row was already terminal (the first terminal write wins).
    pub fn finish_run(&self, run_id: &str, completion: &RunCompletion) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE runs SET status = ?1, exit_code = ?2, signal = ?3, ended_at = ?4,
                             error_message = ?5
             WHERE id = ?6 AND status = 'running'",
            params![
                completion.status.to_string(),
                completion.exit_code,
                completion.signal,
                now_timestamp(),
                completion.error_message,
                run_id,
            ],
        )?;
        Ok(n > 0)
    }

    /// Mark a run that never got a process as `failed`.
    pub fn fail_run(&self, run_id: &str, error_message: &str) -> Result<bool> {
        self.finish_run(
            run_id,
            &RunCompletion {
                status: RunStatus::Failed,
                exit_code: None,
                signal: None,
                error_message: Some(error_message.to_string()),
            },
        )
    }

    /// Insert a `skipped` run with `started_at == ended_at`.
    pub fn insert_skipped_run(&self, run_id: &str, job_id: &str, at: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO runs (id, job_id, status, started_at, ended_at)
             VALUES (?1, ?2, 'skipped', ?3, ?3)",
            params![run_id, job_id, at],
        )?;
        Ok(())
    }

    pub fn list_running_runs(&self) -> Result<Vec<Run>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE status = 'running' ORDER BY started_at"
        ))?;
        let runs = stmt
            .query_map([], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    /// `running` → `lost`. Returns `false` if the row was no longer running.
    pub fn mark_run_lost(&self, run_id: &str) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE runs SET status = 'lost', ended_at = ?1 WHERE id = ?2 AND status = 'running'",
            params![now_timestamp(), run_id],
        )?;
        Ok(n > 0)
    }

    pub fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let db = self.conn();
        let run = db
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                [id],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    /// Most recent runs of a job, newest first.
    pub fn list_runs(&self, job_id: &str, limit: usize) -> Result<Vec<Run>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE job_id = ?1
             ORDER BY started_at DESC, id DESC LIMIT ?2"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let runs = stmt
            .query_map(params![job_id, limit], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    pub fn latest_run(&self, job_id: &str) -> Result<Option<Run>> {
        Ok(self.list_runs(job_id, 1)?.into_iter().next())
    }

    pub fn count_runs(&self, job_id: &str) -> Result<usize> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM runs WHERE job_id = ?1",
            [job_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::other(msg)),
    )
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let command_json: String = row.get(3)?;
    let command: Vec<String> =
        serde_json::from_str(&command_json).map_err(|e| conversion_error(3, e.to_string()))?;
    let env_json: Option<String> = row.get(5)?;
    let env: Option<BTreeMap<String, String>> = env_json
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| conversion_error(5, e.to_string()))?;

    let schedule_type: String = row.get(6)?;
    let schedule = match schedule_type.as_str() {
        "cron" => {
            let expression: Option<String> = row.get(7)?;
            Schedule::Cron {
                expression: expression
                    .ok_or_else(|| conversion_error(7, "cron job without pattern".into()))?,
            }
        }
        "once" => {
            let raw: Option<String> = row.get(8)?;
            let raw = raw.ok_or_else(|| conversion_error(8, "one-shot job without run_at".into()))?;
            let at = DateTime::parse_from_rfc3339(&raw)
                .map_err(|e| conversion_error(8, e.to_string()))?
                .with_timezone(&Utc);
            Schedule::Once { at }
        }
        other => return Err(conversion_error(6, format!("unknown schedule type: {other}"))),
    };

    let policy: String = row.get(10)?;
    let overlap_policy: OverlapPolicy = policy.parse().map_err(|e| conversion_error(10, e))?;
    let timeout_ms: Option<i64> = row.get(11)?;

    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        command,
        cwd: row.get(4)?,
        env,
        schedule,
        timezone: row.get(9)?,
        overlap_policy,
        timeout_ms: timeout_ms.map(|ms| ms.max(0) as u64),
        paused: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
        last_run_at: row.get(15)?,
        next_run_at: row.get(16)?,
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    let status: String = row.get(2)?;
    let status: RunStatus = status.parse().map_err(|e| conversion_error(2, e))?;
    Ok(Run {
        id: row.get(0)?,
        job_id: row.get(1)?,
        status,
        pid: row.get(3)?,
        exit_code: row.get(4)?,
        signal: row.get(5)?,
        started_at: row.get(6)?,
        ended_at: row.get(7)?,
        stdout_path: row.get(8)?,
        stderr_path: row.get(9)?,
        error_message: row.get(10)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db;

    pub(crate) fn memory_store() -> JobStore {
        JobStore::new(db::open_in_memory().unwrap())
    }

    pub(crate) fn cron_job(name: &str, expression: &str) -> ValidJob {
        ValidJob {
            name: name.to_string(),
            description: None,
            command: vec!["/bin/echo".to_string(), "hi".to_string()],
            cwd: None,
            env: None,
            schedule: Schedule::Cron {
                expression: expression.to_string(),
            },
            timezone: None,
            overlap_policy: OverlapPolicy::Skip,
            timeout_ms: None,
            paused: false,
        }
    }

    #[test]
    fn upsert_creates_then_updates_by_name() {
        let store = memory_store();
        let (first, created) = store.upsert_job(&cron_job("ping", "* * * * *"), None).unwrap();
        assert!(created);

        let mut changed = cron_job("ping", "*/5 * * * *");
        changed.overlap_policy = OverlapPolicy::Allow;
        let (second, created) = store.upsert_job(&changed, Some("ignored-id")).unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.schedule.cron_expression(), Some("*/5 * * * *"));
        assert_eq!(second.overlap_policy, OverlapPolicy::Allow);
        assert_eq!(store.list_jobs().unwrap().len(), 1);
    }

    #[test]
    fn upsert_honours_id_hint_for_new_jobs() {
        let store = memory_store();
        let (job, _) = store
            .upsert_job(&cron_job("backup", "0 3 * * *"), Some("01ARZ3NDEKTSV4RRFFQ69G5FAV"))
            .unwrap();
        assert_eq!(job.id, "01ARZ3NDEKTSV4RRFFQ69G5FAV");
    }

    #[test]
    fn upsert_preserves_run_timestamps() {
        let store = memory_store();
        let (job, _) = store.upsert_job(&cron_job("ping", "* * * * *"), None).unwrap();
        store.touch_last_run_at(&job.id, "2026-01-01T00:00:00.000Z").unwrap();

        let (again, _) = store.upsert_job(&cron_job("ping", "* * * * *"), None).unwrap();
        assert_eq!(again.last_run_at.as_deref(), Some("2026-01-01T00:00:00.000Z"));
    }

    #[test]
    fn one_shot_and_env_round_trip() {
        let store = memory_store();
        let mut job = cron_job("once", "* * * * *");
        let at = DateTime::parse_from_rfc3339("2030-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        job.schedule = Schedule::Once { at };
        job.env = Some(BTreeMap::from([("A".to_string(), "1".to_string())]));
        job.timeout_ms = Some(1500);

        let (saved, _) = store.upsert_job(&job, None).unwrap();
        assert_eq!(saved.schedule, Schedule::Once { at });
        assert_eq!(saved.env.unwrap()["A"], "1");
        assert_eq!(saved.timeout_ms, Some(1500));
    }

    #[test]
    fn delete_removes_every_run() {
        let store = memory_store();
        let (job, _) = store.upsert_job(&cron_job("ping", "* * * * *"), None).unwrap();
        store
            .insert_running_run("r1", &job.id, &now_timestamp(), "/o", "/e")
            .unwrap();
        store.insert_skipped_run("r2", &job.id, &now_timestamp()).unwrap();
        assert_eq!(store.count_runs(&job.id).unwrap(), 2);

        assert!(store.delete_job(&job.id).unwrap());
        assert_eq!(store.count_runs(&job.id).unwrap(), 0);
        assert!(store.get_run("r1").unwrap().is_none());
        assert!(!store.delete_job(&job.id).unwrap());
    }

    #[test]
    fn pause_clears_next_run() {
        let store = memory_store();
        let (job, _) = store.upsert_job(&cron_job("ping", "* * * * *"), None).unwrap();
        store.update_next_run_at(&job.id, Some(Utc::now())).unwrap();

        let paused = store.set_paused("ping", true).unwrap();
        assert!(paused.paused);
        assert!(paused.next_run_at.is_none());

        let resumed = store.set_paused("ping", false).unwrap();
        assert!(!resumed.paused);
    }

    #[test]
    fn pause_unknown_job_is_not_found() {
        let store = memory_store();
        let err = store.set_paused("ghost", true).unwrap_err();
        assert_eq!(err.code(), "job_not_found");
    }

    #[test]
    fn terminal_status_never_reverts() {
        let store = memory_store();
        let (job, _) = store.upsert_job(&cron_job("ping", "* * * * *"), None).unwrap();
        store
            .insert_running_run("r1", &job.id, &now_timestamp(), "/o", "/e")
            .unwrap();

        let done = RunCompletion {
            status: RunStatus::Success,
            exit_code: Some(0),
            signal: None,
            error_message: None,
        };
        assert!(store.finish_run("r1", &done).unwrap());
        assert!(!store.mark_run_lost("r1").unwrap());
        let failed = RunCompletion {
            status: RunStatus::Failed,
            ..done
        };
        assert!(!store.finish_run("r1", &failed).unwrap());
        assert_eq!(store.get_run("r1").unwrap().unwrap().status, RunStatus::Success);
    }

    #[test]
    fn reset_drops_runs_and_timestamps() {
        let store = memory_store();
        let (job, _) = store.upsert_job(&cron_job("ping", "* * * * *"), None).unwrap();
        store.touch_last_run_at(&job.id, &now_timestamp()).unwrap();
        store.insert_skipped_run("r1", &job.id, &now_timestamp()).unwrap();

        let reset = store.reset_job("ping").unwrap();
        assert!(reset.last_run_at.is_none());
        assert!(reset.next_run_at.is_none());
        assert_eq!(store.count_runs(&job.id).unwrap(), 0);
    }

    #[test]
    fn latest_run_is_newest() {
        let store = memory_store();
        let (job, _) = store.upsert_job(&cron_job("ping", "* * * * *"), None).unwrap();
        store
            .insert_skipped_run("a", &job.id, "2026-01-01T00:00:00.000Z")
            .unwrap();
        store
            .insert_skipped_run("b", &job.id, "2026-01-02T00:00:00.000Z")
            .unwrap();

        assert_eq!(store.latest_run(&job.id).unwrap().unwrap().id, "b");
        assert_eq!(store.list_runs(&job.id, 10).unwrap().len(), 2);
    }
}
