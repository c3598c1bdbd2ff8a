use std::path::Path;

use rusqlite::Connection;

use crate::error::Result;

/// Open the store database at `path` with the pragmas tickd relies on.
///
/// `foreign_keys` is per-connection in SQLite, so every connection must be
/// opened through here (or call [`configure`]) for run cascades to work.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    configure(&conn)?;
    Ok(conn)
}

/// In-memory database with the schema applied. Used by tests.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    init_db(&conn)?;
    Ok(conn)
}

pub fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(())
}

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` and `runs` tables (idempotent). Runs reference their
/// job with `ON DELETE CASCADE`, so removing a job can never orphan runs.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id              TEXT    NOT NULL PRIMARY KEY,
            name            TEXT    NOT NULL UNIQUE,
            description     TEXT,
            command         TEXT    NOT NULL,   -- JSON array of argv strings
            cwd             TEXT,
            env             TEXT,               -- JSON object or NULL
            schedule_type   TEXT    NOT NULL,   -- 'cron' | 'once'
            cron            TEXT,
            run_at          TEXT,               -- ISO-8601 or NULL
            timezone        TEXT,
            overlap_policy  TEXT    NOT NULL DEFAULT 'skip',
            timeout_ms      INTEGER,
            paused          INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT    NOT NULL,
            updated_at      TEXT    NOT NULL,
            last_run_at     TEXT,
            next_run_at     TEXT
        ) STRICT;

        CREATE TABLE IF NOT EXISTS runs (
            id              TEXT    NOT NULL PRIMARY KEY,
            job_id          TEXT    NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            status          TEXT    NOT NULL,
            pid             INTEGER,
            exit_code       INTEGER,
            signal          TEXT,
            started_at      TEXT,
            ended_at        TEXT,
            stdout_path     TEXT,
            stderr_path     TEXT,
            error_message   TEXT
        ) STRICT;

        -- Latest-run lookups for stop/kill and run listings.
        CREATE INDEX IF NOT EXISTS idx_runs_job_started ON runs (job_id, started_at);
        -- Recovery scans for status = 'running'.
        CREATE INDEX IF NOT EXISTS idx_runs_status ON runs (status);
        ",
    )?;
    Ok(())
}
