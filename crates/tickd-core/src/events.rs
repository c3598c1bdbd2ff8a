//! Append-only lifecycle event log (`events.jsonl`).
//!
//! One JSON object per line: `{"type": ..., "timestamp": ..., "payload": {...}}`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    DaemonStarted,
    DaemonStopped,
    JobCreated,
    JobUpdated,
    JobPaused,
    JobResumed,
    JobReset,
    JobDeleted,
    RunStarted,
    RunFinished,
    RunFailed,
    RunKilled,
    RunSkipped,
    RunLost,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::DaemonStarted => "daemon_started",
            EventKind::DaemonStopped => "daemon_stopped",
            EventKind::JobCreated => "job_created",
            EventKind::JobUpdated => "job_updated",
            EventKind::JobPaused => "job_paused",
            EventKind::JobResumed => "job_resumed",
            EventKind::JobReset => "job_reset",
            EventKind::JobDeleted => "job_deleted",
            EventKind::RunStarted => "run_started",
            EventKind::RunFinished => "run_finished",
            EventKind::RunFailed => "run_failed",
            EventKind::RunKilled => "run_killed",
            EventKind::RunSkipped => "run_skipped",
            EventKind::RunLost => "run_lost",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single line of the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: String,
    pub payload: serde_json::Value,
}

/// Writer for the event log. Cheap to share behind an `Arc`.
pub struct EventLog {
    path: PathBuf,
    /// Serialises appends so concurrent writers never interleave partial lines.
    write_lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, logging any failure.
    pub fn emit(&self, kind: EventKind, payload: serde_json::Value) {
        if let Err(e) = self.append(kind, payload) {
            warn!(event = %kind, path = %self.path.display(), "event log append failed: {e}");
        }
    }

    /// Append one record, returning any I/O or serialisation error.
    pub fn append(&self, kind: EventKind, payload: serde_json::Value) -> Result<()> {
        let record = EventRecord {
            kind,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            payload,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Read every record back. Lines that fail to parse are skipped.
    pub fn read_all(&self) -> Result<Vec<EventRecord>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
