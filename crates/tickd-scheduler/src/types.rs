use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Defines when a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Recurring cron pattern (5 fields, or 6 with leading seconds).
    Cron { expression: String },

    /// Run exactly once at the given UTC instant.
    Once { at: DateTime<Utc> },
}

impl Schedule {
    /// Value of the `schedule_type` column.
    pub fn schedule_type(&self) -> &'static str {
        match self {
            Schedule::Cron { .. } => "cron",
            Schedule::Once { .. } => "once",
        }
    }

    pub fn cron_expression(&self) -> Option<&str> {
        match self {
            Schedule::Cron { expression } => Some(expression),
            Schedule::Once { .. } => None,
        }
    }

    pub fn run_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron { .. } => None,
            Schedule::Once { at } => Some(*at),
        }
    }
}

/// What to do when a trigger fires while a previous run is still active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Record a `skipped` run and do not spawn.
    #[default]
    Skip,
    /// Spawn concurrently.
    Allow,
}

impl std::fmt::Display for OverlapPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OverlapPolicy::Skip => "skip",
            OverlapPolicy::Allow => "allow",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OverlapPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "skip" => Ok(OverlapPolicy::Skip),
            "allow" => Ok(OverlapPolicy::Allow),
            other => Err(format!("unknown overlap policy: {other}")),
        }
    }
}

/// Lifecycle state of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Process spawned (or about to be) and not yet reaped.
    Running,
    /// Exited with code 0.
    Success,
    /// Non-zero exit, or the process could not be spawned.
    Failed,
    /// Terminated by a signal (including the timeout kill).
    Killed,
    /// Not spawned because a previous run was active under `skip`.
    Skipped,
    /// Was `running` when a previous daemon died and the pid is gone.
    Lost,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Killed => "killed",
            RunStatus::Skipped => "skipped",
            RunStatus::Lost => "lost",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "killed" => Ok(RunStatus::Killed),
            "skipped" => Ok(RunStatus::Skipped),
            "lost" => Ok(RunStatus::Lost),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// UUIDv7 string. Primary key, never changes.
    pub id: String,
    /// Unique human-assigned label; the upsert key.
    pub name: String,
    pub description: Option<String>,
    /// argv; element 0 is the executable.
    pub command: Vec<String>,
    pub cwd: Option<String>,
    /// Overlaid on the daemon's environment; job keys win.
    pub env: Option<BTreeMap<String, String>>,
    pub schedule: Schedule,
    /// IANA zone used to evaluate cron patterns. UTC when absent.
    pub timezone: Option<String>,
    pub overlap_policy: OverlapPolicy,
    pub timeout_ms: Option<u64>,
    pub paused: bool,
    pub created_at: String,
    pub updated_at: String,
    pub last_run_at: Option<String>,
    /// Null while paused or once the schedule is exhausted.
    pub next_run_at: Option<String>,
}

/// One execution attempt of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub job_id: String,
    pub status: RunStatus,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    /// Signal name, e.g. `SIGKILL`.
    pub signal: Option<String>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub error_message: Option<String>,
}

/// RFC 3339 with millisecond precision and a `Z` suffix, so stored
/// timestamps sort lexicographically.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}
