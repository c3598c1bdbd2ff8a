//! Job input validation plus the upsert/delete paths shared by the control
//! surface and the file synchronizer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tickd_core::{EventKind, EventLog};
use tracing::info;

use crate::error::{Result, SchedulerError};
use crate::store::JobStore;
use crate::trigger::{parse_cron, parse_timezone};
use crate::types::{Job, OverlapPolicy, Schedule};

/// Unvalidated job definition, in the shape a client sends it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobInput {
    pub name: String,
    pub description: Option<String>,
    pub command: Vec<String>,
    pub cwd: Option<String>,
    pub env: Option<BTreeMap<String, String>>,
    /// Cron pattern. Exactly one of `schedule` and `run_at` must be set.
    pub schedule: Option<String>,
    /// RFC 3339 instant for a one-shot job.
    pub run_at: Option<String>,
    pub timezone: Option<String>,
    pub timeout_ms: Option<i64>,
    pub paused: Option<bool>,
    pub overlap_policy: Option<OverlapPolicy>,
}

/// A job definition that passed validation. Everything the store persists
/// except identity and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidJob {
    pub name: String,
    pub description: Option<String>,
    pub command: Vec<String>,
    pub cwd: Option<String>,
    pub env: Option<BTreeMap<String, String>>,
    pub schedule: Schedule,
    pub timezone: Option<String>,
    pub overlap_policy: OverlapPolicy,
    pub timeout_ms: Option<u64>,
    pub paused: bool,
}

impl JobInput {
    pub fn validate(&self) -> Result<ValidJob> {
        let name = self.name.as_str();
        if name.trim().is_empty() {
            return Err(invalid("job name cannot be empty"));
        }
        // Names are lookup keys in the store and in jobs.toml alike.
        if name != name.trim() {
            return Err(invalid("job name cannot have leading or trailing whitespace"));
        }
        if self.command.is_empty() {
            return Err(invalid("command is required"));
        }
        if self.command.iter().any(String::is_empty) {
            return Err(invalid("command argument cannot be empty"));
        }
        non_empty("description", &self.description)?;
        non_empty("cwd", &self.cwd)?;
        non_empty("timezone", &self.timezone)?;

        let schedule = match (non_blank(&self.schedule), non_blank(&self.run_at)) {
            (Some(expression), None) => {
                parse_cron(expression)?;
                Schedule::Cron {
                    expression: expression.to_string(),
                }
            }
            (None, Some(raw)) => Schedule::Once {
                at: parse_run_at(raw)?,
            },
            (Some(_), Some(_)) => {
                return Err(invalid("provide either a cron schedule or run_at, not both"))
            }
            (None, None) => return Err(invalid("missing schedule: provide a cron pattern or run_at")),
        };
        parse_timezone(self.timezone.as_deref())?;

        let timeout_ms = match self.timeout_ms {
            Some(ms) if ms <= 0 => return Err(invalid("timeout must be a positive number")),
            Some(ms) => Some(ms as u64),
            None => None,
        };

        Ok(ValidJob {
            name: name.to_string(),
            description: self.description.clone(),
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            schedule,
            timezone: self.timezone.clone(),
            overlap_policy: self.overlap_policy.unwrap_or_default(),
            timeout_ms,
            paused: self.paused.unwrap_or(false),
        })
    }
}

impl From<&Job> for JobInput {
    fn from(job: &Job) -> Self {
        Self {
            name: job.name.clone(),
            description: job.description.clone(),
            command: job.command.clone(),
            cwd: job.cwd.clone(),
            env: job.env.clone(),
            schedule: job.schedule.cron_expression().map(str::to_string),
            run_at: job
                .schedule
                .run_at()
                .map(crate::types::format_timestamp),
            timezone: job.timezone.clone(),
            timeout_ms: job.timeout_ms.map(|ms| ms as i64),
            paused: Some(job.paused),
            overlap_policy: Some(job.overlap_policy),
        }
    }
}

fn invalid(msg: &str) -> SchedulerError {
    SchedulerError::InvalidJob(msg.to_string())
}

fn non_empty(field: &str, value: &Option<String>) -> Result<()> {
    match value {
        Some(v) if v.is_empty() => Err(SchedulerError::InvalidJob(format!(
            "{field} cannot be empty"
        ))),
        _ => Ok(()),
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn parse_run_at(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|_| {
            SchedulerError::InvalidJob(format!(
                "invalid run_at '{raw}': use RFC 3339 with an offset, e.g. 2026-02-01T10:00:00Z"
            ))
        })
}

/// Validate and persist `input`. Identity: the existing row for that name,
/// else `id_hint`, else a fresh UUIDv7. Emits `job_created` or `job_updated`.
pub fn upsert_job(
    store: &JobStore,
    events: &EventLog,
    input: &JobInput,
    id_hint: Option<&str>,
) -> Result<(Job, bool)> {
    let valid = input.validate()?;
    upsert_valid_job(store, events, &valid, id_hint)
}

pub(crate) fn upsert_valid_job(
    store: &JobStore,
    events: &EventLog,
    valid: &ValidJob,
    id_hint: Option<&str>,
) -> Result<(Job, bool)> {
    let (job, created) = store.upsert_job(valid, id_hint)?;
    let kind = if created {
        EventKind::JobCreated
    } else {
        EventKind::JobUpdated
    };
    events.emit(kind, json!({ "jobId": job.id, "name": job.name }));
    info!(job_id = %job.id, name = %job.name, created, "job saved");
    Ok((job, created))
}

/// Delete the job called `name` together with its runs. Returns the deleted
/// job's id, or `None` if no such job exists.
pub fn delete_job_by_name(store: &JobStore, events: &EventLog, name: &str) -> Result<Option<String>> {
    let Some(job) = store.get_job_by_name(name)? else {
        return Ok(None);
    };
    if !store.delete_job(&job.id)? {
        return Ok(None);
    }
    events.emit(
        EventKind::JobDeleted,
        json!({ "jobId": job.id, "name": job.name }),
    );
    Ok(Some(job.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::memory_store;

    fn input(name: &str) -> JobInput {
        JobInput {
            name: name.to_string(),
            command: vec!["/bin/true".to_string()],
            schedule: Some("*/5 * * * *".to_string()),
            ..Default::default()
        }
    }

    fn event_log() -> (tempfile::TempDir, EventLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events.jsonl"));
        (dir, log)
    }

    #[test]
    fn defaults_apply() {
        let valid = input("ping").validate().unwrap();
        assert_eq!(valid.overlap_policy, OverlapPolicy::Skip);
        assert!(!valid.paused);
        assert!(valid.timeout_ms.is_none());
    }

    #[test]
    fn padded_names_are_rejected() {
        for name in [" ping", "ping ", "\tping", "ping\n", "   "] {
            let err = input(name).validate().unwrap_err();
            assert_eq!(err.code(), "validation_error", "{name:?}");
        }
        assert_eq!(input("ping pong").validate().unwrap().name, "ping pong");
    }

    #[test]
    fn schedule_and_run_at_are_exclusive() {
        let mut both = input("ping");
        both.run_at = Some("2030-01-01T00:00:00Z".to_string());
        assert_eq!(both.validate().unwrap_err().code(), "validation_error");

        let mut neither = input("ping");
        neither.schedule = None;
        assert_eq!(neither.validate().unwrap_err().code(), "validation_error");
    }

    #[test]
    fn rejects_bad_fields() {
        let mut empty_arg = input("ping");
        empty_arg.command.push(String::new());
        assert!(empty_arg.validate().is_err());

        let mut no_command = input("ping");
        no_command.command.clear();
        assert!(no_command.validate().is_err());

        let mut zero_timeout = input("ping");
        zero_timeout.timeout_ms = Some(0);
        assert!(zero_timeout.validate().is_err());

        let mut bad_cron = input("ping");
        bad_cron.schedule = Some("every day".to_string());
        assert_eq!(bad_cron.validate().unwrap_err().code(), "invalid_schedule");

        let mut bad_zone = input("ping");
        bad_zone.timezone = Some("Nowhere/Land".to_string());
        assert_eq!(bad_zone.validate().unwrap_err().code(), "invalid_schedule");

        let mut bad_at = input("ping");
        bad_at.schedule = None;
        bad_at.run_at = Some("tomorrow".to_string());
        assert_eq!(bad_at.validate().unwrap_err().code(), "validation_error");
    }

    #[test]
    fn deserializes_camel_case() {
        let input: JobInput = serde_json::from_value(serde_json::json!({
            "name": "nightly",
            "command": ["backup.sh"],
            "runAt": "2030-01-01T00:00:00+01:00",
            "timeoutMs": 5000,
            "overlapPolicy": "allow"
        }))
        .unwrap();
        let valid = input.validate().unwrap();
        assert_eq!(valid.overlap_policy, OverlapPolicy::Allow);
        assert_eq!(valid.timeout_ms, Some(5000));
        assert_eq!(
            valid.schedule.run_at().unwrap(),
            DateTime::parse_from_rfc3339("2029-12-31T23:00:00Z").unwrap()
        );
    }

    #[test]
    fn upsert_emits_created_then_updated() {
        let store = memory_store();
        let (_dir, events) = event_log();

        let (job, created) = upsert_job(&store, &events, &input("ping"), None).unwrap();
        assert!(created);
        let (again, created) = upsert_job(&store, &events, &input("ping"), Some("other")).unwrap();
        assert!(!created);
        assert_eq!(again.id, job.id);

        let kinds: Vec<EventKind> = events.read_all().unwrap().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::JobCreated, EventKind::JobUpdated]);
    }

    #[test]
    fn invalid_input_touches_nothing() {
        let store = memory_store();
        let (_dir, events) = event_log();
        let mut bad = input("ping");
        bad.command.clear();

        assert!(upsert_job(&store, &events, &bad, None).is_err());
        assert!(store.list_jobs().unwrap().is_empty());
        assert!(events.read_all().unwrap().is_empty());
    }

    #[test]
    fn delete_by_name() {
        let store = memory_store();
        let (_dir, events) = event_log();
        let (job, _) = upsert_job(&store, &events, &input("ping"), None).unwrap();

        assert_eq!(
            delete_job_by_name(&store, &events, "ping").unwrap(),
            Some(job.id)
        );
        assert_eq!(delete_job_by_name(&store, &events, "ping").unwrap(), None);
        let last = events.read_all().unwrap().pop().unwrap();
        assert_eq!(last.kind, EventKind::JobDeleted);
    }
}
