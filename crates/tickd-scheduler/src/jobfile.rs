//! The declarative job file (`jobs.toml`).
//!
//! ```toml
//! [jobs.backup]
//! id = "0190f3c2-..."
//! command = ["restic", "backup", "/home"]
//! schedule = "0 3 * * *"
//! timezone = "Europe/Berlin"
//! paused = false
//! overlap_policy = "skip"
//!
//! [jobs.backup.env]
//! RESTIC_REPOSITORY = "/mnt/backup"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::jobs::{JobInput, ValidJob};
use crate::types::{format_timestamp, Job, OverlapPolicy};

/// One validated entry of the job file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    /// Identity hint for jobs the store does not know yet. Always a UUID,
    /// unique within the file.
    pub id: Option<String>,
    pub job: ValidJob,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct JobFileEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    run_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    paused: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    overlap_policy: Option<OverlapPolicy>,
    // Tables must follow plain values in TOML output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    env: Option<BTreeMap<String, String>>,
}

impl JobFileEntry {
    fn into_input(self, name: &str) -> (Option<String>, JobInput) {
        let input = JobInput {
            name: name.to_string(),
            description: self.description,
            command: self.command,
            cwd: self.cwd,
            env: self.env,
            schedule: self.schedule,
            run_at: self.run_at,
            timezone: self.timezone,
            timeout_ms: self.timeout_ms,
            paused: self.paused,
            overlap_policy: self.overlap_policy,
        };
        (self.id.filter(|id| !id.is_empty()), input)
    }

    fn from_job(job: &Job) -> Self {
        Self {
            id: Some(job.id.clone()),
            description: job.description.clone(),
            command: job.command.clone(),
            cwd: job.cwd.clone(),
            schedule: job.schedule.cron_expression().map(str::to_string),
            run_at: job.schedule.run_at().map(format_timestamp),
            timezone: job.timezone.clone(),
            timeout_ms: job.timeout_ms.map(|ms| ms as i64),
            paused: Some(job.paused),
            overlap_policy: Some(job.overlap_policy),
            env: job.env.clone(),
        }
    }
}

#[derive(Serialize)]
struct JobFileOut<'a> {
    jobs: BTreeMap<&'a str, JobFileEntry>,
}

/// Parse and validate the whole file. Any bad entry fails the parse, as does
/// an `id` that is not a UUID or that two entries share.
pub fn parse_job_file(text: &str) -> Result<Vec<JobSpec>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let doc: toml::Table =
        toml::from_str(text).map_err(|e| SchedulerError::InvalidJobFile(e.to_string()))?;
    let Some(jobs) = doc.get("jobs") else {
        return Ok(Vec::new());
    };
    let jobs = jobs
        .as_table()
        .ok_or_else(|| SchedulerError::InvalidJobFile("[jobs] must be a table".to_string()))?;

    let mut specs = Vec::with_capacity(jobs.len());
    let mut id_owners: HashMap<String, &str> = HashMap::new();
    for (name, value) in jobs {
        if !value.is_table() {
            return Err(SchedulerError::InvalidJobFile(format!(
                "job '{name}': entry must be a table"
            )));
        }
        let entry: JobFileEntry = value
            .clone()
            .try_into()
            .map_err(|e| SchedulerError::InvalidJobFile(format!("job '{name}': {e}")))?;
        let (id, input) = entry.into_input(name);
        if let Some(ref id) = id {
            check_file_id(name, id)?;
            if let Some(other) = id_owners.insert(id.clone(), name) {
                return Err(SchedulerError::InvalidJobFile(format!(
                    "job '{name}': id {id} is already used by job '{other}'"
                )));
            }
        }
        let job = input
            .validate()
            .map_err(|e| SchedulerError::InvalidJobFile(format!("job '{name}': {e}")))?;
        specs.push(JobSpec { id, job });
    }
    Ok(specs)
}

/// Ids end up in run output paths, so only canonical UUIDs are accepted.
fn check_file_id(name: &str, id: &str) -> Result<()> {
    match Uuid::parse_str(id) {
        Ok(parsed) if parsed.hyphenated().to_string() == id.to_ascii_lowercase() => Ok(()),
        _ => Err(SchedulerError::InvalidJobFile(format!(
            "job '{name}': id must be a UUID, got {id:?}"
        ))),
    }
}

/// Render jobs as a job file, one table per job in name order.
pub fn serialize_job_file(jobs: &[Job]) -> Result<String> {
    let out = JobFileOut {
        jobs: jobs
            .iter()
            .map(|job| (job.name.as_str(), JobFileEntry::from_job(job)))
            .collect(),
    };
    toml::to_string(&out).map_err(|e| SchedulerError::InvalidJobFile(e.to_string()))
}

/// Read and parse `path`. A missing file holds no jobs.
pub fn read_job_file(path: &Path) -> Result<Vec<JobSpec>> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_job_file(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

pub fn write_job_file(path: &Path, jobs: &[Job]) -> Result<()> {
    let text = serialize_job_file(jobs)?;
    std::fs::write(path, text)?;
    Ok(())
}
