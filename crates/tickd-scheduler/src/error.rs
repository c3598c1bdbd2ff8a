use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No job with the given name exists in the store.
    #[error("Job not found: {name}")]
    JobNotFound { name: String },

    /// No run with the given ID exists in the store.
    #[error("Run not found: {id}")]
    RunNotFound { id: String },

    /// Stop/kill requested but the job has no active run.
    #[error("Job {name} has no running run")]
    RunNotRunning { name: String },

    /// Job definition failed validation.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// The cron pattern, timestamp or timezone could not be evaluated.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The declarative job file could not be parsed or validated.
    #[error("Invalid job file: {0}")]
    InvalidJobFile(String),

    #[error("Import failed: {0}")]
    ImportFailed(String),

    #[error("Failed to signal pid {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),
}

impl SchedulerError {
    /// Stable machine-readable code for the transport layer.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "database_error",
            SchedulerError::JobNotFound { .. } => "job_not_found",
            SchedulerError::RunNotFound { .. } => "run_not_found",
            SchedulerError::RunNotRunning { .. } => "run_not_running",
            SchedulerError::InvalidJob(_) => "validation_error",
            SchedulerError::InvalidSchedule(_) => "invalid_schedule",
            SchedulerError::InvalidJobFile(_) => "invalid_job_file",
            SchedulerError::ImportFailed(_) => "import_failed",
            SchedulerError::SignalFailed { .. } => "signal_failed",
            SchedulerError::Io(_) => "io_error",
            SchedulerError::Serialization(_) => "serialization_error",
            SchedulerError::Watch(_) => "watch_error",
        }
    }

    /// True for the "expected" outcomes a caller maps to a 4xx-style reply.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::JobNotFound { .. }
                | SchedulerError::RunNotFound { .. }
                | SchedulerError::RunNotRunning { .. }
                | SchedulerError::InvalidJob(_)
                | SchedulerError::InvalidSchedule(_)
                | SchedulerError::InvalidJobFile(_)
                | SchedulerError::ImportFailed(_)
        )
    }
}

impl From<tickd_core::TickdError> for SchedulerError {
    fn from(e: tickd_core::TickdError) -> Self {
        match e {
            tickd_core::TickdError::Io(io) => SchedulerError::Io(io),
            tickd_core::TickdError::Serialization(se) => SchedulerError::Serialization(se),
            tickd_core::TickdError::Config(msg) => SchedulerError::Io(std::io::Error::other(msg)),
            tickd_core::TickdError::InvalidPathComponent(id) => SchedulerError::Io(
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid path component: {id:?}"),
                ),
            ),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
