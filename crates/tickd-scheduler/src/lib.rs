//! `tickd-scheduler`: cron and one-shot job scheduling with SQLite
//! persistence.
//!
//! # Overview
//!
//! Jobs live in a SQLite `jobs` table ([`store::JobStore`]); every execution
//! attempt is a row in `runs`. The [`scheduler::Scheduler`] arms one tokio
//! task per job ([`trigger`]), and on each occurrence hands the job to the
//! [`runner::Runner`], which spawns the command through a
//! [`process::Spawner`] and records how it ended.
//!
//! | Schedule | Behaviour                                                |
//! |----------|----------------------------------------------------------|
//! | `Cron`   | 5-field pattern (6 with seconds), optional IANA timezone |
//! | `Once`   | Single fire at an absolute instant                       |
//!
//! A job's overlap policy decides what happens when it fires while a previous
//! run is still active: `skip` records a `skipped` run, `allow` starts another.
//!
//! [`sync::JobFileSync`] keeps the store and `jobs.toml` in step in both
//! directions, and [`control::JobControl`] bundles the operations a client
//! transport exposes.

pub mod control;
pub mod db;
pub mod error;
pub mod jobfile;
pub mod jobs;
pub mod process;
pub mod recovery;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod trigger;
pub mod types;

pub use control::{JobControl, RunLogs, RunStarted, UpsertOutcome};
pub use error::{Result, SchedulerError};
pub use jobs::{JobInput, ValidJob};
pub use process::{ShellSpawner, Spawner};
pub use recovery::recover_running_runs;
pub use runner::{RunHandle, Runner};
pub use scheduler::{Dispatch, Scheduler};
pub use store::JobStore;
pub use sync::{ApplySummary, JobFileSync};
pub use types::{Job, OverlapPolicy, Run, RunStatus, Schedule};
