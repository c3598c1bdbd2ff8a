//! `tickd-core`: configuration, filesystem layout, and the lifecycle event
//! log shared by the scheduler and the daemon binary.

pub mod config;
pub mod error;
pub mod events;
pub mod paths;
pub mod state;

pub use config::TickdConfig;
pub use error::{Result, TickdError};
pub use events::{EventKind, EventLog, EventRecord};
pub use paths::{Paths, RunOutputPaths};
pub use state::DaemonState;
