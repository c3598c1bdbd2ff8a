use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, SchedulerError};
use crate::types::{Job, Schedule};

/// Longest single sleep while waiting for an occurrence. Waking up this often
/// lets the task notice wall-clock jumps (suspend/resume, NTP steps).
const MAX_SLEEP_SLICE: Duration = Duration::from_secs(30);

/// Computes the occurrences of a job's schedule.
#[derive(Clone)]
pub enum Trigger {
    /// Recurring cron pattern, evaluated in `timezone`.
    Cron {
        expression: String,
        cron: Cron,
        timezone: Tz,
    },
    /// Single absolute instant.
    Once { at: DateTime<Utc> },
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Cron {
                expression,
                timezone,
                ..
            } => f
                .debug_struct("Cron")
                .field("expression", expression)
                .field("timezone", timezone)
                .finish(),
            Trigger::Once { at } => f.debug_struct("Once").field("at", at).finish(),
        }
    }
}

impl Trigger {
    pub fn for_job(job: &Job) -> Result<Self> {
        Self::new(&job.schedule, job.timezone.as_deref())
    }

    pub fn new(schedule: &Schedule, timezone: Option<&str>) -> Result<Self> {
        match schedule {
            Schedule::Cron { expression } => Ok(Trigger::Cron {
                expression: expression.clone(),
                cron: parse_cron(expression)?,
                timezone: parse_timezone(timezone)?,
            }),
            Schedule::Once { at } => Ok(Trigger::Once { at: *at }),
        }
    }

    /// First occurrence strictly after `from`, or `None` once exhausted.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron { cron, timezone, .. } => {
                let local = from.with_timezone(timezone);
                cron.find_next_occurrence(&local, false)
                    .ok()
                    .map(|next| next.with_timezone(&Utc))
            }
            Trigger::Once { at } => {
                if *at > from {
                    Some(*at)
                } else {
                    None
                }
            }
        }
    }
}

/// Parse a 5-field cron pattern, or 6 fields with leading seconds.
pub fn parse_cron(expression: &str) -> Result<Cron> {
    Cron::new(expression)
        .with_seconds_optional()
        .parse()
        .map_err(|e| SchedulerError::InvalidSchedule(format!("cron '{expression}': {e}")))
}

/// Resolve an IANA zone name; `None` means UTC.
pub fn parse_timezone(timezone: Option<&str>) -> Result<Tz> {
    match timezone {
        None => Ok(Tz::UTC),
        Some(name) => name
            .parse::<Tz>()
            .map_err(|e| SchedulerError::InvalidSchedule(format!("timezone '{name}': {e}"))),
    }
}

/// A live trigger task. Dropping the handle does not stop the task; call
/// [`TriggerHandle::cancel`].
pub struct TriggerHandle {
    trigger: Trigger,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl TriggerHandle {
    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    /// Next occurrence after now, as the armed task will see it.
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.trigger.next_after(Utc::now())
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Arm `trigger`: a tokio task waits for each occurrence and calls `on_fire`
/// with it, until the trigger is exhausted or the handle is cancelled.
///
/// Must be called from within a tokio runtime.
pub fn arm<F>(trigger: Trigger, on_fire: F) -> TriggerHandle
where
    F: Fn(DateTime<Utc>) + Send + 'static,
{
    let token = CancellationToken::new();
    let task = tokio::spawn(run_trigger(trigger.clone(), token.clone(), on_fire));
    TriggerHandle {
        trigger,
        token,
        task,
    }
}

async fn run_trigger<F>(trigger: Trigger, token: CancellationToken, on_fire: F)
where
    F: Fn(DateTime<Utc>) + Send + 'static,
{
    let mut next = trigger.next_after(Utc::now());
    while let Some(at) = next {
        loop {
            let now = Utc::now();
            if at <= now {
                break;
            }
            let wait = (at - now).to_std().unwrap_or_default().min(MAX_SLEEP_SLICE);
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        if token.is_cancelled() {
            return;
        }
        debug!(occurrence = %at, "trigger fired");
        on_fire(at);
        // A late wake-up must not replay every occurrence it slept through.
        next = trigger.next_after(Utc::now().max(at));
    }
    debug!("trigger exhausted");
}
