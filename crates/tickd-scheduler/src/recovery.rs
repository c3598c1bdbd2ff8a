use serde_json::json;
use tickd_core::{EventKind, EventLog};
use tracing::{info, warn};

use crate::error::Result;
use crate::store::JobStore;

/// Reclassify runs left `running` by a previous daemon.
///
/// Rows without a pid, or whose pid `is_alive` reports dead, become `lost`.
/// Rows with a live pid are left alone: nothing will ever record their exit,
/// but the process is still doing its work. Must run before any trigger is
/// armed. Returns the number of rows marked lost.
pub fn recover_running_runs(
    store: &JobStore,
    events: &EventLog,
    is_alive: impl Fn(u32) -> bool,
) -> Result<usize> {
    let mut lost = 0;
    for run in store.list_running_runs()? {
        if let Some(pid) = run.pid {
            if is_alive(pid) {
                info!(run_id = %run.id, job_id = %run.job_id, pid, "orphaned run still alive, leaving it");
                continue;
            }
        }
        if store.mark_run_lost(&run.id)? {
            lost += 1;
            warn!(run_id = %run.id, job_id = %run.job_id, pid = ?run.pid, "run lost");
            events.emit(
                EventKind::RunLost,
                json!({ "jobId": run.job_id, "runId": run.id, "pid": run.pid }),
            );
        }
    }
    if lost > 0 {
        info!(count = lost, "recovery marked runs lost");
    }
    Ok(lost)
}
