#![forbid(unsafe_code)]

use crate::services::{ProgressEvent, ProgressSink};
use crate::{PipelineError, SharedStore, lock_store};
use sm_core::ids::JobId;
use sm_core::model::Phase;
use sm_storage::{JobEventAppendRequest, JobEventRow};

pub const EVENT_PHASE_STARTED: &str = "phase_started";
pub const EVENT_PHASE_COMPLETED: &str = "phase_completed";
pub const EVENT_PHASE_SKIPPED: &str = "phase_skipped";
pub const EVENT_PHASE_RETRY: &str = "phase_retry";
pub const EVENT_JOB_FAILED: &str = "job_failed";
pub const EVENT_JOB_CANCELLED: &str = "job_cancelled";
pub const EVENT_CANCEL_REQUESTED: &str = "cancel_requested";
pub const EVENT_JOB_SUBMITTED: &str = "job_submitted";
pub const EVENT_JOB_INVALIDATED: &str = "job_invalidated";
pub const EVENT_GATE_RESULT: &str = "gate_result";
pub const EVENT_UNIT_FALLBACK: &str = "unit_fallback";
pub const EVENT_PLAN_FALLBACK: &str = "plan_fallback";

/// Appends the event to the job log, then hands it to the sink. The store assigns the
/// sequence number, so numbering stays monotonic across workers.
pub fn record_event(
    store: &SharedStore,
    sink: Option<&dyn ProgressSink>,
    request: JobEventAppendRequest,
) -> Result<JobEventRow, PipelineError> {
    let row = lock_store(store)?.job_event_append(request)?;
    if let Some(sink) = sink {
        sink.publish(&progress_event(&row));
    }
    Ok(row)
}

pub fn event_request(
    job_id: &JobId,
    kind: &str,
    phase: Option<Phase>,
    message: impl Into<String>,
    payload: Option<serde_json::Value>,
    now_ms: i64,
) -> JobEventAppendRequest {
    JobEventAppendRequest {
        job_id: job_id.clone(),
        kind: kind.to_string(),
        phase,
        message: message.into(),
        payload_json: payload.map(|value| value.to_string()),
        now_ms,
    }
}

pub fn progress_event(row: &JobEventRow) -> ProgressEvent {
    ProgressEvent {
        job_id: row.job_id.to_string(),
        seq: row.seq,
        kind: row.kind.clone(),
        phase: row.phase.map(|phase| phase.as_str().to_string()),
        message: row.message.clone(),
        ts_ms: row.ts_ms,
    }
}
