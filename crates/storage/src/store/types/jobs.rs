#![forbid(unsafe_code)]

use sm_core::ids::{JobId, WorkerId};
use sm_core::model::Phase;

#[derive(Clone, Debug)]
pub struct JobRow {
    pub id: JobId,
    pub revision: i64,
    pub phase: Phase,
    pub source_url: String,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub instructions: Option<String>,
    pub migration_attempt: i64,
    pub lease_owner: Option<String>,
    pub lease_expires_at_ms: Option<i64>,
    pub cancel_requested: bool,
    pub available_at_ms: i64,
    pub last_error: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub completed_at_ms: Option<i64>,
}

impl JobRow {
    /// True when some worker holds an unexpired lease at `now_ms`.
    pub fn lease_active(&self, now_ms: i64) -> bool {
        self.lease_owner.is_some() && self.lease_expires_at_ms.is_some_and(|exp| exp > now_ms)
    }
}

#[derive(Clone, Debug)]
pub struct JobCreateRequest {
    pub source_url: String,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub instructions: Option<String>,
    pub now_ms: i64,
}

/// Shared shape of claim/renew: one job, one worker, one TTL.
#[derive(Clone, Debug)]
pub struct JobLeaseRequest {
    pub id: JobId,
    pub worker_id: WorkerId,
    pub ttl_ms: u64,
    pub now_ms: i64,
}

#[derive(Clone, Debug)]
pub struct JobAdvanceRequest {
    pub id: JobId,
    pub worker_id: WorkerId,
    pub from: Phase,
    pub now_ms: i64,
}

#[derive(Clone, Debug)]
pub struct JobRequeueRequest {
    pub id: JobId,
    pub worker_id: WorkerId,
    pub available_at_ms: i64,
    pub reason: String,
    pub now_ms: i64,
}

#[derive(Clone, Debug)]
pub struct JobFailRequest {
    pub id: JobId,
    pub worker_id: WorkerId,
    pub reason: String,
    pub now_ms: i64,
}

#[derive(Clone, Debug)]
pub struct JobInvalidateRequest {
    pub id: JobId,
    pub from_phase: Phase,
    /// Set when the invalidating caller currently holds the lease itself.
    pub worker_id: Option<WorkerId>,
    pub now_ms: i64,
}

#[derive(Clone, Debug)]
pub struct PhaseResultRow {
    pub phase: Phase,
    pub signature: String,
    pub result_json: String,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct PhaseResultPutRequest {
    pub id: JobId,
    pub worker_id: WorkerId,
    pub phase: Phase,
    pub signature: String,
    pub result_json: String,
    pub now_ms: i64,
}

#[derive(Clone, Debug)]
pub struct PhaseAttemptRequest {
    pub id: JobId,
    pub worker_id: WorkerId,
    pub phase: Phase,
    pub now_ms: i64,
}
