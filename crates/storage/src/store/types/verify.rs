#![forbid(unsafe_code)]

use sm_core::ids::JobId;

#[derive(Clone, Debug)]
pub struct VerifyBeginRequest {
    pub request_key: String,
    pub job_id: JobId,
    pub migration_attempt: i64,
    pub gate_name: String,
    pub holder: String,
    pub ttl_ms: u64,
    pub now_ms: i64,
}

/// Outcome of registering a verification request under its idempotent key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyBegin {
    /// The caller owns the request and must run it.
    Acquired,
    /// Another holder is running the same request.
    InFlight { holder: String, expires_at_ms: i64 },
    /// The request already finished; reuse its result.
    Completed { result_json: String },
}

#[derive(Clone, Debug)]
pub struct VerifySlotRequest {
    pub lane: String,
    pub capacity: u32,
    pub holder: String,
    pub ttl_ms: u64,
    pub now_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifySlotLease {
    pub lane: String,
    pub slot_index: u32,
    pub holder: String,
    pub expires_at_ms: i64,
}
