#![forbid(unsafe_code)]

use sm_core::ids::JobId;
use sm_core::model::Phase;

#[derive(Clone, Debug)]
pub struct JobEventRow {
    pub job_id: JobId,
    pub seq: i64,
    pub ts_ms: i64,
    pub kind: String,
    pub phase: Option<Phase>,
    pub message: String,
    pub payload_json: Option<String>,
}

#[derive(Clone, Debug)]
pub struct JobEventAppendRequest {
    pub job_id: JobId,
    pub kind: String,
    pub phase: Option<Phase>,
    pub message: String,
    pub payload_json: Option<String>,
    pub now_ms: i64,
}
