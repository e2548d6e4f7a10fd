#![forbid(unsafe_code)]

use sm_core::ids::{JobId, WorkerId};
use sm_core::model::{UnitKind, UnitStatus};

#[derive(Clone, Debug)]
pub struct UnitRow {
    pub seq: i64,
    pub job_id: JobId,
    pub path: String,
    pub unit_type: String,
    pub kind: UnitKind,
    pub status: UnitStatus,
    pub source_signature: String,
    pub repair_attempts: u32,
    pub content: Option<String>,
    pub ts_ms: i64,
}

#[derive(Clone, Debug)]
pub struct UnitRecordRequest {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub path: String,
    pub unit_type: String,
    pub kind: UnitKind,
    pub status: UnitStatus,
    pub source_signature: String,
    pub repair_attempts: u32,
    pub content: Option<String>,
    pub now_ms: i64,
}
