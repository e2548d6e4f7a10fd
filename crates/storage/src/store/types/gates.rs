#![forbid(unsafe_code)]

use sm_core::ids::{JobId, WorkerId};
use sm_core::model::{GateStatus, Severity};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FindingRow {
    pub severity: Severity,
    pub location: Option<String>,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct GateResultInput {
    pub gate_name: String,
    pub status: GateStatus,
    pub blocking: bool,
    pub findings: Vec<FindingRow>,
    pub duration_ms: u64,
}

#[derive(Clone, Debug)]
pub struct GateRunRecordRequest {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub migration_attempt: i64,
    /// In configured gate order.
    pub results: Vec<GateResultInput>,
    pub now_ms: i64,
}

#[derive(Clone, Debug)]
pub struct GateResultRow {
    pub job_id: JobId,
    pub migration_attempt: i64,
    pub run: i64,
    pub position: u32,
    pub gate_name: String,
    pub status: GateStatus,
    pub blocking: bool,
    pub findings: Vec<FindingRow>,
    pub duration_ms: u64,
    pub ts_ms: i64,
}
