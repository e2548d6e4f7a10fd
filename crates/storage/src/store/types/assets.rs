#![forbid(unsafe_code)]

use sm_core::ids::{JobId, WorkerId};
use sm_core::model::AssetStatus;

#[derive(Clone, Debug)]
pub struct AssetRecordRow {
    pub seq: i64,
    pub job_id: JobId,
    pub source_url: String,
    pub local_path: Option<String>,
    pub status: AssetStatus,
    pub skip_reason: Option<String>,
    pub bytes_original: u64,
    pub bytes_final: u64,
    pub ts_ms: i64,
}

#[derive(Clone, Debug)]
pub struct AssetRecordRequest {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub source_url: String,
    pub local_path: Option<String>,
    pub status: AssetStatus,
    pub skip_reason: Option<String>,
    pub bytes_original: u64,
    pub bytes_final: u64,
    pub now_ms: i64,
}
