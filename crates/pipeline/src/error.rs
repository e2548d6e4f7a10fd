#![forbid(unsafe_code)]

use sm_storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("config: {0}")]
    Config(String),
    #[error("lease lost (job_id={job_id})")]
    LeaseLost { job_id: String },
    #[error("store lock poisoned")]
    StorePoisoned,
    #[error("unknown job {0}")]
    UnknownJob(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("cancellation requested (job_id={job_id})")]
    Cancelled { job_id: String },
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
}

impl PipelineError {
    /// The worker no longer owns the job and must stop writing to it.
    pub fn is_lease_lost(&self) -> bool {
        match self {
            Self::LeaseLost { .. } => true,
            Self::Store(err) => err.is_lease_lost(),
            _ => false,
        }
    }
}
