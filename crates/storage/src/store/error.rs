#![forbid(unsafe_code)]

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("unknown id")]
    UnknownId,
    #[error("job is terminal (job_id={job_id}, phase={phase})")]
    JobTerminal { job_id: String, phase: String },
    #[error("phase mismatch (job_id={job_id}, expected={expected}, actual={actual})")]
    PhaseMismatch {
        job_id: String,
        expected: String,
        actual: String,
    },
    #[error("lease not held (job_id={job_id}, worker={worker_id}, holder={})", holder.as_deref().unwrap_or("none"))]
    LeaseNotHeld {
        job_id: String,
        worker_id: String,
        holder: Option<String>,
    },
    #[error("lease held (job_id={job_id}, holder={holder}, expires_at_ms={expires_at_ms})")]
    LeaseHeld {
        job_id: String,
        holder: String,
        expires_at_ms: i64,
    },
    #[error("cancellation not requested (job_id={job_id})")]
    CancelNotRequested { job_id: String },
}

impl StoreError {
    /// The caller lost (or never had) the job lease; it must stop touching the job.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Self::LeaseNotHeld { .. })
    }
}
