#![forbid(unsafe_code)]

//! Job leases: at most one live worker per job.
//!
//! Claims are a single conditional update in the store, so two workers racing on the same
//! job cannot both win. A worker that dies simply stops renewing; once its lease expires the
//! job is claimable again and resumes from the last committed checkpoint.

use crate::clock::Clock;
use crate::{PipelineError, SharedStore, lock_store};
use sm_core::ids::{JobId, WorkerId};
use sm_storage::JobLeaseRequest;
use std::sync::Arc;
use std::time::Duration;

pub trait LeaseManager: Send + Sync {
    /// `Ok(false)` when someone else holds the job, it is terminal, or it is backing off.
    fn try_claim(&self, job_id: &JobId, worker_id: &WorkerId) -> Result<bool, PipelineError>;

    /// Extends a held lease. `Ok(false)` means the lease is gone.
    fn renew(&self, job_id: &JobId, worker_id: &WorkerId) -> Result<bool, PipelineError>;

    fn release(&self, job_id: &JobId, worker_id: &WorkerId) -> Result<(), PipelineError>;

    fn ttl(&self) -> Duration;
}

pub struct StoreLeaseManager {
    store: SharedStore,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl StoreLeaseManager {
    pub fn new(store: SharedStore, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    fn request(&self, job_id: &JobId, worker_id: &WorkerId) -> JobLeaseRequest {
        JobLeaseRequest {
            id: job_id.clone(),
            worker_id: worker_id.clone(),
            ttl_ms: u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX),
            now_ms: self.clock.now_ms(),
        }
    }
}

impl LeaseManager for StoreLeaseManager {
    fn try_claim(&self, job_id: &JobId, worker_id: &WorkerId) -> Result<bool, PipelineError> {
        let request = self.request(job_id, worker_id);
        let claimed = lock_store(&self.store)?.job_try_claim(request)?;
        if claimed {
            tracing::debug!(job_id = %job_id, worker = %worker_id, "lease claimed");
        }
        Ok(claimed)
    }

    fn renew(&self, job_id: &JobId, worker_id: &WorkerId) -> Result<bool, PipelineError> {
        let request = self.request(job_id, worker_id);
        let renewed = lock_store(&self.store)?.job_renew(request)?;
        if !renewed {
            tracing::warn!(job_id = %job_id, worker = %worker_id, "lease renewal refused");
        }
        Ok(renewed)
    }

    fn release(&self, job_id: &JobId, worker_id: &WorkerId) -> Result<(), PipelineError> {
        let now_ms = self.clock.now_ms();
        lock_store(&self.store)?.job_release(job_id, worker_id, now_ms)?;
        Ok(())
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// A claimed job. Every checkpoint calls [`HeldLease::keep_alive`]; once it fails the holder
/// must stop writing to the job.
pub struct HeldLease<'a> {
    manager: &'a dyn LeaseManager,
    job_id: JobId,
    worker_id: WorkerId,
}

impl<'a> HeldLease<'a> {
    pub fn acquire(
        manager: &'a dyn LeaseManager,
        job_id: &JobId,
        worker_id: &WorkerId,
    ) -> Result<Option<Self>, PipelineError> {
        if !manager.try_claim(job_id, worker_id)? {
            return Ok(None);
        }
        Ok(Some(Self {
            manager,
            job_id: job_id.clone(),
            worker_id: worker_id.clone(),
        }))
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn keep_alive(&self) -> Result<(), PipelineError> {
        if self.manager.renew(&self.job_id, &self.worker_id)? {
            Ok(())
        } else {
            Err(PipelineError::LeaseLost {
                job_id: self.job_id.to_string(),
            })
        }
    }

    pub fn release(self) -> Result<(), PipelineError> {
        self.manager.release(&self.job_id, &self.worker_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::shared_store;
    use sm_storage::{JobCreateRequest, SqliteStore};

    fn setup() -> (tempfile::TempDir, SharedStore, ManualClock, JobId) {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut store = SqliteStore::open(dir.path()).expect("open store");
        let job = store
            .job_create(JobCreateRequest {
                source_url: "https://site.example/".to_string(),
                project_id: None,
                user_id: None,
                instructions: None,
                now_ms: 1_000,
            })
            .expect("create job");
        (dir, shared_store(store), ManualClock::new(1_000), job.id)
    }

    #[test]
    fn held_lease_detects_loss() {
        let (_dir, store, clock, job) = setup();
        let manager = StoreLeaseManager::new(
            store.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(5),
        );
        let a = WorkerId::try_new("a").expect("worker");
        let b = WorkerId::try_new("b").expect("worker");

        let held = HeldLease::acquire(&manager, &job, &a)
            .expect("claim")
            .expect("first claim wins");
        assert!(HeldLease::acquire(&manager, &job, &b).expect("claim").is_none());
        held.keep_alive().expect("still held");

        clock.advance(Duration::from_secs(5));
        assert!(manager.try_claim(&job, &b).expect("reclaim"));
        let err = held.keep_alive().expect_err("lost");
        assert!(err.is_lease_lost());
    }
}
