#![forbid(unsafe_code)]

//! Drives claimed jobs through `ANALYZE → PLAN → TRANSFORM → VERIFY → DEPLOY`.
//!
//! Every state change goes through a lease-guarded store write. A phase whose cached result
//! still matches its input signature is skipped without calling the executor, which makes
//! resuming after a crash or lease expiry cheap.

use crate::cache::{KvCache, StoreCache};
use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::lease::{HeldLease, LeaseManager, StoreLeaseManager};
use crate::phases::{Executors, PhaseContext, PhaseExecutor, PhaseOutcome, PriorResults};
use crate::progress::{
    self, EVENT_JOB_CANCELLED, EVENT_JOB_FAILED, EVENT_PHASE_COMPLETED, EVENT_PHASE_RETRY,
    EVENT_PHASE_SKIPPED, EVENT_PHASE_STARTED,
};
use crate::services::Services;
use crate::signature::{SourceDescriptor, analyze_signature, chained_signature};
use crate::{PipelineError, SharedStore, lock_store};
use serde_json::json;
use sm_core::ids::{JobId, WorkerId};
use sm_core::model::Phase;
use sm_storage::{
    JobAdvanceRequest, JobFailRequest, JobRequeueRequest, JobRow, PhaseAttemptRequest,
    PhaseResultPutRequest,
};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

const CLAIM_SCAN_LIMIT: usize = 16;

/// What a single [`Orchestrator::step`] did to the job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Advanced { from: Phase, to: Phase },
    /// The cached result matched; the executor was not called.
    Skipped { phase: Phase },
    Completed,
    Requeued { phase: Phase, available_at_ms: i64 },
    Failed { phase: Phase, reason: String },
    Cancelled,
    Terminal(Phase),
    LeaseLost,
}

impl StepOutcome {
    fn keeps_going(&self) -> bool {
        matches!(self, Self::Advanced { .. } | Self::Skipped { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    NotClaimed,
    Stopped(StepOutcome),
}

pub struct Orchestrator {
    store: SharedStore,
    services: Services,
    config: Arc<PipelineConfig>,
    clock: Arc<dyn Clock>,
    cache: Arc<dyn KvCache>,
    leases: Arc<dyn LeaseManager>,
    executors: Executors,
    worker_id: WorkerId,
}

impl Orchestrator {
    pub fn new(
        store: SharedStore,
        services: Services,
        config: Arc<PipelineConfig>,
        clock: Arc<dyn Clock>,
        worker_id: WorkerId,
    ) -> Self {
        let cache = Arc::new(StoreCache::new(store.clone(), clock.clone()));
        let leases = Arc::new(StoreLeaseManager::new(
            store.clone(),
            clock.clone(),
            config.lease_ttl(),
        ));
        Self {
            store,
            services,
            config,
            clock,
            cache,
            leases,
            executors: Executors::standard(),
            worker_id,
        }
    }

    pub fn with_executors(mut self, executors: Executors) -> Self {
        self.executors = executors;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn KvCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn lease_manager(&self) -> &dyn LeaseManager {
        self.leases.as_ref()
    }

    /// Claims the first claimable job and drives it until it stops. `None` when the queue has
    /// nothing this worker could claim.
    pub fn run_once(&self) -> Result<Option<(JobId, StepOutcome)>, PipelineError> {
        let now_ms = self.clock.now_ms();
        let candidates = lock_store(&self.store)?.jobs_claimable(now_ms, CLAIM_SCAN_LIMIT)?;
        for job_id in candidates {
            match self.run_job(&job_id)? {
                RunOutcome::NotClaimed => continue,
                RunOutcome::Stopped(outcome) => return Ok(Some((job_id, outcome))),
            }
        }
        Ok(None)
    }

    /// Claims `job_id` and steps it until it completes, fails, backs off, is cancelled or the
    /// lease is lost. The lease is released on the way out unless it was lost.
    pub fn run_job(&self, job_id: &JobId) -> Result<RunOutcome, PipelineError> {
        let Some(lease) = HeldLease::acquire(self.leases.as_ref(), job_id, &self.worker_id)?
        else {
            return Ok(RunOutcome::NotClaimed);
        };
        tracing::info!(job_id = %job_id, worker = %self.worker_id, "job claimed");

        let result = self.drive(&lease);
        match &result {
            Ok(StepOutcome::LeaseLost) => {
                tracing::warn!(job_id = %job_id, worker = %self.worker_id, "lease lost, stopping");
            }
            _ => {
                if let Err(err) = lease.release() {
                    tracing::warn!(job_id = %job_id, error = %err, "lease release failed");
                }
            }
        }
        result.map(RunOutcome::Stopped)
    }

    fn drive(&self, lease: &HeldLease<'_>) -> Result<StepOutcome, PipelineError> {
        loop {
            let outcome = self.step(lease)?;
            if !outcome.keeps_going() {
                return Ok(outcome);
            }
        }
    }

    /// Runs (or skips) the job's current phase once.
    pub fn step(&self, lease: &HeldLease<'_>) -> Result<StepOutcome, PipelineError> {
        match self.step_inner(lease) {
            Err(err) if err.is_lease_lost() => Ok(StepOutcome::LeaseLost),
            other => other,
        }
    }

    fn step_inner(&self, lease: &HeldLease<'_>) -> Result<StepOutcome, PipelineError> {
        lease.keep_alive()?;
        let job = self.load_job(lease.job_id())?;
        if job.phase.is_terminal() {
            return Ok(StepOutcome::Terminal(job.phase));
        }
        if job.cancel_requested {
            return self.cancel(lease, job.phase);
        }

        let phase = job.phase;
        let executor = self.executors.get(phase).cloned().ok_or_else(|| {
            PipelineError::Config(format!("no executor registered for {}", phase.as_str()))
        })?;
        let (prior, signature) = match self.inputs(&job, executor.as_ref()) {
            Ok(inputs) => inputs,
            Err(PipelineError::Corrupt(reason)) => return self.fail(lease, phase, reason),
            Err(err) => return Err(err),
        };

        let cached = lock_store(&self.store)?.phase_result_get(&job.id, phase)?;
        if cached.is_some_and(|row| row.signature == signature) {
            let outcome = self.advance(lease, phase)?;
            self.emit(&job.id, EVENT_PHASE_SKIPPED, phase, "cached result reused", None)?;
            tracing::info!(job_id = %job.id, phase = phase.as_str(), "phase skipped");
            return Ok(match outcome {
                StepOutcome::Advanced { .. } => StepOutcome::Skipped { phase },
                other => other,
            });
        }

        let attempt = lock_store(&self.store)?.phase_attempt_increment(PhaseAttemptRequest {
            id: job.id.clone(),
            worker_id: self.worker_id.clone(),
            phase,
            now_ms: self.clock.now_ms(),
        })?;
        self.emit(
            &job.id,
            EVENT_PHASE_STARTED,
            phase,
            format!("{} started", phase.as_str()),
            Some(json!({ "attempt": attempt })),
        )?;

        let span = tracing::info_span!("phase", job_id = %job.id, phase = phase.as_str(), attempt);
        let _entered = span.enter();
        let ctx = PhaseContext {
            job: &job,
            phase,
            attempt,
            signature: &signature,
            prior: &prior,
            store: &self.store,
            services: &self.services,
            config: &self.config,
            clock: &self.clock,
            cache: self.cache.as_ref(),
            lease,
        };
        let executed = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(&ctx)))
            .unwrap_or_else(|payload| {
                Ok(PhaseOutcome::Fatal(format!(
                    "executor panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });

        match executed {
            Ok(PhaseOutcome::Success(value)) => self.commit(lease, phase, signature, value),
            Ok(PhaseOutcome::Retryable(reason)) => {
                self.retry_or_fail(lease, phase, attempt, reason)
            }
            Ok(PhaseOutcome::Fatal(reason)) => {
                if self.load_job(lease.job_id())?.cancel_requested {
                    return self.cancel(lease, phase);
                }
                self.fail(lease, phase, reason)
            }
            Err(PipelineError::Cancelled { .. }) => self.cancel(lease, phase),
            Err(PipelineError::Corrupt(reason)) => self.fail(lease, phase, reason),
            Err(err) => Err(err),
        }
    }

    fn load_job(&self, job_id: &JobId) -> Result<JobRow, PipelineError> {
        lock_store(&self.store)?
            .job_get(job_id)?
            .ok_or_else(|| PipelineError::UnknownJob(job_id.to_string()))
    }

    /// Results of every earlier phase plus the input signature of the current one.
    fn inputs(
        &self,
        job: &JobRow,
        executor: &dyn PhaseExecutor,
    ) -> Result<(PriorResults, String), PipelineError> {
        let rows = lock_store(&self.store)?.phase_results(&job.id)?;
        let mut prior = PriorResults::default();
        let mut previous = None;
        for row in rows {
            if row.phase.ordinal() >= job.phase.ordinal() {
                continue;
            }
            if Some(row.phase) == job.phase.previous() {
                previous = Some((row.signature.clone(), row.result_json.clone()));
            }
            prior.insert(row.phase, row.result_json);
        }

        let signature = match job.phase.previous() {
            None => analyze_signature(&SourceDescriptor {
                source_url: &job.source_url,
                project_id: job.project_id.as_deref(),
                instructions: job.instructions.as_deref(),
            }),
            Some(prev_phase) => {
                let (prev_signature, prev_result) = previous.ok_or_else(|| {
                    PipelineError::Corrupt(format!(
                        "{} has no committed result",
                        prev_phase.as_str()
                    ))
                })?;
                chained_signature(
                    job.phase,
                    &prev_signature,
                    &prev_result,
                    &executor.signature_config(&self.config),
                )
            }
        };
        Ok((prior, signature))
    }

    fn advance(&self, lease: &HeldLease<'_>, from: Phase) -> Result<StepOutcome, PipelineError> {
        let row = lock_store(&self.store)?.job_advance(JobAdvanceRequest {
            id: lease.job_id().clone(),
            worker_id: self.worker_id.clone(),
            from,
            now_ms: self.clock.now_ms(),
        })?;
        Ok(if row.phase == Phase::Done {
            StepOutcome::Completed
        } else {
            StepOutcome::Advanced {
                from,
                to: row.phase,
            }
        })
    }

    fn commit(
        &self,
        lease: &HeldLease<'_>,
        phase: Phase,
        signature: String,
        value: serde_json::Value,
    ) -> Result<StepOutcome, PipelineError> {
        let result_json = serde_json::to_string(&value)
            .map_err(|err| PipelineError::Corrupt(format!("phase result: {err}")))?;
        lock_store(&self.store)?.phase_result_put(PhaseResultPutRequest {
            id: lease.job_id().clone(),
            worker_id: self.worker_id.clone(),
            phase,
            signature,
            result_json,
            now_ms: self.clock.now_ms(),
        })?;
        let outcome = self.advance(lease, phase)?;
        self.emit(
            lease.job_id(),
            EVENT_PHASE_COMPLETED,
            phase,
            format!("{} completed", phase.as_str()),
            None,
        )?;
        tracing::info!(job_id = %lease.job_id(), phase = phase.as_str(), "phase completed");
        Ok(outcome)
    }

    fn retry_or_fail(
        &self,
        lease: &HeldLease<'_>,
        phase: Phase,
        attempt: u32,
        reason: String,
    ) -> Result<StepOutcome, PipelineError> {
        if self.load_job(lease.job_id())?.cancel_requested {
            return self.cancel(lease, phase);
        }
        let max = self.config.retry.max_phase_attempts;
        if attempt >= max {
            return self.fail(
                lease,
                phase,
                format!("gave up after {attempt} attempts: {reason}"),
            );
        }

        let now_ms = self.clock.now_ms();
        let backoff_ms = self.config.retry.backoff_ms(attempt);
        let available_at_ms = now_ms.saturating_add(i64::try_from(backoff_ms).unwrap_or(i64::MAX));
        let row = lock_store(&self.store)?.job_requeue(JobRequeueRequest {
            id: lease.job_id().clone(),
            worker_id: self.worker_id.clone(),
            available_at_ms,
            reason: reason.clone(),
            now_ms,
        })?;
        self.emit(
            lease.job_id(),
            EVENT_PHASE_RETRY,
            phase,
            reason.clone(),
            Some(json!({ "attempt": attempt, "max_attempts": max, "backoff_ms": backoff_ms })),
        )?;
        tracing::warn!(
            job_id = %lease.job_id(),
            phase = phase.as_str(),
            attempt,
            backoff_ms,
            reason = %reason,
            "phase requeued"
        );
        Ok(StepOutcome::Requeued {
            phase,
            available_at_ms: row.available_at_ms,
        })
    }

    fn fail(
        &self,
        lease: &HeldLease<'_>,
        phase: Phase,
        reason: String,
    ) -> Result<StepOutcome, PipelineError> {
        lock_store(&self.store)?.job_fail(JobFailRequest {
            id: lease.job_id().clone(),
            worker_id: self.worker_id.clone(),
            reason: reason.clone(),
            now_ms: self.clock.now_ms(),
        })?;
        self.emit(lease.job_id(), EVENT_JOB_FAILED, phase, reason.clone(), None)?;
        tracing::error!(
            job_id = %lease.job_id(),
            phase = phase.as_str(),
            reason = %reason,
            "job failed"
        );
        Ok(StepOutcome::Failed { phase, reason })
    }

    fn cancel(&self, lease: &HeldLease<'_>, phase: Phase) -> Result<StepOutcome, PipelineError> {
        let now_ms = self.clock.now_ms();
        lock_store(&self.store)?.job_mark_cancelled(lease.job_id(), &self.worker_id, now_ms)?;
        self.emit(
            lease.job_id(),
            EVENT_JOB_CANCELLED,
            phase,
            format!("cancelled before finishing {}", phase.as_str()),
            None,
        )?;
        tracing::info!(job_id = %lease.job_id(), phase = phase.as_str(), "job cancelled");
        Ok(StepOutcome::Cancelled)
    }

    fn emit(
        &self,
        job_id: &JobId,
        kind: &str,
        phase: Phase,
        message: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) -> Result<(), PipelineError> {
        let request =
            progress::event_request(job_id, kind, Some(phase), message, payload, self.clock.now_ms());
        progress::record_event(&self.store, Some(self.services.progress.as_ref()), request)?;
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_progress_keeps_the_loop_going() {
        assert!(
            StepOutcome::Advanced {
                from: Phase::Analyze,
                to: Phase::Plan
            }
            .keeps_going()
        );
        assert!(StepOutcome::Skipped { phase: Phase::Plan }.keeps_going());
        assert!(!StepOutcome::Completed.keeps_going());
        assert!(!StepOutcome::LeaseLost.keeps_going());
        assert!(
            !StepOutcome::Requeued {
                phase: Phase::Plan,
                available_at_ms: 0
            }
            .keeps_going()
        );
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
