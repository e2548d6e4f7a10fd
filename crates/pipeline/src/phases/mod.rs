#![forbid(unsafe_code)]

//! Phase executors. Each one maps a job plus the cached results of earlier phases to a
//! [`PhaseOutcome`]; executors are idempotent and never advance the job themselves.

mod analyze;
mod deploy;
mod plan;
mod transform;
mod verify;

pub use analyze::AnalyzeExecutor;
pub use deploy::{DeployExecutor, DeployResult};
pub use plan::PlanExecutor;
pub use transform::{TransformExecutor, TransformResult};
pub use verify::{GateSummary, VerifyExecutor, VerifyReport};

use crate::cache::KvCache;
use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::lease::HeldLease;
use crate::model::ProjectSnapshot;
use crate::progress;
use crate::services::{ServiceError, Services};
use crate::{PipelineError, SharedStore, lock_store};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sm_core::ids::{JobId, WorkerId};
use sm_core::model::Phase;
use sm_storage::JobRow;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Three-way result of one phase execution.
#[derive(Clone, Debug, PartialEq)]
pub enum PhaseOutcome {
    Success(serde_json::Value),
    /// Worth another execution after backoff, within the attempt bound.
    Retryable(String),
    Fatal(String),
}

impl PhaseOutcome {
    pub fn success<T: Serialize>(value: &T) -> Result<Self, PipelineError> {
        serde_json::to_value(value)
            .map(Self::Success)
            .map_err(|err| PipelineError::Corrupt(format!("phase result: {err}")))
    }

    /// Transient and timed-out calls are retried; unusable input or output is not.
    pub fn from_service_error(context: &str, err: ServiceError) -> Self {
        if err.is_retryable() {
            Self::Retryable(format!("{context}: {err}"))
        } else {
            Self::Fatal(format!("{context}: {err}"))
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Retryable(_) => "retryable",
            Self::Fatal(_) => "fatal",
        }
    }
}

/// Read-only view of the results earlier phases committed.
#[derive(Clone, Debug, Default)]
pub struct PriorResults {
    by_phase: BTreeMap<Phase, String>,
}

impl PriorResults {
    pub fn insert(&mut self, phase: Phase, result_json: String) {
        self.by_phase.insert(phase, result_json);
    }

    pub fn raw(&self, phase: Phase) -> Option<&str> {
        self.by_phase.get(&phase).map(String::as_str)
    }

    pub fn get<T: DeserializeOwned>(&self, phase: Phase) -> Result<T, PipelineError> {
        let raw = self.raw(phase).ok_or_else(|| {
            PipelineError::Corrupt(format!("missing {} result", phase.as_str()))
        })?;
        serde_json::from_str(raw)
            .map_err(|err| PipelineError::Corrupt(format!("{} result: {err}", phase.as_str())))
    }
}

pub struct PhaseContext<'a> {
    pub job: &'a JobRow,
    pub phase: Phase,
    /// 1-based execution count of this phase, including the current one.
    pub attempt: u32,
    pub signature: &'a str,
    pub prior: &'a PriorResults,
    pub store: &'a SharedStore,
    pub services: &'a Services,
    pub config: &'a PipelineConfig,
    pub clock: &'a Arc<dyn Clock>,
    pub cache: &'a dyn KvCache,
    pub lease: &'a HeldLease<'a>,
}

impl PhaseContext<'_> {
    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }

    pub fn worker_id(&self) -> &WorkerId {
        self.lease.worker_id()
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.config.retry.max_phase_attempts
    }

    /// Renews the lease and observes cooperative cancellation. Long-running executors call
    /// this between units of work.
    pub fn checkpoint(&self) -> Result<(), PipelineError> {
        self.lease.keep_alive()?;
        let job = lock_store(self.store)?
            .job_get(self.job_id())?
            .ok_or_else(|| PipelineError::UnknownJob(self.job_id().to_string()))?;
        if job.cancel_requested {
            return Err(PipelineError::Cancelled {
                job_id: self.job_id().to_string(),
            });
        }
        Ok(())
    }

    pub fn emit(
        &self,
        kind: &str,
        message: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) -> Result<(), PipelineError> {
        let request = progress::event_request(
            self.job_id(),
            kind,
            Some(self.phase),
            message,
            payload,
            self.now_ms(),
        );
        progress::record_event(self.store, Some(self.services.progress.as_ref()), request)?;
        Ok(())
    }

    /// Current project files: the newest content of every generated unit.
    pub fn snapshot(&self) -> Result<ProjectSnapshot, PipelineError> {
        let store = lock_store(self.store)?;
        let mut snapshot = ProjectSnapshot {
            files: BTreeMap::new(),
            asset_dir: Some(asset_dir(store.storage_dir(), self.job_id())),
        };
        for unit in store.units_latest(self.job_id())? {
            if let Some(content) = unit.content {
                snapshot.files.insert(unit.path, content);
            }
        }
        Ok(snapshot)
    }
}

/// Where downloaded media of a job is written.
pub fn asset_dir(storage_dir: &std::path::Path, job_id: &JobId) -> PathBuf {
    storage_dir.join("assets").join(job_id.as_str())
}

/// Maps errors raised inside an executor to an outcome. Lost leases and cancellation stay
/// errors so the orchestrator can stop without touching the job.
pub(crate) fn interrupt_or_retry(err: PipelineError) -> Result<PhaseOutcome, PipelineError> {
    match err {
        err if err.is_lease_lost() => Err(err),
        PipelineError::Cancelled { .. } => Err(err),
        PipelineError::Corrupt(reason) => Ok(PhaseOutcome::Fatal(reason)),
        other => Ok(PhaseOutcome::Retryable(other.to_string())),
    }
}

pub trait PhaseExecutor: Send + Sync {
    fn phase(&self) -> Phase;

    /// Configuration this phase depends on. It is folded into the input signature, so a
    /// change invalidates the cached result.
    fn signature_config(&self, _config: &PipelineConfig) -> String {
        String::new()
    }

    fn execute(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutcome, PipelineError>;
}

#[derive(Clone)]
pub struct Executors {
    by_phase: BTreeMap<Phase, Arc<dyn PhaseExecutor>>,
}

impl Executors {
    pub fn standard() -> Self {
        let executors: [Arc<dyn PhaseExecutor>; 5] = [
            Arc::new(AnalyzeExecutor),
            Arc::new(PlanExecutor),
            Arc::new(TransformExecutor),
            Arc::new(VerifyExecutor),
            Arc::new(DeployExecutor),
        ];
        let mut by_phase = BTreeMap::new();
        for executor in executors {
            by_phase.insert(executor.phase(), executor);
        }
        Self { by_phase }
    }

    /// Swaps the executor registered for `executor.phase()`.
    pub fn with(mut self, executor: Arc<dyn PhaseExecutor>) -> Self {
        self.by_phase.insert(executor.phase(), executor);
        self
    }

    pub fn get(&self, phase: Phase) -> Option<&Arc<dyn PhaseExecutor>> {
        self.by_phase.get(&phase)
    }
}

impl Default for Executors {
    fn default() -> Self {
        Self::standard()
    }
}
