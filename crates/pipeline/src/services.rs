#![forbid(unsafe_code)]

//! Boundaries to the outside world. Every collaborator call goes through
//! [`call_with_timeout`], so a hung provider costs at most its deadline.

use crate::model::{GeneratedFile, MigrationPlan, PlannedPage, ProjectSnapshot, SiteAnalysis};
use serde::{Deserialize, Serialize};
use sm_core::ids::JobId;
use sm_core::model::Phase;
use sm_storage::FindingRow;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceErrorKind {
    /// Network blips, rate limits, 5xx. Worth retrying.
    Transient,
    /// The request or the response is unusable. Retrying the same input will not help.
    Invalid,
    Timeout,
}

impl ServiceErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Invalid => "invalid",
            Self::Timeout => "timeout",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{} error: {message}", kind.as_str())]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ServiceErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            kind: ServiceErrorKind::Invalid,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ServiceErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ServiceErrorKind::Transient | ServiceErrorKind::Timeout
        )
    }
}

/// Runs `call` on a helper thread and gives up after `timeout`. A call that overruns keeps
/// running detached; its result is dropped.
pub fn call_with_timeout<T, F>(label: &str, timeout: Duration, call: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let spawned = std::thread::Builder::new()
        .name(format!("sm-call-{label}"))
        .spawn(move || {
            let _ = tx.send(call());
        });
    if let Err(err) = spawned {
        return Err(ServiceError::transient(format!(
            "{label}: cannot spawn call thread: {err}"
        )));
    }
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(ServiceError::timeout(format!(
            "{label} exceeded {}ms",
            timeout.as_millis()
        ))),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(ServiceError::transient(format!(
            "{label}: call aborted"
        ))),
    }
}

/// Same contract as [`call_with_timeout`], except an overrunning call is waited out before the
/// timeout is reported. Whatever the caller holds around the call (a lane slot) stays held
/// until the work has really stopped.
pub fn call_with_timeout_settled<T, F>(
    label: &str,
    timeout: Duration,
    call: F,
) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let handle = std::thread::Builder::new()
        .name(format!("sm-call-{label}"))
        .spawn(move || {
            let _ = tx.send(call());
        })
        .map_err(|err| {
            ServiceError::transient(format!("{label}: cannot spawn call thread: {err}"))
        })?;
    let outcome = match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            tracing::warn!(
                label,
                timeout_ms = timeout.as_millis() as u64,
                "call overran its deadline; waiting for it to stop"
            );
            Err(ServiceError::timeout(format!(
                "{label} exceeded {}ms",
                timeout.as_millis()
            )))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(ServiceError::transient(format!(
            "{label}: call aborted"
        ))),
    };
    let _ = handle.join();
    outcome
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub source_url: String,
    pub instructions: Option<String>,
}

pub trait SiteAnalyzer: Send + Sync {
    fn analyze(&self, request: &AnalyzeRequest) -> Result<SiteAnalysis, ServiceError>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub analysis: SiteAnalysis,
    pub design_system: String,
    pub taxonomy: Vec<String>,
    pub instructions: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SharedRequest {
    pub plan: MigrationPlan,
    /// Primitive types still to be generated, already deduplicated.
    pub unit_types: Vec<String>,
}

/// Public surface of a generated primitive, as pages see it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimitiveSignature {
    pub name: String,
    pub import_path: String,
    pub exports: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageRequest {
    pub design_system: String,
    pub page: PlannedPage,
    pub primitives: Vec<PrimitiveSignature>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    #[serde(default)]
    pub line: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepairRequest {
    pub path: String,
    pub unit_type: String,
    pub design_system: String,
    pub content: String,
    pub diagnostics: Vec<Diagnostic>,
    pub attempt: u32,
}

/// The AI model. Outputs are structured; callers validate and repair them locally.
pub trait Generator: Send + Sync {
    /// Raw structured plan, validated by the caller.
    fn plan(&self, request: &PlanRequest) -> Result<serde_json::Value, ServiceError>;

    /// One call for every requested primitive.
    fn generate_shared(&self, request: &SharedRequest) -> Result<Vec<GeneratedFile>, ServiceError>;

    fn generate_page(&self, request: &PageRequest) -> Result<GeneratedFile, ServiceError>;

    fn repair(&self, request: &RepairRequest) -> Result<GeneratedFile, ServiceError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSource {
    pub path: String,
    pub unit_type: String,
    pub content: String,
}

pub trait Checker: Send + Sync {
    /// Compiler diagnostics for a single unit; empty means it compiles.
    fn check_unit(&self, unit: &UnitSource) -> Result<Vec<Diagnostic>, ServiceError>;

    /// Whole-project type check.
    fn check_project(&self, snapshot: &ProjectSnapshot) -> Result<Vec<FindingRow>, ServiceError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildReport {
    pub success: bool,
    pub findings: Vec<FindingRow>,
}

pub trait ProjectBuilder: Send + Sync {
    /// `deadline` is the gate budget; implementations should stop the build once it passes.
    fn build(
        &self,
        snapshot: &ProjectSnapshot,
        deadline: Duration,
    ) -> Result<BuildReport, ServiceError>;
}

pub trait AssetFetcher: Send + Sync {
    /// Size announced by the remote side (e.g. `Content-Length`), when it can tell cheaply.
    fn probe_size(&self, url: &str) -> Result<Option<u64>, ServiceError>;

    fn fetch(&self, url: &str) -> Result<Vec<u8>, ServiceError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranscodedAsset {
    pub bytes: Vec<u8>,
    pub extension: String,
}

pub trait Transcoder: Send + Sync {
    /// `Ok(None)` when the format is left as-is.
    fn transcode(&self, url: &str, bytes: &[u8]) -> Result<Option<TranscodedAsset>, ServiceError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub url: String,
}

pub trait Deployer: Send + Sync {
    fn deploy(&self, job_id: &JobId, snapshot: &ProjectSnapshot) -> Result<Deployment, ServiceError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub seq: i64,
    pub kind: String,
    pub phase: Option<String>,
    pub message: String,
    pub ts_ms: i64,
}

impl ProgressEvent {
    pub fn phase(&self) -> Option<Phase> {
        self.phase.as_deref().and_then(Phase::parse)
    }
}

/// Progress transport (SSE, logs, queues). Delivery is best-effort; the durable copy lives
/// in the store.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: &ProgressEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn publish(&self, _event: &ProgressEvent) {}
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn publish(&self, event: &ProgressEvent) {
        tracing::info!(
            job_id = %event.job_id,
            seq = event.seq,
            kind = %event.kind,
            phase = event.phase.as_deref().unwrap_or("-"),
            "{}",
            event.message
        );
    }
}

/// The full set of collaborators a worker needs.
#[derive(Clone)]
pub struct Services {
    pub analyzer: Arc<dyn SiteAnalyzer>,
    pub generator: Arc<dyn Generator>,
    pub checker: Arc<dyn Checker>,
    pub builder: Arc<dyn ProjectBuilder>,
    pub fetcher: Arc<dyn AssetFetcher>,
    pub transcoder: Arc<dyn Transcoder>,
    pub deployer: Arc<dyn Deployer>,
    pub progress: Arc<dyn ProgressSink>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_turns_into_timeout_error() {
        let err = call_with_timeout("slow", Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        })
        .expect_err("deadline");
        assert_eq!(err.kind, ServiceErrorKind::Timeout);
        assert!(err.is_retryable());
    }

    #[test]
    fn settled_timeout_returns_only_after_the_call_stops() {
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = finished.clone();
        let err = call_with_timeout_settled("slow", Duration::from_millis(20), move || {
            std::thread::sleep(Duration::from_millis(200));
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })
        .expect_err("deadline");
        assert_eq!(err.kind, ServiceErrorKind::Timeout);
        assert!(finished.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn fast_calls_pass_through() {
        let value = call_with_timeout("fast", Duration::from_secs(5), || Ok(7)).expect("value");
        assert_eq!(value, 7);
        let err = call_with_timeout::<(), _>("bad", Duration::from_secs(5), || {
            Err(ServiceError::invalid("nope"))
        })
        .expect_err("error");
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "invalid error: nope");
    }
}
