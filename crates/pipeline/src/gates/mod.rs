#![forbid(unsafe_code)]

//! Ordered quality gates, fail-fast on blocking failures.

mod static_checks;

pub use static_checks::{AccessibilityGate, SeoGate};

use crate::clock::Clock;
use crate::config::GateSpec;
use crate::model::ProjectSnapshot;
use crate::services::{
    Checker, ProjectBuilder, ServiceError, ServiceErrorKind, call_with_timeout,
    call_with_timeout_settled,
};
use crate::verify_scheduler::{Scheduled, VerifyScheduler, VerifyTicket};
use crate::{PipelineError, config};
use sm_core::ids::JobId;
use sm_core::model::{GateStatus, Severity, VerifyOutcome};
use sm_storage::{FindingRow, GateResultInput};
use std::sync::Arc;
use std::time::Duration;

pub const TIMEOUT_FINDING_PREFIX: &str = "timeout";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GateVerdict {
    pub passed: bool,
    pub findings: Vec<FindingRow>,
}

impl GateVerdict {
    /// Passes unless some finding is an error.
    pub fn from_findings(findings: Vec<FindingRow>) -> Self {
        let passed = !findings.iter().any(|f| f.severity == Severity::Error);
        Self { passed, findings }
    }

    pub fn timeout(detail: impl std::fmt::Display) -> Self {
        Self {
            passed: false,
            findings: vec![FindingRow {
                severity: Severity::Error,
                location: None,
                message: format!("{TIMEOUT_FINDING_PREFIX}: {detail}"),
            }],
        }
    }

    pub fn from_service_error(err: &ServiceError) -> Self {
        if err.kind == ServiceErrorKind::Timeout {
            return Self::timeout(&err.message);
        }
        Self {
            passed: false,
            findings: vec![FindingRow {
                severity: Severity::Error,
                location: None,
                message: format!("gate could not run: {err}"),
            }],
        }
    }
}

/// A single check over the generated project. Gates read the snapshot and never change it.
pub trait Gate: Send + Sync {
    fn run(
        &self,
        snapshot: &Arc<ProjectSnapshot>,
        deadline: Duration,
    ) -> Result<GateVerdict, PipelineError>;

    /// Time the gate may spend on top of its deadline before the work starts, such as waiting
    /// for a lane slot.
    fn allowance(&self) -> Duration {
        Duration::ZERO
    }
}

pub struct TypecheckGate {
    checker: Arc<dyn Checker>,
}

impl TypecheckGate {
    pub fn new(checker: Arc<dyn Checker>) -> Self {
        Self { checker }
    }
}

impl Gate for TypecheckGate {
    fn run(
        &self,
        snapshot: &Arc<ProjectSnapshot>,
        deadline: Duration,
    ) -> Result<GateVerdict, PipelineError> {
        let checker = self.checker.clone();
        let snapshot = snapshot.clone();
        Ok(
            match call_with_timeout(config::GATE_TYPECHECK, deadline, move || {
                checker.check_project(&snapshot)
            }) {
                Ok(findings) => GateVerdict::from_findings(findings),
                Err(err) => GateVerdict::from_service_error(&err),
            },
        )
    }
}

/// Runs the project build inside the shared verification lane.
pub struct BuildGate {
    scheduler: Arc<VerifyScheduler>,
    builder: Arc<dyn ProjectBuilder>,
    job_id: JobId,
    migration_attempt: i64,
    holder: String,
}

impl BuildGate {
    pub fn new(
        scheduler: Arc<VerifyScheduler>,
        builder: Arc<dyn ProjectBuilder>,
        job_id: JobId,
        migration_attempt: i64,
        holder: String,
    ) -> Self {
        Self {
            scheduler,
            builder,
            job_id,
            migration_attempt,
            holder,
        }
    }
}

impl Gate for BuildGate {
    fn run(
        &self,
        snapshot: &Arc<ProjectSnapshot>,
        deadline: Duration,
    ) -> Result<GateVerdict, PipelineError> {
        let ticket = VerifyTicket {
            job_id: self.job_id.clone(),
            migration_attempt: self.migration_attempt,
            gate_name: config::GATE_BUILD.to_string(),
            holder: self.holder.clone(),
            deadline,
        };
        let builder = self.builder.clone();
        let snapshot = snapshot.clone();
        // The slot stays held until the build has stopped, even past its deadline.
        let scheduled = self.scheduler.run(&ticket, move || {
            match call_with_timeout_settled(config::GATE_BUILD, deadline, move || {
                builder.build(&snapshot, deadline)
            }) {
                Ok(report) => {
                    let mut verdict = GateVerdict::from_findings(report.findings);
                    verdict.passed &= report.success;
                    verdict
                }
                Err(err) => GateVerdict::from_service_error(&err),
            }
        })?;
        Ok(match scheduled {
            Scheduled::Ran(verdict) | Scheduled::Reused(verdict) => verdict,
            Scheduled::QueueTimeout => GateVerdict::timeout(format!(
                "no verification slot within {}ms",
                self.scheduler.settings().queue_wait.as_millis()
            )),
        })
    }

    fn allowance(&self) -> Duration {
        let settings = self.scheduler.settings();
        settings
            .queue_wait
            .saturating_add(settings.poll)
            .saturating_add(BUILD_SETTLE_GRACE)
    }
}

/// Extra time the engine grants a build past its deadline for the builder to stop.
const BUILD_SETTLE_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct GateReport {
    pub results: Vec<GateResultInput>,
    pub outcome: VerifyOutcome,
}

pub struct GateEngine {
    gates: Vec<(GateSpec, Arc<dyn Gate>)>,
    clock: Arc<dyn Clock>,
}

impl GateEngine {
    pub fn new(gates: Vec<(GateSpec, Arc<dyn Gate>)>, clock: Arc<dyn Clock>) -> Self {
        Self { gates, clock }
    }

    /// Runs every gate in order. After a blocking failure the remaining gates are recorded as
    /// `skip` without running.
    pub fn run(&self, snapshot: &Arc<ProjectSnapshot>) -> Result<GateReport, PipelineError> {
        let mut results = Vec::with_capacity(self.gates.len());
        let mut halted = false;

        for (spec, gate) in &self.gates {
            let result = if halted {
                GateResultInput {
                    gate_name: spec.name.clone(),
                    status: GateStatus::Skip,
                    blocking: spec.blocking,
                    findings: Vec::new(),
                    duration_ms: 0,
                }
            } else {
                let started = self.clock.now_ms();
                let verdict = self.run_gate(spec, gate, snapshot)?;
                let elapsed =
                    u64::try_from(self.clock.now_ms().saturating_sub(started)).unwrap_or(0);
                let status = if verdict.passed {
                    GateStatus::Pass
                } else {
                    GateStatus::Fail
                };
                if status == GateStatus::Fail && spec.blocking {
                    halted = true;
                }
                tracing::info!(
                    gate = %spec.name,
                    status = %status,
                    blocking = spec.blocking,
                    findings = verdict.findings.len(),
                    elapsed_ms = elapsed,
                    "gate finished"
                );
                GateResultInput {
                    gate_name: spec.name.clone(),
                    status,
                    blocking: spec.blocking,
                    findings: verdict.findings,
                    duration_ms: elapsed,
                }
            };
            results.push(result);
        }

        let outcome = if results
            .iter()
            .all(|r| !r.blocking || r.status == GateStatus::Pass)
        {
            VerifyOutcome::Pass
        } else {
            VerifyOutcome::Degraded
        };
        Ok(GateReport { results, outcome })
    }

    /// Runs one gate under its deadline. A gate that overruns is recorded as a timeout failure
    /// and left to finish in the background.
    fn run_gate(
        &self,
        spec: &GateSpec,
        gate: &Arc<dyn Gate>,
        snapshot: &Arc<ProjectSnapshot>,
    ) -> Result<GateVerdict, PipelineError> {
        let deadline = spec.timeout();
        let gate = gate.clone();
        let limit = deadline.saturating_add(gate.allowance());
        let snapshot = snapshot.clone();
        match call_with_timeout(&spec.name, limit, move || Ok(gate.run(&snapshot, deadline))) {
            Ok(verdict) => verdict,
            Err(err) => {
                tracing::warn!(gate = %spec.name, error = %err, "gate did not finish");
                Ok(GateVerdict::from_service_error(&err))
            }
        }
    }
}
