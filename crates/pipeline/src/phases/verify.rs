#![forbid(unsafe_code)]

use super::{PhaseContext, PhaseExecutor, PhaseOutcome, interrupt_or_retry};
use crate::PipelineError;
use crate::config::{
    GATE_ACCESSIBILITY, GATE_BUILD, GATE_SEO, GATE_TYPECHECK, GateSpec, PipelineConfig,
};
use crate::gates::{
    AccessibilityGate, BuildGate, Gate, GateEngine, GateReport, SeoGate, TypecheckGate,
};
use crate::lock_store;
use crate::progress::EVENT_GATE_RESULT;
use crate::verify_scheduler::{LaneSettings, VerifyScheduler};
use serde::{Deserialize, Serialize};
use sm_core::model::{GateStatus, Phase, VerifyOutcome};
use sm_storage::{GateResultInput, GateRunRecordRequest};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSummary {
    pub gate: String,
    pub status: String,
    pub blocking: bool,
    pub findings: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub outcome: String,
    pub run: i64,
    pub gates: Vec<GateSummary>,
}

impl VerifyReport {
    pub fn outcome(&self) -> Option<VerifyOutcome> {
        VerifyOutcome::parse(&self.outcome)
    }
}

/// Runs the configured gates over the generated project and records every result.
pub struct VerifyExecutor;

impl VerifyExecutor {
    fn gates(ctx: &PhaseContext<'_>) -> Vec<(GateSpec, Arc<dyn Gate>)> {
        let verify = &ctx.config.verify;
        let scheduler = Arc::new(VerifyScheduler::new(
            ctx.store.clone(),
            ctx.clock.clone(),
            LaneSettings {
                lane: verify.lane.clone(),
                capacity: verify.lane_capacity,
                queue_wait: Duration::from_millis(verify.queue_wait_ms),
                poll: Duration::from_millis(verify.queue_poll_ms),
            },
        ));
        let mut out = Vec::with_capacity(verify.gates.len());
        for spec in &verify.gates {
            let gate: Arc<dyn Gate> = match spec.name.as_str() {
                GATE_TYPECHECK => Arc::new(TypecheckGate::new(ctx.services.checker.clone())),
                GATE_BUILD => Arc::new(BuildGate::new(
                    scheduler.clone(),
                    ctx.services.builder.clone(),
                    ctx.job_id().clone(),
                    ctx.job.migration_attempt,
                    format!("{}:{}:{}", ctx.worker_id(), ctx.job_id(), spec.name),
                )),
                GATE_ACCESSIBILITY => Arc::new(AccessibilityGate),
                GATE_SEO => Arc::new(SeoGate),
                other => {
                    // Config validation rejects unknown names before a worker starts.
                    tracing::error!(gate = %other, "unknown gate skipped");
                    continue;
                }
            };
            out.push((spec.clone(), gate));
        }
        out
    }

    fn run(ctx: &PhaseContext<'_>) -> Result<GateReport, PipelineError> {
        ctx.checkpoint()?;
        let snapshot = Arc::new(ctx.snapshot()?);
        GateEngine::new(Self::gates(ctx), ctx.clock.clone()).run(&snapshot)
    }

    /// Announces recorded results; only called once the run is committed.
    fn announce(
        ctx: &PhaseContext<'_>,
        run: i64,
        results: &[GateResultInput],
    ) -> Result<(), PipelineError> {
        for result in results {
            ctx.emit(
                EVENT_GATE_RESULT,
                format!("{} {}", result.gate_name, result.status),
                Some(serde_json::json!({
                    "run": run,
                    "gate": result.gate_name,
                    "status": result.status.as_str(),
                    "blocking": result.blocking,
                    "findings": result.findings.len(),
                    "duration_ms": result.duration_ms,
                })),
            )?;
        }
        Ok(())
    }
}

impl PhaseExecutor for VerifyExecutor {
    fn phase(&self) -> Phase {
        Phase::Verify
    }

    fn signature_config(&self, config: &PipelineConfig) -> String {
        let gates: Vec<String> = config
            .verify
            .gates
            .iter()
            .map(|g| format!("{}:{}", g.name, g.blocking))
            .collect();
        format!(
            "gates={};fail_on_blocking={}",
            gates.join(","),
            config.verify.fail_job_on_blocking_failure
        )
    }

    fn execute(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutcome, PipelineError> {
        let report = match Self::run(ctx) {
            Ok(report) => report,
            Err(err) => return interrupt_or_retry(err),
        };

        let gates: Vec<GateSummary> = report
            .results
            .iter()
            .map(|r| GateSummary {
                gate: r.gate_name.clone(),
                status: r.status.as_str().to_string(),
                blocking: r.blocking,
                findings: r.findings.len(),
            })
            .collect();
        let failed_blocking: Vec<String> = report
            .results
            .iter()
            .filter(|r| r.blocking && r.status == GateStatus::Fail)
            .map(|r| r.gate_name.clone())
            .collect();

        let recorded = lock_store(ctx.store).and_then(|mut store| {
            store
                .gate_results_record(GateRunRecordRequest {
                    job_id: ctx.job_id().clone(),
                    worker_id: ctx.worker_id().clone(),
                    migration_attempt: ctx.job.migration_attempt,
                    results: report.results.clone(),
                    now_ms: ctx.now_ms(),
                })
                .map_err(PipelineError::from)
        });
        let run = match recorded {
            Ok(run) => run,
            Err(err) => return interrupt_or_retry(err),
        };
        if let Err(err) = Self::announce(ctx, run, &report.results) {
            return interrupt_or_retry(err);
        }

        tracing::info!(
            job_id = %ctx.job_id(),
            outcome = %report.outcome,
            run,
            "verification finished"
        );
        let degraded = report.outcome == VerifyOutcome::Degraded;
        if degraded && ctx.config.verify.fail_job_on_blocking_failure {
            return Ok(PhaseOutcome::Fatal(format!(
                "blocking gate failed: {}",
                failed_blocking.join(", ")
            )));
        }
        PhaseOutcome::success(&VerifyReport {
            outcome: report.outcome.as_str().to_string(),
            run,
            gates,
        })
    }
}
