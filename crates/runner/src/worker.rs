#![forbid(unsafe_code)]

use crate::RunnerError;
use sm_pipeline::clock::Clock;
use sm_pipeline::orchestrator::{Orchestrator, StepOutcome};
use std::time::Duration;

#[derive(Clone, Debug)]
pub(crate) struct WorkerOptions {
    /// Sleep between queue scans when nothing is claimable.
    pub(crate) poll: Duration,
    /// Exit once the queue has nothing claimable instead of polling forever.
    pub(crate) once: bool,
    /// Consecutive store or orchestration errors tolerated before the worker gives up.
    pub(crate) max_failures: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct WorkerStats {
    pub(crate) claims: u64,
    pub(crate) completed: u64,
    pub(crate) failed: u64,
    pub(crate) cancelled: u64,
    pub(crate) requeued: u64,
    pub(crate) lease_lost: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &StepOutcome) {
        self.claims += 1;
        match outcome {
            StepOutcome::Completed => self.completed += 1,
            StepOutcome::Failed { .. } => self.failed += 1,
            StepOutcome::Cancelled => self.cancelled += 1,
            StepOutcome::Requeued { .. } => self.requeued += 1,
            StepOutcome::LeaseLost => self.lease_lost += 1,
            StepOutcome::Advanced { .. } | StepOutcome::Skipped { .. } | StepOutcome::Terminal(_) => {}
        }
    }
}

/// Claims and drives jobs until told to stop. Every job is driven until it completes, fails,
/// backs off or is cancelled; then the queue is scanned again.
pub(crate) fn run(
    orchestrator: &Orchestrator,
    clock: &dyn Clock,
    options: &WorkerOptions,
) -> Result<WorkerStats, RunnerError> {
    let mut stats = WorkerStats::default();
    let mut failures = 0u32;
    tracing::info!(
        worker = %orchestrator.worker_id(),
        poll_ms = options.poll.as_millis() as u64,
        once = options.once,
        "worker started"
    );

    loop {
        match orchestrator.run_once() {
            Ok(Some((job_id, outcome))) => {
                failures = 0;
                stats.record(&outcome);
                tracing::info!(job_id = %job_id, outcome = ?outcome, "job pass finished");
            }
            Ok(None) => {
                failures = 0;
                if options.once {
                    tracing::info!(claims = stats.claims, "queue drained");
                    return Ok(stats);
                }
                clock.sleep(options.poll);
            }
            Err(err) => {
                failures += 1;
                tracing::error!(error = %err, failures, "worker pass failed");
                if failures >= options.max_failures.max(1) {
                    return Err(err.into());
                }
                clock.sleep(options.poll);
            }
        }
    }
}
