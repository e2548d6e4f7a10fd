#![forbid(unsafe_code)]

use super::{PhaseContext, PhaseExecutor, PhaseOutcome};
use crate::PipelineError;
use crate::services::{AnalyzeRequest, call_with_timeout};
use sm_core::model::Phase;
use std::time::Duration;

pub struct AnalyzeExecutor;

impl PhaseExecutor for AnalyzeExecutor {
    fn phase(&self) -> Phase {
        Phase::Analyze
    }

    fn execute(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutcome, PipelineError> {
        let analyzer = ctx.services.analyzer.clone();
        let request = AnalyzeRequest {
            source_url: ctx.job.source_url.clone(),
            instructions: ctx.job.instructions.clone(),
        };
        let timeout = Duration::from_millis(ctx.config.timeouts.analyze_ms);
        let analysis = match call_with_timeout("analyze", timeout, move || {
            analyzer.analyze(&request)
        }) {
            Ok(analysis) => analysis,
            Err(err) => return Ok(PhaseOutcome::from_service_error("analyze", err)),
        };

        if analysis.pages.is_empty() {
            return Ok(PhaseOutcome::Fatal(
                "analysis found no pages on the source site".to_string(),
            ));
        }
        tracing::info!(
            job_id = %ctx.job_id(),
            pages = analysis.pages.len(),
            assets = analysis.assets.len(),
            "site analyzed"
        );
        PhaseOutcome::success(&analysis)
    }
}
