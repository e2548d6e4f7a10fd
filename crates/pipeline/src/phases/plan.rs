#![forbid(unsafe_code)]

use super::{PhaseContext, PhaseExecutor, PhaseOutcome};
use crate::PipelineError;
use crate::config::PipelineConfig;
use crate::model::{MigrationPlan, SiteAnalysis};
use crate::progress::EVENT_PLAN_FALLBACK;
use crate::services::{PlanRequest, call_with_timeout};
use sm_core::model::Phase;
use std::time::Duration;

/// Asks the generator for a plan and validates it. Unusable output, or provider failures on
/// the last allowed attempt, fall back to the deterministic plan.
pub struct PlanExecutor;

impl PhaseExecutor for PlanExecutor {
    fn phase(&self) -> Phase {
        Phase::Plan
    }

    fn signature_config(&self, config: &PipelineConfig) -> String {
        format!(
            "design_system={};taxonomy={}",
            config.codegen.design_system,
            config.codegen.shared_taxonomy.join(",")
        )
    }

    fn execute(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutcome, PipelineError> {
        let analysis: SiteAnalysis = ctx.prior.get(Phase::Analyze)?;
        let settings = &ctx.config.codegen;

        let generator = ctx.services.generator.clone();
        let request = PlanRequest {
            analysis: analysis.clone(),
            design_system: settings.design_system.clone(),
            taxonomy: settings.shared_taxonomy.clone(),
            instructions: ctx.job.instructions.clone(),
        };
        let timeout = Duration::from_millis(ctx.config.timeouts.plan_ms);
        let reason = match call_with_timeout("plan", timeout, move || generator.plan(&request)) {
            Ok(value) => match MigrationPlan::from_provider_output(value, settings) {
                Ok(plan) => return PhaseOutcome::success(&plan),
                Err(rejection) => rejection.to_string(),
            },
            Err(err) if err.is_retryable() && !ctx.is_last_attempt() => {
                return Ok(PhaseOutcome::from_service_error("plan", err));
            }
            Err(err) => err.to_string(),
        };

        tracing::warn!(job_id = %ctx.job_id(), %reason, "using fallback plan");
        let plan = MigrationPlan::fallback(&analysis, settings);
        ctx.emit(
            EVENT_PLAN_FALLBACK,
            format!("plan derived locally: {reason}"),
            Some(serde_json::json!({ "pages": plan.pages.len() })),
        )?;
        PhaseOutcome::success(&plan)
    }
}
