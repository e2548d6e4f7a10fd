#![forbid(unsafe_code)]

use super::{PhaseContext, PhaseExecutor, PhaseOutcome, interrupt_or_retry};
use crate::PipelineError;
use crate::assets::{AssetPipeline, AssetSummary};
use crate::codegen::{CodegenEngine, CodegenError, CodegenReport};
use crate::config::PipelineConfig;
use crate::model::{MigrationPlan, SiteAnalysis};
use serde::{Deserialize, Serialize};
use sm_core::model::Phase;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransformResult {
    pub codegen: CodegenReport,
    pub assets: AssetSummary,
}

/// Generates the project from the plan, then localizes referenced media.
pub struct TransformExecutor;

impl PhaseExecutor for TransformExecutor {
    fn phase(&self) -> Phase {
        Phase::Transform
    }

    fn signature_config(&self, config: &PipelineConfig) -> String {
        let assets = &config.assets;
        format!(
            "design_system={};max_repairs={};allow={};block={};file_cap={};total_cap={}",
            config.codegen.design_system,
            config.codegen.max_repairs,
            assets.allow_hosts.join(","),
            assets.block_hosts.join(","),
            assets.max_file_bytes,
            assets.max_total_bytes
        )
    }

    fn execute(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutcome, PipelineError> {
        let analysis: SiteAnalysis = ctx.prior.get(Phase::Analyze)?;
        let plan: MigrationPlan = ctx.prior.get(Phase::Plan)?;

        let codegen = match CodegenEngine::new(ctx).run(&plan) {
            Ok(report) => report,
            Err(CodegenError::Service { context, error }) => {
                return Ok(PhaseOutcome::from_service_error(&context, error));
            }
            Err(CodegenError::Pipeline(err)) => return interrupt_or_retry(err),
        };

        let assets = match AssetPipeline::new(ctx).run(&analysis.origin, &analysis.assets) {
            Ok(summary) => summary,
            Err(err) => return interrupt_or_retry(err),
        };

        tracing::info!(
            job_id = %ctx.job_id(),
            units = codegen.units.len(),
            fallbacks = codegen.fallbacks,
            ai_calls = codegen.ai_calls,
            assets_stored = assets.stored,
            "transform finished"
        );
        PhaseOutcome::success(&TransformResult { codegen, assets })
    }
}
