#![forbid(unsafe_code)]

use super::{PhaseContext, PhaseExecutor, PhaseOutcome, VerifyReport, interrupt_or_retry};
use crate::PipelineError;
use crate::services::call_with_timeout;
use serde::{Deserialize, Serialize};
use sm_core::model::Phase;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployResult {
    pub url: String,
    /// Verification outcome the deployment shipped with (`pass` or `degraded`).
    pub verify_outcome: String,
}

pub struct DeployExecutor;

impl PhaseExecutor for DeployExecutor {
    fn phase(&self) -> Phase {
        Phase::Deploy
    }

    fn execute(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutcome, PipelineError> {
        let verify: VerifyReport = ctx.prior.get(Phase::Verify)?;
        let snapshot = match ctx.checkpoint().and_then(|()| ctx.snapshot()) {
            Ok(snapshot) => snapshot,
            Err(err) => return interrupt_or_retry(err),
        };
        if snapshot.files.is_empty() {
            return Ok(PhaseOutcome::Fatal("nothing to deploy".to_string()));
        }

        let deployer = ctx.services.deployer.clone();
        let job_id = ctx.job_id().clone();
        let timeout = Duration::from_millis(ctx.config.timeouts.deploy_ms);
        match call_with_timeout("deploy", timeout, move || deployer.deploy(&job_id, &snapshot)) {
            Ok(deployment) => {
                tracing::info!(job_id = %ctx.job_id(), url = %deployment.url, "deployed");
                PhaseOutcome::success(&DeployResult {
                    url: deployment.url,
                    verify_outcome: verify.outcome,
                })
            }
            Err(err) => Ok(PhaseOutcome::from_service_error("deploy", err)),
        }
    }
}
