#![forbid(unsafe_code)]

use crate::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const MAX_CONFIG_BYTES: u64 = 256 * 1024;

pub const GATE_TYPECHECK: &str = "typecheck";
pub const GATE_BUILD: &str = "build";
pub const GATE_ACCESSIBILITY: &str = "accessibility";
pub const GATE_SEO: &str = "seo";

const KNOWN_GATES: [&str; 4] = [GATE_TYPECHECK, GATE_BUILD, GATE_ACCESSIBILITY, GATE_SEO];

/// Shared primitives the first generation pass may produce, in generation order.
pub const DEFAULT_SHARED_TAXONOMY: [&str; 10] = [
    "Button",
    "Card",
    "Footer",
    "Form",
    "Header",
    "Hero",
    "Image",
    "Link",
    "Navigation",
    "Section",
];

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub lease: LeaseSettings,
    pub retry: RetrySettings,
    pub timeouts: PhaseTimeouts,
    pub codegen: CodegenSettings,
    pub verify: VerifySettings,
    pub assets: AssetPolicy,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeaseSettings {
    pub ttl_ms: u64,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            ttl_ms: 30 * 60 * 1_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    /// Executions of one phase before a retryable failure becomes fatal.
    pub max_phase_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_phase_attempts: 3,
            backoff_base_ms: 5_000,
            backoff_max_ms: 5 * 60 * 1_000,
        }
    }
}

impl RetrySettings {
    /// Exponential backoff after the `attempt`-th failed execution (1-based).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(20);
        self.backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PhaseTimeouts {
    pub analyze_ms: u64,
    pub plan_ms: u64,
    pub deploy_ms: u64,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            analyze_ms: 5 * 60 * 1_000,
            plan_ms: 3 * 60 * 1_000,
            deploy_ms: 10 * 60 * 1_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CodegenSettings {
    pub design_system: String,
    pub shared_taxonomy: Vec<String>,
    pub max_repairs: u32,
    pub generation_timeout_ms: u64,
    pub repair_timeout_ms: u64,
    pub check_timeout_ms: u64,
    pub page_concurrency: usize,
    /// Lifetime of cross-job unit cache entries; `None` keeps them until evicted.
    pub cache_ttl_ms: Option<u64>,
}

impl Default for CodegenSettings {
    fn default() -> Self {
        Self {
            design_system: "tailwind".to_string(),
            shared_taxonomy: DEFAULT_SHARED_TAXONOMY
                .iter()
                .map(|name| name.to_string())
                .collect(),
            max_repairs: 2,
            generation_timeout_ms: 2 * 60 * 1_000,
            repair_timeout_ms: 60 * 1_000,
            check_timeout_ms: 30 * 1_000,
            page_concurrency: 4,
            cache_ttl_ms: Some(7 * 24 * 60 * 60 * 1_000),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateSpec {
    pub name: String,
    pub blocking: bool,
    pub timeout_ms: u64,
}

impl GateSpec {
    pub fn new(name: &str, blocking: bool, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            blocking,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifySettings {
    /// Gates in execution order.
    pub gates: Vec<GateSpec>,
    /// Lane name for heavy gates in the shared slot table.
    pub lane: String,
    pub lane_capacity: u32,
    pub queue_wait_ms: u64,
    pub queue_poll_ms: u64,
    /// When set, a failed blocking gate fails the job instead of delivering it as degraded.
    pub fail_job_on_blocking_failure: bool,
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            gates: vec![
                GateSpec::new(GATE_TYPECHECK, true, Duration::from_secs(60)),
                GateSpec::new(GATE_BUILD, true, Duration::from_secs(10 * 60)),
                GateSpec::new(GATE_ACCESSIBILITY, false, Duration::from_secs(15)),
                GateSpec::new(GATE_SEO, false, Duration::from_secs(15)),
            ],
            lane: "build".to_string(),
            lane_capacity: 1,
            queue_wait_ms: 15 * 60 * 1_000,
            queue_poll_ms: 2_000,
            fail_job_on_blocking_failure: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AssetPolicy {
    /// Off-origin hosts that may still be fetched (font services, CDNs).
    pub allow_hosts: Vec<String>,
    /// Hosts never fetched, even when allow-listed.
    pub block_hosts: Vec<String>,
    pub max_file_bytes: u64,
    pub max_total_bytes: u64,
    pub fetch_timeout_ms: u64,
    pub output_dir: String,
}

impl Default for AssetPolicy {
    fn default() -> Self {
        Self {
            allow_hosts: vec![
                "fonts.googleapis.com".to_string(),
                "fonts.gstatic.com".to_string(),
            ],
            block_hosts: vec!["images.gettyimages.com".to_string(), "shutterstock.com".to_string()],
            max_file_bytes: 5 * 1024 * 1024,
            max_total_bytes: 50 * 1024 * 1024,
            fetch_timeout_ms: 30 * 1_000,
            output_dir: "public/assets".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, PipelineError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|err| PipelineError::Config(format!("invalid pipeline config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let meta = std::fs::metadata(path)
            .map_err(|err| PipelineError::Config(format!("{}: {err}", path.display())))?;
        if meta.len() > MAX_CONFIG_BYTES {
            return Err(PipelineError::Config(format!(
                "{}: config file is too large",
                path.display()
            )));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|err| PipelineError::Config(format!("{}: {err}", path.display())))?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let fail = |msg: &str| Err(PipelineError::Config(msg.to_string()));

        if self.lease.ttl_ms < 1_000 {
            return fail("lease.ttl_ms must be at least 1000");
        }
        if self.retry.max_phase_attempts == 0 {
            return fail("retry.max_phase_attempts must be at least 1");
        }
        if self.retry.backoff_max_ms < self.retry.backoff_base_ms {
            return fail("retry.backoff_max_ms must not be below backoff_base_ms");
        }
        if self.codegen.design_system.trim().is_empty() {
            return fail("codegen.design_system must not be empty");
        }
        if self.codegen.page_concurrency == 0 {
            return fail("codegen.page_concurrency must be at least 1");
        }
        if self
            .codegen
            .shared_taxonomy
            .iter()
            .any(|name| !is_component_name(name))
        {
            return fail("codegen.shared_taxonomy entries must be PascalCase identifiers");
        }
        if self.verify.gates.is_empty() {
            return fail("verify.gates must not be empty");
        }
        let mut seen = std::collections::BTreeSet::new();
        for gate in &self.verify.gates {
            if !KNOWN_GATES.contains(&gate.name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "verify.gates: unknown gate `{}`",
                    gate.name
                )));
            }
            if !seen.insert(gate.name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "verify.gates: duplicate gate `{}`",
                    gate.name
                )));
            }
            if gate.timeout_ms == 0 {
                return fail("verify.gates: timeout_ms must be positive");
            }
        }
        if self.verify.lane_capacity == 0 {
            return fail("verify.lane_capacity must be at least 1");
        }
        if self.verify.queue_poll_ms == 0 {
            return fail("verify.queue_poll_ms must be positive");
        }
        if self.assets.max_file_bytes > self.assets.max_total_bytes {
            return fail("assets.max_file_bytes must not exceed max_total_bytes");
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease.ttl_ms)
    }
}

pub(crate) fn is_component_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.lease.ttl_ms, 1_800_000);
        assert_eq!(config.retry.max_phase_attempts, 3);
        assert_eq!(config.codegen.max_repairs, 2);
        assert_eq!(config.verify.lane_capacity, 1);
        assert!(!config.verify.fail_job_on_blocking_failure);
        let order: Vec<_> = config.verify.gates.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(order, [GATE_TYPECHECK, GATE_BUILD, GATE_ACCESSIBILITY, GATE_SEO]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn yaml_overrides_merge_with_defaults() {
        let config = PipelineConfig::from_yaml_str(
            "codegen:\n  max_repairs: 4\nverify:\n  fail_job_on_blocking_failure: true\n",
        )
        .expect("parse");
        assert_eq!(config.codegen.max_repairs, 4);
        assert_eq!(config.codegen.page_concurrency, 4);
        assert!(config.verify.fail_job_on_blocking_failure);
        assert_eq!(config.verify.gates.len(), 4);
    }

    #[test]
    fn unknown_gates_and_fields_are_rejected() {
        let err = PipelineConfig::from_yaml_str(
            "verify:\n  gates:\n    - { name: lint, blocking: true, timeout_ms: 10 }\n",
        )
        .expect_err("unknown gate");
        assert!(err.to_string().contains("unknown gate"));

        assert!(PipelineConfig::from_yaml_str("lease:\n  ttl: 5\n").is_err());
    }

    #[test]
    fn backoff_grows_and_saturates() {
        let retry = RetrySettings {
            max_phase_attempts: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 350,
        };
        assert_eq!(retry.backoff_ms(1), 100);
        assert_eq!(retry.backoff_ms(2), 200);
        assert_eq!(retry.backoff_ms(3), 350);
        assert_eq!(retry.backoff_ms(40), 350);
    }
}
