#![forbid(unsafe_code)]

//! Collaborators backed by external commands, wired from the `--tools` YAML file.

use crate::RunnerError;
use crate::process::{ProcessTool, ToolCommand};
use serde::{Deserialize, Serialize};
use sm_core::ids::JobId;
use sm_core::model::Severity;
use sm_pipeline::model::{GeneratedFile, ProjectSnapshot, SiteAnalysis};
use sm_pipeline::services::{
    AnalyzeRequest, AssetFetcher, BuildReport, Checker, Deployer, Deployment, Diagnostic,
    Generator, PageRequest, PlanRequest, ProjectBuilder, ProgressSink, RepairRequest,
    ServiceError, Services, SharedRequest, SiteAnalyzer, TranscodedAsset, Transcoder, UnitSource,
};
use sm_storage::FindingRow;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const MAX_TOOLS_FILE_BYTES: u64 = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TranscoderCommand {
    pub(crate) program: String,
    #[serde(default)]
    pub(crate) args: Vec<String>,
    #[serde(default)]
    pub(crate) env: BTreeMap<String, String>,
    #[serde(default = "default_transcode_timeout_ms")]
    pub(crate) timeout_ms: u64,
    /// Extension of everything the transcoder emits, e.g. `webp`.
    pub(crate) output_extension: String,
}

fn default_transcode_timeout_ms() -> u64 {
    60 * 1_000
}

impl TranscoderCommand {
    fn command(&self) -> ToolCommand {
        ToolCommand {
            program: self.program.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            timeout_ms: self.timeout_ms,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ToolsConfig {
    pub(crate) analyzer: ToolCommand,
    pub(crate) generator: ToolCommand,
    pub(crate) checker: ToolCommand,
    pub(crate) builder: ToolCommand,
    pub(crate) fetcher: ToolCommand,
    pub(crate) deployer: ToolCommand,
    #[serde(default)]
    pub(crate) transcoder: Option<TranscoderCommand>,
}

impl ToolsConfig {
    pub(crate) fn from_yaml_str(raw: &str) -> Result<Self, RunnerError> {
        let tools: Self = serde_yaml::from_str(raw)
            .map_err(|e| RunnerError::Config(format!("tools file: {e}")))?;
        tools.validate()?;
        Ok(tools)
    }

    pub(crate) fn load(path: &Path) -> Result<Self, RunnerError> {
        let meta = std::fs::metadata(path)
            .map_err(|e| RunnerError::Config(format!("{}: {e}", path.display())))?;
        if meta.len() > MAX_TOOLS_FILE_BYTES {
            return Err(RunnerError::Config(format!(
                "{}: tools file is too large",
                path.display()
            )));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RunnerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&raw)
    }

    fn validate(&self) -> Result<(), RunnerError> {
        let transcoder = self.transcoder.as_ref().map(TranscoderCommand::command);
        let mut commands = vec![
            ("analyzer", &self.analyzer),
            ("generator", &self.generator),
            ("checker", &self.checker),
            ("builder", &self.builder),
            ("fetcher", &self.fetcher),
            ("deployer", &self.deployer),
        ];
        if let (Some(config), Some(command)) = (&self.transcoder, &transcoder) {
            let ext = config.output_extension.trim();
            if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(RunnerError::Config(
                    "transcoder.output_extension must be alphanumeric".to_string(),
                ));
            }
            commands.push(("transcoder", command));
        }
        for (name, command) in commands {
            if command.program.trim().is_empty() {
                return Err(RunnerError::Config(format!("{name}.program must not be empty")));
            }
            if command.timeout_ms == 0 {
                return Err(RunnerError::Config(format!("{name}.timeout_ms must be positive")));
            }
        }
        Ok(())
    }

    pub(crate) fn services(&self, progress: Arc<dyn ProgressSink>) -> Services {
        let transcoder: Arc<dyn Transcoder> = match &self.transcoder {
            Some(t) => Arc::new(ProcessTranscoder {
                tool: ProcessTool::new("transcoder", t.command()),
                extension: t.output_extension.trim().to_ascii_lowercase(),
            }),
            None => Arc::new(KeepOriginal),
        };
        Services {
            analyzer: Arc::new(ProcessAnalyzer(ProcessTool::new("analyzer", self.analyzer.clone()))),
            generator: Arc::new(ProcessGenerator(ProcessTool::new(
                "generator",
                self.generator.clone(),
            ))),
            checker: Arc::new(ProcessChecker(ProcessTool::new("checker", self.checker.clone()))),
            builder: Arc::new(ProcessBuilder(ProcessTool::new("builder", self.builder.clone()))),
            fetcher: Arc::new(ProcessFetcher(ProcessTool::new("fetcher", self.fetcher.clone()))),
            transcoder,
            deployer: Arc::new(ProcessDeployer(ProcessTool::new("deployer", self.deployer.clone()))),
            progress,
        }
    }
}

/// What project-level tools receive: every generated file plus where the media lives.
#[derive(Serialize)]
struct SnapshotPayload<'a> {
    files: &'a BTreeMap<String, String>,
    asset_dir: Option<String>,
}

impl<'a> SnapshotPayload<'a> {
    fn new(snapshot: &'a ProjectSnapshot) -> Self {
        Self {
            files: &snapshot.files,
            asset_dir: snapshot
                .asset_dir
                .as_ref()
                .map(|dir| dir.display().to_string()),
        }
    }
}

#[derive(Deserialize)]
struct FindingPayload {
    severity: String,
    #[serde(default)]
    location: Option<String>,
    message: String,
}

impl FindingPayload {
    fn into_row(self) -> FindingRow {
        FindingRow {
            severity: Severity::parse(&self.severity).unwrap_or(Severity::Error),
            location: self.location,
            message: self.message,
        }
    }
}

fn finding_rows(findings: Vec<FindingPayload>) -> Vec<FindingRow> {
    findings.into_iter().map(FindingPayload::into_row).collect()
}

pub(crate) struct ProcessAnalyzer(ProcessTool);

impl SiteAnalyzer for ProcessAnalyzer {
    fn analyze(&self, request: &AnalyzeRequest) -> Result<SiteAnalysis, ServiceError> {
        self.0.call_json("analyze", request)
    }
}

pub(crate) struct ProcessGenerator(ProcessTool);

impl Generator for ProcessGenerator {
    fn plan(&self, request: &PlanRequest) -> Result<serde_json::Value, ServiceError> {
        self.0.call_json("plan", request)
    }

    fn generate_shared(&self, request: &SharedRequest) -> Result<Vec<GeneratedFile>, ServiceError> {
        self.0.call_json("generate-shared", request)
    }

    fn generate_page(&self, request: &PageRequest) -> Result<GeneratedFile, ServiceError> {
        self.0.call_json("generate-page", request)
    }

    fn repair(&self, request: &RepairRequest) -> Result<GeneratedFile, ServiceError> {
        self.0.call_json("repair", request)
    }
}

pub(crate) struct ProcessChecker(ProcessTool);

impl Checker for ProcessChecker {
    fn check_unit(&self, unit: &UnitSource) -> Result<Vec<Diagnostic>, ServiceError> {
        self.0.call_json("check-unit", unit)
    }

    fn check_project(&self, snapshot: &ProjectSnapshot) -> Result<Vec<FindingRow>, ServiceError> {
        let findings: Vec<FindingPayload> =
            self.0.call_json("check-project", &SnapshotPayload::new(snapshot))?;
        Ok(finding_rows(findings))
    }
}

#[derive(Deserialize)]
struct BuildPayload {
    success: bool,
    #[serde(default)]
    findings: Vec<FindingPayload>,
}

pub(crate) struct ProcessBuilder(ProcessTool);

impl ProjectBuilder for ProcessBuilder {
    fn build(
        &self,
        snapshot: &ProjectSnapshot,
        deadline: Duration,
    ) -> Result<BuildReport, ServiceError> {
        let payload = SnapshotPayload::new(snapshot);
        let report: BuildPayload = self.0.call_json_within("build", &payload, deadline)?;
        Ok(BuildReport {
            success: report.success,
            findings: finding_rows(report.findings),
        })
    }
}

#[derive(Deserialize)]
struct ProbePayload {
    #[serde(default)]
    size: Option<u64>,
}

/// `probe URL` answers `{"size": N|null}`; `fetch URL` writes the body to stdout.
pub(crate) struct ProcessFetcher(ProcessTool);

impl AssetFetcher for ProcessFetcher {
    fn probe_size(&self, url: &str) -> Result<Option<u64>, ServiceError> {
        let raw = self.0.call_raw("probe", &[url], Vec::new())?;
        let probe: ProbePayload = serde_json::from_slice(&raw).map_err(|e| {
            ServiceError::invalid(format!("{}: parse probe response: {e}", self.0.name()))
        })?;
        Ok(probe.size)
    }

    fn fetch(&self, url: &str) -> Result<Vec<u8>, ServiceError> {
        self.0.call_raw("fetch", &[url], Vec::new())
    }
}

/// `transcode URL` reads the original on stdin; empty stdout keeps the original.
pub(crate) struct ProcessTranscoder {
    tool: ProcessTool,
    extension: String,
}

impl Transcoder for ProcessTranscoder {
    fn transcode(&self, url: &str, bytes: &[u8]) -> Result<Option<TranscodedAsset>, ServiceError> {
        let out = self.tool.call_raw("transcode", &[url], bytes.to_vec())?;
        if out.is_empty() {
            return Ok(None);
        }
        Ok(Some(TranscodedAsset {
            bytes: out,
            extension: self.extension.clone(),
        }))
    }
}

pub(crate) struct KeepOriginal;

impl Transcoder for KeepOriginal {
    fn transcode(&self, _url: &str, _bytes: &[u8]) -> Result<Option<TranscodedAsset>, ServiceError> {
        Ok(None)
    }
}

#[derive(Serialize)]
struct DeployPayload<'a> {
    job_id: &'a str,
    #[serde(flatten)]
    snapshot: SnapshotPayload<'a>,
}

pub(crate) struct ProcessDeployer(ProcessTool);

impl Deployer for ProcessDeployer {
    fn deploy(&self, job_id: &JobId, snapshot: &ProjectSnapshot) -> Result<Deployment, ServiceError> {
        self.0.call_json(
            "deploy",
            &DeployPayload {
                job_id: job_id.as_str(),
                snapshot: SnapshotPayload::new(snapshot),
            },
        )
    }
}
