#![forbid(unsafe_code)]
#![allow(dead_code)]

use serde_json::json;
use sm_core::ids::{JobId, WorkerId};
use sm_core::model::{Phase, Severity};
use sm_pipeline::api::{PipelineApi, SubmitRequest};
use sm_pipeline::clock::ManualClock;
use sm_pipeline::codegen::templates;
use sm_pipeline::config::PipelineConfig;
use sm_pipeline::model::{GeneratedFile, ProjectSnapshot, SiteAnalysis, SourcePage, slug_from_url};
use sm_pipeline::orchestrator::Orchestrator;
use sm_pipeline::phases::{PhaseContext, PhaseExecutor, PhaseOutcome};
use sm_pipeline::services::{
    AnalyzeRequest, AssetFetcher, BuildReport, Checker, Deployer, Deployment, Diagnostic,
    Generator, PageRequest, PlanRequest, ProgressEvent, ProgressSink, ProjectBuilder,
    RepairRequest, ServiceError, Services, SharedRequest, SiteAnalyzer, TranscodedAsset,
    Transcoder, UnitSource,
};
use sm_pipeline::{PipelineError, SharedStore, shared_store};
use sm_storage::{FindingRow, JobRow, SqliteStore};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SOURCE_URL: &str = "https://shop.example/";
pub const BROKEN_MARKER: &str = "// BROKEN";

/// Call counters shared by every fake, keyed by operation.
#[derive(Default)]
pub struct CallLog {
    calls: Mutex<BTreeMap<String, u32>>,
}

impl CallLog {
    pub fn hit(&self, name: impl Into<String>) {
        let mut calls = self.calls.lock().expect("call log");
        *calls.entry(name.into()).or_default() += 1;
    }

    pub fn count(&self, name: &str) -> u32 {
        self.calls
            .lock()
            .expect("call log")
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

pub struct FakeAnalyzer {
    log: Arc<CallLog>,
    pub transient_failures: AtomicU32,
    pub assets: Mutex<Vec<String>>,
}

impl SiteAnalyzer for FakeAnalyzer {
    fn analyze(&self, request: &AnalyzeRequest) -> Result<SiteAnalysis, ServiceError> {
        self.log.hit("analyze");
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ServiceError::transient("crawler unavailable"));
        }
        let origin = request.source_url.trim_end_matches('/').to_string();
        Ok(SiteAnalysis {
            pages: vec![
                SourcePage {
                    url: format!("{origin}/"),
                    title: "Shop".to_string(),
                    description: "Everything for the home".to_string(),
                    sections: vec!["Featured".to_string()],
                },
                SourcePage {
                    url: format!("{origin}/about"),
                    title: "About us".to_string(),
                    description: String::new(),
                    sections: Vec::new(),
                },
            ],
            origin,
            assets: self.assets.lock().expect("assets").clone(),
            design_tokens: BTreeMap::new(),
        })
    }
}

pub struct FakeGenerator {
    log: Arc<CallLog>,
    pub reject_plan: AtomicBool,
    /// Unit paths whose generated content never compiles.
    pub broken_paths: Mutex<BTreeSet<String>>,
    /// When set, a repair removes the defect instead of returning the same content.
    pub repairs_fix: AtomicBool,
}

impl FakeGenerator {
    fn is_broken(&self, path: &str) -> bool {
        self.broken_paths.lock().expect("broken paths").contains(path)
    }
}

impl Generator for FakeGenerator {
    fn plan(&self, request: &PlanRequest) -> Result<serde_json::Value, ServiceError> {
        self.log.hit("plan");
        if self.reject_plan.load(Ordering::SeqCst) {
            return Ok(json!({ "pages": "not a list" }));
        }
        let pages: Vec<_> = request
            .analysis
            .pages
            .iter()
            .map(|page| {
                let slug = slug_from_url(&page.url);
                let route = if slug == "home" {
                    "/".to_string()
                } else {
                    format!("/{slug}")
                };
                json!({
                    "slug": slug,
                    "route": route,
                    "title": page.title,
                    "source_url": page.url,
                    "description": page.description,
                    "sections": page.sections,
                })
            })
            .collect();
        Ok(json!({
            "shared": ["Header", "Footer", "Section", "Button"],
            "pages": pages,
        }))
    }

    fn generate_shared(&self, request: &SharedRequest) -> Result<Vec<GeneratedFile>, ServiceError> {
        self.log.hit("generate_shared");
        Ok(request
            .unit_types
            .iter()
            .map(|unit_type| GeneratedFile {
                unit_type: unit_type.clone(),
                content: templates::shared_component(unit_type, &request.plan.design_system),
            })
            .collect())
    }

    fn generate_page(&self, request: &PageRequest) -> Result<GeneratedFile, ServiceError> {
        let path = request.page.unit_path();
        self.log.hit("generate_page");
        self.log.hit(format!("generate_page:{path}"));
        let mut content = templates::page_component(&request.page, &request.primitives);
        if self.is_broken(&path) {
            content = format!("{BROKEN_MARKER}\n{content}");
        }
        Ok(GeneratedFile {
            unit_type: request.page.component_name(),
            content,
        })
    }

    fn repair(&self, request: &RepairRequest) -> Result<GeneratedFile, ServiceError> {
        self.log.hit("repair");
        self.log.hit(format!("repair:{}", request.path));
        let content = if self.repairs_fix.load(Ordering::SeqCst) {
            request.content.replace(BROKEN_MARKER, "")
        } else {
            request.content.clone()
        };
        Ok(GeneratedFile {
            unit_type: request.unit_type.clone(),
            content,
        })
    }
}

pub struct FakeChecker {
    log: Arc<CallLog>,
    pub project_fails: AtomicBool,
}

impl Checker for FakeChecker {
    fn check_unit(&self, unit: &UnitSource) -> Result<Vec<Diagnostic>, ServiceError> {
        self.log.hit("check_unit");
        if unit.content.contains(BROKEN_MARKER) {
            return Ok(vec![Diagnostic {
                message: "TS2304: Cannot find name 'Broken'".to_string(),
                line: Some(1),
            }]);
        }
        Ok(Vec::new())
    }

    fn check_project(&self, _snapshot: &ProjectSnapshot) -> Result<Vec<FindingRow>, ServiceError> {
        self.log.hit("check_project");
        if self.project_fails.load(Ordering::SeqCst) {
            return Ok(vec![FindingRow {
                severity: Severity::Error,
                location: Some("src/App.tsx:1".to_string()),
                message: "TS2322: type mismatch".to_string(),
            }]);
        }
        Ok(Vec::new())
    }
}

pub struct FakeBuilder {
    log: Arc<CallLog>,
}

impl ProjectBuilder for FakeBuilder {
    fn build(
        &self,
        snapshot: &ProjectSnapshot,
        _deadline: Duration,
    ) -> Result<BuildReport, ServiceError> {
        self.log.hit("build");
        Ok(BuildReport {
            success: !snapshot.files.is_empty(),
            findings: Vec::new(),
        })
    }
}

pub struct FakeFetcher {
    log: Arc<CallLog>,
    pub bodies: Mutex<BTreeMap<String, Vec<u8>>>,
    pub fetched: Mutex<Vec<String>>,
}

impl AssetFetcher for FakeFetcher {
    fn probe_size(&self, _url: &str) -> Result<Option<u64>, ServiceError> {
        Ok(None)
    }

    fn fetch(&self, url: &str) -> Result<Vec<u8>, ServiceError> {
        self.log.hit("fetch");
        self.fetched.lock().expect("fetched").push(url.to_string());
        self.bodies
            .lock()
            .expect("bodies")
            .get(url)
            .cloned()
            .ok_or_else(|| ServiceError::invalid(format!("404 for {url}")))
    }
}

pub struct KeepOriginal;

impl Transcoder for KeepOriginal {
    fn transcode(&self, _url: &str, _bytes: &[u8]) -> Result<Option<TranscodedAsset>, ServiceError> {
        Ok(None)
    }
}

pub struct FakeDeployer {
    log: Arc<CallLog>,
}

impl Deployer for FakeDeployer {
    fn deploy(&self, job_id: &JobId, _snapshot: &ProjectSnapshot) -> Result<Deployment, ServiceError> {
        self.log.hit("deploy");
        Ok(Deployment {
            url: format!("https://preview.example/{job_id}"),
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressSink for RecordingSink {
    fn publish(&self, event: &ProgressEvent) {
        self.events.lock().expect("events").push(event.clone());
    }
}

pub struct Fakes {
    pub log: Arc<CallLog>,
    pub analyzer: Arc<FakeAnalyzer>,
    pub generator: Arc<FakeGenerator>,
    pub checker: Arc<FakeChecker>,
    pub fetcher: Arc<FakeFetcher>,
    pub sink: Arc<RecordingSink>,
}

impl Fakes {
    pub fn new() -> Self {
        let log = Arc::new(CallLog::default());
        Self {
            analyzer: Arc::new(FakeAnalyzer {
                log: log.clone(),
                transient_failures: AtomicU32::new(0),
                assets: Mutex::new(Vec::new()),
            }),
            generator: Arc::new(FakeGenerator {
                log: log.clone(),
                reject_plan: AtomicBool::new(false),
                broken_paths: Mutex::new(BTreeSet::new()),
                repairs_fix: AtomicBool::new(false),
            }),
            checker: Arc::new(FakeChecker {
                log: log.clone(),
                project_fails: AtomicBool::new(false),
            }),
            fetcher: Arc::new(FakeFetcher {
                log: log.clone(),
                bodies: Mutex::new(BTreeMap::new()),
                fetched: Mutex::new(Vec::new()),
            }),
            sink: Arc::new(RecordingSink::default()),
            log,
        }
    }

    pub fn services(&self) -> Services {
        Services {
            analyzer: self.analyzer.clone(),
            generator: self.generator.clone(),
            checker: self.checker.clone(),
            builder: Arc::new(FakeBuilder {
                log: self.log.clone(),
            }),
            fetcher: self.fetcher.clone(),
            transcoder: Arc::new(KeepOriginal),
            deployer: Arc::new(FakeDeployer {
                log: self.log.clone(),
            }),
            progress: self.sink.clone(),
        }
    }
}

/// Delegating executor that counts how often the wrapped phase actually runs.
pub struct CountingExecutor {
    inner: Arc<dyn PhaseExecutor>,
    pub runs: AtomicU32,
}

impl CountingExecutor {
    pub fn wrap(inner: Arc<dyn PhaseExecutor>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            runs: AtomicU32::new(0),
        })
    }
}

impl PhaseExecutor for CountingExecutor {
    fn phase(&self) -> Phase {
        self.inner.phase()
    }

    fn signature_config(&self, config: &PipelineConfig) -> String {
        self.inner.signature_config(config)
    }

    fn execute(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutcome, PipelineError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(ctx)
    }
}

pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.lease.ttl_ms = 60_000;
    config.retry.backoff_base_ms = 1_000;
    config.retry.backoff_max_ms = 4_000;
    config.verify.queue_poll_ms = 500;
    config.verify.queue_wait_ms = 5_000;
    config
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub store: SharedStore,
    pub clock: ManualClock,
    pub fakes: Fakes,
    pub config: Arc<PipelineConfig>,
}

impl Harness {
    pub fn new(config: PipelineConfig) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = SqliteStore::open(dir.path()).expect("open store");
        Self {
            dir,
            store: shared_store(store),
            clock: ManualClock::new(1_700_000_000_000),
            fakes: Fakes::new(),
            config: Arc::new(config),
        }
    }

    pub fn orchestrator(&self, worker: &str) -> Orchestrator {
        Orchestrator::new(
            self.store.clone(),
            self.fakes.services(),
            self.config.clone(),
            Arc::new(self.clock.clone()),
            WorkerId::try_new(worker).expect("worker id"),
        )
    }

    pub fn api(&self) -> PipelineApi {
        PipelineApi::new(self.store.clone(), Arc::new(self.clock.clone()))
    }

    pub fn submit(&self) -> JobId {
        self.api()
            .submit_job(SubmitRequest {
                source_url: SOURCE_URL.to_string(),
                project_id: Some("proj-1".to_string()),
                user_id: Some("user-1".to_string()),
                instructions: Some("keep the brand colours".to_string()),
            })
            .expect("submit")
            .id
    }

    pub fn job(&self, job_id: &JobId) -> JobRow {
        self.store
            .lock()
            .expect("store")
            .job_get(job_id)
            .expect("job_get")
            .expect("job exists")
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub fn result<T: serde::de::DeserializeOwned>(&self, job_id: &JobId, phase: Phase) -> T {
        let row = self
            .store
            .lock()
            .expect("store")
            .phase_result_get(job_id, phase)
            .expect("phase_result_get")
            .expect("phase result");
        serde_json::from_str(&row.result_json).expect("decode phase result")
    }
}
