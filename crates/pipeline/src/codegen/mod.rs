#![forbid(unsafe_code)]

//! Hierarchical code generation.
//!
//! Pass 1 produces every shared primitive of the plan in a single model call. Pass 2 produces
//! one page per call, concurrently, against the primitives' public signatures. Each unit then
//! runs through a bounded compile-repair loop; a unit that exhausts its repairs is replaced by
//! a deterministic template and never sent to the model again within the job.
//!
//! Every state change of a unit is appended to the store, so a resumed worker reuses settled
//! units and continues unsettled ones where they stopped.

pub mod templates;

use crate::PipelineError;
use crate::lock_store;
use crate::model::{MigrationPlan, PlannedPage};
use crate::phases::PhaseContext;
use crate::progress::EVENT_UNIT_FALLBACK;
use crate::services::{
    Diagnostic, PageRequest, PrimitiveSignature, RepairRequest, ServiceError, SharedRequest,
    UnitSource, call_with_timeout,
};
use crate::signature::SignatureBuilder;
use serde::{Deserialize, Serialize};
use sm_core::model::{UnitKind, UnitStatus};
use sm_storage::{UnitRecordRequest, UnitRow};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const CACHE_KEY_PREFIX: &str = "unit:";
const STAT_CACHE_HITS: &str = "codegen:cache_hits";
const STAT_AI_CALLS: &str = "codegen:ai_calls";

#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("{context}: {error}")]
    Service { context: String, error: ServiceError },
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl CodegenError {
    fn service(context: impl Into<String>, error: ServiceError) -> Self {
        Self::Service {
            context: context.into(),
            error,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub unit_type: String,
    pub kind: String,
    pub status: String,
    pub repair_attempts: u32,
}

impl ManifestEntry {
    fn from_row(row: &UnitRow) -> Self {
        Self {
            path: row.path.clone(),
            unit_type: row.unit_type.clone(),
            kind: row.kind.as_str().to_string(),
            status: row.status.as_str().to_string(),
            repair_attempts: row.repair_attempts,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodegenReport {
    /// Shared primitives, then pages, then scaffold files, in plan order.
    pub units: Vec<ManifestEntry>,
    pub ai_calls: u32,
    pub cache_hits: u32,
    /// Units taken over from an earlier run of this phase.
    pub reused: u32,
    pub fallbacks: u32,
}

/// A unit the plan calls for. The set of paths depends only on the plan and design system.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedUnit {
    pub path: String,
    pub unit_type: String,
    pub kind: UnitKind,
    /// Cross-job cache signature over unit type, design system and plan content.
    pub signature: String,
}

fn unit_signature(unit_type: &str, design_system: &str, plan_content: &str) -> String {
    SignatureBuilder::new("unit")
        .field(unit_type)
        .field(design_system)
        .field(plan_content)
        .finish()
}

fn to_json<T: Serialize>(value: &T) -> Result<String, PipelineError> {
    serde_json::to_string(value).map_err(|err| PipelineError::Corrupt(err.to_string()))
}

pub fn shared_units(plan: &MigrationPlan) -> Result<Vec<PlannedUnit>, PipelineError> {
    let plan_json = to_json(plan)?;
    Ok(plan
        .shared
        .iter()
        .map(|unit_type| PlannedUnit {
            path: templates::shared_path(unit_type),
            unit_type: unit_type.clone(),
            kind: UnitKind::Shared,
            signature: unit_signature(unit_type, &plan.design_system, &plan_json),
        })
        .collect())
}

pub fn page_units(plan: &MigrationPlan) -> Result<Vec<(PlannedUnit, &PlannedPage)>, PipelineError> {
    let shared = plan.shared.join(",");
    plan.pages
        .iter()
        .map(|page| {
            let content = format!("{}|{shared}", to_json(page)?);
            Ok((
                PlannedUnit {
                    path: page.unit_path(),
                    unit_type: page.component_name(),
                    kind: UnitKind::Page,
                    signature: unit_signature(
                        &page.component_name(),
                        &plan.design_system,
                        &content,
                    ),
                },
                page,
            ))
        })
        .collect()
}

pub fn scaffold_units(plan: &MigrationPlan) -> Result<Vec<(PlannedUnit, String)>, PipelineError> {
    let plan_json = to_json(plan)?;
    let files = [
        (templates::INDEX_HTML, "Document", templates::index_html(plan)),
        (templates::ROUTES_TS, "Routes", templates::routes_ts(plan)),
        (templates::APP_TSX, "App", templates::app_tsx(plan)),
    ];
    Ok(files
        .into_iter()
        .map(|(path, unit_type, content)| {
            (
                PlannedUnit {
                    path: path.to_string(),
                    unit_type: unit_type.to_string(),
                    kind: UnitKind::Scaffold,
                    signature: unit_signature(unit_type, &plan.design_system, &plan_json),
                },
                content,
            )
        })
        .collect())
}

/// Every path the plan produces, in generation order.
pub fn unit_paths(plan: &MigrationPlan) -> Result<Vec<String>, PipelineError> {
    let mut paths: Vec<String> = shared_units(plan)?.into_iter().map(|u| u.path).collect();
    paths.extend(page_units(plan)?.into_iter().map(|(u, _)| u.path));
    paths.extend(scaffold_units(plan)?.into_iter().map(|(u, _)| u.path));
    Ok(paths)
}

/// Names a page declares at top level (`function X`, `const X =`, `class X`).
fn declared_names(content: &str) -> Vec<&str> {
    let mut names = Vec::new();
    for line in content.lines() {
        let mut rest = line.trim_start();
        for prefix in ["export ", "default "] {
            rest = rest.strip_prefix(prefix).unwrap_or(rest);
        }
        let Some(after) = ["function ", "const ", "let ", "class "]
            .iter()
            .find_map(|kw| rest.strip_prefix(kw))
        else {
            continue;
        };
        let end = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '$'))
            .unwrap_or(after.len());
        if end > 0 {
            names.push(&after[..end]);
        }
    }
    names
}

/// Checks that need no compiler: empty output and pages re-defining shared primitives.
fn local_diagnostics(content: &str, forbidden: &[String]) -> Vec<Diagnostic> {
    if content.trim().is_empty() {
        return vec![Diagnostic {
            message: "generated unit is empty".to_string(),
            line: None,
        }];
    }
    let mut out = Vec::new();
    for name in declared_names(content) {
        if forbidden.iter().any(|primitive| primitive == name) {
            out.push(Diagnostic {
                message: format!("`{name}` is a shared primitive; import it instead of redefining it"),
                line: None,
            });
        }
    }
    out
}

enum Resume {
    Settled(UnitRow),
    InProgress { content: String, attempts: u32 },
    Fresh,
}

struct Draft<'u> {
    unit: &'u PlannedUnit,
    content: String,
    attempts: u32,
}

pub struct CodegenEngine<'a> {
    ctx: &'a PhaseContext<'a>,
    ai_calls: AtomicU32,
    cache_hits: AtomicU32,
    reused: AtomicU32,
    fallbacks: AtomicU32,
}

impl<'a> CodegenEngine<'a> {
    pub fn new(ctx: &'a PhaseContext<'a>) -> Self {
        Self {
            ctx,
            ai_calls: AtomicU32::new(0),
            cache_hits: AtomicU32::new(0),
            reused: AtomicU32::new(0),
            fallbacks: AtomicU32::new(0),
        }
    }

    pub fn run(&self, plan: &MigrationPlan) -> Result<CodegenReport, CodegenError> {
        let mut units = self.shared_pass(plan)?;
        units.extend(self.page_pass(plan)?);
        units.extend(self.scaffold(plan)?);
        Ok(CodegenReport {
            units,
            ai_calls: self.ai_calls.load(Ordering::SeqCst),
            cache_hits: self.cache_hits.load(Ordering::SeqCst),
            reused: self.reused.load(Ordering::SeqCst),
            fallbacks: self.fallbacks.load(Ordering::SeqCst),
        })
    }

    fn settings(&self) -> &crate::config::CodegenSettings {
        &self.ctx.config.codegen
    }

    /// Checkpoint signature: the cache signature scoped to the current migration attempt. After
    /// invalidation the job's own checkpoints no longer match; the cross-job cache still does.
    fn checkpoint_signature(&self, unit: &PlannedUnit) -> String {
        SignatureBuilder::new("unit-checkpoint")
            .field(&unit.signature)
            .int_field(self.ctx.job.migration_attempt)
            .finish()
    }

    fn record(
        &self,
        unit: &PlannedUnit,
        status: UnitStatus,
        attempts: u32,
        content: Option<String>,
    ) -> Result<UnitRow, PipelineError> {
        let request = UnitRecordRequest {
            job_id: self.ctx.job_id().clone(),
            worker_id: self.ctx.worker_id().clone(),
            path: unit.path.clone(),
            unit_type: unit.unit_type.clone(),
            kind: unit.kind,
            status,
            source_signature: self.checkpoint_signature(unit),
            repair_attempts: attempts,
            content,
            now_ms: self.ctx.now_ms(),
        };
        Ok(lock_store(self.ctx.store)?.unit_record(request)?)
    }

    fn resume(&self, unit: &PlannedUnit) -> Result<Resume, PipelineError> {
        let latest = lock_store(self.ctx.store)?.unit_latest(self.ctx.job_id(), &unit.path)?;
        let Some(row) = latest else {
            return Ok(Resume::Fresh);
        };
        if row.source_signature != self.checkpoint_signature(unit) {
            return Ok(Resume::Fresh);
        }
        if row.status.is_settled() {
            self.reused.fetch_add(1, Ordering::SeqCst);
            return Ok(Resume::Settled(row));
        }
        match (row.status, row.content) {
            (UnitStatus::Writing | UnitStatus::Repairing, Some(content)) => Ok(Resume::InProgress {
                content,
                attempts: row.repair_attempts,
            }),
            _ => Ok(Resume::Fresh),
        }
    }

    fn cache_key(unit: &PlannedUnit) -> String {
        format!("{CACHE_KEY_PREFIX}{}", unit.signature)
    }

    fn bump_stat(&self, key: &str) {
        if let Err(err) = self.ctx.cache.increment(key, 1, None) {
            tracing::debug!(%key, error = %err, "cache counter unavailable");
        }
    }

    /// Cross-job lookup. Backend errors count as a miss.
    fn cache_lookup(&self, unit: &PlannedUnit) -> Result<Option<UnitRow>, PipelineError> {
        let content = match self.ctx.cache.get(&Self::cache_key(unit)) {
            Ok(Some(content)) => content,
            Ok(None) => return Ok(None),
            Err(err) => {
                tracing::warn!(path = %unit.path, error = %err, "unit cache lookup failed");
                return Ok(None);
            }
        };
        self.cache_hits.fetch_add(1, Ordering::SeqCst);
        self.bump_stat(STAT_CACHE_HITS);
        Ok(Some(self.record(unit, UnitStatus::Done, 0, Some(content))?))
    }

    fn cache_store(&self, unit: &PlannedUnit, content: &str) {
        let ttl = self.settings().cache_ttl_ms.map(Duration::from_millis);
        if let Err(err) = self.ctx.cache.set(&Self::cache_key(unit), content, ttl) {
            tracing::warn!(path = %unit.path, error = %err, "unit cache write failed");
        }
    }

    fn count_ai_call(&self) {
        self.ai_calls.fetch_add(1, Ordering::SeqCst);
        self.bump_stat(STAT_AI_CALLS);
    }

    fn shared_pass(&self, plan: &MigrationPlan) -> Result<Vec<ManifestEntry>, CodegenError> {
        let units = shared_units(plan)?;
        let mut settled: BTreeMap<&str, UnitRow> = BTreeMap::new();
        let mut drafts = Vec::new();
        let mut missing = Vec::new();

        for unit in &units {
            match self.resume(unit)? {
                Resume::Settled(row) => {
                    settled.insert(unit.path.as_str(), row);
                }
                Resume::InProgress { content, attempts } => drafts.push(Draft {
                    unit,
                    content,
                    attempts,
                }),
                Resume::Fresh => match self.cache_lookup(unit)? {
                    Some(row) => {
                        settled.insert(unit.path.as_str(), row);
                    }
                    None => missing.push(unit),
                },
            }
        }

        if !missing.is_empty() {
            self.ctx.checkpoint()?;
            for unit in &missing {
                self.record(unit, UnitStatus::Pending, 0, None)?;
            }
            let request = SharedRequest {
                plan: plan.clone(),
                unit_types: missing.iter().map(|unit| unit.unit_type.clone()).collect(),
            };
            let generator = self.ctx.services.generator.clone();
            let timeout = Duration::from_millis(self.settings().generation_timeout_ms);
            self.count_ai_call();
            let files = call_with_timeout("generate_shared", timeout, move || {
                generator.generate_shared(&request)
            })
            .map_err(|err| CodegenError::service("shared generation", err))?;

            let mut by_type: BTreeMap<String, String> = BTreeMap::new();
            for file in files {
                by_type.entry(file.unit_type).or_insert(file.content);
            }
            for unit in missing {
                let content = by_type.remove(&unit.unit_type).unwrap_or_default();
                self.record(unit, UnitStatus::Writing, 0, Some(content.clone()))?;
                drafts.push(Draft {
                    unit,
                    content,
                    attempts: 0,
                });
            }
        }

        for draft in drafts {
            let unit = draft.unit;
            let row = self.settle(draft, &[])?;
            settled.insert(unit.path.as_str(), row);
        }

        Ok(units
            .iter()
            .filter_map(|unit| settled.get(unit.path.as_str()))
            .map(ManifestEntry::from_row)
            .collect())
    }

    fn page_pass(&self, plan: &MigrationPlan) -> Result<Vec<ManifestEntry>, CodegenError> {
        let pages = page_units(plan)?;
        let primitives: Vec<PrimitiveSignature> = plan
            .shared
            .iter()
            .map(|unit_type| templates::primitive_signature(unit_type))
            .collect();
        let primitives = primitives.as_slice();
        let concurrency = self.settings().page_concurrency.max(1);

        let mut entries = Vec::with_capacity(pages.len());
        for chunk in pages.chunks(concurrency) {
            let results: Vec<Result<UnitRow, CodegenError>> = std::thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|(unit, page)| scope.spawn(move || self.page_unit(unit, page, primitives)))
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle.join().unwrap_or_else(|_| {
                            Err(PipelineError::Corrupt("page generation panicked".to_string()).into())
                        })
                    })
                    .collect()
            });
            for result in results {
                entries.push(ManifestEntry::from_row(&result?));
            }
        }
        Ok(entries)
    }

    fn page_unit(
        &self,
        unit: &PlannedUnit,
        page: &PlannedPage,
        primitives: &[PrimitiveSignature],
    ) -> Result<UnitRow, CodegenError> {
        let forbidden: Vec<String> = primitives.iter().map(|p| p.name.clone()).collect();
        let draft = match self.resume(unit)? {
            Resume::Settled(row) => return Ok(row),
            Resume::InProgress { content, attempts } => Draft {
                unit,
                content,
                attempts,
            },
            Resume::Fresh => {
                if let Some(row) = self.cache_lookup(unit)? {
                    return Ok(row);
                }
                self.ctx.checkpoint()?;
                let request = PageRequest {
                    design_system: self.settings().design_system.clone(),
                    page: page.clone(),
                    primitives: primitives.to_vec(),
                };
                let generator = self.ctx.services.generator.clone();
                let timeout = Duration::from_millis(self.settings().generation_timeout_ms);
                self.count_ai_call();
                let file = call_with_timeout("generate_page", timeout, move || {
                    generator.generate_page(&request)
                })
                .map_err(|err| CodegenError::service(format!("page {}", unit.path), err))?;
                self.record(unit, UnitStatus::Writing, 0, Some(file.content.clone()))?;
                Draft {
                    unit,
                    content: file.content,
                    attempts: 0,
                }
            }
        };
        self.settle_with_template(draft, &forbidden, || {
            templates::page_component(page, primitives)
        })
    }

    fn settle(&self, draft: Draft<'_>, forbidden: &[String]) -> Result<UnitRow, CodegenError> {
        let unit_type = draft.unit.unit_type.clone();
        let design_system = self.settings().design_system.clone();
        self.settle_with_template(draft, forbidden, || {
            templates::shared_component(&unit_type, &design_system)
        })
    }

    /// Compile-repair loop. Cancellation and lease loss are observed before every iteration.
    fn settle_with_template(
        &self,
        draft: Draft<'_>,
        forbidden: &[String],
        template: impl FnOnce() -> String,
    ) -> Result<UnitRow, CodegenError> {
        let Draft {
            unit,
            mut content,
            mut attempts,
        } = draft;
        let max_repairs = self.settings().max_repairs;

        loop {
            self.ctx.checkpoint()?;
            let diagnostics = self.diagnose(unit, &content, forbidden)?;
            if diagnostics.is_empty() {
                let row = self.record(unit, UnitStatus::Done, attempts, Some(content.clone()))?;
                self.cache_store(unit, &content);
                return Ok(row);
            }

            if attempts < max_repairs {
                attempts += 1;
            }
            if attempts >= max_repairs {
                return Ok(self.fallback(unit, attempts, template(), &diagnostics)?);
            }

            self.record(unit, UnitStatus::Repairing, attempts, Some(content.clone()))?;
            let request = RepairRequest {
                path: unit.path.clone(),
                unit_type: unit.unit_type.clone(),
                design_system: self.settings().design_system.clone(),
                content: content.clone(),
                diagnostics,
                attempt: attempts,
            };
            let generator = self.ctx.services.generator.clone();
            let timeout = Duration::from_millis(self.settings().repair_timeout_ms);
            self.count_ai_call();
            match call_with_timeout("repair", timeout, move || generator.repair(&request)) {
                Ok(file) => content = file.content,
                Err(err) => {
                    tracing::warn!(path = %unit.path, attempt = attempts, error = %err, "repair call failed");
                }
            }
        }
    }

    fn diagnose(
        &self,
        unit: &PlannedUnit,
        content: &str,
        forbidden: &[String],
    ) -> Result<Vec<Diagnostic>, CodegenError> {
        let local = local_diagnostics(content, forbidden);
        if !local.is_empty() {
            return Ok(local);
        }
        let checker = self.ctx.services.checker.clone();
        let source = UnitSource {
            path: unit.path.clone(),
            unit_type: unit.unit_type.clone(),
            content: content.to_string(),
        };
        let timeout = Duration::from_millis(self.settings().check_timeout_ms);
        call_with_timeout("check_unit", timeout, move || checker.check_unit(&source))
            .map_err(|err| CodegenError::service(format!("check {}", unit.path), err))
    }

    fn fallback(
        &self,
        unit: &PlannedUnit,
        attempts: u32,
        content: String,
        diagnostics: &[Diagnostic],
    ) -> Result<UnitRow, PipelineError> {
        self.fallbacks.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(
            job_id = %self.ctx.job_id(),
            path = %unit.path,
            attempts,
            "unit replaced by template"
        );
        let row = self.record(unit, UnitStatus::Fallback, attempts, Some(content))?;
        let last = diagnostics
            .first()
            .map(|d| d.message.as_str())
            .unwrap_or("check failed");
        self.ctx.emit(
            EVENT_UNIT_FALLBACK,
            format!("{} fell back to template: {last}", unit.path),
            Some(serde_json::json!({ "path": unit.path, "repair_attempts": attempts })),
        )?;
        Ok(row)
    }

    fn scaffold(&self, plan: &MigrationPlan) -> Result<Vec<ManifestEntry>, CodegenError> {
        let mut entries = Vec::new();
        for (unit, content) in scaffold_units(plan)? {
            let row = match self.resume(&unit)? {
                Resume::Settled(row) => row,
                _ => self.record(&unit, UnitStatus::Done, 0, Some(content))?,
            };
            entries.push(ManifestEntry::from_row(&row));
        }
        Ok(entries)
    }
}
