#![forbid(unsafe_code)]

use crate::config::{CodegenSettings, is_component_name};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

const MAX_PLANNED_PAGES: usize = 200;
const MAX_SLUG_LEN: usize = 80;

/// Output of the Analyze phase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SiteAnalysis {
    pub origin: String,
    pub pages: Vec<SourcePage>,
    /// Media referenced by the site, absolute URLs.
    #[serde(default)]
    pub assets: Vec<String>,
    #[serde(default)]
    pub design_tokens: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourcePage {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sections: Vec<String>,
}

/// Output of the Plan phase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    #[serde(default)]
    pub design_system: String,
    /// Shared primitive types, restricted to the configured taxonomy.
    #[serde(default)]
    pub shared: Vec<String>,
    pub pages: Vec<PlannedPage>,
    /// Set when the provider output was unusable and the plan was derived locally.
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlannedPage {
    pub slug: String,
    pub route: String,
    pub title: String,
    pub source_url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sections: Vec<String>,
}

impl PlannedPage {
    pub fn component_name(&self) -> String {
        let mut out = String::new();
        for part in self.slug.split('-').filter(|p| !p.is_empty()) {
            let mut chars = part.chars();
            if let Some(first) = chars.next() {
                out.push(first.to_ascii_uppercase());
                out.extend(chars);
            }
        }
        if out.is_empty() || !out.starts_with(|c: char| c.is_ascii_alphabetic()) {
            out.insert_str(0, "Page");
        }
        out.push_str("Page");
        out
    }

    pub fn unit_path(&self) -> String {
        format!("src/pages/{}.tsx", self.slug)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("plan rejected: {0}")]
pub struct PlanRejection(pub String);

impl MigrationPlan {
    /// Validates structured provider output. The design system always comes from
    /// configuration; shared types outside the taxonomy are dropped and duplicates collapse.
    pub fn from_provider_output(
        value: serde_json::Value,
        settings: &CodegenSettings,
    ) -> Result<Self, PlanRejection> {
        let mut plan: MigrationPlan =
            serde_json::from_value(value).map_err(|err| PlanRejection(err.to_string()))?;
        plan.design_system = settings.design_system.clone();
        plan.shared = normalize_shared(&plan.shared, &settings.shared_taxonomy);
        plan.fallback = false;

        if plan.pages.is_empty() {
            return Err(PlanRejection("plan has no pages".to_string()));
        }
        if plan.pages.len() > MAX_PLANNED_PAGES {
            return Err(PlanRejection("plan has too many pages".to_string()));
        }
        let mut slugs = BTreeSet::new();
        let mut routes = BTreeSet::new();
        for page in &plan.pages {
            if !is_valid_slug(&page.slug) {
                return Err(PlanRejection(format!("invalid page slug `{}`", page.slug)));
            }
            if !page.route.starts_with('/') {
                return Err(PlanRejection(format!("invalid route `{}`", page.route)));
            }
            if !slugs.insert(page.slug.as_str()) {
                return Err(PlanRejection(format!("duplicate slug `{}`", page.slug)));
            }
            if !routes.insert(page.route.as_str()) {
                return Err(PlanRejection(format!("duplicate route `{}`", page.route)));
            }
            if page.title.trim().is_empty() {
                return Err(PlanRejection(format!("page `{}` has no title", page.slug)));
            }
        }
        Ok(plan)
    }

    /// Deterministic plan derived from the analysis alone: one page per source page and the
    /// layout primitives every site needs.
    pub fn fallback(analysis: &SiteAnalysis, settings: &CodegenSettings) -> Self {
        let mut slugs = BTreeSet::new();
        let mut pages = Vec::new();
        for source in analysis.pages.iter().take(MAX_PLANNED_PAGES) {
            let base = slug_from_url(&source.url);
            let mut slug = base.clone();
            let mut n = 2;
            while !slugs.insert(slug.clone()) {
                slug = format!("{base}-{n}");
                n += 1;
            }
            let route = if slug == "home" {
                "/".to_string()
            } else {
                format!("/{slug}")
            };
            let title = if source.title.trim().is_empty() {
                slug.clone()
            } else {
                source.title.trim().to_string()
            };
            pages.push(PlannedPage {
                slug,
                route,
                title,
                source_url: source.url.clone(),
                description: source.description.clone(),
                sections: source.sections.clone(),
            });
        }

        let layout = ["Header", "Navigation", "Section", "Footer"].map(str::to_string);
        MigrationPlan {
            design_system: settings.design_system.clone(),
            shared: normalize_shared(&layout, &settings.shared_taxonomy),
            pages,
            fallback: true,
        }
    }
}

fn normalize_shared(requested: &[String], taxonomy: &[String]) -> Vec<String> {
    let requested = requested
        .iter()
        .map(|name| name.trim())
        .filter(|name| is_component_name(name))
        .collect::<BTreeSet<_>>();
    taxonomy
        .iter()
        .filter(|name| requested.contains(name.as_str()))
        .cloned()
        .collect()
}

fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= MAX_SLUG_LEN
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !slug.starts_with('-')
        && !slug.ends_with('-')
}

/// `https://a.example/about/team?x=1` becomes `about-team`; the site root becomes `home`.
pub fn slug_from_url(raw: &str) -> String {
    let path = match url::Url::parse(raw) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => raw.to_string(),
    };
    let mut slug = String::new();
    for ch in path.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    let slug = slug
        .strip_suffix("-html")
        .or_else(|| slug.strip_suffix("-htm"))
        .unwrap_or(slug);
    let slug: String = slug.chars().take(MAX_SLUG_LEN).collect();
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() || slug == "index" {
        "home".to_string()
    } else {
        slug.to_string()
    }
}

/// A file produced by a generation or repair call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub unit_type: String,
    pub content: String,
}

/// Read-only view of the generated project handed to gates and the deployer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProjectSnapshot {
    pub files: BTreeMap<String, String>,
    /// Directory holding the job's downloaded media, if any was fetched.
    pub asset_dir: Option<PathBuf>,
}

impl ProjectSnapshot {
    pub fn pages(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files
            .iter()
            .filter(|(path, _)| path.starts_with("src/pages/"))
            .map(|(path, content)| (path.as_str(), content.as_str()))
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }
}
