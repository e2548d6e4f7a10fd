#![forbid(unsafe_code)]

//! Selective localization of referenced media.
//!
//! Every candidate URL gets exactly one recorded decision. Stored bytes never exceed the
//! aggregate cap: the first asset that would cross it is skipped along with everything
//! after it.

use crate::config::AssetPolicy;
use crate::phases::{PhaseContext, asset_dir};
use crate::services::call_with_timeout;
use crate::signature::SignatureBuilder;
use crate::{PipelineError, lock_store};
use serde::{Deserialize, Serialize};
use sm_core::model::AssetStatus;
use sm_storage::AssetRecordRequest;
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

pub const REASON_INVALID_URL: &str = "invalid-url";
pub const REASON_BLOCKLISTED: &str = "blocklisted-domain";
pub const REASON_OFF_ORIGIN: &str = "off-origin";
pub const REASON_FILE_CAP: &str = "file-cap-exceeded";
pub const REASON_AGGREGATE_CAP: &str = "aggregate-cap-exceeded";
pub const REASON_FETCH_ERROR: &str = "fetch-error";
pub const REASON_WRITE_ERROR: &str = "write-error";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSummary {
    pub stored: u32,
    pub skipped: u32,
    pub failed: u32,
    pub bytes_total: u64,
}

/// Policy decision that needs no network access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Screening {
    Fetch(Url),
    Reject {
        status: AssetStatus,
        reason: &'static str,
    },
}

fn host_listed(host: &str, list: &[String]) -> bool {
    list.iter().any(|entry| {
        let entry = entry.trim().trim_start_matches("*.").to_ascii_lowercase();
        !entry.is_empty()
            && (host == entry
                || host
                    .strip_suffix(entry.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.')))
    })
}

/// Resolves `raw` against the site origin and applies the host lists. A block-listed host is
/// rejected even when it is also allow-listed or same-origin.
pub fn screen(raw: &str, origin: Option<&Url>, policy: &AssetPolicy) -> Screening {
    let invalid = Screening::Reject {
        status: AssetStatus::Failed,
        reason: REASON_INVALID_URL,
    };
    let parsed = match origin {
        Some(base) => base.join(raw.trim()),
        None => Url::parse(raw.trim()),
    };
    let Ok(url) = parsed else {
        return invalid;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return invalid;
    }
    let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
        return invalid;
    };

    if host_listed(&host, &policy.block_hosts) {
        return Screening::Reject {
            status: AssetStatus::Skipped,
            reason: REASON_BLOCKLISTED,
        };
    }
    let same_origin = origin
        .and_then(|base| base.host_str())
        .is_some_and(|origin_host| origin_host.eq_ignore_ascii_case(&host));
    if !same_origin && !host_listed(&host, &policy.allow_hosts) {
        return Screening::Reject {
            status: AssetStatus::Skipped,
            reason: REASON_OFF_ORIGIN,
        };
    }
    Screening::Fetch(url)
}

/// `<hash>-<file name>` with the extension swapped when the asset was transcoded.
fn local_name(url: &Url, extension: Option<&str>) -> String {
    let hash = SignatureBuilder::new("asset").field(url.as_str()).finish();
    let base = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .unwrap_or("asset");
    let mut name: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(80)
        .collect();
    if let Some(ext) = extension {
        let stem = match name.rfind('.') {
            Some(dot) if dot > 0 => name[..dot].to_string(),
            _ => name.clone(),
        };
        name = format!("{stem}.{ext}");
    }
    format!("{}-{name}", &hash[..12])
}

struct Decision {
    status: AssetStatus,
    reason: Option<&'static str>,
    local_path: Option<String>,
    bytes_original: u64,
    bytes_final: u64,
}

impl Decision {
    fn reject(status: AssetStatus, reason: &'static str, bytes_original: u64) -> Self {
        Self {
            status,
            reason: Some(reason),
            local_path: None,
            bytes_original,
            bytes_final: 0,
        }
    }
}

pub struct AssetPipeline<'a> {
    ctx: &'a PhaseContext<'a>,
}

impl<'a> AssetPipeline<'a> {
    pub fn new(ctx: &'a PhaseContext<'a>) -> Self {
        Self { ctx }
    }

    fn policy(&self) -> &AssetPolicy {
        &self.ctx.config.assets
    }

    pub fn run(&self, origin: &str, candidates: &[String]) -> Result<AssetSummary, PipelineError> {
        let origin = Url::parse(origin).ok();
        let (mut decided, mut total, mut aggregate_hit) = self.previous_decisions()?;
        let mut seen = HashSet::new();

        for raw in candidates {
            let key = raw.trim();
            if key.is_empty() || !seen.insert(key) || decided.contains(key) {
                continue;
            }
            self.ctx.checkpoint()?;

            let decision = if aggregate_hit {
                Decision::reject(AssetStatus::Skipped, REASON_AGGREGATE_CAP, 0)
            } else {
                match screen(key, origin.as_ref(), self.policy()) {
                    Screening::Reject { status, reason } => Decision::reject(status, reason, 0),
                    Screening::Fetch(url) => self.fetch(&url, total)?,
                }
            };
            if decision.reason == Some(REASON_AGGREGATE_CAP) {
                aggregate_hit = true;
            }
            if decision.status.is_stored() {
                total = total.saturating_add(decision.bytes_final);
            }
            tracing::debug!(
                url = %key,
                status = %decision.status,
                reason = decision.reason.unwrap_or("-"),
                "asset decided"
            );
            self.record(key, decision)?;
            decided.insert(key.to_string());
        }

        self.summary()
    }

    /// URLs decided by an earlier run of this phase, bytes they stored, and whether the
    /// aggregate cap was already hit.
    fn previous_decisions(&self) -> Result<(HashSet<String>, u64, bool), PipelineError> {
        let rows = lock_store(self.ctx.store)?.asset_records_latest(self.ctx.job_id())?;
        let mut decided = HashSet::new();
        let mut total = 0u64;
        let mut aggregate_hit = false;
        for row in rows {
            if row.status.is_stored() {
                total = total.saturating_add(row.bytes_final);
            }
            if row.skip_reason.as_deref() == Some(REASON_AGGREGATE_CAP) {
                aggregate_hit = true;
            }
            decided.insert(row.source_url);
        }
        Ok((decided, total, aggregate_hit))
    }

    fn fetch(&self, url: &Url, stored_so_far: u64) -> Result<Decision, PipelineError> {
        let policy = self.policy();
        let timeout = Duration::from_millis(policy.fetch_timeout_ms);
        let fetcher = self.ctx.services.fetcher.clone();

        let probe_url = url.to_string();
        let probe_fetcher = fetcher.clone();
        match call_with_timeout("asset_probe", timeout, move || {
            probe_fetcher.probe_size(&probe_url)
        }) {
            Ok(Some(size)) if size > policy.max_file_bytes => {
                return Ok(Decision::reject(AssetStatus::Skipped, REASON_FILE_CAP, size));
            }
            Ok(Some(size)) if stored_so_far.saturating_add(size) > policy.max_total_bytes => {
                return Ok(Decision::reject(AssetStatus::Skipped, REASON_AGGREGATE_CAP, size));
            }
            Ok(_) => {}
            Err(err) => tracing::debug!(url = %url, error = %err, "size probe failed"),
        }

        let fetch_url = url.to_string();
        let bytes = match call_with_timeout("asset_fetch", timeout, move || {
            fetcher.fetch(&fetch_url)
        }) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(url = %url, error = %err, "asset fetch failed");
                return Ok(Decision::reject(AssetStatus::Failed, REASON_FETCH_ERROR, 0));
            }
        };
        let original = bytes.len() as u64;
        if original > policy.max_file_bytes {
            return Ok(Decision::reject(AssetStatus::Skipped, REASON_FILE_CAP, original));
        }

        let transcoder = self.ctx.services.transcoder.clone();
        let source = bytes.clone();
        let transcode_url = url.to_string();
        let transcoded = match call_with_timeout("asset_transcode", timeout, move || {
            transcoder.transcode(&transcode_url, &source)
        }) {
            Ok(Some(out)) if (out.bytes.len() as u64) < original => Some(out),
            Ok(_) => None,
            Err(err) => {
                tracing::debug!(url = %url, error = %err, "transcode failed, keeping original");
                None
            }
        };
        let (status, extension, payload) = match transcoded {
            Some(out) => (AssetStatus::Optimized, Some(out.extension), out.bytes),
            None => (AssetStatus::Downloaded, None, bytes),
        };
        let final_len = payload.len() as u64;
        if stored_so_far.saturating_add(final_len) > policy.max_total_bytes {
            return Ok(Decision::reject(AssetStatus::Skipped, REASON_AGGREGATE_CAP, original));
        }

        let name = local_name(url, extension.as_deref());
        if let Err(err) = self.write(&name, &payload) {
            tracing::warn!(url = %url, error = %err, "asset write failed");
            return Ok(Decision::reject(AssetStatus::Failed, REASON_WRITE_ERROR, original));
        }
        Ok(Decision {
            status,
            reason: None,
            local_path: Some(format!("{}/{name}", policy.output_dir.trim_end_matches('/'))),
            bytes_original: original,
            bytes_final: final_len,
        })
    }

    fn write(&self, name: &str, payload: &[u8]) -> Result<(), PipelineError> {
        let dir = {
            let store = lock_store(self.ctx.store)?;
            asset_dir(store.storage_dir(), self.ctx.job_id())
        };
        std::fs::create_dir_all(&dir)
            .and_then(|()| std::fs::write(dir.join(name), payload))
            .map_err(|err| PipelineError::InvalidInput(format!("{}: {err}", dir.display())))
    }

    fn record(&self, url: &str, decision: Decision) -> Result<(), PipelineError> {
        lock_store(self.ctx.store)?.asset_record(AssetRecordRequest {
            job_id: self.ctx.job_id().clone(),
            worker_id: self.ctx.worker_id().clone(),
            source_url: url.to_string(),
            local_path: decision.local_path,
            status: decision.status,
            skip_reason: decision.reason.map(str::to_string),
            bytes_original: decision.bytes_original,
            bytes_final: decision.bytes_final,
            now_ms: self.ctx.now_ms(),
        })?;
        Ok(())
    }

    fn summary(&self) -> Result<AssetSummary, PipelineError> {
        let rows = lock_store(self.ctx.store)?.asset_records_latest(self.ctx.job_id())?;
        let mut summary = AssetSummary::default();
        for row in rows {
            match row.status {
                AssetStatus::Downloaded | AssetStatus::Optimized => {
                    summary.stored += 1;
                    summary.bytes_total = summary.bytes_total.saturating_add(row.bytes_final);
                }
                AssetStatus::Skipped => summary.skipped += 1,
                AssetStatus::Failed => summary.failed += 1,
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AssetPolicy {
        AssetPolicy {
            allow_hosts: vec!["fonts.gstatic.com".to_string(), "cdn.example".to_string()],
            block_hosts: vec!["stock.example".to_string(), "cdn.example".to_string()],
            ..AssetPolicy::default()
        }
    }

    fn reason(screening: Screening) -> Option<&'static str> {
        match screening {
            Screening::Fetch(_) => None,
            Screening::Reject { reason, .. } => Some(reason),
        }
    }

    #[test]
    fn screening_order() {
        let origin = Url::parse("https://shop.example/").ok();
        let origin = origin.as_ref();
        let policy = policy();

        assert_eq!(reason(screen("/img/a.png", origin, &policy)), None);
        assert_eq!(
            reason(screen("https://fonts.gstatic.com/f.woff2", origin, &policy)),
            None
        );
        assert_eq!(
            reason(screen("https://other.example/a.png", origin, &policy)),
            Some(REASON_OFF_ORIGIN)
        );
        assert_eq!(
            reason(screen("https://img.stock.example/a.png", origin, &policy)),
            Some(REASON_BLOCKLISTED)
        );
        assert_eq!(
            reason(screen("https://cdn.example/a.png", origin, &policy)),
            Some(REASON_BLOCKLISTED)
        );
        assert_eq!(
            reason(screen("data:image/png;base64,AAAA", origin, &policy)),
            Some(REASON_INVALID_URL)
        );
        assert_eq!(reason(screen("not a url", None, &policy)), Some(REASON_INVALID_URL));
    }

    #[test]
    fn host_lists_match_subdomains_only_on_label_boundaries() {
        let list = vec!["example.com".to_string()];
        assert!(host_listed("example.com", &list));
        assert!(host_listed("img.example.com", &list));
        assert!(!host_listed("badexample.com", &list));
    }

    #[test]
    fn local_names_are_stable_and_sanitized() {
        let url = Url::parse("https://shop.example/media/Hero Image.JPG?v=2").expect("url");
        let a = local_name(&url, None);
        assert_eq!(a, local_name(&url, None));
        assert!(a.ends_with("-Hero_Image.JPG"));
        assert!(local_name(&url, Some("webp")).ends_with("-Hero_Image.webp"));
    }
}
