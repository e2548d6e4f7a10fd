#![forbid(unsafe_code)]

//! Operations exposed to callers outside the worker: submit, inspect, cancel, invalidate.

use crate::clock::Clock;
use crate::progress::{
    self, EVENT_CANCEL_REQUESTED, EVENT_JOB_CANCELLED, EVENT_JOB_INVALIDATED, EVENT_JOB_SUBMITTED,
};
use crate::services::ProgressSink;
use crate::{PipelineError, SharedStore, lock_store};
use serde_json::json;
use sm_core::ids::JobId;
use sm_core::model::Phase;
use sm_storage::{
    AssetRecordRow, GateResultRow, JobCreateRequest, JobEventRow, JobInvalidateRequest, JobRow,
    UnitRow,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use url::Url;

const MAX_STATUS_EVENTS: usize = 200;

#[derive(Clone, Debug, Default)]
pub struct SubmitRequest {
    pub source_url: String,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub instructions: Option<String>,
}

#[derive(Clone, Debug)]
pub struct JobStatus {
    pub job: JobRow,
    pub phase_attempts: BTreeMap<Phase, u32>,
    /// Current row of every generated unit.
    pub manifest: Vec<UnitRow>,
    /// Most recent gate run.
    pub gate_results: Vec<GateResultRow>,
    pub assets: Vec<AssetRecordRow>,
    pub events: Vec<JobEventRow>,
}

fn normalize_source_url(raw: &str) -> Result<String, PipelineError> {
    let invalid = || PipelineError::InvalidInput(format!("source_url must be an http(s) URL: {raw}"));
    let url = Url::parse(raw.trim()).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid());
    }
    Ok(url.to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub struct PipelineApi {
    store: SharedStore,
    clock: Arc<dyn Clock>,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl PipelineApi {
    pub fn new(store: SharedStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            sink: None,
        }
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn submit_job(&self, request: SubmitRequest) -> Result<JobRow, PipelineError> {
        let source_url = normalize_source_url(&request.source_url)?;
        let now_ms = self.clock.now_ms();
        let job = lock_store(&self.store)?.job_create(JobCreateRequest {
            source_url,
            project_id: non_empty(request.project_id),
            user_id: non_empty(request.user_id),
            instructions: non_empty(request.instructions),
            now_ms,
        })?;
        self.emit(
            &job.id,
            EVENT_JOB_SUBMITTED,
            Some(job.phase),
            format!("migration of {} submitted", job.source_url),
            None,
        )?;
        tracing::info!(job_id = %job.id, source_url = %job.source_url, "job submitted");
        Ok(job)
    }

    /// Snapshot of a job. `events_after` pages through the event log by sequence number.
    pub fn get_job_status(
        &self,
        job_id: &JobId,
        events_after: i64,
    ) -> Result<JobStatus, PipelineError> {
        let store = lock_store(&self.store)?;
        let job = store
            .job_get(job_id)?
            .ok_or_else(|| PipelineError::UnknownJob(job_id.to_string()))?;
        Ok(JobStatus {
            phase_attempts: store.phase_attempts(job_id)?,
            manifest: store.units_latest(job_id)?,
            gate_results: store.gate_results_latest(job_id)?,
            assets: store.asset_records_latest(job_id)?,
            events: store.job_events_list(job_id, events_after, MAX_STATUS_EVENTS)?,
            job,
        })
    }

    /// Unheld jobs are cancelled immediately. A job a worker holds is flagged and the worker
    /// stops at its next checkpoint. Terminal jobs are returned unchanged.
    pub fn cancel_job(&self, job_id: &JobId) -> Result<JobRow, PipelineError> {
        let now_ms = self.clock.now_ms();
        let (before, after) = {
            let mut store = lock_store(&self.store)?;
            let before = store
                .job_get(job_id)?
                .ok_or_else(|| PipelineError::UnknownJob(job_id.to_string()))?;
            let after = store.job_request_cancel(job_id, now_ms)?;
            (before, after)
        };
        if before.phase.is_terminal() {
            return Ok(after);
        }
        if after.phase == Phase::Cancelled {
            self.emit(job_id, EVENT_JOB_CANCELLED, Some(before.phase), "cancelled", None)?;
            tracing::info!(job_id = %job_id, "job cancelled");
        } else if !before.cancel_requested {
            self.emit(
                job_id,
                EVENT_CANCEL_REQUESTED,
                Some(after.phase),
                "cancellation requested",
                after
                    .lease_owner
                    .as_deref()
                    .map(|holder| json!({ "lease_owner": holder })),
            )?;
            tracing::info!(job_id = %job_id, "cancellation requested");
        }
        Ok(after)
    }

    /// Rewinds the job to `from_phase` and drops every cached result from there on.
    pub fn invalidate_job(&self, job_id: &JobId, from_phase: Phase) -> Result<JobRow, PipelineError> {
        let now_ms = self.clock.now_ms();
        let job = lock_store(&self.store)?.job_invalidate(JobInvalidateRequest {
            id: job_id.clone(),
            from_phase,
            worker_id: None,
            now_ms,
        })?;
        self.emit(
            job_id,
            EVENT_JOB_INVALIDATED,
            Some(from_phase),
            format!("invalidated from {}", from_phase.as_str()),
            Some(json!({ "migration_attempt": job.migration_attempt })),
        )?;
        tracing::info!(
            job_id = %job_id,
            from_phase = from_phase.as_str(),
            migration_attempt = job.migration_attempt,
            "job invalidated"
        );
        Ok(job)
    }

    fn emit(
        &self,
        job_id: &JobId,
        kind: &str,
        phase: Option<Phase>,
        message: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) -> Result<(), PipelineError> {
        let request =
            progress::event_request(job_id, kind, phase, message, payload, self.clock.now_ms());
        progress::record_event(&self.store, self.sink.as_deref(), request)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_urls_must_be_web_urls() {
        assert_eq!(
            normalize_source_url(" https://shop.example ").expect("valid"),
            "https://shop.example/"
        );
        for bad in ["", "shop.example", "ftp://shop.example/", "mailto:a@b.example"] {
            assert!(normalize_source_url(bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn blank_optional_fields_are_dropped() {
        assert_eq!(non_empty(Some("  ".to_string())), None);
        assert_eq!(non_empty(Some(" p1 ".to_string())), Some("p1".to_string()));
    }
}
