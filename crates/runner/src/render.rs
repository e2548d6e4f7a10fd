#![forbid(unsafe_code)]

use serde_json::{Value, json};
use sm_pipeline::api::JobStatus;
use sm_storage::{AssetRecordRow, GateResultRow, JobEventRow, JobRow, UnitRow};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// RFC3339 rendering of a millisecond timestamp; falls back to the raw number when out of range.
pub(crate) fn ts(ms: i64) -> Value {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .map_or_else(|| json!(ms), Value::String)
}

fn opt_ts(ms: Option<i64>) -> Value {
    ms.map_or(Value::Null, ts)
}

pub(crate) fn job(row: &JobRow) -> Value {
    json!({
        "job_id": row.id.as_str(),
        "phase": row.phase.as_str(),
        "revision": row.revision,
        "source_url": row.source_url,
        "project_id": row.project_id,
        "user_id": row.user_id,
        "instructions": row.instructions,
        "migration_attempt": row.migration_attempt,
        "lease_owner": row.lease_owner,
        "lease_expires_at": opt_ts(row.lease_expires_at_ms),
        "cancel_requested": row.cancel_requested,
        "available_at": ts(row.available_at_ms),
        "last_error": row.last_error,
        "created_at": ts(row.created_at_ms),
        "updated_at": ts(row.updated_at_ms),
        "completed_at": opt_ts(row.completed_at_ms),
    })
}

fn unit(row: &UnitRow) -> Value {
    json!({
        "path": row.path,
        "unit_type": row.unit_type,
        "kind": row.kind.as_str(),
        "status": row.status.as_str(),
        "repair_attempts": row.repair_attempts,
        "bytes": row.content.as_ref().map_or(0, String::len),
    })
}

fn gate(row: &GateResultRow) -> Value {
    let findings: Vec<Value> = row
        .findings
        .iter()
        .map(|f| {
            json!({
                "severity": f.severity.as_str(),
                "location": f.location,
                "message": f.message,
            })
        })
        .collect();
    json!({
        "gate": row.gate_name,
        "status": row.status.as_str(),
        "blocking": row.blocking,
        "duration_ms": row.duration_ms,
        "findings": findings,
    })
}

fn asset(row: &AssetRecordRow) -> Value {
    json!({
        "source_url": row.source_url,
        "status": row.status.as_str(),
        "local_path": row.local_path,
        "skip_reason": row.skip_reason,
        "bytes_original": row.bytes_original,
        "bytes_final": row.bytes_final,
    })
}

fn event(row: &JobEventRow) -> Value {
    json!({
        "seq": row.seq,
        "ts": ts(row.ts_ms),
        "kind": row.kind,
        "phase": row.phase.map(|p| p.as_str()),
        "message": row.message,
    })
}

pub(crate) fn status(status: &JobStatus) -> Value {
    let attempts: serde_json::Map<String, Value> = status
        .phase_attempts
        .iter()
        .map(|(phase, n)| (phase.as_str().to_string(), json!(n)))
        .collect();
    json!({
        "job": job(&status.job),
        "phase_attempts": attempts,
        "manifest": status.manifest.iter().map(unit).collect::<Vec<_>>(),
        "gate_results": status.gate_results.iter().map(gate).collect::<Vec<_>>(),
        "assets": status.assets.iter().map(asset).collect::<Vec<_>>(),
        "events": status.events.iter().map(event).collect::<Vec<_>>(),
    })
}
