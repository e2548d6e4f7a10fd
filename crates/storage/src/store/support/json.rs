#![forbid(unsafe_code)]

use super::super::{FindingRow, StoreError};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sm_core::model::Severity;

pub(in crate::store) fn encode_findings(findings: &[FindingRow]) -> String {
    let items = findings
        .iter()
        .map(|finding| {
            let mut obj = JsonMap::new();
            obj.insert(
                "severity".to_string(),
                JsonValue::String(finding.severity.as_str().to_string()),
            );
            obj.insert(
                "location".to_string(),
                finding
                    .location
                    .as_ref()
                    .map(|l| JsonValue::String(l.clone()))
                    .unwrap_or(JsonValue::Null),
            );
            obj.insert(
                "message".to_string(),
                JsonValue::String(finding.message.clone()),
            );
            JsonValue::Object(obj)
        })
        .collect::<Vec<_>>();
    JsonValue::Array(items).to_string()
}

pub(in crate::store) fn decode_findings(raw: &str) -> Result<Vec<FindingRow>, StoreError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let value: JsonValue = serde_json::from_str(trimmed)
        .map_err(|_| StoreError::InvalidInput("stored findings are invalid json"))?;
    let Some(items) = value.as_array() else {
        return Err(StoreError::InvalidInput("stored findings must be a list"));
    };

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let severity = item
            .get("severity")
            .and_then(JsonValue::as_str)
            .and_then(Severity::parse)
            .ok_or(StoreError::InvalidInput("stored finding has invalid severity"))?;
        let location = item
            .get("location")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        let message = item
            .get("message")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        out.push(FindingRow {
            severity,
            location,
            message,
        });
    }
    Ok(out)
}
