#![forbid(unsafe_code)]

use rusqlite::types::Type;
use sm_core::ids::JobId;
use sm_core::model::{AssetStatus, GateStatus, Phase, UnitKind, UnitStatus};

fn conversion_error(index: usize, what: &'static str, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        Type::Text,
        format!("invalid {what}: {raw}").into(),
    )
}

pub(in crate::store) fn phase_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> Result<Phase, rusqlite::Error> {
    let raw = row.get::<_, String>(index)?;
    Phase::parse(&raw).ok_or_else(|| conversion_error(index, "phase", &raw))
}

pub(in crate::store) fn optional_phase_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> Result<Option<Phase>, rusqlite::Error> {
    let Some(raw) = row.get::<_, Option<String>>(index)? else {
        return Ok(None);
    };
    Phase::parse(&raw)
        .map(Some)
        .ok_or_else(|| conversion_error(index, "phase", &raw))
}

pub(in crate::store) fn unit_status_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> Result<UnitStatus, rusqlite::Error> {
    let raw = row.get::<_, String>(index)?;
    UnitStatus::parse(&raw).ok_or_else(|| conversion_error(index, "unit status", &raw))
}

pub(in crate::store) fn unit_kind_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> Result<UnitKind, rusqlite::Error> {
    let raw = row.get::<_, String>(index)?;
    UnitKind::parse(&raw).ok_or_else(|| conversion_error(index, "unit kind", &raw))
}

pub(in crate::store) fn gate_status_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> Result<GateStatus, rusqlite::Error> {
    let raw = row.get::<_, String>(index)?;
    GateStatus::parse(&raw).ok_or_else(|| conversion_error(index, "gate status", &raw))
}

pub(in crate::store) fn asset_status_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> Result<AssetStatus, rusqlite::Error> {
    let raw = row.get::<_, String>(index)?;
    AssetStatus::parse(&raw).ok_or_else(|| conversion_error(index, "asset status", &raw))
}

pub(in crate::store) fn bool_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> Result<bool, rusqlite::Error> {
    Ok(row.get::<_, i64>(index)? != 0)
}

pub(in crate::store) fn job_id_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> Result<JobId, rusqlite::Error> {
    let raw = row.get::<_, String>(index)?;
    JobId::try_new(raw.as_str()).map_err(|_| conversion_error(index, "job id", &raw))
}
