#![forbid(unsafe_code)]

use super::support::{job_id_column, unit_kind_column, unit_status_column};
use super::*;

const MAX_UNIT_PATH_LEN: usize = 512;
const MAX_UNIT_CONTENT_LEN: usize = 1_000_000;

fn normalize_unit_path(raw: &str) -> Result<String, StoreError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(StoreError::InvalidInput("unit path must not be empty"));
    }
    if value.len() > MAX_UNIT_PATH_LEN {
        return Err(StoreError::InvalidInput("unit path is too long"));
    }
    if value.starts_with('/') || value.split('/').any(|part| part == "..") {
        return Err(StoreError::InvalidInput("unit path must be project-relative"));
    }
    Ok(value.to_string())
}

const UNIT_COLUMNS: &str = "seq, job_id, path, unit_type, kind, status, source_signature, \
     repair_attempts, content, ts_ms";

fn read_unit_row(row: &rusqlite::Row<'_>) -> Result<UnitRow, rusqlite::Error> {
    Ok(UnitRow {
        seq: row.get(0)?,
        job_id: job_id_column(row, 1)?,
        path: row.get(2)?,
        unit_type: row.get(3)?,
        kind: unit_kind_column(row, 4)?,
        status: unit_status_column(row, 5)?,
        source_signature: row.get(6)?,
        repair_attempts: u32::try_from(row.get::<_, i64>(7)?).unwrap_or(0),
        content: row.get(8)?,
        ts_ms: row.get(9)?,
    })
}

impl SqliteStore {
    /// Appends a new state for a unit. Older rows stay as history.
    pub fn unit_record(&mut self, request: UnitRecordRequest) -> Result<UnitRow, StoreError> {
        let path = normalize_unit_path(&request.path)?;
        if request
            .content
            .as_ref()
            .is_some_and(|c| c.len() > MAX_UNIT_CONTENT_LEN)
        {
            return Err(StoreError::InvalidInput("unit content is too large"));
        }

        let tx = self.conn.transaction()?;
        guard_lease_tx(&tx, &request.job_id, &request.worker_id, request.now_ms)?;
        tx.execute(
            r#"
            INSERT INTO generated_units(
              job_id, path, unit_type, kind, status, source_signature, repair_attempts, content, ts_ms
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                request.job_id.as_str(),
                path,
                request.unit_type,
                request.kind.as_str(),
                request.status.as_str(),
                request.source_signature,
                i64::from(request.repair_attempts),
                request.content,
                request.now_ms
            ],
        )?;
        let seq = tx.last_insert_rowid();
        tx.commit()?;

        Ok(UnitRow {
            seq,
            job_id: request.job_id,
            path,
            unit_type: request.unit_type,
            kind: request.kind,
            status: request.status,
            source_signature: request.source_signature,
            repair_attempts: request.repair_attempts,
            content: request.content,
            ts_ms: request.now_ms,
        })
    }

    /// Current state of every unit of the job (newest row per path), ordered by path.
    pub fn units_latest(&self, job_id: &JobId) -> Result<Vec<UnitRow>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {UNIT_COLUMNS}
            FROM generated_units
            WHERE seq IN (
              SELECT MAX(seq) FROM generated_units WHERE job_id=?1 GROUP BY path
            )
            ORDER BY path ASC
            "#
        ))?;
        let rows = stmt.query_map(params![job_id.as_str()], read_unit_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn unit_latest(&self, job_id: &JobId, path: &str) -> Result<Option<UnitRow>, StoreError> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {UNIT_COLUMNS} FROM generated_units \
                     WHERE job_id=?1 AND path=?2 ORDER BY seq DESC LIMIT 1"
                ),
                params![job_id.as_str(), path.trim()],
                read_unit_row,
            )
            .optional()?)
    }

    /// Every recorded state of one unit, oldest first.
    pub fn unit_history(&self, job_id: &JobId, path: &str) -> Result<Vec<UnitRow>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {UNIT_COLUMNS} FROM generated_units WHERE job_id=?1 AND path=?2 ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map(params![job_id.as_str(), path.trim()], read_unit_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
