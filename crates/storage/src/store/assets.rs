#![forbid(unsafe_code)]

use super::support::{asset_status_column, job_id_column};
use super::*;
use sm_core::model::AssetStatus;

const MAX_SKIP_REASON_LEN: usize = 64;

impl SqliteStore {
    pub fn asset_record(&mut self, request: AssetRecordRequest) -> Result<AssetRecordRow, StoreError> {
        let source_url = request.source_url.trim().to_string();
        if source_url.is_empty() {
            return Err(StoreError::InvalidInput("asset source_url must not be empty"));
        }
        let needs_reason = matches!(request.status, AssetStatus::Skipped | AssetStatus::Failed);
        match request.skip_reason.as_deref() {
            None if needs_reason => {
                return Err(StoreError::InvalidInput(
                    "skipped or failed assets need a reason",
                ));
            }
            Some(reason) if reason.len() > MAX_SKIP_REASON_LEN => {
                return Err(StoreError::InvalidInput("asset reason is too long"));
            }
            _ => {}
        }
        if request.status.is_stored() && request.local_path.is_none() {
            return Err(StoreError::InvalidInput("stored assets need a local_path"));
        }

        let tx = self.conn.transaction()?;
        guard_lease_tx(&tx, &request.job_id, &request.worker_id, request.now_ms)?;
        tx.execute(
            r#"
            INSERT INTO asset_records(
              job_id, source_url, local_path, status, skip_reason, bytes_original, bytes_final, ts_ms
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                request.job_id.as_str(),
                source_url,
                request.local_path,
                request.status.as_str(),
                request.skip_reason,
                to_sqlite_i64(request.bytes_original)?,
                to_sqlite_i64(request.bytes_final)?,
                request.now_ms
            ],
        )?;
        let seq = tx.last_insert_rowid();
        tx.commit()?;

        Ok(AssetRecordRow {
            seq,
            job_id: request.job_id,
            source_url,
            local_path: request.local_path,
            status: request.status,
            skip_reason: request.skip_reason,
            bytes_original: request.bytes_original,
            bytes_final: request.bytes_final,
            ts_ms: request.now_ms,
        })
    }

    /// Newest decision per source URL, in the order the URLs were first seen.
    pub fn asset_records_latest(&self, job_id: &JobId) -> Result<Vec<AssetRecordRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT a.seq, a.job_id, a.source_url, a.local_path, a.status, a.skip_reason,
                   a.bytes_original, a.bytes_final, a.ts_ms
            FROM asset_records a
            JOIN (
              SELECT source_url, MAX(seq) AS last_seq, MIN(seq) AS first_seq
              FROM asset_records WHERE job_id=?1 GROUP BY source_url
            ) g ON a.seq = g.last_seq
            ORDER BY g.first_seq ASC
            "#,
        )?;
        let rows = stmt.query_map(params![job_id.as_str()], |row| {
            Ok(AssetRecordRow {
                seq: row.get(0)?,
                job_id: job_id_column(row, 1)?,
                source_url: row.get(2)?,
                local_path: row.get(3)?,
                status: asset_status_column(row, 4)?,
                skip_reason: row.get(5)?,
                bytes_original: from_sqlite_u64(row.get(6)?),
                bytes_final: from_sqlite_u64(row.get(7)?),
                ts_ms: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
