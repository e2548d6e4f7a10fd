#![forbid(unsafe_code)]

use super::support::{
    bool_column, decode_findings, encode_findings, gate_status_column, job_id_column,
};
use super::*;

const MAX_GATE_NAME_LEN: usize = 64;
const MAX_GATES_PER_RUN: usize = 32;

fn normalize_gate_name(raw: &str) -> Result<String, StoreError> {
    let value = raw.trim();
    if value.is_empty() || value.len() > MAX_GATE_NAME_LEN {
        return Err(StoreError::InvalidInput("gate name must be 1..64 chars"));
    }
    Ok(value.to_string())
}

impl SqliteStore {
    /// Appends one verification run (all gates, in order) and returns its run number.
    pub fn gate_results_record(&mut self, request: GateRunRecordRequest) -> Result<i64, StoreError> {
        if request.results.is_empty() {
            return Err(StoreError::InvalidInput("gate run must contain results"));
        }
        if request.results.len() > MAX_GATES_PER_RUN {
            return Err(StoreError::InvalidInput("too many gates in one run"));
        }
        let mut names = Vec::with_capacity(request.results.len());
        for result in &request.results {
            names.push(normalize_gate_name(&result.gate_name)?);
        }

        let tx = self.conn.transaction()?;
        guard_lease_tx(&tx, &request.job_id, &request.worker_id, request.now_ms)?;
        let run: i64 = tx.query_row(
            "SELECT COALESCE(MAX(run), 0) + 1 FROM gate_results WHERE job_id=?1",
            params![request.job_id.as_str()],
            |row| row.get(0),
        )?;

        for (position, (result, name)) in request.results.iter().zip(names).enumerate() {
            tx.execute(
                r#"
                INSERT INTO gate_results(
                  job_id, migration_attempt, run, position, gate_name, status, blocking,
                  findings_json, duration_ms, ts_ms
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    request.job_id.as_str(),
                    request.migration_attempt,
                    run,
                    position as i64,
                    name,
                    result.status.as_str(),
                    i64::from(result.blocking),
                    encode_findings(&result.findings),
                    to_sqlite_i64(result.duration_ms)?,
                    request.now_ms
                ],
            )?;
        }

        tx.commit()?;
        Ok(run)
    }

    /// Gate results of the newest run, in gate order. Empty if Verify never ran.
    pub fn gate_results_latest(&self, job_id: &JobId) -> Result<Vec<GateResultRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT job_id, migration_attempt, run, position, gate_name, status, blocking,
                   findings_json, duration_ms, ts_ms
            FROM gate_results
            WHERE job_id=?1 AND run = (SELECT MAX(run) FROM gate_results WHERE job_id=?1)
            ORDER BY position ASC
            "#,
        )?;
        let mut rows = stmt.query(params![job_id.as_str()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let findings_json: String = row.get(7)?;
            out.push(GateResultRow {
                job_id: job_id_column(row, 0)?,
                migration_attempt: row.get(1)?,
                run: row.get(2)?,
                position: u32::try_from(row.get::<_, i64>(3)?).unwrap_or(0),
                gate_name: row.get(4)?,
                status: gate_status_column(row, 5)?,
                blocking: bool_column(row, 6)?,
                findings: decode_findings(&findings_json)?,
                duration_ms: from_sqlite_u64(row.get(8)?),
                ts_ms: row.get(9)?,
            });
        }
        Ok(out)
    }
}
