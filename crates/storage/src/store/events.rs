#![forbid(unsafe_code)]

use super::support::{job_id_column, optional_phase_column};
use super::*;

const MAX_EVENT_KIND_LEN: usize = 32;
const MAX_EVENT_MESSAGE_LEN: usize = 400;
const MAX_TAIL_EVENTS: usize = 500;

fn normalize_event_kind(raw: &str) -> Result<String, StoreError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(StoreError::InvalidInput("event kind must not be empty"));
    }
    if value.len() > MAX_EVENT_KIND_LEN
        || !value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(StoreError::InvalidInput("event kind must be [a-z0-9_]{1,32}"));
    }
    Ok(value.to_string())
}

fn normalize_event_message(raw: &str) -> String {
    let value = raw.trim();
    if value.len() <= MAX_EVENT_MESSAGE_LEN {
        return value.to_string();
    }
    let mut end = MAX_EVENT_MESSAGE_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

fn read_event_row(row: &rusqlite::Row<'_>) -> Result<JobEventRow, rusqlite::Error> {
    Ok(JobEventRow {
        job_id: job_id_column(row, 0)?,
        seq: row.get(1)?,
        ts_ms: row.get(2)?,
        kind: row.get(3)?,
        phase: optional_phase_column(row, 4)?,
        message: row.get(5)?,
        payload_json: row.get(6)?,
    })
}

impl SqliteStore {
    /// Appends a progress event. The sequence number comes from the job row, so it is strictly
    /// increasing per job no matter which worker (or API caller) emits it.
    pub fn job_event_append(
        &mut self,
        request: JobEventAppendRequest,
    ) -> Result<JobEventRow, StoreError> {
        let kind = normalize_event_kind(&request.kind)?;
        let message = normalize_event_message(&request.message);

        let tx = self.conn.transaction()?;
        ensure_job_exists_tx(&tx, &request.job_id)?;
        tx.execute(
            "UPDATE jobs SET event_seq=event_seq+1 WHERE id=?1",
            params![request.job_id.as_str()],
        )?;
        let seq: i64 = tx.query_row(
            "SELECT event_seq FROM jobs WHERE id=?1",
            params![request.job_id.as_str()],
            |row| row.get(0),
        )?;
        tx.execute(
            r#"
            INSERT INTO job_events(job_id, seq, ts_ms, kind, phase, message, payload_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                request.job_id.as_str(),
                seq,
                request.now_ms,
                kind,
                request.phase.map(|p| p.as_str()),
                message,
                request.payload_json
            ],
        )?;
        tx.commit()?;

        Ok(JobEventRow {
            job_id: request.job_id,
            seq,
            ts_ms: request.now_ms,
            kind,
            phase: request.phase,
            message,
            payload_json: request.payload_json,
        })
    }

    /// Events with `seq > after_seq`, oldest first.
    pub fn job_events_list(
        &self,
        job_id: &JobId,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<JobEventRow>, StoreError> {
        let limit = limit.clamp(1, MAX_TAIL_EVENTS) as i64;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT job_id, seq, ts_ms, kind, phase, message, payload_json
            FROM job_events
            WHERE job_id=?1 AND seq > ?2
            ORDER BY seq ASC
            LIMIT ?3
            "#,
        )?;
        let rows = stmt.query_map(params![job_id.as_str(), after_seq, limit], read_event_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_is_restricted() {
        assert!(normalize_event_kind("phase_started").is_ok());
        assert!(normalize_event_kind("Phase").is_err());
        assert!(normalize_event_kind(" ").is_err());
    }
}
