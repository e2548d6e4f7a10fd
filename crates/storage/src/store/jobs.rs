#![forbid(unsafe_code)]

use super::support::{bool_column, job_id_column, phase_column};
use super::*;
use std::collections::BTreeMap;

const MAX_SOURCE_URL_LEN: usize = 2_048;
const MAX_INSTRUCTIONS_LEN: usize = 50_000;
const MAX_OWNER_FIELD_LEN: usize = 128;
const MAX_REASON_LEN: usize = 2_000;
const MAX_SIGNATURE_LEN: usize = 128;
const MAX_LIST_LIMIT: usize = 500;

const JOB_COLUMNS: &str = "id, revision, phase, source_url, project_id, user_id, instructions, \
     migration_attempt, lease_owner, lease_expires_at_ms, cancel_requested, available_at_ms, \
     last_error, created_at_ms, updated_at_ms, completed_at_ms";

fn normalize_source_url(raw: &str) -> Result<String, StoreError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(StoreError::InvalidInput("source_url must not be empty"));
    }
    if value.len() > MAX_SOURCE_URL_LEN {
        return Err(StoreError::InvalidInput("source_url is too long"));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(StoreError::InvalidInput("source_url must not contain whitespace"));
    }
    Ok(value.to_string())
}

fn normalize_owner_field(
    raw: Option<String>,
    field: &'static str,
) -> Result<Option<String>, StoreError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value = raw.trim();
    if value.is_empty() {
        return Ok(None);
    }
    if value.len() > MAX_OWNER_FIELD_LEN || value.chars().any(|c| c.is_control()) {
        return Err(StoreError::InvalidInput(field));
    }
    Ok(Some(value.to_string()))
}

fn normalize_instructions(raw: Option<String>) -> Result<Option<String>, StoreError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value = raw.trim();
    if value.is_empty() {
        return Ok(None);
    }
    if value.len() > MAX_INSTRUCTIONS_LEN {
        return Err(StoreError::InvalidInput("instructions are too long"));
    }
    Ok(Some(value.to_string()))
}

fn normalize_reason(raw: &str) -> String {
    let value = raw.trim();
    if value.len() <= MAX_REASON_LEN {
        return value.to_string();
    }
    let mut end = MAX_REASON_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

fn normalize_signature(raw: &str) -> Result<String, StoreError> {
    let value = raw.trim();
    if value.is_empty() || value.len() > MAX_SIGNATURE_LEN {
        return Err(StoreError::InvalidInput("signature must be 1..128 chars"));
    }
    Ok(value.to_string())
}

fn read_job_row(row: &rusqlite::Row<'_>) -> Result<JobRow, rusqlite::Error> {
    Ok(JobRow {
        id: job_id_column(row, 0)?,
        revision: row.get(1)?,
        phase: phase_column(row, 2)?,
        source_url: row.get(3)?,
        project_id: row.get(4)?,
        user_id: row.get(5)?,
        instructions: row.get(6)?,
        migration_attempt: row.get(7)?,
        lease_owner: row.get(8)?,
        lease_expires_at_ms: row.get(9)?,
        cancel_requested: bool_column(row, 10)?,
        available_at_ms: row.get(11)?,
        last_error: row.get(12)?,
        created_at_ms: row.get(13)?,
        updated_at_ms: row.get(14)?,
        completed_at_ms: row.get(15)?,
    })
}

fn job_get_tx(tx: &Transaction<'_>, job_id: &JobId) -> Result<JobRow, StoreError> {
    tx.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id=?1"),
        params![job_id.as_str()],
        read_job_row,
    )
    .optional()?
    .ok_or(StoreError::UnknownId)
}

fn terminal_error(job_id: &JobId, phase: Phase) -> StoreError {
    StoreError::JobTerminal {
        job_id: job_id.to_string(),
        phase: phase.as_str().to_string(),
    }
}

impl SqliteStore {
    pub fn job_create(&mut self, request: JobCreateRequest) -> Result<JobRow, StoreError> {
        let source_url = normalize_source_url(&request.source_url)?;
        let project_id = normalize_owner_field(request.project_id, "invalid project_id")?;
        let user_id = normalize_owner_field(request.user_id, "invalid user_id")?;
        let instructions = normalize_instructions(request.instructions)?;
        let now_ms = request.now_ms;

        let tx = self.conn.transaction()?;
        let seq = next_counter_tx(&tx, "job_seq")?;
        let id = JobId::from_seq(seq);
        tx.execute(
            r#"
            INSERT INTO jobs(
              id, revision, phase, source_url, project_id, user_id, instructions,
              migration_attempt, cancel_requested, available_at_ms, event_seq,
              created_at_ms, updated_at_ms
            )
            VALUES (?1, 0, ?2, ?3, ?4, ?5, ?6, 1, 0, ?7, 0, ?7, ?7)
            "#,
            params![
                id.as_str(),
                Phase::Analyze.as_str(),
                source_url,
                project_id,
                user_id,
                instructions,
                now_ms
            ],
        )?;
        let row = job_get_tx(&tx, &id)?;
        tx.commit()?;
        Ok(row)
    }

    pub fn job_get(&self, job_id: &JobId) -> Result<Option<JobRow>, StoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id=?1"),
                params![job_id.as_str()],
                read_job_row,
            )
            .optional()?)
    }

    /// Newest first.
    pub fn jobs_list(&self, limit: usize) -> Result<Vec<JobRow>, StoreError> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT) as i64;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at_ms DESC, id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], read_job_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Jobs a worker could claim at `now_ms`, oldest first. The list is advisory: the claim
    /// itself is what decides ownership.
    pub fn jobs_claimable(&self, now_ms: i64, limit: usize) -> Result<Vec<JobId>, StoreError> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT) as i64;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id FROM jobs
            WHERE phase NOT IN ('DONE', 'FAILED', 'CANCELLED')
              AND available_at_ms <= ?1
              AND (lease_owner IS NULL OR lease_expires_at_ms <= ?1)
            ORDER BY available_at_ms ASC, created_at_ms ASC, id ASC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![now_ms, limit], |row| job_id_column(row, 0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Compare-and-swap claim. Returns `false` when another worker holds an unexpired lease,
    /// the job is terminal, backing off, or unknown.
    pub fn job_try_claim(&mut self, request: JobLeaseRequest) -> Result<bool, StoreError> {
        let expires_at_ms = lease_expiry(request.now_ms, request.ttl_ms);
        let changed = self.conn.execute(
            r#"
            UPDATE jobs
            SET lease_owner=?2, lease_expires_at_ms=?3, revision=revision+1, updated_at_ms=?4
            WHERE id=?1
              AND phase NOT IN ('DONE', 'FAILED', 'CANCELLED')
              AND available_at_ms <= ?4
              AND (lease_owner IS NULL OR lease_expires_at_ms <= ?4)
            "#,
            params![
                request.id.as_str(),
                request.worker_id.as_str(),
                expires_at_ms,
                request.now_ms
            ],
        )?;
        Ok(changed == 1)
    }

    /// Extends a lease the caller still holds. `false` means the lease is gone.
    pub fn job_renew(&mut self, request: JobLeaseRequest) -> Result<bool, StoreError> {
        let expires_at_ms = lease_expiry(request.now_ms, request.ttl_ms);
        let changed = self.conn.execute(
            r#"
            UPDATE jobs
            SET lease_expires_at_ms=?3, updated_at_ms=?4
            WHERE id=?1 AND lease_owner=?2 AND lease_expires_at_ms > ?4
              AND phase NOT IN ('DONE', 'FAILED', 'CANCELLED')
            "#,
            params![
                request.id.as_str(),
                request.worker_id.as_str(),
                expires_at_ms,
                request.now_ms
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn job_release(
        &mut self,
        job_id: &JobId,
        worker_id: &WorkerId,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            r#"
            UPDATE jobs
            SET lease_owner=NULL, lease_expires_at_ms=NULL, revision=revision+1, updated_at_ms=?3
            WHERE id=?1 AND lease_owner=?2
            "#,
            params![job_id.as_str(), worker_id.as_str(), now_ms],
        )?;
        Ok(changed == 1)
    }

    /// Moves the job from `from` to the next phase. Reaching DONE releases the lease.
    pub fn job_advance(&mut self, request: JobAdvanceRequest) -> Result<JobRow, StoreError> {
        let tx = self.conn.transaction()?;
        let phase = guard_lease_tx(&tx, &request.id, &request.worker_id, request.now_ms)?;
        if phase != request.from {
            return Err(StoreError::PhaseMismatch {
                job_id: request.id.to_string(),
                expected: request.from.as_str().to_string(),
                actual: phase.as_str().to_string(),
            });
        }

        let next = phase.next();
        if next == Phase::Done {
            tx.execute(
                r#"
                UPDATE jobs
                SET phase=?2, revision=revision+1, updated_at_ms=?3, completed_at_ms=?3,
                    lease_owner=NULL, lease_expires_at_ms=NULL, last_error=NULL
                WHERE id=?1
                "#,
                params![request.id.as_str(), next.as_str(), request.now_ms],
            )?;
        } else {
            tx.execute(
                r#"
                UPDATE jobs
                SET phase=?2, revision=revision+1, updated_at_ms=?3, last_error=NULL
                WHERE id=?1
                "#,
                params![request.id.as_str(), next.as_str(), request.now_ms],
            )?;
        }

        let row = job_get_tx(&tx, &request.id)?;
        tx.commit()?;
        Ok(row)
    }

    /// Gives the job back to the queue with a backoff deadline, keeping its phase.
    pub fn job_requeue(&mut self, request: JobRequeueRequest) -> Result<JobRow, StoreError> {
        let tx = self.conn.transaction()?;
        guard_lease_tx(&tx, &request.id, &request.worker_id, request.now_ms)?;
        tx.execute(
            r#"
            UPDATE jobs
            SET available_at_ms=?2, last_error=?3, lease_owner=NULL, lease_expires_at_ms=NULL,
                revision=revision+1, updated_at_ms=?4
            WHERE id=?1
            "#,
            params![
                request.id.as_str(),
                request.available_at_ms.max(request.now_ms),
                normalize_reason(&request.reason),
                request.now_ms
            ],
        )?;
        let row = job_get_tx(&tx, &request.id)?;
        tx.commit()?;
        Ok(row)
    }

    pub fn job_fail(&mut self, request: JobFailRequest) -> Result<JobRow, StoreError> {
        let tx = self.conn.transaction()?;
        guard_lease_tx(&tx, &request.id, &request.worker_id, request.now_ms)?;
        tx.execute(
            r#"
            UPDATE jobs
            SET phase='FAILED', last_error=?2, lease_owner=NULL, lease_expires_at_ms=NULL,
                revision=revision+1, updated_at_ms=?3, completed_at_ms=?3
            WHERE id=?1
            "#,
            params![
                request.id.as_str(),
                normalize_reason(&request.reason),
                request.now_ms
            ],
        )?;
        let row = job_get_tx(&tx, &request.id)?;
        tx.commit()?;
        Ok(row)
    }

    /// Completes a cooperative cancellation observed by the lease holder.
    pub fn job_mark_cancelled(
        &mut self,
        job_id: &JobId,
        worker_id: &WorkerId,
        now_ms: i64,
    ) -> Result<JobRow, StoreError> {
        let tx = self.conn.transaction()?;
        guard_lease_tx(&tx, job_id, worker_id, now_ms)?;
        let requested = tx.query_row(
            "SELECT cancel_requested FROM jobs WHERE id=?1",
            params![job_id.as_str()],
            |row| bool_column(row, 0),
        )?;
        if !requested {
            return Err(StoreError::CancelNotRequested {
                job_id: job_id.to_string(),
            });
        }
        tx.execute(
            r#"
            UPDATE jobs
            SET phase='CANCELLED', lease_owner=NULL, lease_expires_at_ms=NULL,
                revision=revision+1, updated_at_ms=?2, completed_at_ms=?2
            WHERE id=?1
            "#,
            params![job_id.as_str(), now_ms],
        )?;
        let row = job_get_tx(&tx, job_id)?;
        tx.commit()?;
        Ok(row)
    }

    /// Flags the job for cancellation. A job nobody holds is cancelled on the spot; a held job
    /// is cancelled by its worker at the next checkpoint. Terminal jobs are returned unchanged.
    pub fn job_request_cancel(
        &mut self,
        job_id: &JobId,
        now_ms: i64,
    ) -> Result<JobRow, StoreError> {
        let tx = self.conn.transaction()?;
        let current = job_get_tx(&tx, job_id)?;
        if current.phase.is_terminal() {
            tx.commit()?;
            return Ok(current);
        }

        if current.lease_active(now_ms) {
            tx.execute(
                "UPDATE jobs SET cancel_requested=1, revision=revision+1, updated_at_ms=?2 WHERE id=?1",
                params![job_id.as_str(), now_ms],
            )?;
        } else {
            tx.execute(
                r#"
                UPDATE jobs
                SET cancel_requested=1, phase='CANCELLED', lease_owner=NULL, lease_expires_at_ms=NULL,
                    revision=revision+1, updated_at_ms=?2, completed_at_ms=?2
                WHERE id=?1
                "#,
                params![job_id.as_str(), now_ms],
            )?;
        }

        let row = job_get_tx(&tx, job_id)?;
        tx.commit()?;
        Ok(row)
    }

    /// Forced invalidation: drops cached results from `from_phase` onward and rewinds the job
    /// to it under a new migration attempt.
    pub fn job_invalidate(&mut self, request: JobInvalidateRequest) -> Result<JobRow, StoreError> {
        if !request.from_phase.is_work() {
            return Err(StoreError::InvalidInput(
                "invalidation must start at a work phase",
            ));
        }

        let tx = self.conn.transaction()?;
        let current = job_get_tx(&tx, &request.id)?;
        if current.phase.is_terminal() {
            return Err(terminal_error(&request.id, current.phase));
        }
        if current.lease_active(request.now_ms) {
            let holder = current.lease_owner.clone().unwrap_or_default();
            let caller_holds = request
                .worker_id
                .as_ref()
                .is_some_and(|worker| worker.as_str() == holder);
            if !caller_holds {
                return Err(StoreError::LeaseHeld {
                    job_id: request.id.to_string(),
                    holder,
                    expires_at_ms: current.lease_expires_at_ms.unwrap_or_default(),
                });
            }
        }
        if request.from_phase.ordinal() > current.phase.ordinal() {
            return Err(StoreError::InvalidInput(
                "invalidation can only rewind to the current or an earlier phase",
            ));
        }

        for phase in Phase::WORK
            .iter()
            .filter(|phase| phase.ordinal() >= request.from_phase.ordinal())
        {
            tx.execute(
                "DELETE FROM phase_results WHERE job_id=?1 AND phase=?2",
                params![request.id.as_str(), phase.as_str()],
            )?;
            tx.execute(
                "DELETE FROM phase_attempts WHERE job_id=?1 AND phase=?2",
                params![request.id.as_str(), phase.as_str()],
            )?;
        }

        tx.execute(
            r#"
            UPDATE jobs
            SET phase=?2, migration_attempt=migration_attempt+1, available_at_ms=?3,
                last_error=NULL, revision=revision+1, updated_at_ms=?3
            WHERE id=?1
            "#,
            params![
                request.id.as_str(),
                request.from_phase.as_str(),
                request.now_ms
            ],
        )?;

        let row = job_get_tx(&tx, &request.id)?;
        tx.commit()?;
        Ok(row)
    }

    /// Removes the job and, through foreign-key cascades, everything scoped to it.
    pub fn job_delete(&mut self, job_id: &JobId) -> Result<bool, StoreError> {
        let tx = self.conn.transaction()?;
        let deleted = tx.execute("DELETE FROM jobs WHERE id=?1", params![job_id.as_str()])?;
        tx.commit()?;
        Ok(deleted == 1)
    }

    /// Counts one more execution of `phase` and returns the new total.
    pub fn phase_attempt_increment(
        &mut self,
        request: PhaseAttemptRequest,
    ) -> Result<u32, StoreError> {
        let tx = self.conn.transaction()?;
        guard_lease_tx(&tx, &request.id, &request.worker_id, request.now_ms)?;
        tx.execute(
            r#"
            INSERT INTO phase_attempts(job_id, phase, count) VALUES (?1, ?2, 1)
            ON CONFLICT(job_id, phase) DO UPDATE SET count=count+1
            "#,
            params![request.id.as_str(), request.phase.as_str()],
        )?;
        let count: i64 = tx.query_row(
            "SELECT count FROM phase_attempts WHERE job_id=?1 AND phase=?2",
            params![request.id.as_str(), request.phase.as_str()],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    pub fn phase_attempts(&self, job_id: &JobId) -> Result<BTreeMap<Phase, u32>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT phase, count FROM phase_attempts WHERE job_id=?1")?;
        let rows = stmt.query_map(params![job_id.as_str()], |row| {
            Ok((phase_column(row, 0)?, row.get::<_, i64>(1)?))
        })?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (phase, count) = row?;
            out.insert(phase, u32::try_from(count).unwrap_or(u32::MAX));
        }
        Ok(out)
    }

    pub fn phase_result_put(&mut self, request: PhaseResultPutRequest) -> Result<(), StoreError> {
        let signature = normalize_signature(&request.signature)?;
        if !request.phase.is_work() {
            return Err(StoreError::InvalidInput("phase results exist only for work phases"));
        }
        let tx = self.conn.transaction()?;
        guard_lease_tx(&tx, &request.id, &request.worker_id, request.now_ms)?;
        tx.execute(
            r#"
            INSERT INTO phase_results(job_id, phase, signature, result_json, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(job_id, phase) DO UPDATE SET
              signature=excluded.signature,
              result_json=excluded.result_json,
              created_at_ms=excluded.created_at_ms
            "#,
            params![
                request.id.as_str(),
                request.phase.as_str(),
                signature,
                request.result_json,
                request.now_ms
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn phase_result_get(
        &self,
        job_id: &JobId,
        phase: Phase,
    ) -> Result<Option<PhaseResultRow>, StoreError> {
        Ok(self
            .conn
            .query_row(
                r#"
                SELECT phase, signature, result_json, created_at_ms
                FROM phase_results WHERE job_id=?1 AND phase=?2
                "#,
                params![job_id.as_str(), phase.as_str()],
                read_phase_result_row,
            )
            .optional()?)
    }

    /// Cached results in pipeline order.
    pub fn phase_results(&self, job_id: &JobId) -> Result<Vec<PhaseResultRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT phase, signature, result_json, created_at_ms
            FROM phase_results WHERE job_id=?1
            "#,
        )?;
        let rows = stmt.query_map(params![job_id.as_str()], read_phase_result_row)?;
        let mut out = rows.collect::<Result<Vec<_>, _>>()?;
        out.sort_by_key(|row| row.phase.ordinal());
        Ok(out)
    }
}

fn read_phase_result_row(row: &rusqlite::Row<'_>) -> Result<PhaseResultRow, rusqlite::Error> {
    Ok(PhaseResultRow {
        phase: phase_column(row, 0)?,
        signature: row.get(1)?,
        result_json: row.get(2)?,
        created_at_ms: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_is_truncated_on_char_boundary() {
        let long = "é".repeat(MAX_REASON_LEN);
        let out = normalize_reason(&long);
        assert!(out.len() <= MAX_REASON_LEN);
        assert!(out.chars().all(|c| c == 'é'));
    }

    #[test]
    fn source_url_rejects_blank_and_whitespace() {
        assert!(normalize_source_url("   ").is_err());
        assert!(normalize_source_url("https://a.example/ x").is_err());
        assert_eq!(
            normalize_source_url(" https://a.example/ ").unwrap(),
            "https://a.example/"
        );
    }
}
