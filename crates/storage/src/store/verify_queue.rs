#![forbid(unsafe_code)]

use super::*;
use rusqlite::TransactionBehavior;

const MAX_LANE_LEN: usize = 64;
const MAX_HOLDER_LEN: usize = 256;
const MAX_LANE_CAPACITY: u32 = 64;

fn normalize_lane(raw: &str) -> Result<String, StoreError> {
    let value = raw.trim();
    if value.is_empty() || value.len() > MAX_LANE_LEN {
        return Err(StoreError::InvalidInput("lane must be 1..64 chars"));
    }
    Ok(value.to_string())
}

fn normalize_holder(raw: &str) -> Result<String, StoreError> {
    let value = raw.trim();
    if value.is_empty() || value.len() > MAX_HOLDER_LEN {
        return Err(StoreError::InvalidInput("holder must be 1..256 chars"));
    }
    Ok(value.to_string())
}

impl SqliteStore {
    /// Registers a verification request under its idempotent key. Duplicates collapse into the
    /// running entry or the stored result; an expired running entry is taken over.
    pub fn verify_request_begin(
        &mut self,
        request: VerifyBeginRequest,
    ) -> Result<VerifyBegin, StoreError> {
        let holder = normalize_holder(&request.holder)?;
        if request.request_key.trim().is_empty() {
            return Err(StoreError::InvalidInput("request_key must not be empty"));
        }
        let expires_at_ms = lease_expiry(request.now_ms, request.ttl_ms);

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            r#"
            INSERT OR IGNORE INTO verify_requests(
              request_key, job_id, migration_attempt, gate_name, status, holder,
              lease_expires_at_ms, result_json, created_at_ms, updated_at_ms
            )
            VALUES (?1, ?2, ?3, ?4, 'running', ?5, ?6, NULL, ?7, ?7)
            "#,
            params![
                request.request_key,
                request.job_id.as_str(),
                request.migration_attempt,
                request.gate_name,
                holder,
                expires_at_ms,
                request.now_ms
            ],
        )?;
        if inserted == 1 {
            tx.commit()?;
            return Ok(VerifyBegin::Acquired);
        }

        let (status, current_holder, current_expiry, result_json) = tx.query_row(
            r#"
            SELECT status, holder, lease_expires_at_ms, result_json
            FROM verify_requests WHERE request_key=?1
            "#,
            params![request.request_key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )?;

        if status == "done" {
            tx.commit()?;
            return Ok(VerifyBegin::Completed {
                result_json: result_json.unwrap_or_default(),
            });
        }

        let expired = current_expiry.is_none_or(|exp| exp <= request.now_ms);
        let same_holder = current_holder.as_deref() == Some(holder.as_str());
        if expired || same_holder {
            tx.execute(
                r#"
                UPDATE verify_requests
                SET holder=?2, lease_expires_at_ms=?3, updated_at_ms=?4
                WHERE request_key=?1
                "#,
                params![request.request_key, holder, expires_at_ms, request.now_ms],
            )?;
            tx.commit()?;
            return Ok(VerifyBegin::Acquired);
        }

        tx.commit()?;
        Ok(VerifyBegin::InFlight {
            holder: current_holder.unwrap_or_default(),
            expires_at_ms: current_expiry.unwrap_or_default(),
        })
    }

    /// Stores the result for later duplicates. `false` if the caller no longer owns the entry.
    pub fn verify_request_complete(
        &mut self,
        request_key: &str,
        holder: &str,
        result_json: &str,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            r#"
            UPDATE verify_requests
            SET status='done', result_json=?3, holder=NULL, lease_expires_at_ms=NULL, updated_at_ms=?4
            WHERE request_key=?1 AND holder=?2 AND status='running'
            "#,
            params![request_key, holder.trim(), result_json, now_ms],
        )?;
        Ok(changed == 1)
    }

    /// Drops a running entry so the next attempt starts fresh (used when the run never
    /// produced a reusable result).
    pub fn verify_request_abandon(
        &mut self,
        request_key: &str,
        holder: &str,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "DELETE FROM verify_requests WHERE request_key=?1 AND holder=?2 AND status='running'",
            params![request_key, holder.trim()],
        )?;
        Ok(changed == 1)
    }

    /// Claims a free (or expired) slot below `capacity`. `None` means the lane is saturated.
    pub fn verify_slot_try_acquire(
        &mut self,
        request: VerifySlotRequest,
    ) -> Result<Option<VerifySlotLease>, StoreError> {
        let lane = normalize_lane(&request.lane)?;
        let holder = normalize_holder(&request.holder)?;
        if request.capacity == 0 || request.capacity > MAX_LANE_CAPACITY {
            return Err(StoreError::InvalidInput("lane capacity must be 1..64"));
        }
        let expires_at_ms = lease_expiry(request.now_ms, request.ttl_ms);

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        for slot_index in 0..request.capacity {
            tx.execute(
                r#"
                INSERT OR IGNORE INTO verify_slots(lane, slot_index, holder, lease_expires_at_ms, updated_at_ms)
                VALUES (?1, ?2, NULL, NULL, ?3)
                "#,
                params![lane, i64::from(slot_index), request.now_ms],
            )?;
        }

        let free = tx
            .query_row(
                r#"
                SELECT slot_index FROM verify_slots
                WHERE lane=?1 AND slot_index < ?2
                  AND (holder IS NULL OR lease_expires_at_ms <= ?3)
                ORDER BY slot_index ASC
                LIMIT 1
                "#,
                params![lane, i64::from(request.capacity), request.now_ms],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        let Some(slot_index) = free else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            r#"
            UPDATE verify_slots
            SET holder=?3, lease_expires_at_ms=?4, updated_at_ms=?5
            WHERE lane=?1 AND slot_index=?2
            "#,
            params![lane, slot_index, holder, expires_at_ms, request.now_ms],
        )?;
        tx.commit()?;

        Ok(Some(VerifySlotLease {
            lane,
            slot_index: u32::try_from(slot_index).unwrap_or(0),
            holder,
            expires_at_ms,
        }))
    }

    pub fn verify_slot_release(&mut self, lease: &VerifySlotLease, now_ms: i64) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            r#"
            UPDATE verify_slots
            SET holder=NULL, lease_expires_at_ms=NULL, updated_at_ms=?4
            WHERE lane=?1 AND slot_index=?2 AND holder=?3
            "#,
            params![
                lease.lane,
                i64::from(lease.slot_index),
                lease.holder,
                now_ms
            ],
        )?;
        Ok(changed == 1)
    }

    /// Slots held with an unexpired lease at `now_ms`.
    pub fn verify_slots_in_use(&self, lane: &str, now_ms: i64) -> Result<u32, StoreError> {
        let count: i64 = self.conn.query_row(
            r#"
            SELECT COUNT(1) FROM verify_slots
            WHERE lane=?1 AND holder IS NOT NULL AND lease_expires_at_ms > ?2
            "#,
            params![lane.trim(), now_ms],
            |row| row.get(0),
        )?;
        Ok(u32::try_from(count).unwrap_or(0))
    }
}
