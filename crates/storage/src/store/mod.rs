#![forbid(unsafe_code)]

mod assets;
mod cache;
mod error;
mod events;
mod gates;
mod jobs;
mod support;
mod types;
mod units;
mod verify_queue;

pub use error::StoreError;
pub use types::*;

use rusqlite::{Connection, OptionalExtension, Transaction, params};
use sm_core::ids::{JobId, WorkerId};
use sm_core::model::Phase;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DB_FILE_NAME: &str = "site_migrator.db";
const MIN_LEASE_TTL_MS: u64 = 1_000;
const MAX_LEASE_TTL_MS: u64 = 24 * 60 * 60 * 1_000;

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    storage_dir: PathBuf,
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;

        let db_path = storage_dir.join(DB_FILE_NAME);
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        support::migrate_sqlite_schema(&conn)?;

        Ok(Self { conn, storage_dir })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }
}

/// Wall-clock milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration,
        Err(_) => return 0,
    };

    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}

fn lease_expiry(now_ms: i64, ttl_ms: u64) -> i64 {
    let ttl_ms = ttl_ms.clamp(MIN_LEASE_TTL_MS, MAX_LEASE_TTL_MS);
    now_ms.saturating_add(i64::try_from(ttl_ms).unwrap_or(i64::MAX))
}

fn next_counter_tx(tx: &Transaction<'_>, name: &str) -> Result<i64, StoreError> {
    let current: i64 = tx
        .query_row(
            "SELECT value FROM counters WHERE name=?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
    let next = current + 1;
    tx.execute(
        r#"
        INSERT INTO counters(name, value) VALUES (?1, ?2)
        ON CONFLICT(name) DO UPDATE SET value=excluded.value
        "#,
        params![name, next],
    )?;
    Ok(next)
}

/// Verifies that `worker_id` holds an unexpired lease on a non-terminal job and returns the
/// current phase. Every lease-guarded write goes through this inside its transaction.
fn guard_lease_tx(
    tx: &Transaction<'_>,
    job_id: &JobId,
    worker_id: &WorkerId,
    now_ms: i64,
) -> Result<Phase, StoreError> {
    let row = tx
        .query_row(
            "SELECT phase, lease_owner, lease_expires_at_ms FROM jobs WHERE id=?1",
            params![job_id.as_str()],
            |row| {
                Ok((
                    support::phase_column(row, 0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((phase, owner, expires_at_ms)) = row else {
        return Err(StoreError::UnknownId);
    };
    if phase.is_terminal() {
        return Err(StoreError::JobTerminal {
            job_id: job_id.to_string(),
            phase: phase.as_str().to_string(),
        });
    }
    let held = owner.as_deref() == Some(worker_id.as_str())
        && expires_at_ms.is_some_and(|exp| exp > now_ms);
    if !held {
        return Err(StoreError::LeaseNotHeld {
            job_id: job_id.to_string(),
            worker_id: worker_id.to_string(),
            holder: owner,
        });
    }
    Ok(phase)
}

fn ensure_job_exists_tx(tx: &Transaction<'_>, job_id: &JobId) -> Result<(), StoreError> {
    let exists = tx
        .query_row(
            "SELECT 1 FROM jobs WHERE id=?1",
            params![job_id.as_str()],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if exists {
        Ok(())
    } else {
        Err(StoreError::UnknownId)
    }
}

fn to_sqlite_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::InvalidInput("value exceeds sqlite integer range"))
}

fn from_sqlite_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
