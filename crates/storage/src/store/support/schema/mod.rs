#![forbid(unsafe_code)]

mod sql;

use super::super::StoreError;
use rusqlite::{Connection, OptionalExtension, params};

pub(in crate::store) const SCHEMA_VERSION: &str = "sm1";

pub(in crate::store) fn migrate_sqlite_schema(conn: &Connection) -> Result<(), StoreError> {
    preflight_gate(conn)?;

    conn.execute_batch(&sql::full_schema_sql())?;

    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
        params!["schema_version", SCHEMA_VERSION],
    )?;

    Ok(())
}

fn preflight_gate(conn: &Connection) -> Result<(), StoreError> {
    let has_meta = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='meta'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if !has_meta {
        return Ok(());
    }

    let version = conn
        .query_row(
            "SELECT value FROM meta WHERE key='schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?;

    match version.as_deref() {
        None => Ok(()),
        Some(v) if v == SCHEMA_VERSION => Ok(()),
        Some(_) => Err(StoreError::InvalidInput(
            "RESET_REQUIRED: schema version mismatch",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_schema_reapplies_cleanly() {
        let conn = Connection::open_in_memory().expect("open");
        migrate_sqlite_schema(&conn).expect("first pass");
        migrate_sqlite_schema(&conn).expect("second pass");
        let version: String = conn
            .query_row("SELECT value FROM meta WHERE key='schema_version'", [], |row| {
                row.get(0)
            })
            .expect("version");
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn foreign_schema_version_requires_reset() {
        let conn = Connection::open_in_memory().expect("open");
        migrate_sqlite_schema(&conn).expect("create");
        conn.execute("UPDATE meta SET value='sm0' WHERE key='schema_version'", [])
            .expect("downgrade marker");
        assert!(matches!(
            migrate_sqlite_schema(&conn),
            Err(StoreError::InvalidInput(msg)) if msg.starts_with("RESET_REQUIRED")
        ));
    }

    #[test]
    fn lease_owner_without_expiry_is_rejected() {
        let conn = Connection::open_in_memory().expect("open");
        migrate_sqlite_schema(&conn).expect("create");
        let insert = |id: &str, owner: Option<&str>| {
            conn.execute(
                "INSERT INTO jobs(id, revision, phase, source_url, lease_owner, available_at_ms, \
                 created_at_ms, updated_at_ms) VALUES (?1, 1, 'ANALYZE', 'https://a.example/', ?2, \
                 0, 0, 0)",
                params![id, owner],
            )
        };
        insert("MIG-0001", None).expect("unleased job");
        assert!(insert("MIG-0002", Some("w1")).is_err());
    }
}
