#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        -- Verification lane. Slots are the one scarce shared resource: a row per
        -- (lane, slot_index) below the configured capacity, held through a lease so the
        -- ceiling is enforced across processes.
        CREATE TABLE IF NOT EXISTS verify_slots (
          lane TEXT NOT NULL,
          slot_index INTEGER NOT NULL,
          holder TEXT,
          lease_expires_at_ms INTEGER,
          updated_at_ms INTEGER NOT NULL,
          PRIMARY KEY (lane, slot_index)
        );

        -- Idempotent verification requests. A duplicate key collapses into the in-flight
        -- or completed entry.
        CREATE TABLE IF NOT EXISTS verify_requests (
          request_key TEXT PRIMARY KEY,
          job_id TEXT NOT NULL,
          migration_attempt INTEGER NOT NULL,
          gate_name TEXT NOT NULL,
          status TEXT NOT NULL,              -- running|done
          holder TEXT,
          lease_expires_at_ms INTEGER,
          result_json TEXT,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          FOREIGN KEY(job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );
"#;
