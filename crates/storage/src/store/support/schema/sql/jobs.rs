#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        -- One row per migration job. Only phase/lease/bookkeeping columns are mutable;
        -- every transition is guarded by the lease columns.
        CREATE TABLE IF NOT EXISTS jobs (
          id TEXT PRIMARY KEY,
          revision INTEGER NOT NULL,
          phase TEXT NOT NULL,
          source_url TEXT NOT NULL,
          project_id TEXT,
          user_id TEXT,
          instructions TEXT,
          migration_attempt INTEGER NOT NULL DEFAULT 1,
          lease_owner TEXT,
          lease_expires_at_ms INTEGER,
          cancel_requested INTEGER NOT NULL DEFAULT 0,
          available_at_ms INTEGER NOT NULL,
          last_error TEXT,
          event_seq INTEGER NOT NULL DEFAULT 0,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          completed_at_ms INTEGER,
          CHECK((lease_owner IS NULL) = (lease_expires_at_ms IS NULL))
        );

        -- Idempotent per-phase result cache keyed by the input signature.
        CREATE TABLE IF NOT EXISTS phase_results (
          job_id TEXT NOT NULL,
          phase TEXT NOT NULL,
          signature TEXT NOT NULL,
          result_json TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          PRIMARY KEY (job_id, phase),
          FOREIGN KEY(job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS phase_attempts (
          job_id TEXT NOT NULL,
          phase TEXT NOT NULL,
          count INTEGER NOT NULL,
          PRIMARY KEY (job_id, phase),
          FOREIGN KEY(job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );

        -- Progress events. `seq` is allocated from jobs.event_seq so it is strictly
        -- increasing per job regardless of which worker emits.
        CREATE TABLE IF NOT EXISTS job_events (
          job_id TEXT NOT NULL,
          seq INTEGER NOT NULL,
          ts_ms INTEGER NOT NULL,
          kind TEXT NOT NULL,
          phase TEXT,
          message TEXT NOT NULL,
          payload_json TEXT,
          PRIMARY KEY (job_id, seq),
          FOREIGN KEY(job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );
"#;
