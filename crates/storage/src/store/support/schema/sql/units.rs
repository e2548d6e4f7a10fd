#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        -- Append-only history of generated files. The newest row per (job_id, path) is current.
        CREATE TABLE IF NOT EXISTS generated_units (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          job_id TEXT NOT NULL,
          path TEXT NOT NULL,
          unit_type TEXT NOT NULL,
          kind TEXT NOT NULL,
          status TEXT NOT NULL,
          source_signature TEXT NOT NULL,
          repair_attempts INTEGER NOT NULL,
          content TEXT,
          ts_ms INTEGER NOT NULL,
          FOREIGN KEY(job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );
"#;
