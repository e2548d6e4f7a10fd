#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        CREATE TABLE IF NOT EXISTS gate_results (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          job_id TEXT NOT NULL,
          migration_attempt INTEGER NOT NULL,
          run INTEGER NOT NULL,
          position INTEGER NOT NULL,
          gate_name TEXT NOT NULL,
          status TEXT NOT NULL,
          blocking INTEGER NOT NULL,
          findings_json TEXT NOT NULL,
          duration_ms INTEGER NOT NULL,
          ts_ms INTEGER NOT NULL,
          UNIQUE (job_id, run, position),
          FOREIGN KEY(job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );
"#;
