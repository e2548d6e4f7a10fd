#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        CREATE TABLE IF NOT EXISTS asset_records (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          job_id TEXT NOT NULL,
          source_url TEXT NOT NULL,
          local_path TEXT,
          status TEXT NOT NULL,
          skip_reason TEXT,
          bytes_original INTEGER NOT NULL,
          bytes_final INTEGER NOT NULL,
          ts_ms INTEGER NOT NULL,
          FOREIGN KEY(job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );
"#;
