#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        -- Shared get/set/increment cache with TTL (cross-job unit reuse, counters).
        CREATE TABLE IF NOT EXISTS kv_cache (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL,
          expires_at_ms INTEGER
        );
"#;
