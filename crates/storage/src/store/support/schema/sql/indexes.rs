#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        CREATE INDEX IF NOT EXISTS idx_jobs_claimable ON jobs(phase, available_at_ms, created_at_ms);
        CREATE INDEX IF NOT EXISTS idx_generated_units_job_path ON generated_units(job_id, path, seq);
        CREATE INDEX IF NOT EXISTS idx_gate_results_job_run ON gate_results(job_id, run, position);
        CREATE INDEX IF NOT EXISTS idx_asset_records_job_url ON asset_records(job_id, source_url, seq);
        CREATE INDEX IF NOT EXISTS idx_verify_requests_job ON verify_requests(job_id, migration_attempt);
        CREATE INDEX IF NOT EXISTS idx_kv_cache_expires ON kv_cache(expires_at_ms);
"#;
