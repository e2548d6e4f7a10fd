#![forbid(unsafe_code)]

use super::*;

const MAX_CACHE_KEY_LEN: usize = 256;
const MAX_CACHE_VALUE_LEN: usize = 1_000_000;

fn normalize_cache_key(raw: &str) -> Result<&str, StoreError> {
    let value = raw.trim();
    if value.is_empty() || value.len() > MAX_CACHE_KEY_LEN {
        return Err(StoreError::InvalidInput("cache key must be 1..256 chars"));
    }
    Ok(value)
}

fn cache_expiry(now_ms: i64, ttl_ms: Option<u64>) -> Option<i64> {
    ttl_ms.map(|ttl| now_ms.saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX)))
}

impl SqliteStore {
    pub fn cache_get(&self, key: &str, now_ms: i64) -> Result<Option<String>, StoreError> {
        let key = normalize_cache_key(key)?;
        Ok(self
            .conn
            .query_row(
                r#"
                SELECT value FROM kv_cache
                WHERE key=?1 AND (expires_at_ms IS NULL OR expires_at_ms > ?2)
                "#,
                params![key, now_ms],
                |row| row.get::<_, String>(0),
            )
            .optional()?)
    }

    pub fn cache_set(&mut self, request: CacheSetRequest) -> Result<(), StoreError> {
        let key = normalize_cache_key(&request.key)?;
        if request.value.len() > MAX_CACHE_VALUE_LEN {
            return Err(StoreError::InvalidInput("cache value is too large"));
        }
        self.conn.execute(
            r#"
            INSERT INTO kv_cache(key, value, expires_at_ms) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value=excluded.value, expires_at_ms=excluded.expires_at_ms
            "#,
            params![key, request.value, cache_expiry(request.now_ms, request.ttl_ms)],
        )?;
        Ok(())
    }

    /// Adds `delta` to an integer entry, starting from zero when the entry is missing, expired
    /// or not an integer. The TTL is applied only when a fresh entry is created.
    pub fn cache_increment(&mut self, request: CacheIncrementRequest) -> Result<i64, StoreError> {
        let key = normalize_cache_key(&request.key)?;
        let tx = self.conn.transaction()?;
        let current = tx
            .query_row(
                r#"
                SELECT value, expires_at_ms FROM kv_cache
                WHERE key=?1 AND (expires_at_ms IS NULL OR expires_at_ms > ?2)
                "#,
                params![key, request.now_ms],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?)),
            )
            .optional()?;

        let (next, expires_at_ms) = match current
            .as_ref()
            .and_then(|(value, exp)| value.trim().parse::<i64>().ok().map(|v| (v, *exp)))
        {
            Some((value, exp)) => (value.saturating_add(request.delta), exp),
            None => (
                request.delta,
                cache_expiry(request.now_ms, request.ttl_ms),
            ),
        };

        tx.execute(
            r#"
            INSERT INTO kv_cache(key, value, expires_at_ms) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value=excluded.value, expires_at_ms=excluded.expires_at_ms
            "#,
            params![key, next.to_string(), expires_at_ms],
        )?;
        tx.commit()?;
        Ok(next)
    }

    /// Deletes expired entries; returns how many were removed.
    pub fn cache_purge_expired(&mut self, now_ms: i64) -> Result<usize, StoreError> {
        Ok(self.conn.execute(
            "DELETE FROM kv_cache WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?1",
            params![now_ms],
        )?)
    }
}
