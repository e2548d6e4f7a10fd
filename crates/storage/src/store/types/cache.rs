#![forbid(unsafe_code)]

#[derive(Clone, Debug)]
pub struct CacheSetRequest {
    pub key: String,
    pub value: String,
    pub ttl_ms: Option<u64>,
    pub now_ms: i64,
}

#[derive(Clone, Debug)]
pub struct CacheIncrementRequest {
    pub key: String,
    pub delta: i64,
    pub ttl_ms: Option<u64>,
    pub now_ms: i64,
}
