//! Cache layer (C5, cache half): normalized-query cache keying and
//! matter-scoped invalidation.
//!
//! Grounded in `original_source/.../query_normalizer.py` (normalization
//! rules) and `original_source/.../query_cache_service.py` (key shape,
//! invalidation-on-upload). Hashing follows the teacher's SHA-256-of-JSON
//! pattern in `config.rs`'s `Config::hash`.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Default TTL for a cached query result (see SPEC_FULL §6).
pub const DEFAULT_QUERY_TTL_SECS: u64 = 3600;

fn whitespace_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

fn disallowed_punctuation_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"[^\w\s.,?'"-]"#).expect("static regex"))
}

/// Normalize a query string for cache-key purposes: lowercase, strip
/// punctuation other than `. , ? ' " -`, collapse internal whitespace, trim.
/// Two queries that normalize identically hit the same cache entry.
pub fn normalize_query(query: &str) -> String {
    let lowered = query.to_lowercase();
    let stripped = disallowed_punctuation_pattern().replace_all(&lowered, "");
    let collapsed = whitespace_pattern().replace_all(&stripped, " ");
    collapsed.trim().to_string()
}

/// SHA-256 hex digest of the normalized query, used as the cache key's
/// suffix so keys stay a fixed, short length regardless of query length.
pub fn hash_query(query: &str) -> String {
    let normalized = normalize_query(query);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// `cache:query:{matter_id}:{hash}` — scoped by matter so one tenant's
/// cached answers can never leak into another's results, and so
/// invalidation can target exactly one matter via a prefix scan.
pub fn query_cache_key(matter_id: &str, query: &str) -> String {
    format!("cache:query:{matter_id}:{}", hash_query(query))
}

/// Prefix used to SCAN-and-delete every cached query result for a matter,
/// e.g. when a new document upload could change retrieval results.
pub fn matter_cache_prefix(matter_id: &str) -> String {
    format!("cache:query:{matter_id}:*")
}

#[async_trait::async_trait]
pub trait QueryCache: Send + Sync {
    async fn get(&self, matter_id: &str, query: &str) -> Result<Option<String>>;
    async fn set(&self, matter_id: &str, query: &str, value: &str, ttl_secs: u64) -> Result<()>;
    /// Invalidate every cached result scoped to `matter_id`. Called after a
    /// document finishes ingestion, per §6 — a matter's retrieval surface
    /// has changed, so stale cached answers must not be served.
    async fn invalidate_matter(&self, matter_id: &str) -> Result<u64>;
}

/// Single-process fallback, analogous to [`crate::lock::InMemoryChunkLock`]:
/// suitable for single-worker deployments where `redis_url` isn't configured.
pub struct InMemoryQueryCache {
    state: tokio::sync::Mutex<std::collections::HashMap<String, (String, std::time::Instant)>>,
}

impl InMemoryQueryCache {
    pub fn new() -> Self {
        Self { state: tokio::sync::Mutex::new(std::collections::HashMap::new()) }
    }
}

impl Default for InMemoryQueryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl QueryCache for InMemoryQueryCache {
    async fn get(&self, matter_id: &str, query: &str) -> Result<Option<String>> {
        let key = query_cache_key(matter_id, query);
        let mut state = self.state.lock().await;
        match state.get(&key) {
            Some((value, expires_at)) if *expires_at > std::time::Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                state.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, matter_id: &str, query: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let key = query_cache_key(matter_id, query);
        let expires_at = std::time::Instant::now() + std::time::Duration::from_secs(ttl_secs);
        self.state.lock().await.insert(key, (value.to_string(), expires_at));
        Ok(())
    }

    async fn invalidate_matter(&self, matter_id: &str) -> Result<u64> {
        let prefix = format!("cache:query:{matter_id}:");
        let mut state = self.state.lock().await;
        let before = state.len();
        state.retain(|key, _| !key.starts_with(&prefix));
        Ok((before - state.len()) as u64)
    }
}

pub struct RedisQueryCache {
    conn: tokio::sync::Mutex<redis::aio::ConnectionManager>,
}

impl RedisQueryCache {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn: tokio::sync::Mutex::new(conn) }
    }
}

#[async_trait::async_trait]
impl QueryCache for RedisQueryCache {
    async fn get(&self, matter_id: &str, query: &str) -> Result<Option<String>> {
        let mut conn = self.conn.lock().await;
        let key = query_cache_key(matter_id, query);
        let value: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut *conn).await?;
        Ok(value)
    }

    async fn set(&self, matter_id: &str, query: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let key = query_cache_key(matter_id, query);
        redis::cmd("SET")
            .arg(&key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn invalidate_matter(&self, matter_id: &str) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        let pattern = matter_cache_prefix(matter_id);
        let mut deleted = 0u64;
        let mut cursor: u64 = 0;

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut *conn)
                .await?;

            if !keys.is_empty() {
                deleted += redis::cmd("DEL").arg(&keys).query_async::<u64>(&mut *conn).await?;
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_lowercases_and_collapses_whitespace() {
        assert_eq!(normalize_query("  What   Happened  ON\tMarch 3rd?  "), "what happened on march 3rd?");
    }

    #[test]
    fn normalize_strips_disallowed_punctuation_but_keeps_allowed() {
        assert_eq!(normalize_query("what's the status; really?!"), "what's the status really?");
    }

    #[test]
    fn equivalent_queries_hash_identically() {
        assert_eq!(hash_query("What happened?"), hash_query("  what   happened?  "));
    }

    #[test]
    fn different_queries_hash_differently() {
        assert_ne!(hash_query("first question"), hash_query("second question"));
    }

    #[test]
    fn cache_key_is_scoped_by_matter() {
        let a = query_cache_key("matter-1", "same query");
        let b = query_cache_key("matter-2", "same query");
        assert_ne!(a, b);
        assert!(a.starts_with("cache:query:matter-1:"));
    }

    #[tokio::test]
    async fn in_memory_cache_round_trips_and_invalidates_by_matter() {
        let cache = InMemoryQueryCache::new();
        cache.set("matter-1", "what happened?", "some answer", 3600).await.unwrap();
        cache.set("matter-2", "what happened?", "other answer", 3600).await.unwrap();

        assert_eq!(cache.get("matter-1", "what happened?").await.unwrap().as_deref(), Some("some answer"));

        let deleted = cache.invalidate_matter("matter-1").await.unwrap();
        assert_eq!(deleted, 1);
        assert!(cache.get("matter-1", "what happened?").await.unwrap().is_none());
        assert!(cache.get("matter-2", "what happened?").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn in_memory_cache_entry_expires_after_ttl() {
        let cache = InMemoryQueryCache::new();
        cache.set("matter-1", "q", "v", 0).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(cache.get("matter-1", "q").await.unwrap().is_none());
    }
}
