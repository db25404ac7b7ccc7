//! Lock layer (C5, lock half): per-chunk distributed mutual exclusion.
//!
//! Grounded in `rate_limit/redis.rs`'s Lua-scripted atomic acquire/release
//! pattern and `original_source/.../distributed_lock.py`'s `ChunkLock`
//! class. Two backends share one trait: a Redis backend for multi-worker
//! deployments and an in-memory backend (a single-process fallback,
//! analogous to how the teacher's rate limiter has both a Redis and a
//! local-map backend).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("lock already held: {0}")]
    AlreadyHeld(String),
}

pub type Result<T> = std::result::Result<T, LockError>;

/// An acquired lock's token, required to release it. A release with a
/// mismatched token is a silent no-op rather than an error — the same
/// compare-and-delete guard the original's Lua release script enforces, so
/// a lock that already expired and was reacquired by someone else can never
/// be stolen back.
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub key: String,
    token: String,
}

#[async_trait]
pub trait ChunkLock: Send + Sync {
    /// Attempt to acquire `key` for `ttl`. Returns `None` if already held.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>>;
    /// Release the lock iff `handle`'s token still matches what's stored.
    async fn release(&self, handle: &LockHandle) -> Result<()>;
    /// Extend a held lock's TTL, e.g. from a long-running stage's heartbeat.
    async fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<bool>;
}

pub fn chunk_lock_key(document_id: &str, chunk_index: u32) -> String {
    format!("lock:chunk:{document_id}:{chunk_index}")
}

/// In-memory backend: a single process's chunk locks, guarded by one mutex.
/// Suitable for single-worker deployments or tests; multi-worker deployments
/// must configure the Redis backend instead.
pub struct InMemoryChunkLock {
    state: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryChunkLock {
    pub fn new() -> Self {
        Self { state: Mutex::new(HashMap::new()) }
    }
}

impl Default for InMemoryChunkLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChunkLock for InMemoryChunkLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if let Some((_, expires_at)) = state.get(key) {
            if *expires_at > now {
                return Ok(None);
            }
        }

        let token = Uuid::new_v4().to_string();
        state.insert(key.to_string(), (token.clone(), now + ttl));
        Ok(Some(LockHandle { key: key.to_string(), token }))
    }

    async fn release(&self, handle: &LockHandle) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some((token, _)) = state.get(&handle.key) {
            if *token == handle.token {
                state.remove(&handle.key);
            }
        }
        Ok(())
    }

    async fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.get_mut(&handle.key) {
            Some((token, expires_at)) if *token == handle.token => {
                *expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Redis-backed lock using `SET key token NX PX ttl_ms` for acquisition and
/// a compare-and-delete Lua script for release, the same shape as
/// `RedisRateLimitBackend::acquire`'s Lua script.
pub struct RedisChunkLock {
    conn: Arc<Mutex<redis::aio::ConnectionManager>>,
}

impl RedisChunkLock {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn: Arc::new(Mutex::new(conn)) }
    }
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

#[async_trait]
impl ChunkLock for RedisChunkLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.lock().await;

        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as i64)
            .query_async(&mut *conn)
            .await?;

        Ok(result.map(|_| LockHandle { key: key.to_string(), token }))
    }

    async fn release(&self, handle: &LockHandle) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let script = redis::Script::new(RELEASE_SCRIPT);
        let _: i64 = script.key(&handle.key).arg(&handle.token).invoke_async(&mut *conn).await?;
        Ok(())
    }

    async fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let script = redis::Script::new(RENEW_SCRIPT);
        let result: i64 = script
            .key(&handle.key)
            .arg(&handle.token)
            .arg(ttl.as_millis() as i64)
            .invoke_async(&mut *conn)
            .await?;
        Ok(result == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_while_first_holds() {
        let lock = InMemoryChunkLock::new();
        let key = chunk_lock_key("doc-1", 0);

        let first = lock.acquire(&key, Duration::from_secs(60)).await.unwrap();
        assert!(first.is_some());

        let second = lock.acquire(&key, Duration::from_secs(60)).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn acquire_succeeds_again_after_release() {
        let lock = InMemoryChunkLock::new();
        let key = chunk_lock_key("doc-1", 0);

        let handle = lock.acquire(&key, Duration::from_secs(60)).await.unwrap().unwrap();
        lock.release(&handle).await.unwrap();

        let second = lock.acquire(&key, Duration::from_secs(60)).await.unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn release_with_stale_token_is_a_no_op() {
        let lock = InMemoryChunkLock::new();
        let key = chunk_lock_key("doc-1", 0);

        let handle = lock.acquire(&key, Duration::from_secs(60)).await.unwrap().unwrap();
        lock.release(&handle).await.unwrap();
        let new_handle = lock.acquire(&key, Duration::from_secs(60)).await.unwrap().unwrap();

        // Releasing the stale (already-released) handle must not evict the
        // new holder's lock.
        lock.release(&handle).await.unwrap();
        let third = lock.acquire(&key, Duration::from_secs(60)).await.unwrap();
        assert!(third.is_none());
        drop(new_handle);
    }

    #[tokio::test]
    async fn renew_extends_ttl_only_for_current_holder() {
        let lock = InMemoryChunkLock::new();
        let key = chunk_lock_key("doc-1", 0);
        let handle = lock.acquire(&key, Duration::from_millis(10)).await.unwrap().unwrap();

        assert!(lock.renew(&handle, Duration::from_secs(60)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = lock.acquire(&key, Duration::from_secs(60)).await.unwrap();
        assert!(second.is_none());
    }
}
