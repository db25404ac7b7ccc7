//! Realtime fan-out (C6): WebSocket progress broadcast, modeled generically
//! over a `ProgressSink` trait so the connection manager's indexing/
//! broadcast/cleanup logic is implementable and testable without the
//! out-of-scope HTTP/WebSocket transport.
//!
//! Grounded in `original_source/backend/app/api/ws/connection_manager.py`:
//! three independent indices updated together under one critical section,
//! matching the original's `_connections_by_matter`/`_connections_by_user`/
//! `_all_connections` triple plus its single `asyncio.Lock`.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Server-to-client message schema (§6). An axum WS route handler (external,
/// not built here) would serialize these to JSON text frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected { matter_id: String, user_id: String },
    JobProgress { job_id: String, progress: u8, stage: String },
    DocumentStatus { document_id: String, status: String },
    DocumentReady { document_id: String },
    Ping,
    Pong,
}

/// Anything that can receive a server message and be pinged/closed. The
/// real implementation is a thin adapter over an axum WebSocket split sink;
/// tests use an in-memory channel-backed sink instead.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn send(&self, message: &ServerMessage) -> Result<(), SinkError>;
    async fn close(&self);
}

#[derive(Debug, thiserror::Error)]
#[error("failed to send to connection: {0}")]
pub struct SinkError(pub String);

struct ConnectionInfo {
    matter_id: String,
    user_id: String,
    sink: std::sync::Arc<dyn ProgressSink>,
}

/// Default interval for application-level pings (§4.6/§6 config key
/// `websocket_ping_interval_s`).
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

pub struct ConnectionManager {
    connections_by_matter: RwLock<HashMap<String, HashSet<ConnectionId>>>,
    connections_by_user: RwLock<HashMap<String, HashSet<ConnectionId>>>,
    connections: RwLock<HashMap<ConnectionId, ConnectionInfo>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections_by_matter: RwLock::new(HashMap::new()),
            connections_by_user: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register an already-authenticated connection. Authentication/matter
    /// membership checks happen at the (out-of-scope) HTTP/WS boundary
    /// before this is called.
    pub async fn register(&self, matter_id: &str, user_id: &str, sink: std::sync::Arc<dyn ProgressSink>) -> ConnectionId {
        let id = Uuid::new_v4();

        let mut by_matter = self.connections_by_matter.write().await;
        let mut by_user = self.connections_by_user.write().await;
        let mut all = self.connections.write().await;

        by_matter.entry(matter_id.to_string()).or_default().insert(id);
        by_user.entry(user_id.to_string()).or_default().insert(id);
        all.insert(id, ConnectionInfo { matter_id: matter_id.to_string(), user_id: user_id.to_string(), sink });

        id
    }

    /// Unregister a connection, cleaning up any now-empty index buckets.
    pub async fn unregister(&self, id: ConnectionId) {
        let mut all = self.connections.write().await;
        let Some(info) = all.remove(&id) else { return };
        drop(all);

        let mut by_matter = self.connections_by_matter.write().await;
        if let Some(set) = by_matter.get_mut(&info.matter_id) {
            set.remove(&id);
            if set.is_empty() {
                by_matter.remove(&info.matter_id);
            }
        }
        drop(by_matter);

        let mut by_user = self.connections_by_user.write().await;
        if let Some(set) = by_user.get_mut(&info.user_id) {
            set.remove(&id);
            if set.is_empty() {
                by_user.remove(&info.user_id);
            }
        }
    }

    /// Broadcast a message to every connection registered under `matter_id`.
    /// Per-socket error isolation: one failing send is logged and that
    /// connection is scheduled for disconnect, never aborting the loop.
    pub async fn broadcast_to_matter(&self, matter_id: &str, message: &ServerMessage) {
        let snapshot: Vec<ConnectionId> = {
            let by_matter = self.connections_by_matter.read().await;
            by_matter.get(matter_id).map(|set| set.iter().copied().collect()).unwrap_or_default()
        };

        let mut failed = Vec::new();
        for id in snapshot {
            let sink = {
                let all = self.connections.read().await;
                all.get(&id).map(|info| info.sink.clone())
            };
            let Some(sink) = sink else { continue };

            if let Err(err) = sink.send(message).await {
                tracing::warn!(connection_id = %id, error = %err, "send failed, scheduling disconnect");
                failed.push(id);
            }
        }

        for id in failed {
            if let Some(info) = self.connections.read().await.get(&id) {
                info.sink.close().await;
            }
            self.unregister(id).await;
        }
    }

    pub async fn connection_count_for_matter(&self, matter_id: &str) -> usize {
        self.connections_by_matter.read().await.get(matter_id).map(|s| s.len()).unwrap_or(0)
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct RecordingSink {
        sent: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn send(&self, _message: &ServerMessage) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError("boom".into()));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn register_then_broadcast_reaches_matter_connections() {
        let manager = ConnectionManager::new();
        let sent = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(RecordingSink { sent: sent.clone(), fail: false });

        manager.register("matter-1", "user-1", sink).await;
        manager.broadcast_to_matter("matter-1", &ServerMessage::DocumentReady { document_id: "doc-1".into() }).await;

        assert_eq!(sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregister_cleans_up_empty_buckets() {
        let manager = ConnectionManager::new();
        let sink = Arc::new(RecordingSink { sent: Arc::new(AtomicUsize::new(0)), fail: false });
        let id = manager.register("matter-1", "user-1", sink).await;

        manager.unregister(id).await;
        assert_eq!(manager.connection_count_for_matter("matter-1").await, 0);
    }

    #[tokio::test]
    async fn a_failing_send_does_not_prevent_other_sends() {
        let manager = ConnectionManager::new();
        let sent = Arc::new(AtomicUsize::new(0));

        let failing = Arc::new(RecordingSink { sent: sent.clone(), fail: true });
        let working = Arc::new(RecordingSink { sent: sent.clone(), fail: false });

        manager.register("matter-1", "user-1", failing).await;
        manager.register("matter-1", "user-2", working).await;

        manager.broadcast_to_matter("matter-1", &ServerMessage::DocumentReady { document_id: "doc-1".into() }).await;

        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert_eq!(manager.connection_count_for_matter("matter-1").await, 1);
    }
}
