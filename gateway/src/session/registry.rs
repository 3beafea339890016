//! Process-wide registry of live client connections.
//!
//! This is the only structure shared between connection tasks. Each
//! accepted connection holds a [`ConnectionGuard`]; dropping the guard (on
//! any exit path, including panics and socket errors) removes the entry and
//! decrements the active count exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ConnectionInfo, now_ms};

/// Opaque handle identifying one connection.
pub type ConnectionId = Uuid;

/// Read-only view of a live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    pub user_id: String,
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub created_at_ms: u64,
}

/// Registration failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("connection limit of {0} reached")]
    AtCapacity(usize),
}

struct Entry {
    summary: ConnectionSummary,
    token: CancellationToken,
}

/// Tracks active connections and fans out shutdown.
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<ConnectionId, Entry>>,
    active: AtomicUsize,
    max_connections: Option<usize>,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("active", &self.active_count())
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl ConnectionRegistry {
    pub fn new(max_connections: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            max_connections,
        })
    }

    /// Register a connection, enforcing the capacity limit.
    pub fn register(self: &Arc<Self>, info: &ConnectionInfo) -> Result<ConnectionGuard, RegistryError> {
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        let summary = ConnectionSummary {
            id,
            user_id: info.user_id.clone(),
            thread_id: info.thread_id.clone(),
            conversation_id: info.conversation_id.clone(),
            tenant_id: info.tenant_id.clone(),
            created_at_ms: now_ms(),
        };

        {
            let mut entries = self.entries.lock();
            if let Some(max) = self.max_connections
                && entries.len() >= max
            {
                return Err(RegistryError::AtCapacity(max));
            }
            entries.insert(
                id,
                Entry {
                    summary,
                    token: token.clone(),
                },
            );
            self.active.fetch_add(1, Ordering::SeqCst);
        }

        tracing::debug!(connection_id = %id, user_id = %info.user_id, "Connection registered");

        Ok(ConnectionGuard {
            registry: Arc::clone(self),
            id,
            token,
        })
    }

    /// Remove a connection. Returns `false` if it was already gone.
    fn deregister(&self, id: &ConnectionId) -> bool {
        let removed = self.entries.lock().remove(id).is_some();
        if removed {
            self.active.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(connection_id = %id, "Connection deregistered");
        }
        removed
    }

    /// Summaries of every live connection, oldest first.
    pub fn list_active(&self) -> Vec<ConnectionSummary> {
        let mut list: Vec<_> = self
            .entries
            .lock()
            .values()
            .map(|entry| entry.summary.clone())
            .collect();
        list.sort_by_key(|s| s.created_at_ms);
        list
    }

    /// Ask every live connection to tear down.
    pub fn close_all(&self) -> usize {
        let entries = self.entries.lock();
        for entry in entries.values() {
            entry.token.cancel();
        }
        entries.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Cheap pre-check before doing expensive work for a new connection.
    /// `register` remains the authoritative check.
    pub fn has_capacity(&self) -> bool {
        self.max_connections
            .is_none_or(|max| self.active_count() < max)
    }
}

/// Keeps a connection registered for as long as it lives.
#[derive(Debug)]
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
    token: CancellationToken,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Cancelled by [`ConnectionRegistry::close_all`].
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Deregister now. Later calls and the eventual drop are no-ops.
    pub fn release(&self) -> bool {
        self.registry.deregister(&self.id)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.deregister(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(user: &str) -> ConnectionInfo {
        ConnectionInfo {
            user_id: user.to_string(),
            thread_id: format!("thread-{user}"),
            conversation_id: None,
            tenant_id: Some("acme".to_string()),
        }
    }

    #[test]
    fn test_register_and_list() {
        let registry = ConnectionRegistry::new(None);
        let _a = registry.register(&info("a")).unwrap();
        let _b = registry.register(&info("b")).unwrap();

        assert_eq!(registry.active_count(), 2);
        let users: Vec<_> = registry.list_active().into_iter().map(|s| s.user_id).collect();
        assert!(users.contains(&"a".to_string()));
        assert!(users.contains(&"b".to_string()));
    }

    #[test]
    fn test_drop_deregisters() {
        let registry = ConnectionRegistry::new(None);
        {
            let _guard = registry.register(&info("a")).unwrap();
            assert_eq!(registry.active_count(), 1);
        }
        assert_eq!(registry.active_count(), 0);
        assert!(registry.list_active().is_empty());
    }

    #[test]
    fn test_double_release_never_double_decrements() {
        let registry = ConnectionRegistry::new(None);
        let keep = registry.register(&info("keep")).unwrap();
        let guard = registry.register(&info("a")).unwrap();

        assert!(guard.release());
        assert!(!guard.release());
        drop(guard);

        assert_eq!(registry.active_count(), 1);
        drop(keep);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_release_from_two_threads() {
        let registry = ConnectionRegistry::new(None);
        let guard = Arc::new(registry.register(&info("a")).unwrap());

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let guard = Arc::clone(&guard);
                std::thread::spawn(move || guard.release())
            })
            .collect();
        let released: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();

        assert_eq!(released, 1);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_capacity_limit() {
        let registry = ConnectionRegistry::new(Some(1));
        assert!(registry.has_capacity());
        let first = registry.register(&info("a")).unwrap();
        assert!(!registry.has_capacity());
        assert_eq!(
            registry.register(&info("b")).unwrap_err(),
            RegistryError::AtCapacity(1)
        );
        drop(first);
        assert!(registry.has_capacity());
        assert!(registry.register(&info("b")).is_ok());
        assert!(ConnectionRegistry::new(None).has_capacity());
    }

    #[test]
    fn test_close_all_cancels_tokens() {
        let registry = ConnectionRegistry::new(None);
        let a = registry.register(&info("a")).unwrap();
        let b = registry.register(&info("b")).unwrap();

        assert_eq!(registry.close_all(), 2);
        assert!(a.token().is_cancelled());
        assert!(b.token().is_cancelled());
    }

    #[test]
    fn test_summary_serializes_camel_case() {
        let registry = ConnectionRegistry::new(None);
        let _a = registry.register(&info("a")).unwrap();
        let value = serde_json::to_value(registry.list_active()).unwrap();
        assert_eq!(value[0]["userId"], "a");
        assert_eq!(value[0]["threadId"], "thread-a");
        assert_eq!(value[0]["tenantId"], "acme");
        assert!(value[0].get("conversationId").is_none());
    }
}
