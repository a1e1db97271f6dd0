//! Directory of live producer sessions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::session::{ClientSession, CloseReason};

/// Live sessions keyed by client id.
///
/// The lock is never held while a session is being closed.
#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a session, displacing and closing any previous one with the same id.
    pub async fn register(&self, session: Arc<ClientSession>) -> Option<Arc<ClientSession>> {
        let displaced = {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session.id().to_string(), session.clone())
        };

        match &displaced {
            Some(previous) => {
                tracing::info!("Client {} reconnected, displacing previous session", session.id());
                previous.close(CloseReason::Displaced);
            }
            None => tracing::debug!("Registered client {}", session.id()),
        }

        displaced
    }

    /// Remove a session. Returns whether it was present.
    pub async fn unregister(&self, client_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(client_id).is_some();
        if removed {
            tracing::debug!("Unregistered client {}", client_id);
        }
        removed
    }

    /// Remove `session` only if it is still the registered one for its id.
    pub async fn remove_if_current(&self, session: &Arc<ClientSession>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(session.id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(session.id());
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, client_id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.read().await.get(client_id).cloned()
    }

    pub async fn contains(&self, client_id: &str) -> bool {
        self.get(client_id).await.is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Empty the registry and close every session once.
    ///
    /// Returns the number of sessions that were closed.
    pub async fn broadcast_shutdown(&self) -> usize {
        let drained: Vec<Arc<ClientSession>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, session)| session).collect()
        };

        let closed = drained
            .iter()
            .filter(|session| session.close(CloseReason::Shutdown))
            .count();

        tracing::info!("Broadcast shutdown to {} sessions", drained.len());
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::session::{SessionMode, SessionState};
    use crate::test_util::{memory_transport, session_context, MemoryClient, MockBackend};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    async fn session(id: &str) -> Arc<ClientSession> {
        let ctx = session_context(Arc::new(MockBackend::new())).await;
        let (session, _queue) = ClientSession::new(
            id.to_string(),
            "user".to_string(),
            SessionMode::Unary,
            ctx,
            &CancellationToken::new(),
        );
        session
    }

    async fn running_session(id: &str) -> (Arc<ClientSession>, MemoryClient) {
        let ctx = session_context(Arc::new(MockBackend::new())).await;
        let (session, queue) = ClientSession::new(
            id.to_string(),
            "user".to_string(),
            SessionMode::Unary,
            ctx,
            &CancellationToken::new(),
        );
        let (client, reader, writer) = memory_transport();
        tokio::spawn(session.clone().run(reader, writer, queue));
        (session, client)
    }

    #[tokio::test]
    async fn test_register_then_unregister() {
        let registry = ConnectionRegistry::new();
        for id in ["a", "b", "client-42"] {
            registry.register(session(id).await).await;
            assert!(registry.contains(id).await);
            assert!(registry.unregister(id).await);
            assert!(!registry.contains(id).await);
            assert!(registry.get(id).await.is_none());
        }
        assert!(!registry.unregister("a").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_register_displaces_previous_session() {
        let registry = ConnectionRegistry::new();
        let first = session("dup").await;
        let second = session("dup").await;

        assert!(registry.register(first.clone()).await.is_none());
        let displaced = registry.register(second.clone()).await.unwrap();

        assert!(Arc::ptr_eq(&displaced, &first));
        assert_eq!(first.close_reason(), Some(CloseReason::Displaced));
        assert_eq!(second.state(), SessionState::Open);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_displaced_session_does_not_evict_replacement() {
        let registry = ConnectionRegistry::new();
        let first = session("dup").await;
        let second = session("dup").await;

        registry.register(first.clone()).await;
        registry.register(second.clone()).await;

        assert!(!registry.remove_if_current(&first).await);
        assert!(Arc::ptr_eq(&registry.get("dup").await.unwrap(), &second));
        assert!(registry.remove_if_current(&second).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_broadcast_shutdown_closes_every_session_once() {
        let registry = ConnectionRegistry::new();
        let mut running = Vec::new();
        for i in 0..5 {
            let (session, client) = running_session(&format!("client-{}", i)).await;
            registry.register(session.clone()).await;
            running.push((session, client));
        }

        assert_eq!(registry.broadcast_shutdown().await, 5);
        assert_eq!(registry.len().await, 0);
        assert_eq!(registry.broadcast_shutdown().await, 0);

        for (session, client) in &running {
            tokio::time::timeout(Duration::from_secs(2), session.wait_closed())
                .await
                .unwrap();
            assert!(session.is_queue_closed());
            assert_eq!(session.close_reason(), Some(CloseReason::Shutdown));
            assert_eq!(client.close_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_get_returns_current_session() {
        let registry = ConnectionRegistry::new();
        let first = session("x").await;
        registry.register(first.clone()).await;
        assert!(Arc::ptr_eq(&registry.get("x").await.unwrap(), &first));

        let second = session("x").await;
        registry.register(second.clone()).await;
        assert!(Arc::ptr_eq(&registry.get("x").await.unwrap(), &second));
        assert!(registry.get("y").await.is_none());
    }
}
