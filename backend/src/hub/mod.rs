//! Producer connection hub.
//!
//! This module provides:
//! - `Hub`: admission, session lifecycle, and global shutdown
//! - `ConnectionRegistry`: live sessions keyed by client id
//! - `ClientSession`: one producer connection and its two loops
//! - WebSocket upgrade handler

mod registry;
pub mod session;
pub mod ws;

pub use registry::ConnectionRegistry;
pub use session::{ClientSession, CloseReason, SessionConfig, SessionContext, SessionMode, SessionState};

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::Message;
use drowsy_common::Envelope;
use futures_util::{Sink, Stream};
use tokio_util::sync::CancellationToken;

/// Why a connection was refused before upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("Server is shutting down")]
    ShuttingDown,
    #[error("Connection limit of {0} reached")]
    AtCapacity(usize),
}

/// Result of [`Hub::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sessions that received a shutdown close.
    pub sessions_closed: usize,
    /// Whether tracked work outlived the grace period and was cancelled.
    pub forced: bool,
}

/// Owns every producer session.
pub struct Hub {
    registry: ConnectionRegistry,
    ctx: SessionContext,
    root: CancellationToken,
    accepting: AtomicBool,
    max_connections: usize,
}

impl Hub {
    pub fn new(ctx: SessionContext, max_connections: usize) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            ctx,
            root: CancellationToken::new(),
            accepting: AtomicBool::new(true),
            max_connections,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub async fn session_count(&self) -> usize {
        self.registry.len().await
    }

    /// Check whether a new connection for `client_id` may be upgraded.
    pub async fn admit(&self, client_id: &str) -> Result<(), AdmissionError> {
        if !self.is_accepting() {
            return Err(AdmissionError::ShuttingDown);
        }

        // A reconnect displaces its old session, so it never grows the count.
        if self.registry.len().await >= self.max_connections
            && !self.registry.contains(client_id).await
        {
            return Err(AdmissionError::AtCapacity(self.max_connections));
        }

        Ok(())
    }

    /// Run a producer session over an upgraded transport until it closes.
    pub async fn serve<R, W>(&self, client_id: String, subject: String, mode: SessionMode, reader: R, writer: W)
    where
        R: Stream<Item = Result<Message, axum::Error>> + Send + Unpin + 'static,
        W: Sink<Message, Error = axum::Error> + Send + Unpin + 'static,
    {
        if !self.is_accepting() {
            tracing::info!("Refusing client {}, hub is shutting down", client_id);
            return;
        }

        let (session, queue) =
            ClientSession::new(client_id, subject, mode, self.ctx.clone(), &self.root);

        if let Some(previous) = self.registry.register(session.clone()).await {
            let grace = self.ctx.config.write_timeout;
            if tokio::time::timeout(grace, previous.wait_closed()).await.is_err() {
                tracing::warn!(
                    "Displaced session {} did not close within {:?}",
                    previous.id(),
                    grace
                );
            }
        }

        // Shutdown may have drained the registry while we registered.
        if !self.is_accepting() {
            session.close(CloseReason::Shutdown);
        } else {
            session.enqueue(Envelope::welcome(session.id())).await;
        }

        self.ctx.metrics.client_connected();
        tracing::info!(
            client_id = %session.id(),
            subject = %session.subject(),
            mode = ?session.mode(),
            connected_at = %session.connected_at(),
            "Client connected"
        );

        session.clone().run(reader, writer, queue).await;

        self.registry.remove_if_current(&session).await;
        self.ctx.metrics.client_disconnected();
        tracing::info!(
            client_id = %session.id(),
            reason = ?session.close_reason(),
            "Client disconnected"
        );
    }

    /// Stop accepting, close every session, and wait for tracked work.
    ///
    /// Work still running after `grace` is cancelled.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.accepting.store(false, Ordering::SeqCst);
        let sessions_closed = self.registry.broadcast_shutdown().await;

        self.ctx.tracker.close();
        let forced = tokio::time::timeout(grace, self.ctx.tracker.wait())
            .await
            .is_err();

        if forced {
            tracing::warn!(
                "{} tasks still running after {:?}, forcing teardown",
                self.ctx.tracker.len(),
                grace
            );
            self.root.cancel();
        }

        ShutdownReport {
            sessions_closed,
            forced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::test_util::{memory_transport, session_context, MockBackend};
    use drowsy_common::EnvelopeType;

    const WAIT: Duration = Duration::from_secs(2);

    async fn hub(max_connections: usize) -> Arc<Hub> {
        let ctx = session_context(Arc::new(MockBackend::new())).await;
        Arc::new(Hub::new(ctx, max_connections))
    }

    async fn wait_for_sessions(hub: &Hub, count: usize) {
        tokio::time::timeout(WAIT, async {
            while hub.session_count().await != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_serve_sends_welcome_and_unregisters_on_exit() {
        let hub = hub(10).await;
        let (mut client, reader, writer) = memory_transport();

        let serving = {
            let hub = hub.clone();
            tokio::spawn(async move {
                hub.serve("c1".into(), "user".into(), SessionMode::Unary, reader, writer)
                    .await
            })
        };

        let welcome = client.next_envelope(WAIT).await.unwrap();
        assert_eq!(welcome.kind, EnvelopeType::Welcome);
        assert_eq!(welcome.client_id.as_deref(), Some("c1"));
        wait_for_sessions(&hub, 1).await;

        client.hang_up();
        tokio::time::timeout(WAIT, serving).await.unwrap().unwrap();
        assert_eq!(hub.session_count().await, 0);
        assert_eq!(hub.ctx.metrics.active_clients(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_displaces_old_session() {
        let hub = hub(10).await;
        let (mut old_client, reader, writer) = memory_transport();
        let old = {
            let hub = hub.clone();
            tokio::spawn(async move {
                hub.serve("dup".into(), "user".into(), SessionMode::Unary, reader, writer)
                    .await
            })
        };
        old_client.next_envelope(WAIT).await.unwrap();

        let (mut new_client, reader, writer) = memory_transport();
        let _new = {
            let hub = hub.clone();
            tokio::spawn(async move {
                hub.serve("dup".into(), "user".into(), SessionMode::Unary, reader, writer)
                    .await
            })
        };

        let close = old_client.next_close(WAIT).await.unwrap();
        assert_eq!(close.code, session::CLOSE_DISPLACED);
        tokio::time::timeout(WAIT, old).await.unwrap().unwrap();
        assert_eq!(old_client.close_count(), 1);

        let welcome = new_client.next_envelope(WAIT).await.unwrap();
        assert_eq!(welcome.kind, EnvelopeType::Welcome);
        assert_eq!(hub.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_session_registered_during_shutdown_is_closed() {
        let hub = hub(10).await;

        // A session that never runs holds serve in its displacement wait.
        let (stale, _queue) = ClientSession::new(
            "late".into(),
            "user".into(),
            SessionMode::Unary,
            hub.ctx.clone(),
            &hub.root,
        );
        hub.registry.register(stale.clone()).await;

        let (mut client, reader, writer) = memory_transport();
        let serving = {
            let hub = hub.clone();
            tokio::spawn(async move {
                hub.serve("late".into(), "user".into(), SessionMode::Unary, reader, writer)
                    .await
            })
        };
        tokio::time::timeout(WAIT, async {
            while stale.state() == SessionState::Open {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        hub.accepting.store(false, Ordering::SeqCst);

        tokio::time::timeout(WAIT, serving).await.unwrap().unwrap();
        let close = client.next_close(WAIT).await.unwrap();
        assert_eq!(close.code, 1001);
        assert_eq!(client.close_count(), 1);
        assert_eq!(hub.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_admission_capacity() {
        let hub = hub(1).await;
        let (_client, reader, writer) = memory_transport();
        {
            let hub = hub.clone();
            tokio::spawn(async move {
                hub.serve("only".into(), "user".into(), SessionMode::Unary, reader, writer)
                    .await
            });
        }
        wait_for_sessions(&hub, 1).await;

        assert_eq!(hub.admit("other").await, Err(AdmissionError::AtCapacity(1)));
        assert_eq!(hub.admit("only").await, Ok(()));
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions_and_refuses_new_ones() {
        let hub = hub(10).await;
        let mut clients = Vec::new();
        for i in 0..3 {
            let (client, reader, writer) = memory_transport();
            let hub = hub.clone();
            tokio::spawn(async move {
                hub.serve(format!("c{}", i), "user".into(), SessionMode::Unary, reader, writer)
                    .await
            });
            clients.push(client);
        }
        wait_for_sessions(&hub, 3).await;

        let report = hub.shutdown(WAIT).await;
        assert_eq!(report.sessions_closed, 3);
        assert!(!report.forced);
        assert_eq!(hub.admit("late").await, Err(AdmissionError::ShuttingDown));

        for client in &clients {
            assert_eq!(client.close_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_shutdown_forces_stuck_calls() {
        let ctx = session_context(Arc::new(MockBackend::new())).await;
        let tracker = ctx.tracker.clone();
        let hub = Arc::new(Hub::new(ctx, 10));

        // A tracked task that ignores session cancellation.
        let root = hub.root.clone();
        tracker.spawn(async move { root.cancelled().await });

        let report = hub.shutdown(Duration::from_millis(50)).await;
        assert!(report.forced);
        tokio::time::timeout(WAIT, tracker.wait()).await.unwrap();
    }
}
