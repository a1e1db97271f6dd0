use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use drowsy_common::{Frame, InferenceResult};
use futures_util::StreamExt;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BackendConfig;
use crate::error::{GatewayError, Result};

use super::{BackendConnector, DetectionBackend, DetectionStream, GatewayState};

/// A live backend connection tagged with the dial that produced it.
#[derive(Clone)]
struct Connection {
    generation: u64,
    backend: Arc<dyn DetectionBackend>,
}

/// Single shared handle to the scoring backend.
///
/// Calls are attempted only in [`GatewayState::Ready`]. A transport failure
/// demotes the gateway to `Disconnected`, where it stays until
/// [`InferenceGateway::redial`] is called; nothing reconnects in the
/// background.
pub struct InferenceGateway {
    connector: Arc<dyn BackendConnector>,
    config: BackendConfig,
    state: watch::Sender<GatewayState>,
    connection: RwLock<Option<Connection>>,
    dial_lock: Mutex<()>,
    generation: AtomicU64,
}

impl InferenceGateway {
    /// Build the gateway and dial once. Never fails: a failed dial leaves
    /// the gateway `Disconnected`.
    pub async fn connect(connector: Arc<dyn BackendConnector>, config: BackendConfig) -> Self {
        let gateway = Self {
            connector,
            config,
            state: watch::Sender::new(GatewayState::Disconnected),
            connection: RwLock::new(None),
            dial_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        };

        if let Err(e) = gateway.dial().await {
            warn!(
                target = %gateway.connector.target(),
                error = %e,
                "Initial backend dial failed, gateway is disconnected"
            );
        }

        gateway
    }

    pub fn state(&self) -> GatewayState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<GatewayState> {
        self.state.subscribe()
    }

    pub fn target(&self) -> &str {
        self.connector.target()
    }

    /// Deadline applied to per-frame calls.
    pub fn call_timeout(&self) -> Duration {
        self.config.call_timeout()
    }

    /// Re-establish the backend connection.
    ///
    /// Concurrent redials are serialized; one that waited behind a
    /// successful redial returns without dialing again.
    pub async fn redial(&self) -> Result<GatewayState> {
        let observed = self.generation.load(Ordering::SeqCst);
        let _guard = self.dial_lock.lock().await;

        if self.generation.load(Ordering::SeqCst) != observed && self.state() == GatewayState::Ready
        {
            debug!("Redial already completed by a concurrent caller");
            return Ok(GatewayState::Ready);
        }

        self.connection.write().await.take();
        self.dial().await?;
        Ok(self.state())
    }

    async fn dial(&self) -> Result<()> {
        self.state.send_replace(GatewayState::Connecting);
        info!(target = %self.connector.target(), "Dialing scoring backend");

        let connect_timeout = self.config.connect_timeout();
        let dialed = match timeout(connect_timeout, self.connector.dial()).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Dial(format!(
                "no connection within {:?}",
                connect_timeout
            ))),
        };

        match dialed {
            Ok(backend) => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                *self.connection.write().await = Some(Connection {
                    generation,
                    backend,
                });
                self.state.send_replace(GatewayState::Ready);
                info!(generation, "Scoring backend connected");
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(GatewayState::Disconnected);
                Err(e)
            }
        }
    }

    /// The current connection, if calls may be attempted.
    async fn current(&self) -> Result<Connection> {
        let state = self.state();
        if state != GatewayState::Ready {
            return Err(GatewayError::Unavailable(state));
        }

        self.connection
            .read()
            .await
            .clone()
            .ok_or(GatewayError::Unavailable(GatewayState::Disconnected))
    }

    /// Score one frame within `deadline`.
    ///
    /// The result always carries the frame's own sequence number.
    pub async fn process_frame(&self, frame: Frame, deadline: Duration) -> Result<InferenceResult> {
        let connection = self.current().await?;
        let sequence_number = frame.sequence_number;

        let result = match timeout(deadline, connection.backend.detect(frame, deadline)).await {
            Ok(result) => result.map(|mut scored| {
                scored.sequence_number = sequence_number;
                scored
            }),
            Err(_) => Err(GatewayError::Timeout(deadline)),
        };

        if let Err(e) = &result {
            if e.is_transport() {
                self.demote(connection.generation, e).await;
            }
        }

        result
    }

    /// Open a duplex scoring stream whose results end when `cancel` fires.
    pub async fn open_stream(&self, cancel: CancellationToken) -> Result<DetectionStream> {
        let connection = self.current().await?;

        let open_timeout = self.config.stream_open_timeout();
        let opened = match timeout(open_timeout, connection.backend.open_stream()).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(open_timeout)),
        };

        match opened {
            Ok(stream) => {
                let (frames, results) = stream.split();
                let results = results.take_until(cancel.cancelled_owned()).boxed();
                Ok(DetectionStream::new(frames, results))
            }
            Err(e) => {
                if e.is_transport() {
                    self.demote(connection.generation, &e).await;
                }
                Err(e)
            }
        }
    }

    /// Ask the backend for its health and update the state from the answer.
    ///
    /// Returns false without any I/O while disconnected or dialing.
    pub async fn health_check(&self) -> bool {
        if matches!(
            self.state(),
            GatewayState::Disconnected | GatewayState::Connecting
        ) {
            return false;
        }

        let Some(connection) = self.connection.read().await.clone() else {
            return false;
        };

        let deadline = self.config.health_timeout();
        let health = match timeout(deadline, connection.backend.health(deadline)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(deadline)),
        };

        match health {
            Ok(health) if health.is_healthy() => {
                self.promote(connection.generation, GatewayState::Ready).await;
                true
            }
            Ok(health) => {
                warn!(status = %health.status, "Backend reports it is not serving");
                self.promote(connection.generation, GatewayState::Degraded).await;
                false
            }
            Err(e) => {
                self.demote(connection.generation, &e).await;
                false
            }
        }
    }

    /// Drop the connection. The gateway stays usable for a later redial.
    pub async fn close(&self) {
        let _guard = self.dial_lock.lock().await;
        self.connection.write().await.take();
        self.state.send_replace(GatewayState::Disconnected);
        info!("Backend connection released");
    }

    /// Move a live connection between `Ready` and `Degraded`.
    async fn promote(&self, generation: u64, target: GatewayState) {
        let connection = self.connection.read().await;
        if connection.as_ref().map(|c| c.generation) != Some(generation) {
            return;
        }

        self.state.send_if_modified(|state| {
            if *state != target
                && matches!(*state, GatewayState::Ready | GatewayState::Degraded)
            {
                debug!(from = %state, to = %target, "Gateway state change");
                *state = target;
                true
            } else {
                false
            }
        });
    }

    /// Drop the connection if `generation` is still the live one.
    async fn demote(&self, generation: u64, cause: &GatewayError) {
        let mut connection = self.connection.write().await;
        if connection.as_ref().map(|c| c.generation) != Some(generation) {
            debug!(generation, "Ignoring failure from a stale connection");
            return;
        }

        connection.take();
        self.state.send_replace(GatewayState::Disconnected);
        error!(generation, error = %cause, "Backend connection lost");
    }
}
