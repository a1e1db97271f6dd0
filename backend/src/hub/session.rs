//! One producer connection.
//!
//! A session runs two loops over a split transport:
//! - the read loop (on the accepting task) decodes envelopes and dispatches them
//! - the write loop (tracked task) drains the outbound queue and sends heartbeats
//!
//! Both stop on the session's cancellation token. Only the write loop's exit
//! path closes the transport, so it is closed exactly once.

use std::borrow::Cow;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use chrono::{DateTime, Utc};
use drowsy_common::{Envelope, EnvelopeType, ErrorPayload, Frame, FramePayload, InferenceResult};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{BackendConfig, HubConfig};
use crate::inference::InferenceGateway;
use crate::metrics::Metrics;
use crate::relay::{RelayError, RelayOutcome, StreamRelay};

/// Close code sent when a newer connection took over the client id.
pub const CLOSE_DISPLACED: u16 = 4000;
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_GOING_AWAY: u16 = 1001;

/// Per-session limits derived from configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub outbound_capacity: usize,
    pub enqueue_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub frames_per_minute: u32,
    pub max_in_flight: usize,
    pub call_timeout: Duration,
}

impl SessionConfig {
    pub fn new(hub: &HubConfig, backend: &BackendConfig) -> Self {
        Self {
            outbound_capacity: hub.outbound_capacity.max(1),
            enqueue_timeout: Duration::from_millis(hub.enqueue_timeout_ms),
            heartbeat_interval: Duration::from_secs(hub.heartbeat_interval_secs.max(1)),
            read_timeout: Duration::from_secs(hub.read_timeout_secs),
            write_timeout: Duration::from_secs(hub.write_timeout_secs),
            frames_per_minute: hub.frames_per_minute,
            max_in_flight: hub.max_in_flight_per_session.max(1),
            call_timeout: backend.call_timeout(),
        }
    }
}

/// Collaborators shared by every session of a hub.
#[derive(Clone)]
pub struct SessionContext {
    pub gateway: Arc<InferenceGateway>,
    pub metrics: Arc<Metrics>,
    pub tracker: TaskTracker,
    pub config: Arc<SessionConfig>,
}

/// How frames reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// One backend call per frame.
    #[default]
    Unary,
    /// Frames go through a duplex relay.
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

/// Why a session was torn down. Recorded once, by the first close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    ReadError,
    ReadTimeout,
    WriteError,
    Displaced,
    Shutdown,
}

impl CloseReason {
    /// Close frame to send, if the transport is still writable.
    fn close_frame(self) -> Option<CloseFrame<'static>> {
        let (code, reason) = match self {
            CloseReason::WriteError => return None,
            CloseReason::Displaced => (CLOSE_DISPLACED, "replaced by a newer connection"),
            CloseReason::Shutdown => (CLOSE_GOING_AWAY, "server shutting down"),
            CloseReason::ReadTimeout => (CLOSE_NORMAL, "read timeout"),
            CloseReason::PeerClosed | CloseReason::ReadError => (CLOSE_NORMAL, ""),
        };

        Some(CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        })
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::PeerClosed => "peer closed",
            CloseReason::ReadError => "read error",
            CloseReason::ReadTimeout => "read timeout",
            CloseReason::WriteError => "write error",
            CloseReason::Displaced => "displaced",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Receiving half of a session's outbound queue, handed to [`ClientSession::run`].
pub struct OutboundQueue(mpsc::Receiver<Envelope>);

/// Producer-side handle into a running relay.
struct RelayHandle {
    frames: mpsc::Sender<Frame>,
}

pub struct ClientSession {
    id: String,
    subject: String,
    mode: SessionMode,
    ctx: SessionContext,
    outbound: mpsc::Sender<Envelope>,
    state: watch::Sender<SessionState>,
    reason: OnceLock<CloseReason>,
    cancel: CancellationToken,
    limiter: DefaultDirectRateLimiter,
    in_flight: Arc<Semaphore>,
    connected_at: DateTime<Utc>,
    /// Unix millis of the last inbound message.
    last_activity: AtomicI64,
}

impl ClientSession {
    /// Create a session whose token is a child of `parent`.
    pub fn new(
        id: String,
        subject: String,
        mode: SessionMode,
        ctx: SessionContext,
        parent: &CancellationToken,
    ) -> (Arc<Self>, OutboundQueue) {
        let (outbound, rx) = mpsc::channel(ctx.config.outbound_capacity);
        let per_minute = NonZeroU32::new(ctx.config.frames_per_minute).unwrap_or(NonZeroU32::MIN);
        let in_flight = Arc::new(Semaphore::new(ctx.config.max_in_flight));
        let now = Utc::now();

        let session = Arc::new(Self {
            id,
            subject,
            mode,
            ctx,
            outbound,
            state: watch::Sender::new(SessionState::Open),
            reason: OnceLock::new(),
            cancel: parent.child_token(),
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            in_flight,
            connected_at: now,
            last_activity: AtomicI64::new(now.timestamp_millis()),
        });

        (session, OutboundQueue(rx))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Whether the outbound queue no longer accepts messages.
    pub fn is_queue_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Start teardown. Returns false if the session was already closing.
    pub fn close(&self, reason: CloseReason) -> bool {
        let transitioned = self.state.send_if_modified(|state| {
            if *state == SessionState::Open {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        });

        if transitioned {
            let _ = self.reason.set(reason);
            self.cancel.cancel();
            tracing::info!(client_id = %self.id, reason = %reason, "Closing session");
        }

        transitioned
    }

    /// Resolve once the write loop has released the transport.
    pub async fn wait_closed(&self) {
        let mut states = self.state.subscribe();
        let _ = states.wait_for(|state| *state == SessionState::Closed).await;
    }

    /// Queue an envelope, waiting at most the enqueue timeout for space.
    ///
    /// Returns false if the message was dropped.
    pub async fn enqueue(&self, envelope: Envelope) -> bool {
        if self.state() != SessionState::Open {
            return false;
        }

        match self
            .outbound
            .send_timeout(envelope, self.ctx.config.enqueue_timeout)
            .await
        {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(envelope)) => {
                self.ctx.metrics.record_dropped();
                tracing::warn!(
                    client_id = %self.id,
                    kind = ?envelope.kind,
                    "Outbound queue full, dropping message"
                );
                false
            }
            Err(SendTimeoutError::Closed(_)) => false,
        }
    }

    /// Drive the session until it closes.
    pub async fn run<R, W>(self: Arc<Self>, reader: R, writer: W, queue: OutboundQueue)
    where
        R: Stream<Item = Result<Message, axum::Error>> + Send + Unpin + 'static,
        W: Sink<Message, Error = axum::Error> + Send + Unpin + 'static,
    {
        let write_task = self
            .ctx
            .tracker
            .spawn(self.clone().write_loop(writer, queue.0));

        let relay = match self.mode {
            SessionMode::Stream => self.start_relay().await,
            SessionMode::Unary => None,
        };

        let reason = self.read_loop(reader, relay).await;
        self.close(reason);

        if let Err(e) = write_task.await {
            tracing::error!(client_id = %self.id, "Write loop panicked: {}", e);
        }
    }

    async fn read_loop<R>(self: &Arc<Self>, mut reader: R, mut relay: Option<RelayHandle>) -> CloseReason
    where
        R: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let read_timeout = self.ctx.config.read_timeout;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return self.close_reason().unwrap_or(CloseReason::Shutdown);
                }
                next = timeout(read_timeout, reader.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    tracing::warn!(client_id = %self.id, "No message within {:?}", read_timeout);
                    return CloseReason::ReadTimeout;
                }
                Ok(None) => return CloseReason::PeerClosed,
                Ok(Some(Err(e))) => {
                    tracing::debug!(client_id = %self.id, "Read failed: {}", e);
                    return CloseReason::ReadError;
                }
                Ok(Some(Ok(message))) => message,
            };

            self.last_activity
                .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

            match message {
                Message::Text(text) => self.handle_text(&text, &mut relay).await,
                Message::Binary(_) => {
                    tracing::debug!(client_id = %self.id, "Ignoring binary message");
                }
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(_) => return CloseReason::PeerClosed,
            }
        }
    }

    async fn handle_text(self: &Arc<Self>, text: &str, relay: &mut Option<RelayHandle>) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(client_id = %self.id, "Malformed envelope: {}", e);
                self.reject(ErrorPayload::new("INVALID_ENVELOPE", e.to_string()))
                    .await;
                return;
            }
        };

        match envelope.kind {
            EnvelopeType::Ping => {
                self.enqueue(Envelope::pong(&self.id)).await;
            }
            EnvelopeType::Frame => self.handle_frame(&envelope.payload, relay).await,
            EnvelopeType::Pong => {}
            other => {
                tracing::debug!(client_id = %self.id, "Ignoring {:?} envelope", other);
            }
        }
    }

    async fn handle_frame(self: &Arc<Self>, payload: &Value, relay: &mut Option<RelayHandle>) {
        let payload = match FramePayload::parse(payload) {
            Ok(payload) => payload,
            Err(e) => return self.reject(ErrorPayload::from(&e)).await,
        };
        let sequence_number = payload.sequence_number;

        if self.limiter.check().is_err() {
            return self
                .reject(
                    ErrorPayload::new("RATE_LIMITED", "Frame rate limit exceeded")
                        .with_sequence(sequence_number),
                )
                .await;
        }

        let frame = match payload.decode() {
            Ok(frame) => frame,
            Err(e) => {
                return self
                    .reject(ErrorPayload::from(&e).with_sequence(sequence_number))
                    .await
            }
        };

        let frame = if let Some(handle) = relay.as_ref() {
            let sent = handle
                .frames
                .send_timeout(frame, self.ctx.config.enqueue_timeout)
                .await;
            match sent {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(_)) => {
                    return self
                        .reject(
                            ErrorPayload::new("BUSY", "Stream backlog is full")
                                .with_sequence(sequence_number),
                        )
                        .await;
                }
                Err(SendTimeoutError::Closed(frame)) => {
                    tracing::info!(client_id = %self.id, "Stream ended, continuing in unary mode");
                    relay.take();
                    frame
                }
            }
        } else {
            frame
        };

        let permit = match self.in_flight.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                return self
                    .reject(
                        ErrorPayload::new("BUSY", "Too many frames in flight")
                            .with_sequence(sequence_number),
                    )
                    .await;
            }
        };

        let session = self.clone();
        self.ctx.tracker.spawn(session.score(frame, permit));
    }

    async fn score(self: Arc<Self>, frame: Frame, _permit: OwnedSemaphorePermit) {
        let sequence_number = frame.sequence_number;
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::debug!(client_id = %self.id, sequence_number, "Abandoning frame, session closing");
                return;
            }
            outcome = self.ctx.gateway.process_frame(frame, self.ctx.config.call_timeout) => outcome,
        };

        match outcome {
            Ok(result) => {
                self.ctx
                    .metrics
                    .record_frame(started.elapsed(), result.is_drowsy);
                self.enqueue(Envelope::detection(&self.id, result)).await;
            }
            Err(e) => {
                tracing::warn!(client_id = %self.id, sequence_number, "Frame failed: {}", e);
                self.ctx.metrics.record_error();
                self.enqueue(Envelope::error(
                    &self.id,
                    e.to_payload().with_sequence(sequence_number),
                ))
                .await;
            }
        }
    }

    /// Answer a bad frame or envelope without touching the backend.
    async fn reject(&self, error: ErrorPayload) {
        self.ctx.metrics.record_error();
        self.enqueue(Envelope::error(&self.id, error)).await;
    }

    /// Open a backend stream and relay frames through it.
    ///
    /// On failure the producer gets one `ERROR` and the session stays unary.
    async fn start_relay(self: &Arc<Self>) -> Option<RelayHandle> {
        let relay = StreamRelay::new(&self.cancel);

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            opened = self.ctx.gateway.open_stream(relay.token()) => opened,
        };

        let backend = match opened {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(client_id = %self.id, "Could not open stream, using unary calls: {}", e);
                self.enqueue(Envelope::error(&self.id, e.to_payload())).await;
                return None;
            }
        };

        let (frames, rx) = mpsc::channel(self.ctx.config.max_in_flight);
        let upstream = ReceiverStream::new(rx).map(Ok::<Frame, RelayError>);

        let downstream = Box::pin(futures_util::sink::unfold(
            self.clone(),
            |session, result: InferenceResult| async move {
                let latency = Duration::from_secs_f32(result.inference_time_ms.max(0.0) / 1000.0);
                session.ctx.metrics.record_frame(latency, result.is_drowsy);
                session
                    .enqueue(Envelope::detection(&session.id, result))
                    .await;
                Ok::<_, std::convert::Infallible>(session)
            },
        ));

        let session = self.clone();
        self.ctx.tracker.spawn(async move {
            let outcome = relay.run(upstream, downstream, backend).await;
            if session.state() != SessionState::Open {
                return;
            }

            let error = match outcome {
                RelayOutcome::Failed(_, RelayError::Backend(e)) => e.to_payload(),
                _ => ErrorPayload::new(
                    "STREAM_CLOSED",
                    "Backend stream closed, continuing with unary calls",
                ),
            };
            session.ctx.metrics.record_error();
            session.enqueue(Envelope::error(&session.id, error)).await;
        });

        tracing::info!(client_id = %self.id, "Stream relay started");
        Some(RelayHandle { frames })
    }

    async fn write_loop<W>(self: Arc<Self>, mut sink: W, mut rx: mpsc::Receiver<Envelope>)
    where
        W: Sink<Message, Error = axum::Error> + Unpin,
    {
        let heartbeat_interval = self.ctx.config.heartbeat_interval;
        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_write = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                envelope = rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(client_id = %self.id, "Failed to serialize envelope: {}", e);
                            continue;
                        }
                    };
                    if !self.write(&mut sink, Message::Text(text)).await {
                        self.close(CloseReason::WriteError);
                        break;
                    }
                    last_write = Instant::now();
                }
                _ = heartbeat.tick() => {
                    if last_write.elapsed() < heartbeat_interval {
                        continue;
                    }
                    if !self.write(&mut sink, Message::Ping(Vec::new())).await {
                        self.close(CloseReason::WriteError);
                        break;
                    }
                    last_write = Instant::now();
                }
            }
        }

        rx.close();

        let reason = self.close_reason().unwrap_or(CloseReason::Shutdown);
        if let Some(frame) = reason.close_frame() {
            self.write(&mut sink, Message::Close(Some(frame))).await;
        }
        match timeout(self.ctx.config.write_timeout, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(client_id = %self.id, "Transport close failed: {}", e),
            Err(_) => tracing::debug!(client_id = %self.id, "Transport close timed out"),
        }

        self.state.send_replace(SessionState::Closed);
        let connected_secs = (Utc::now() - self.connected_at()).num_seconds();
        let idle_ms = Utc::now().timestamp_millis() - self.last_activity_ms();
        tracing::info!(
            client_id = %self.id,
            reason = %reason,
            connected_secs,
            idle_ms,
            "Session closed"
        );
    }

    /// Write one message within the write timeout.
    async fn write<W>(&self, sink: &mut W, message: Message) -> bool
    where
        W: Sink<Message, Error = axum::Error> + Unpin,
    {
        match timeout(self.ctx.config.write_timeout, sink.send(message)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!(client_id = %self.id, "Write failed: {}", e);
                false
            }
            Err(_) => {
                tracing::error!(client_id = %self.id, "Write timed out");
                false
            }
        }
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
