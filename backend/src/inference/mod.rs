//! Scoring backend abstraction.
//!
//! This module provides:
//! - `DetectionBackend`: the narrow contract the gateway needs from a scoring service
//! - `BackendConnector`: how a backend connection is (re)established
//! - `InferenceGateway`: the availability state machine in front of both
//! - A gRPC implementation of the two traits

mod gateway;
pub mod grpc;

pub use gateway::InferenceGateway;
pub use grpc::GrpcConnector;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use drowsy_common::{Frame, InferenceResult};
use futures_util::stream::BoxStream;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::Result;

/// Availability of the backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayState {
    /// No connection. Only an explicit redial leaves this state.
    Disconnected,
    /// A dial is in progress.
    Connecting,
    /// Connected and confirmed; the only state in which calls are attempted.
    Ready,
    /// Connected, but the backend reports it is not serving.
    Degraded,
}

impl GatewayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayState::Disconnected => "disconnected",
            GatewayState::Connecting => "connecting",
            GatewayState::Ready => "ready",
            GatewayState::Degraded => "degraded",
        }
    }
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health report returned by the backend's health call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHealth {
    pub status: String,
    pub serving: bool,
}

impl BackendHealth {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            serving: true,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.serving && self.status == "healthy"
    }
}

/// Duplex scoring stream.
///
/// Frames go in through `frames`; dropping the sender (or calling
/// [`DetectionStream::close_send`]) half-closes the upstream. Results come
/// out of `results` until the backend ends the stream or the stream's
/// cancellation token fires.
pub struct DetectionStream {
    pub frames: mpsc::Sender<Frame>,
    pub results: BoxStream<'static, Result<InferenceResult>>,
}

impl DetectionStream {
    pub fn new(
        frames: mpsc::Sender<Frame>,
        results: BoxStream<'static, Result<InferenceResult>>,
    ) -> Self {
        Self { frames, results }
    }

    /// Split into the sending and receiving halves.
    pub fn split(self) -> (mpsc::Sender<Frame>, BoxStream<'static, Result<InferenceResult>>) {
        (self.frames, self.results)
    }

    /// Half-close: no more frames will be sent, results keep flowing.
    pub fn close_send(self) -> BoxStream<'static, Result<InferenceResult>> {
        self.results
    }
}

impl fmt::Debug for DetectionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectionStream")
            .field("frames_closed", &self.frames.is_closed())
            .finish_non_exhaustive()
    }
}

/// Contract consumed from the scoring service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DetectionBackend: Send + Sync {
    /// Score one frame. Implementations must honour `deadline`.
    async fn detect(&self, frame: Frame, deadline: Duration) -> Result<InferenceResult>;

    /// Open a duplex scoring stream.
    async fn open_stream(&self) -> Result<DetectionStream>;

    /// Lightweight round trip used to infer availability.
    async fn health(&self, deadline: Duration) -> Result<BackendHealth>;
}

/// Establishes backend connections.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Human-readable dial target for logs.
    fn target(&self) -> &str;

    async fn dial(&self) -> Result<Arc<dyn DetectionBackend>>;
}
