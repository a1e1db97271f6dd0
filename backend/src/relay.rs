//! Duplex relay between a producer and a backend scoring stream.
//!
//! Two pumps run side by side:
//! - upstream: producer frames into the backend stream
//! - downstream: backend results out to the producer
//!
//! Whichever pump stops first decides the outcome and cancels the other.
//! [`StreamRelay::run`] returns only after both pumps have stopped.

use std::fmt;
use std::sync::OnceLock;

use drowsy_common::{Frame, InferenceResult};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::inference::DetectionStream;

/// Relay direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    /// Producer to backend.
    Upstream,
    /// Backend to producer.
    Downstream,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Upstream => f.write_str("upstream"),
            Leg::Downstream => f.write_str("downstream"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("Client leg failed: {0}")]
    Client(String),

    #[error("Backend leg failed: {0}")]
    Backend(#[from] GatewayError),
}

/// How a relay ended.
#[derive(Debug, Clone)]
pub enum RelayOutcome {
    /// A leg reached end-of-stream.
    Finished(Leg),
    /// A leg failed.
    Failed(Leg, RelayError),
    /// The parent token fired before either leg ended on its own.
    Cancelled,
}

impl RelayOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RelayOutcome::Cancelled)
    }
}

pub struct StreamRelay {
    cancel: CancellationToken,
}

impl StreamRelay {
    /// Create a relay that stops when `parent` is cancelled.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
        }
    }

    /// Token that stops this relay.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Pump until the first leg stops.
    ///
    /// On exit the backend stream's sender is dropped (half-closing the
    /// upstream) and `downstream` is closed.
    pub async fn run<U, D>(self, upstream: U, downstream: D, backend: DetectionStream) -> RelayOutcome
    where
        U: Stream<Item = Result<Frame, RelayError>> + Unpin + Send,
        D: Sink<InferenceResult> + Unpin + Send,
        D::Error: fmt::Display,
    {
        let first = OnceLock::new();
        let (frames, results) = backend.split();

        tokio::join!(
            self.pump_upstream(upstream, frames, &first),
            self.pump_downstream(results, downstream, &first),
        );

        let outcome = first.into_inner().unwrap_or(RelayOutcome::Cancelled);
        tracing::debug!(outcome = ?outcome, "Stream relay stopped");
        outcome
    }

    fn finish(&self, first: &OnceLock<RelayOutcome>, outcome: RelayOutcome) {
        let _ = first.set(outcome);
        self.cancel.cancel();
    }

    async fn pump_upstream<U>(&self, mut upstream: U, frames: mpsc::Sender<Frame>, first: &OnceLock<RelayOutcome>)
    where
        U: Stream<Item = Result<Frame, RelayError>> + Unpin + Send,
    {
        let outcome = loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break None,
                item = upstream.next() => item,
            };

            let frame = match item {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => break Some(RelayOutcome::Failed(Leg::Upstream, e)),
                None => break Some(RelayOutcome::Finished(Leg::Upstream)),
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break None,
                sent = frames.send(frame) => {
                    if sent.is_err() {
                        break Some(RelayOutcome::Failed(
                            Leg::Upstream,
                            RelayError::Backend(GatewayError::StreamClosed),
                        ));
                    }
                }
            }
        };

        drop(frames);
        if let Some(outcome) = outcome {
            self.finish(first, outcome);
        }
    }

    async fn pump_downstream<S, D>(&self, mut results: S, mut downstream: D, first: &OnceLock<RelayOutcome>)
    where
        S: Stream<Item = crate::error::Result<InferenceResult>> + Unpin + Send,
        D: Sink<InferenceResult> + Unpin + Send,
        D::Error: fmt::Display,
    {
        let outcome = loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break None,
                item = results.next() => item,
            };

            let result = match item {
                Some(Ok(result)) => result,
                Some(Err(e)) => break Some(RelayOutcome::Failed(Leg::Downstream, e.into())),
                None => break Some(RelayOutcome::Finished(Leg::Downstream)),
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break None,
                sent = downstream.send(result) => {
                    if let Err(e) = sent {
                        break Some(RelayOutcome::Failed(
                            Leg::Downstream,
                            RelayError::Client(e.to_string()),
                        ));
                    }
                }
            }
        };

        if let Err(e) = downstream.close().await {
            tracing::debug!("Relay client leg close failed: {}", e);
        }
        if let Some(outcome) = outcome {
            self.finish(first, outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::RecordingSink;
    use futures_util::stream;
    use std::time::Duration;
    use tokio_stream::wrappers::ReceiverStream;

    fn result(sequence_number: i32) -> InferenceResult {
        InferenceResult {
            is_drowsy: sequence_number % 2 == 0,
            drowsiness_score: 0.5,
            alert_level: "medium".to_string(),
            inference_time_ms: 3.0,
            sequence_number,
        }
    }

    #[tokio::test]
    async fn test_backend_end_closes_client_leg() {
        let parent = CancellationToken::new();
        let relay = StreamRelay::new(&parent);
        let token = relay.token();

        let (frames_tx, mut frames_rx) = mpsc::channel(4);
        let backend = DetectionStream::new(
            frames_tx,
            stream::iter(vec![Ok(result(1)), Ok(result(2))]).boxed(),
        );
        let (sink, mut delivered, closes) = RecordingSink::new();

        // The producer never sends anything.
        let upstream = stream::pending::<Result<Frame, RelayError>>();

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            relay.run(upstream, sink, backend),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, RelayOutcome::Finished(Leg::Downstream)));
        assert_eq!(delivered.recv().await.unwrap().sequence_number, 1);
        assert_eq!(delivered.recv().await.unwrap().sequence_number, 2);
        assert_eq!(closes.count(), 1);
        assert!(token.is_cancelled());
        // The upstream sender was dropped with the pump.
        assert!(frames_rx.recv().await.is_none());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_client_end_half_closes_backend() {
        let parent = CancellationToken::new();
        let relay = StreamRelay::new(&parent);

        let (frames_tx, frames_rx) = mpsc::channel(4);
        let backend = DetectionStream::new(frames_tx, stream::pending().boxed());
        let (sink, _delivered, closes) = RecordingSink::new();

        let upstream = stream::iter(vec![
            Ok(Frame::new(1, vec![1], 0)),
            Ok(Frame::new(2, vec![2], 0)),
        ]);

        let outcome = relay.run(upstream, sink, backend).await;
        assert!(matches!(outcome, RelayOutcome::Finished(Leg::Upstream)));
        assert_eq!(closes.count(), 1);

        let forwarded: Vec<i32> = ReceiverStream::new(frames_rx)
            .map(|f| f.sequence_number)
            .collect()
            .await;
        assert_eq!(forwarded, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_backend_error_propagates() {
        let relay = StreamRelay::new(&CancellationToken::new());

        let (frames_tx, _frames_rx) = mpsc::channel(1);
        let backend = DetectionStream::new(
            frames_tx,
            stream::iter(vec![Err(GatewayError::Transport("reset".into()))]).boxed(),
        );
        let (sink, _delivered, _closes) = RecordingSink::new();

        let outcome = relay
            .run(stream::pending::<Result<Frame, RelayError>>(), sink, backend)
            .await;

        match outcome {
            RelayOutcome::Failed(Leg::Downstream, RelayError::Backend(e)) => assert!(e.is_transport()),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_client_write_failure_stops_relay() {
        let relay = StreamRelay::new(&CancellationToken::new());

        let (frames_tx, _frames_rx) = mpsc::channel(1);
        let backend = DetectionStream::new(frames_tx, stream::iter(vec![Ok(result(1))]).boxed());
        let (sink, _delivered, closes) = RecordingSink::new();
        sink.fail_writes();

        let outcome = relay
            .run(stream::pending::<Result<Frame, RelayError>>(), sink, backend)
            .await;

        assert!(matches!(outcome, RelayOutcome::Failed(Leg::Downstream, RelayError::Client(_))));
        assert_eq!(closes.count(), 1);
    }

    #[tokio::test]
    async fn test_parent_cancel_stops_both_legs() {
        let parent = CancellationToken::new();
        let relay = StreamRelay::new(&parent);

        let (frames_tx, _frames_rx) = mpsc::channel(1);
        let backend = DetectionStream::new(frames_tx, stream::pending().boxed());
        let (sink, _delivered, closes) = RecordingSink::new();

        let handle = tokio::spawn(relay.run(stream::pending::<Result<Frame, RelayError>>(), sink, backend));
        parent.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_cancelled());
        assert_eq!(closes.count(), 1);
    }
}
