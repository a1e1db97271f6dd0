//! In-memory stand-in for a split WebSocket.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use drowsy_common::Envelope;
use futures_util::Sink;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{timeout_at, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Number of times a [`RecordingSink`] was closed.
#[derive(Debug, Clone, Default)]
pub struct CloseCounter(Arc<AtomicUsize>);

impl CloseCounter {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sink that forwards every item to a channel.
pub struct RecordingSink<T> {
    tx: UnboundedSender<T>,
    fail: Arc<AtomicBool>,
    closes: CloseCounter,
}

impl<T> RecordingSink<T> {
    pub fn new() -> (Self, UnboundedReceiver<T>, CloseCounter) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closes = CloseCounter::default();
        let sink = Self {
            tx,
            fail: Arc::new(AtomicBool::new(false)),
            closes: closes.clone(),
        };
        (sink, rx, closes)
    }

    /// Make every subsequent write fail.
    pub fn fail_writes(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

impl<T> Sink<T> for RecordingSink<T> {
    type Error = axum::Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(axum::Error::new(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write failed",
            )));
        }
        // The receiving side may have been dropped by a test that doesn't care.
        let _ = self.tx.send(item);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.closes.0.fetch_add(1, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

/// The remote end of a [`memory_transport`].
pub struct MemoryClient {
    tx: Option<UnboundedSender<Result<Message, axum::Error>>>,
    rx: UnboundedReceiver<Message>,
    fail: Arc<AtomicBool>,
    closes: CloseCounter,
}

impl MemoryClient {
    pub fn send_json(&self, value: Value) {
        self.send_text(&value.to_string());
    }

    pub fn send_text(&self, text: &str) {
        self.push(Ok(Message::Text(text.to_string())));
    }

    /// Deliver a transport error to the session's reader.
    pub fn send_read_error(&self) {
        self.push(Err(axum::Error::new(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ))));
    }

    /// End the session's read stream, as a peer disconnect would.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }

    /// Make the session's writes fail from now on.
    pub fn fail_writes(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> usize {
        self.closes.count()
    }

    /// Next envelope written by the session, skipping pings and close frames.
    pub async fn next_envelope(&mut self, wait: Duration) -> Option<Envelope> {
        let deadline = Instant::now() + wait;
        loop {
            match timeout_at(deadline, self.rx.recv()).await.ok()?? {
                Message::Text(text) => return serde_json::from_str(&text).ok(),
                _ => continue,
            }
        }
    }

    /// Whether the session writes a ping within `wait`.
    pub async fn next_ping(&mut self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            match timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(Message::Ping(_))) => return true,
                Ok(Some(_)) => continue,
                _ => return false,
            }
        }
    }

    /// Next close frame written by the session.
    pub async fn next_close(&mut self, wait: Duration) -> Option<CloseFrame<'static>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Message::Close(Some(frame)) = timeout_at(deadline, self.rx.recv()).await.ok()?? {
                return Some(frame);
            }
        }
    }

    fn push(&self, item: Result<Message, axum::Error>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(item);
        }
    }
}

/// A connected pair: the client end plus the reader and writer a session runs on.
pub fn memory_transport() -> (
    MemoryClient,
    UnboundedReceiverStream<Result<Message, axum::Error>>,
    RecordingSink<Message>,
) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (sink, out_rx, closes) = RecordingSink::new();

    let client = MemoryClient {
        tx: Some(in_tx),
        rx: out_rx,
        fail: sink.fail.clone(),
        closes,
    };
    (client, UnboundedReceiverStream::new(in_rx), sink)
}
