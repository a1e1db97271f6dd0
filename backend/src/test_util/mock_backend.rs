use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use drowsy_common::{Frame, InferenceResult};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{GatewayError, Result};
use crate::inference::{BackendConnector, BackendHealth, DetectionBackend, DetectionStream};

/// Scriptable in-process scoring backend.
///
/// Unary calls get a fixed result whose sequence number is always 0, so
/// callers must restore the frame's own. Stream results echo the frame's
/// sequence number, as the stream contract does. Per-sequence delays
/// simulate a slow model.
pub struct MockBackend {
    response: InferenceResult,
    delays: Mutex<HashMap<i32, Duration>>,
    failure: Mutex<Option<GatewayError>>,
    stream_limit: Mutex<Option<usize>>,
    stream_delay: Mutex<Option<Duration>>,
    healthy: AtomicBool,
    calls: AtomicUsize,
    streams: AtomicUsize,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            response: InferenceResult {
                is_drowsy: true,
                drowsiness_score: 0.91,
                alert_level: "high".to_string(),
                inference_time_ms: 12.3,
                sequence_number: 0,
            },
            delays: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
            stream_limit: Mutex::new(None),
            stream_delay: Mutex::new(None),
            healthy: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            streams: AtomicUsize::new(0),
        }
    }

    /// Sleep before answering frames with this sequence number.
    pub fn delay_sequence(&self, sequence_number: i32, delay: Duration) {
        lock(&self.delays).insert(sequence_number, delay);
    }

    /// Fail every unary call with `error`, or stop failing with `None`.
    pub fn fail_with(&self, error: Option<GatewayError>) {
        *lock(&self.failure) = error;
    }

    /// End each stream after it has produced `results` results.
    pub fn end_streams_after(&self, results: usize) {
        *lock(&self.stream_limit) = Some(results);
    }

    /// Sleep before handing out each stream.
    pub fn delay_streams(&self, delay: Duration) {
        *lock(&self.stream_delay) = Some(delay);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Unary calls received.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn streams_opened(&self) -> usize {
        self.streams.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DetectionBackend for MockBackend {
    async fn detect(&self, frame: Frame, _deadline: Duration) -> Result<InferenceResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = lock(&self.delays).get(&frame.sequence_number).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = lock(&self.failure).clone();
        match failure {
            Some(error) => Err(error),
            None => Ok(self.response.clone()),
        }
    }

    async fn open_stream(&self) -> Result<DetectionStream> {
        self.streams.fetch_add(1, Ordering::SeqCst);

        let delay = *lock(&self.stream_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (tx, rx) = mpsc::channel::<Frame>(16);
        let template = self.response.clone();
        let results = ReceiverStream::new(rx).map(move |frame| {
            Ok::<_, GatewayError>(InferenceResult {
                sequence_number: frame.sequence_number,
                ..template.clone()
            })
        });

        let limit = *lock(&self.stream_limit);
        let results = match limit {
            Some(limit) => results.take(limit).boxed(),
            None => results.boxed(),
        };

        Ok(DetectionStream::new(tx, results))
    }

    async fn health(&self, _deadline: Duration) -> Result<BackendHealth> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(BackendHealth::healthy())
        } else {
            Ok(BackendHealth {
                status: "unavailable".to_string(),
                serving: false,
            })
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connector handing out a shared [`MockBackend`].
pub struct MockConnector {
    backend: Arc<MockBackend>,
    failing: AtomicBool,
    dials: AtomicUsize,
}

impl MockConnector {
    pub fn new(backend: Arc<MockBackend>) -> Self {
        Self {
            backend,
            failing: AtomicBool::new(false),
            dials: AtomicUsize::new(0),
        }
    }

    /// A connector whose dials fail until [`MockConnector::set_failing`] flips it.
    pub fn failing(backend: Arc<MockBackend>) -> Self {
        let connector = Self::new(backend);
        connector.set_failing(true);
        connector
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendConnector for MockConnector {
    fn target(&self) -> &str {
        "mock://scoring"
    }

    async fn dial(&self) -> Result<Arc<dyn DetectionBackend>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::Dial("connection refused".to_string()));
        }
        Ok(self.backend.clone())
    }
}
