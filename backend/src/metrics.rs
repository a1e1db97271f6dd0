//! Process-wide counters for the gateway.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use prometheus::{Encoder, Gauge, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;

/// Lock-free metrics sink shared by every session.
#[derive(Debug)]
pub struct Metrics {
    frames_processed: AtomicU64,
    errors: AtomicU64,
    latency_micros: AtomicU64,
    drowsy_detections: AtomicU64,
    active_clients: AtomicI64,
    connections_total: AtomicU64,
    dropped_messages: AtomicU64,
    /// Unix millis of the last scored frame, 0 if none.
    last_frame_at: AtomicI64,
    started_at: Instant,
}

/// Point-in-time view served by `/api/metrics`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_frames: u64,
    pub total_errors: u64,
    pub active_clients: i64,
    pub total_connections: u64,
    pub avg_latency_ms: f64,
    pub drowsy_detections: u64,
    /// Share of scored frames flagged drowsy, in percent.
    pub detection_rate: f64,
    pub dropped_messages: u64,
    pub system_uptime_sec: u64,
    pub last_frame_at: Option<i64>,
    /// RFC 3339.
    pub timestamp: String,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latency_micros: AtomicU64::new(0),
            drowsy_detections: AtomicU64::new(0),
            active_clients: AtomicI64::new(0),
            connections_total: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
            last_frame_at: AtomicI64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Record a frame the backend scored.
    pub fn record_frame(&self, latency: Duration, drowsy: bool) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.latency_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        if drowsy {
            self.drowsy_detections.fetch_add(1, Ordering::Relaxed);
        }
        self.last_frame_at
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// An outbound message was dropped on a full queue.
    pub fn record_dropped(&self) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_connected(&self) {
        self.active_clients.fetch_add(1, Ordering::Relaxed);
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        self.active_clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_clients(&self) -> i64 {
        self.active_clients.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total_frames = self.frames_processed.load(Ordering::Relaxed);
        let drowsy_detections = self.drowsy_detections.load(Ordering::Relaxed);
        let latency_micros = self.latency_micros.load(Ordering::Relaxed);

        let (avg_latency_ms, detection_rate) = if total_frames > 0 {
            (
                latency_micros as f64 / total_frames as f64 / 1000.0,
                drowsy_detections as f64 / total_frames as f64 * 100.0,
            )
        } else {
            (0.0, 0.0)
        };

        let last_frame_at = match self.last_frame_at.load(Ordering::Relaxed) {
            0 => None,
            millis => Some(millis),
        };

        MetricsSnapshot {
            total_frames,
            total_errors: self.errors.load(Ordering::Relaxed),
            active_clients: self.active_clients(),
            total_connections: self.connections_total.load(Ordering::Relaxed),
            avg_latency_ms,
            drowsy_detections,
            detection_rate,
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            system_uptime_sec: self.uptime().as_secs(),
            last_frame_at,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Prometheus text exposition of the current counters.
    ///
    /// Values are copied into a registry built per scrape, so the hot path
    /// stays on plain atomics.
    pub fn render_prometheus(&self, backend_ready: bool) -> prometheus::Result<String> {
        let s = self.snapshot();
        let registry = Registry::new_custom(Some("drowsy".to_string()), None)?;

        let counters = [
            ("frames_total", "Frames scored by the backend", s.total_frames),
            ("errors_total", "Frames answered with an error", s.total_errors),
            ("detections_total", "Frames flagged drowsy", s.drowsy_detections),
            (
                "dropped_messages_total",
                "Outbound messages dropped on a full queue",
                s.dropped_messages,
            ),
            ("connections_total", "Producer connections accepted", s.total_connections),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::new(name, help)?;
            counter.inc_by(value);
            registry.register(Box::new(counter))?;
        }

        let gauges = [
            ("active_clients", "Producer connections currently open", s.active_clients as f64),
            ("avg_latency_ms", "Mean backend latency per scored frame", s.avg_latency_ms),
            ("uptime_seconds", "Seconds since the gateway started", s.system_uptime_sec as f64),
            (
                "backend_ready",
                "Whether the scoring backend accepts calls",
                f64::from(u8::from(backend_ready)),
            ),
        ];
        for (name, help, value) in gauges {
            let gauge = Gauge::new(name, help)?;
            gauge.set(value);
            registry.register(Box::new(gauge))?;
        }

        let info = IntGaugeVec::new(Opts::new("info", "Service information"), &["version"])?;
        info.with_label_values(&[env!("CARGO_PKG_VERSION")]).set(1);
        registry.register(Box::new(info))?;

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
