//! Frames submitted for scoring and the results that come back.
//!
//! Neither type is ever persisted: a frame lives from the moment its
//! envelope is decoded until the backend answers, and a result lives until
//! it is written back to the producer.

use serde::{Deserialize, Serialize};

/// One unit of producer input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Caller-assigned sequence number, echoed back in the result.
    pub sequence_number: i32,
    /// Raw encoded image bytes (JPEG in practice).
    pub data: Vec<u8>,
    /// Capture time on the producer, Unix milliseconds.
    pub captured_at_ms: i64,
}

impl Frame {
    pub fn new(sequence_number: i32, data: Vec<u8>, captured_at_ms: i64) -> Self {
        Self {
            sequence_number,
            data,
            captured_at_ms,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Score produced by the backend for a single frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub is_drowsy: bool,
    pub drowsiness_score: f32,
    pub alert_level: String,
    pub inference_time_ms: f32,
    pub sequence_number: i32,
}

/// Reasons a `FRAME` payload cannot be turned into a [`Frame`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Invalid frame payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid base64 frame data: {0}")]
    InvalidBase64(String),

    #[error("Frame data is empty")]
    Empty,
}

impl FrameError {
    /// Stable code carried in `ERROR` envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            FrameError::InvalidPayload(_) => "INVALID_PAYLOAD",
            FrameError::InvalidBase64(_) => "INVALID_BASE64",
            FrameError::Empty => "EMPTY_FRAME",
        }
    }
}
