//! Drowsiness Gateway Common Types
//!
//! Shared types used by the gateway backend and its clients: the WebSocket
//! envelope, envelope payloads, and the transient frame/result pair that
//! travels between a producer and the scoring backend.

pub mod detection;
pub mod protocol;

pub use detection::{Frame, FrameError, InferenceResult};
pub use protocol::{
    DetectionPayload, Envelope, EnvelopeType, ErrorPayload, FramePayload, WelcomePayload,
    PROTOCOL_VERSION,
};
