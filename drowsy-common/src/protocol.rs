//! WebSocket envelope types for producer-gateway communication.
//!
//! # Protocol Overview
//!
//! Every message on a producer connection is a JSON envelope:
//!
//! ```json
//! {"type": "FRAME", "payload": {...}, "client_id": "client-1", "timestamp": 1700000000}
//! ```
//!
//! `type` selects the payload shape. `client_id` and `timestamp` are optional
//! on inbound envelopes; the gateway always fills them on outbound ones
//! (timestamp in Unix seconds).
//!
//! ## Connection Flow
//!
//! 1. Producer opens the WebSocket; the gateway answers with `WELCOME`
//! 2. Producer sends `FRAME` envelopes, each carrying a base64 image
//! 3. Gateway answers each frame with `DETECTION_RESULT` or `ERROR`
//! 4. Either side may send `PING`; the gateway answers with `PONG`
//!
//! ## Ordering
//!
//! Results for frames in flight at the same time may arrive out of order.
//! Producers reconcile via `sequence_number`, which the gateway echoes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Frame, FrameError, InferenceResult};

/// Version advertised in the `WELCOME` payload.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Envelope discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeType {
    Ping,
    Pong,
    Frame,
    Welcome,
    Error,
    DetectionResult,
    /// Any type this gateway does not know about.
    #[serde(other)]
    Unknown,
}

/// Typed wire message exchanged over a producer connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    /// Build an outbound envelope stamped with the current time.
    pub fn new(kind: EnvelopeType, client_id: Option<&str>, payload: Value) -> Self {
        Self {
            kind,
            payload,
            client_id: client_id.map(String::from),
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn pong(client_id: &str) -> Self {
        Self::new(EnvelopeType::Pong, Some(client_id), Value::Null)
    }

    pub fn welcome(client_id: &str) -> Self {
        Self::new(
            EnvelopeType::Welcome,
            Some(client_id),
            WelcomePayload::default().into(),
        )
    }

    pub fn detection(client_id: &str, result: InferenceResult) -> Self {
        Self::new(
            EnvelopeType::DetectionResult,
            Some(client_id),
            DetectionPayload::from(result).into(),
        )
    }

    pub fn error(client_id: &str, error: ErrorPayload) -> Self {
        Self::new(EnvelopeType::Error, Some(client_id), error.into())
    }

    /// Deserialize the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// `FRAME` payload as sent by producers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramePayload {
    /// Base64 image, optionally wrapped as a `data:` URL.
    pub frame: String,
    /// Capture time, Unix milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub sequence_number: i32,
}

impl FramePayload {
    /// Read a `FRAME` payload out of an envelope payload value.
    pub fn parse(payload: &Value) -> Result<Self, FrameError> {
        if payload.is_null() {
            return Err(FrameError::InvalidPayload("missing payload".to_string()));
        }
        Self::deserialize(payload).map_err(|e| FrameError::InvalidPayload(e.to_string()))
    }

    /// Decode the image data. Empty data is rejected.
    pub fn decode(self) -> Result<Frame, FrameError> {
        let encoded = strip_data_url(self.frame.trim());
        let data = STANDARD
            .decode(encoded)
            .map_err(|e| FrameError::InvalidBase64(e.to_string()))?;

        let frame = Frame::new(self.sequence_number, data, self.timestamp);
        if frame.is_empty() {
            return Err(FrameError::Empty);
        }
        Ok(frame)
    }
}

fn strip_data_url(value: &str) -> &str {
    if value.starts_with("data:") {
        if let Some((_, rest)) = value.split_once(',') {
            return rest;
        }
    }
    value
}

/// `DETECTION_RESULT` payload.
///
/// Scores are widened from the backend's `f32` through their shortest
/// decimal form, so `0.91` goes on the wire as `0.91`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionPayload {
    pub is_drowsy: bool,
    pub drowsiness_score: f64,
    pub alert_level: String,
    pub inference_time_ms: f64,
    pub sequence_number: i32,
}

impl From<InferenceResult> for DetectionPayload {
    fn from(result: InferenceResult) -> Self {
        Self {
            is_drowsy: result.is_drowsy,
            drowsiness_score: decimal(result.drowsiness_score),
            alert_level: result.alert_level,
            inference_time_ms: decimal(result.inference_time_ms),
            sequence_number: result.sequence_number,
        }
    }
}

impl From<DetectionPayload> for Value {
    fn from(payload: DetectionPayload) -> Self {
        let mut map = Map::new();
        map.insert("is_drowsy".into(), payload.is_drowsy.into());
        map.insert("drowsiness_score".into(), payload.drowsiness_score.into());
        map.insert("alert_level".into(), payload.alert_level.into());
        map.insert("inference_time_ms".into(), payload.inference_time_ms.into());
        map.insert("sequence_number".into(), payload.sequence_number.into());
        Value::Object(map)
    }
}

fn decimal(value: f32) -> f64 {
    value.to_string().parse().unwrap_or(f64::from(value))
}

/// `ERROR` payload. Per-frame errors echo the sequence number when known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<i32>,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            sequence_number: None,
        }
    }

    pub fn with_sequence(mut self, sequence_number: i32) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }
}

impl From<ErrorPayload> for Value {
    fn from(payload: ErrorPayload) -> Self {
        let mut map = Map::new();
        map.insert("code".into(), payload.code.into());
        map.insert("message".into(), payload.message.into());
        if let Some(sequence_number) = payload.sequence_number {
            map.insert("sequence_number".into(), sequence_number.into());
        }
        Value::Object(map)
    }
}

impl From<&FrameError> for ErrorPayload {
    fn from(error: &FrameError) -> Self {
        ErrorPayload::new(error.code(), error.to_string())
    }
}

/// `WELCOME` payload sent right after a connection is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub message: String,
    pub version: String,
}

impl Default for WelcomePayload {
    fn default() -> Self {
        Self {
            message: "Connected to Drowsiness Detection Server".to_string(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

impl From<WelcomePayload> for Value {
    fn from(payload: WelcomePayload) -> Self {
        let mut map = Map::new();
        map.insert("message".into(), payload.message.into());
        map.insert("version".into(), payload.version.into());
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    // 1x1 white JPEG-like payload; contents are opaque to the gateway.
    const PIXEL_B64: &str = "/9j/4AAQSkZJRgABAQEASABIAAD/2wBDAP//////////////////////////////////////////////////////////////////////////////////////wgALCAABAAEBAREA/8QAFBABAAAAAAAAAAAAAAAAAAAAAP/aAAgBAQABPxA=";

    #[rstest]
    #[case(r#"{"type":"PING"}"#, EnvelopeType::Ping)]
    #[case(r#"{"type":"PONG"}"#, EnvelopeType::Pong)]
    #[case(r#"{"type":"FRAME","payload":{}}"#, EnvelopeType::Frame)]
    #[case(r#"{"type":"DETECTION_RESULT"}"#, EnvelopeType::DetectionResult)]
    #[case(r#"{"type":"SUBSCRIBE"}"#, EnvelopeType::Unknown)]
    fn test_envelope_type_parsing(#[case] raw: &str, #[case] expected: EnvelopeType) {
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.kind, expected);
        assert_eq!(envelope.timestamp, 0);
        assert!(envelope.client_id.is_none());
    }

    #[test]
    fn test_frame_envelope_without_timestamp() {
        let raw = format!(
            r#"{{"type":"FRAME","payload":{{"frame":"{}","timestamp":1700000000000,"sequence_number":7}}}}"#,
            PIXEL_B64
        );
        let envelope: Envelope = serde_json::from_str(&raw).unwrap();
        let frame = FramePayload::parse(&envelope.payload)
            .unwrap()
            .decode()
            .unwrap();

        assert_eq!(frame.sequence_number, 7);
        assert_eq!(frame.captured_at_ms, 1_700_000_000_000);
        assert!(!frame.data.is_empty());
    }

    #[test]
    fn test_frame_payload_accepts_data_url() {
        let payload = json!({
            "frame": format!("data:image/jpeg;base64,{}", PIXEL_B64),
            "timestamp": 1,
            "sequence_number": 2
        });
        let frame = FramePayload::parse(&payload).unwrap().decode().unwrap();
        assert_eq!(frame.data, STANDARD.decode(PIXEL_B64).unwrap());
    }

    #[rstest]
    #[case(json!({"frame": "", "timestamp": 1}), "EMPTY_FRAME")]
    #[case(json!({"frame": "***not base64***"}), "INVALID_BASE64")]
    #[case(json!({"timestamp": 1}), "INVALID_PAYLOAD")]
    #[case(json!("just a string"), "INVALID_PAYLOAD")]
    #[case(Value::Null, "INVALID_PAYLOAD")]
    fn test_frame_payload_rejections(#[case] payload: Value, #[case] code: &str) {
        let err = FramePayload::parse(&payload)
            .and_then(FramePayload::decode)
            .unwrap_err();
        assert_eq!(err.code(), code);
    }

    #[test]
    fn test_detection_envelope_serialization() {
        let envelope = Envelope::detection(
            "client-1",
            InferenceResult {
                is_drowsy: true,
                drowsiness_score: 0.91,
                alert_level: "high".to_string(),
                inference_time_ms: 12.3,
                sequence_number: 7,
            },
        );
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["type"], "DETECTION_RESULT");
        assert_eq!(json["client_id"], "client-1");
        assert_eq!(json["payload"]["is_drowsy"], true);
        assert_eq!(json["payload"]["alert_level"], "high");
        assert_eq!(json["payload"]["sequence_number"], 7);
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_detection_payload_keeps_decimal_scores() {
        let envelope = Envelope::detection(
            "client-1",
            InferenceResult {
                is_drowsy: true,
                drowsiness_score: 0.91,
                alert_level: "high".to_string(),
                inference_time_ms: 12.3,
                sequence_number: 7,
            },
        );
        let text = serde_json::to_string(&envelope.payload).unwrap();
        assert_eq!(
            text,
            r#"{"alert_level":"high","drowsiness_score":0.91,"inference_time_ms":12.3,"is_drowsy":true,"sequence_number":7}"#
        );
    }

    #[test]
    fn test_error_payload_omits_unknown_sequence() {
        let payload = Value::from(ErrorPayload::new("INVALID_JSON", "bad"));
        assert_eq!(payload, json!({"code": "INVALID_JSON", "message": "bad"}));

        let payload = Value::from(ErrorPayload::new("BACKEND_TIMEOUT", "slow").with_sequence(4));
        assert_eq!(payload["sequence_number"], 4);
    }

    #[test]
    fn test_error_envelope_echoes_sequence() {
        let envelope = Envelope::error(
            "client-1",
            ErrorPayload::new("BACKEND_TIMEOUT", "Backend call timed out").with_sequence(3),
        );
        let payload: ErrorPayload = envelope.payload_as().unwrap();
        assert_eq!(payload.code, "BACKEND_TIMEOUT");
        assert_eq!(payload.sequence_number, Some(3));
    }

    #[test]
    fn test_pong_has_no_payload() {
        let json = serde_json::to_string(&Envelope::pong("c")).unwrap();
        assert!(json.contains(r#""type":"PONG""#));
        assert!(!json.contains("payload"));
    }

    #[test]
    fn test_welcome_payload() {
        let envelope = Envelope::welcome("client-9");
        let payload: WelcomePayload = envelope.payload_as().unwrap();
        assert_eq!(payload.version, PROTOCOL_VERSION);
        assert_eq!(envelope.client_id.as_deref(), Some("client-9"));
    }
}
