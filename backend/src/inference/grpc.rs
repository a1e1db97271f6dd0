//! gRPC client for the scoring service.
//!
//! Messages are declared by hand with `prost` derives so no build script or
//! `protoc` is needed. Field tags follow the service's `drowsiness.proto`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use drowsy_common::{Frame, InferenceResult};
use futures_util::{stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;

use crate::config::BackendConfig;
use crate::error::{GatewayError, Result};

use super::{BackendConnector, BackendHealth, DetectionBackend, DetectionStream};

/// Protobuf messages exchanged with the scoring service.
pub mod pb {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct VideoFrame {
        #[prost(bytes = "vec", tag = "1")]
        pub frame_data: ::prost::alloc::vec::Vec<u8>,
        #[prost(int64, tag = "2")]
        pub timestamp: i64,
        #[prost(int32, tag = "3")]
        pub sequence_number: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DetectionResult {
        #[prost(bool, tag = "1")]
        pub is_drowsy: bool,
        #[prost(float, tag = "2")]
        pub drowsiness_score: f32,
        #[prost(bool, tag = "3")]
        pub eyes_looking_forward: bool,
        #[prost(float, tag = "4")]
        pub eye_direction_score: f32,
        #[prost(float, tag = "5")]
        pub head_angle: f32,
        #[prost(string, tag = "6")]
        pub alert_level: ::prost::alloc::string::String,
        #[prost(float, tag = "7")]
        pub inference_time_ms: f32,
        #[prost(int64, tag = "8")]
        pub timestamp: i64,
        #[prost(int64, tag = "9")]
        pub client_timestamp: i64,
        #[prost(int32, tag = "10")]
        pub sequence_number: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct HealthStatus {
        #[prost(string, tag = "1")]
        pub status: ::prost::alloc::string::String,
        #[prost(bool, tag = "2")]
        pub grpc_service: bool,
        #[prost(int32, tag = "3")]
        pub active_clients: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Empty {}
}

impl From<Frame> for pb::VideoFrame {
    fn from(frame: Frame) -> Self {
        Self {
            frame_data: frame.data,
            timestamp: frame.captured_at_ms,
            sequence_number: frame.sequence_number,
        }
    }
}

impl From<pb::DetectionResult> for InferenceResult {
    fn from(result: pb::DetectionResult) -> Self {
        Self {
            is_drowsy: result.is_drowsy,
            drowsiness_score: result.drowsiness_score,
            alert_level: result.alert_level,
            inference_time_ms: result.inference_time_ms,
            sequence_number: result.sequence_number,
        }
    }
}

impl From<pb::HealthStatus> for BackendHealth {
    fn from(status: pb::HealthStatus) -> Self {
        Self {
            status: status.status,
            serving: status.grpc_service,
        }
    }
}

/// RPC paths for one service name.
#[derive(Debug, Clone)]
struct MethodPaths {
    detect: PathAndQuery,
    stream: PathAndQuery,
    health: PathAndQuery,
}

impl MethodPaths {
    fn new(service: &str) -> Result<Self> {
        let path = |method: &str| {
            PathAndQuery::try_from(format!("/{}/{}", service, method))
                .map_err(|e| GatewayError::Dial(format!("invalid service name '{}': {}", service, e)))
        };

        Ok(Self {
            detect: path("DetectDrowsiness")?,
            stream: path("DetectDrowsinessStream")?,
            health: path("Health")?,
        })
    }
}

/// Connected gRPC client.
pub struct GrpcBackend {
    grpc: Grpc<Channel>,
    paths: MethodPaths,
    stream_capacity: usize,
}

impl GrpcBackend {
    pub fn new(channel: Channel, service: &str, max_message_size: usize) -> Result<Self> {
        let grpc = Grpc::new(channel)
            .max_decoding_message_size(max_message_size)
            .max_encoding_message_size(max_message_size);

        Ok(Self {
            grpc,
            paths: MethodPaths::new(service)?,
            stream_capacity: 32,
        })
    }

    /// Clone the client and wait until the channel can take a request.
    async fn ready_client(&self) -> Result<Grpc<Channel>> {
        let mut grpc = self.grpc.clone();
        grpc.ready()
            .await
            .map_err(|e| GatewayError::Transport(format!("service was not ready: {}", e)))?;
        Ok(grpc)
    }
}

#[async_trait]
impl DetectionBackend for GrpcBackend {
    async fn detect(&self, frame: Frame, deadline: Duration) -> Result<InferenceResult> {
        let mut grpc = self.ready_client().await?;

        let mut request = tonic::Request::new(pb::VideoFrame::from(frame));
        request.set_timeout(deadline);

        let codec = ProstCodec::<pb::VideoFrame, pb::DetectionResult>::default();
        let response = grpc
            .unary(request, self.paths.detect.clone(), codec)
            .await
            .map_err(|status| match status.code() {
                Code::DeadlineExceeded => GatewayError::Timeout(deadline),
                _ => GatewayError::from(status),
            })?;

        Ok(response.into_inner().into())
    }

    async fn open_stream(&self) -> Result<DetectionStream> {
        let mut grpc = self.grpc.clone();
        let path = self.paths.stream.clone();

        let (tx, rx) = mpsc::channel::<Frame>(self.stream_capacity);
        let outbound = ReceiverStream::new(rx).map(pb::VideoFrame::from);

        // The service sends its response headers only after reading the first
        // frame, so the call must not be awaited before `tx` is handed out.
        // It starts on the first poll of the result stream.
        let call = async move {
            grpc.ready()
                .await
                .map_err(|e| GatewayError::Transport(format!("service was not ready: {}", e)))?;

            let codec = ProstCodec::<pb::VideoFrame, pb::DetectionResult>::default();
            let response = grpc
                .streaming(tonic::Request::new(outbound), path, codec)
                .await?;
            Ok::<_, GatewayError>(response.into_inner())
        };

        let results = stream::once(call)
            .map(|opened| match opened {
                Ok(inbound) => inbound
                    .map(|item| item.map(InferenceResult::from).map_err(GatewayError::from))
                    .boxed(),
                Err(e) => stream::iter([Err(e)]).boxed(),
            })
            .flatten()
            .boxed();

        Ok(DetectionStream::new(tx, results))
    }

    async fn health(&self, deadline: Duration) -> Result<BackendHealth> {
        let mut grpc = self.ready_client().await?;

        let mut request = tonic::Request::new(pb::Empty {});
        request.set_timeout(deadline);

        let codec = ProstCodec::<pb::Empty, pb::HealthStatus>::default();
        let response = grpc.unary(request, self.paths.health.clone(), codec).await?;

        Ok(response.into_inner().into())
    }
}

/// Dials the scoring service over HTTP/2.
pub struct GrpcConnector {
    config: BackendConfig,
    endpoint: String,
}

impl GrpcConnector {
    pub fn new(config: BackendConfig) -> Self {
        let endpoint = config.endpoint();
        Self { config, endpoint }
    }
}

#[async_trait]
impl BackendConnector for GrpcConnector {
    fn target(&self) -> &str {
        &self.endpoint
    }

    async fn dial(&self) -> Result<Arc<dyn DetectionBackend>> {
        let channel = Endpoint::from_shared(self.endpoint.clone())
            .map_err(|e| GatewayError::Dial(e.to_string()))?
            .connect_timeout(self.config.connect_timeout())
            .http2_keep_alive_interval(Duration::from_secs(self.config.keepalive_interval_secs))
            .keep_alive_timeout(Duration::from_secs(self.config.keepalive_timeout_secs))
            .keep_alive_while_idle(true)
            .connect()
            .await
            .map_err(|e| GatewayError::Dial(e.to_string()))?;

        let backend = GrpcBackend::new(
            channel,
            &self.config.service,
            self.config.max_message_size(),
        )?;

        Ok(Arc::new(backend))
    }
}
