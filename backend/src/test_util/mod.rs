//! Helpers shared by unit and integration tests.

pub mod mock_backend;
pub mod transport;

pub use mock_backend::{MockBackend, MockConnector};
pub use transport::{memory_transport, CloseCounter, MemoryClient, RecordingSink};

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::task::TaskTracker;

use crate::config::{
    AuthConfig, BackendConfig, Config, CorsConfig, HubConfig, LoggingConfig, ServerConfig,
};
use crate::hub::{SessionConfig, SessionContext};
use crate::inference::InferenceGateway;
use crate::metrics::Metrics;
use crate::AppState;

/// Base64 of a 1x1 JPEG.
pub const PIXEL_B64: &str = "/9j/4AAQSkZJRgABAQEASABIAAD/2wBDAP//////////////////////////////////////////////////////////////////////////////////////wgALCAABAAEBAREA/8QAFBABAAAAAAAAAAAAAAAAAAAAAP/aAAgBAQABPxA=";

/// Bearer token accepted when auth is enabled via [`test_config_with_auth`].
pub const TEST_TOKEN: &str = "test-token";

pub fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            environment: "dev".to_string(),
        },
        backend: BackendConfig {
            url: "http://127.0.0.1:1".to_string(),
            connect_timeout_ms: 200,
            call_timeout_ms: 500,
            health_timeout_ms: 200,
            stream_open_timeout_ms: 500,
            ..BackendConfig::default()
        },
        hub: HubConfig {
            outbound_capacity: 16,
            enqueue_timeout_ms: 50,
            write_timeout_secs: 1,
            max_connections: 64,
            shutdown_grace_secs: 2,
            ..HubConfig::default()
        },
        cors: CorsConfig {
            origins: vec!["http://localhost:5000".to_string()],
        },
        auth: AuthConfig {
            enabled: false,
            tokens: HashMap::new(),
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
        },
    }
}

/// [`test_config`] in production mode with token auth for [`TEST_TOKEN`].
pub fn test_config_with_auth() -> Config {
    let mut config = test_config();
    config.server.environment = "production".to_string();
    config.auth = AuthConfig {
        enabled: true,
        tokens: HashMap::from([(TEST_TOKEN.to_string(), "test-user".to_string())]),
    };
    config
}

/// Session wiring around a gateway that is already `Ready` on `backend`.
pub async fn session_context(backend: Arc<MockBackend>) -> SessionContext {
    let config = test_config();
    let connector = Arc::new(MockConnector::new(backend));
    let gateway = InferenceGateway::connect(connector, config.backend.clone()).await;

    SessionContext {
        gateway: Arc::new(gateway),
        metrics: Arc::new(Metrics::new()),
        tracker: TaskTracker::new(),
        config: Arc::new(SessionConfig::new(&config.hub, &config.backend)),
    }
}

pub async fn create_test_state(backend: Arc<MockBackend>) -> Arc<AppState> {
    create_test_state_with(test_config(), Arc::new(MockConnector::new(backend))).await
}

pub async fn create_test_state_with(config: Config, connector: Arc<MockConnector>) -> Arc<AppState> {
    Arc::new(AppState::new(config, connector).await)
}
