//! Configuration for the gateway.

use std::collections::HashMap;
use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Upper bound on a single per-frame backend call.
pub const MAX_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// `dev` relaxes the origin policy for local development.
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl ServerConfig {
    pub fn is_dev(&self) -> bool {
        self.environment == "dev"
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
        }
    }
}

/// Connection settings for the scoring backend.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// gRPC endpoint, e.g. "http://localhost:9000". A bare host:port gets `http://`.
    #[serde(default = "default_backend_url")]
    pub url: String,
    /// Fully qualified gRPC service name.
    #[serde(default = "default_backend_service")]
    pub service: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_stream_open_timeout_ms")]
    pub stream_open_timeout_ms: u64,
    #[serde(default = "default_max_message_size_mb")]
    pub max_message_size_mb: usize,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,
}

impl BackendConfig {
    /// Endpoint URL with a scheme.
    pub fn endpoint(&self) -> String {
        if self.url.contains("://") {
            self.url.clone()
        } else {
            format!("http://{}", self.url)
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Per-frame deadline, never longer than [`MAX_CALL_TIMEOUT`].
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms).min(MAX_CALL_TIMEOUT)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn stream_open_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_open_timeout_ms)
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size_mb * 1024 * 1024
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            service: default_backend_service(),
            connect_timeout_ms: default_connect_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            health_timeout_ms: default_health_timeout_ms(),
            stream_open_timeout_ms: default_stream_open_timeout_ms(),
            max_message_size_mb: default_max_message_size_mb(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_timeout_secs: default_keepalive_timeout(),
        }
    }
}

/// Producer connection handling.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Capacity of each session's outbound queue.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    /// How long a producer of outbound messages waits on a full queue before dropping.
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_message_size_mb")]
    pub max_message_size_mb: usize,
    #[serde(default = "default_frames_per_minute")]
    pub frames_per_minute: u32,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_per_session: usize,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl HubConfig {
    pub fn max_message_size(&self) -> usize {
        self.max_message_size_mb * 1024 * 1024
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: default_outbound_capacity(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            max_connections: default_max_connections(),
            max_message_size_mb: default_max_message_size_mb(),
            frames_per_minute: default_frames_per_minute(),
            max_in_flight_per_session: default_max_in_flight(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    /// Allowed browser origins. `*` allows any origin.
    #[serde(default = "default_origins")]
    pub origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origins: default_origins(),
        }
    }
}

/// Credentials accepted from producers.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maps a credential (bearer token or `session_id` cookie) to a subject.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            tokens: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8081
}
fn default_environment() -> String {
    "production".to_string()
}
fn default_backend_url() -> String {
    "http://localhost:9000".to_string()
}
fn default_backend_service() -> String {
    "drowsiness.DrowsinessDetection".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_call_timeout_ms() -> u64 {
    5000
}
fn default_health_timeout_ms() -> u64 {
    2000
}
fn default_stream_open_timeout_ms() -> u64 {
    5000
}
fn default_max_message_size_mb() -> usize {
    50
}
fn default_keepalive_interval() -> u64 {
    10
}
fn default_keepalive_timeout() -> u64 {
    3
}
fn default_outbound_capacity() -> usize {
    256
}
fn default_enqueue_timeout_ms() -> u64 {
    100
}
fn default_heartbeat_interval() -> u64 {
    54
}
fn default_read_timeout() -> u64 {
    70
}
fn default_write_timeout() -> u64 {
    10
}
fn default_max_connections() -> usize {
    1000
}
fn default_frames_per_minute() -> u32 {
    1000
}
fn default_max_in_flight() -> usize {
    8
}
fn default_shutdown_grace() -> u64 {
    10
}
fn default_origins() -> Vec<String> {
    vec!["http://localhost:5000".to_string()]
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (GATEWAY__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Same as [`Config::load`] with an explicit file stem.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8081);
        assert!(!config.server.is_dev());
        assert_eq!(config.hub.outbound_capacity, 256);
        assert_eq!(config.hub.heartbeat_interval_secs, 54);
        assert_eq!(config.backend.service, "drowsiness.DrowsinessDetection");
        assert!(config.auth.enabled);
    }

    #[test]
    fn test_call_timeout_is_clamped() {
        let backend = BackendConfig {
            call_timeout_ms: 30_000,
            ..BackendConfig::default()
        };
        assert_eq!(backend.call_timeout(), MAX_CALL_TIMEOUT);

        let backend = BackendConfig {
            call_timeout_ms: 250,
            ..BackendConfig::default()
        };
        assert_eq!(backend.call_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_endpoint_adds_scheme() {
        let backend = BackendConfig {
            url: "localhost:9000".to_string(),
            ..BackendConfig::default()
        };
        assert_eq!(backend.endpoint(), "http://localhost:9000");

        let backend = BackendConfig {
            url: "https://scoring.internal:443".to_string(),
            ..BackendConfig::default()
        };
        assert_eq!(backend.endpoint(), "https://scoring.internal:443");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9090
environment = "dev"

[backend]
url = "scoring:9000"

[hub]
outbound_capacity = 16

[auth]
enabled = true

[auth.tokens]
secret-token = "user-42"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = Config::load_from(&path).unwrap();

        assert_eq!(config.server.port, 9090);
        assert!(config.server.is_dev());
        assert_eq!(config.backend.endpoint(), "http://scoring:9000");
        assert_eq!(config.hub.outbound_capacity, 16);
        assert_eq!(config.hub.read_timeout_secs, 70);
        assert_eq!(config.auth.tokens.get("secret-token").map(String::as_str), Some("user-42"));
    }
}
