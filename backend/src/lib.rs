pub mod auth;
pub mod config;
pub mod error;
pub mod hub;
pub mod inference;
pub mod logging;
pub mod metrics;
pub mod relay;
pub mod routes;
pub mod test_util;

pub use auth::{AnonymousAuthenticator, AuthUser, Authenticator, TokenAuthenticator};
pub use config::Config;
pub use error::GatewayError;
pub use hub::{ClientSession, ConnectionRegistry, Hub, SessionMode};
pub use inference::{BackendConnector, DetectionBackend, GatewayState, GrpcConnector, InferenceGateway};
pub use metrics::{Metrics, MetricsSnapshot};
pub use relay::{RelayOutcome, StreamRelay};

use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::{middleware, routing::get, Router};
use tokio_util::task::TaskTracker;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::hub::ws::{ws_handler, OriginPolicy};
use crate::hub::{SessionConfig, SessionContext, ShutdownReport};

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Single shared handle to the scoring backend.
    pub gateway: Arc<InferenceGateway>,
    /// Producer sessions.
    pub hub: Arc<Hub>,
    pub metrics: Arc<Metrics>,
    /// Verifies producers before upgrade.
    pub authenticator: Box<dyn Authenticator>,
    /// Browser origins allowed to connect.
    pub origins: OriginPolicy,
}

impl AppState {
    /// Dial the backend and assemble the hub. A failed dial is not fatal.
    pub async fn new(config: Config, connector: Arc<dyn BackendConnector>) -> Self {
        let gateway = Arc::new(InferenceGateway::connect(connector, config.backend.clone()).await);
        let metrics = Arc::new(Metrics::new());

        let ctx = SessionContext {
            gateway: gateway.clone(),
            metrics: metrics.clone(),
            tracker: TaskTracker::new(),
            config: Arc::new(SessionConfig::new(&config.hub, &config.backend)),
        };
        let hub = Arc::new(Hub::new(ctx, config.hub.max_connections));

        Self {
            authenticator: auth::from_config(&config.auth),
            origins: OriginPolicy::new(&config.cors.origins, config.server.is_dev()),
            gateway,
            hub,
            metrics,
            config,
        }
    }

    /// Stop accepting producers, close every session, then release the backend.
    pub async fn shutdown(&self) -> ShutdownReport {
        let report = self.hub.shutdown(self.config.hub.shutdown_grace()).await;
        if report.forced {
            tracing::warn!("Shutdown grace period elapsed, remaining work was cancelled");
        }

        self.gateway.close().await;
        tracing::info!(
            "Shutdown complete: {} sessions closed, forced={}",
            report.sessions_closed,
            report.forced
        );
        report
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let rest = Router::new()
        .merge(routes::health::router(state.clone()))
        .merge(routes::backend::router(state.clone()))
        .layer(cors_layer(&state.origins));

    let ws = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state);

    Router::new()
        .merge(rest)
        .merge(ws)
        .layer(middleware::from_fn(logging::request_logger))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &OriginPolicy) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    if origins.allows_any() {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .origins()
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}
