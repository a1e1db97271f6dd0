use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::inference::GatewayState;
use crate::metrics::MetricsSnapshot;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub backend_state: GatewayState,
    pub grpc_ok: bool,
    pub http_ok: bool,
    pub active_clients: usize,
    pub timestamp: i64,
}

/// GET /api/health - checks the backend on every call
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let grpc_ok = state.gateway.health_check().await;

    Json(HealthResponse {
        status: if grpc_ok { "healthy" } else { "degraded" },
        backend_state: state.gateway.state(),
        grpc_ok,
        http_ok: state.hub.is_accepting(),
        active_clients: state.hub.session_count().await,
        timestamp: Utc::now().timestamp(),
    })
}

/// GET /api/metrics
async fn metrics_json(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// GET /metrics - Prometheus exposition
async fn metrics_text(State(state): State<Arc<AppState>>) -> Response {
    let ready = state.gateway.state() == GatewayState::Ready;
    match state.metrics.render_prometheus(ready) {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body)
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/metrics", get(metrics_json))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}
