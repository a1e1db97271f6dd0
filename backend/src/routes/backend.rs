use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::post, Json, Router};
use serde::Serialize;

use crate::inference::GatewayState;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct RedialResponse {
    pub state: GatewayState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// POST /api/backend/redial - the only way out of `disconnected`
async fn redial(State(state): State<Arc<AppState>>) -> (StatusCode, Json<RedialResponse>) {
    tracing::info!("Backend redial requested for {}", state.gateway.target());

    match state.gateway.redial().await {
        Ok(backend_state) => (
            StatusCode::OK,
            Json(RedialResponse {
                state: backend_state,
                error: None,
            }),
        ),
        Err(e) => {
            tracing::warn!("Backend redial failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(RedialResponse {
                    state: state.gateway.state(),
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/backend/redial", post(redial))
        .with_state(state)
}
