use axum::{
    extract::{Query, Request},
    http::{StatusCode, Uri},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::Instrument;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::hub::ws::ConnectParams;

/// Install the global subscriber. `RUST_LOG` wins over `default_level`.
pub fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Middleware that logs HTTP requests at INFO level.
///
/// Requests naming a producer (`/ws?clientId=...`) run inside a span carrying
/// that id, so auth and admission logs from the handler can be traced to it.
/// The session's own lifecycle is logged by the hub.
pub async fn request_logger(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client_id = requested_client_id(request.uri()).unwrap_or_else(|| "-".to_string());

    let span = tracing::info_span!("request", client_id = %client_id);
    let response = next.run(request).instrument(span).await;
    let status = response.status();

    if status == StatusCode::SWITCHING_PROTOCOLS {
        tracing::info!(
            path = %path,
            client_id = %client_id,
            duration_ms = %start.elapsed().as_millis(),
            "WebSocket upgrade"
        );
    } else {
        tracing::info!(
            method = %method,
            path = %path,
            client_id = %client_id,
            status = %status.as_u16(),
            duration_ms = %start.elapsed().as_millis(),
            "HTTP request"
        );
    }

    response
}

/// Client id a producer asked for in the query string, if any.
fn requested_client_id(uri: &Uri) -> Option<String> {
    let Query(params) = Query::<ConnectParams>::try_from_uri(uri).ok()?;
    params
        .client_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}
