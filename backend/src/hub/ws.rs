//! WebSocket handler for producer connections.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use serde::Deserialize;
use uuid::Uuid;

use super::SessionMode;
use crate::AppState;

/// Query parameters accepted on `/ws`.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub mode: SessionMode,
}

/// Which browser origins may open producer connections.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    allowed: Vec<String>,
    dev: bool,
}

impl OriginPolicy {
    pub fn new(origins: &[String], dev: bool) -> Self {
        Self {
            allowed: origins
                .iter()
                .map(|o| o.trim().trim_end_matches('/').to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            dev,
        }
    }

    pub fn allows_any(&self) -> bool {
        self.allowed.iter().any(|o| o == "*")
    }

    pub fn origins(&self) -> &[String] {
        &self.allowed
    }

    /// Disallowed origins are rejected, never mapped to a default.
    pub fn allows(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return self.dev;
        };
        let origin = origin.trim().trim_end_matches('/');

        if self.allows_any() || self.allowed.iter().any(|o| o == origin) {
            return true;
        }

        is_localhost(origin) && (self.dev || self.allowed.iter().any(|o| is_localhost(o)))
    }
}

fn is_localhost(origin: &str) -> bool {
    let authority = origin.split_once("://").map_or(origin, |(_, rest)| rest);
    let authority = authority.split('/').next().unwrap_or(authority);

    let host = if authority.starts_with('[') {
        authority
            .split_once(']')
            .map_or(authority, |(host, _)| host)
            .trim_start_matches('[')
    } else {
        authority.split(':').next().unwrap_or(authority)
    };

    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// WebSocket upgrade handler.
///
/// Admission order: origin, credentials, hub accepting, capacity.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());

    if !state.origins.allows(origin) {
        tracing::warn!("Rejected connection from {} with origin {:?}", addr, origin);
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    let user = match state.authenticator.authenticate(&headers).await {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!("Authentication failed for {}: {}", addr, e);
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    let client_id = params
        .client_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("client-{}", Uuid::new_v4()));

    if let Err(e) = state.hub.admit(&client_id).await {
        tracing::warn!("Refused client {} from {}: {}", client_id, addr, e);
        return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
    }

    tracing::info!("Producer {} ({}) connecting from {}", client_id, user.sub, addr);

    let hub = state.hub.clone();
    let mode = params.mode;
    ws.max_message_size(state.config.hub.max_message_size())
        .on_upgrade(move |socket| async move {
            let (writer, reader) = socket.split();
            hub.serve(client_id, user.sub, mode, reader, writer).await;
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy(origins: &[&str], dev: bool) -> OriginPolicy {
        let origins: Vec<String> = origins.iter().map(|o| o.to_string()).collect();
        OriginPolicy::new(&origins, dev)
    }

    #[rstest]
    #[case(&["https://app.example.com"], false, Some("https://app.example.com"), true)]
    #[case(&["https://app.example.com/"], false, Some("https://app.example.com"), true)]
    #[case(&["https://app.example.com"], false, Some("https://evil.example.com"), false)]
    #[case(&["*"], false, Some("https://anything.example"), true)]
    #[case(&["http://localhost:5000"], false, Some("http://localhost:3000"), true)]
    #[case(&["http://localhost:5000"], false, Some("http://127.0.0.1:8080"), true)]
    #[case(&["https://app.example.com"], false, Some("http://localhost:3000"), false)]
    #[case(&["https://app.example.com"], true, Some("http://localhost:3000"), true)]
    #[case(&["https://app.example.com"], true, Some("http://[::1]:3000"), true)]
    #[case(&["https://app.example.com"], false, None, false)]
    #[case(&["https://app.example.com"], true, None, true)]
    fn test_origin_policy(
        #[case] origins: &[&str],
        #[case] dev: bool,
        #[case] origin: Option<&str>,
        #[case] allowed: bool,
    ) {
        assert_eq!(policy(origins, dev).allows(origin), allowed);
    }

    #[test]
    fn test_localhost_lookalike_is_rejected() {
        let policy = policy(&["http://localhost:5000"], true);
        assert!(!policy.allows(Some("http://localhost.evil.com")));
        assert!(!policy.allows(Some("http://127.0.0.1.evil.com")));
    }

    #[test]
    fn test_connect_params() {
        let params: ConnectParams =
            serde_json::from_value(serde_json::json!({"clientId": "cam-1", "mode": "stream"}))
                .unwrap();
        assert_eq!(params.client_id.as_deref(), Some("cam-1"));
        assert_eq!(params.mode, SessionMode::Stream);

        let params: ConnectParams = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(params.mode, SessionMode::Unary);
    }
}
