//! Producer authentication.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};

use crate::config::AuthConfig;

/// Verified producer identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub sub: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing credentials")]
    MissingCredentials,
    #[error("Invalid Authorization header format")]
    InvalidFormat,
    #[error("Unknown credentials")]
    UnknownCredentials,
}

/// Supplies a verified identity before the hub accepts a connection.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthUser, AuthError>;
}

/// Accepts a bearer token or a `session_id` cookie found in a fixed table.
pub struct TokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl TokenAuthenticator {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    fn credential(headers: &HeaderMap) -> Result<Option<String>, AuthError> {
        if let Some(value) = headers.get(header::AUTHORIZATION) {
            let value = value.to_str().map_err(|_| AuthError::InvalidFormat)?;
            let token = value
                .strip_prefix("Bearer ")
                .ok_or(AuthError::InvalidFormat)?;
            return Ok(Some(token.trim().to_string()));
        }

        Ok(session_cookie(headers))
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthUser, AuthError> {
        let credential = Self::credential(headers)?.ok_or(AuthError::MissingCredentials)?;

        self.tokens
            .get(&credential)
            .map(|sub| AuthUser { sub: sub.clone() })
            .ok_or(AuthError::UnknownCredentials)
    }
}

/// Accepts every request. Used when authentication is disabled.
pub struct AnonymousAuthenticator;

#[async_trait]
impl Authenticator for AnonymousAuthenticator {
    async fn authenticate(&self, _headers: &HeaderMap) -> Result<AuthUser, AuthError> {
        Ok(AuthUser {
            sub: "anonymous".to_string(),
        })
    }
}

/// Pick the authenticator for a configuration.
pub fn from_config(config: &AuthConfig) -> Box<dyn Authenticator> {
    if config.enabled {
        Box::new(TokenAuthenticator::new(config.tokens.clone()))
    } else {
        tracing::warn!("Authentication disabled, accepting anonymous producers");
        Box::new(AnonymousAuthenticator)
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == "session_id")
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}
