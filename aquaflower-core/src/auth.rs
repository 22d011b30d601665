//! Bearer-token guard for the bridge's own REST API.
//!
//! `AQUAFLOWER_AUTH_TOKEN` (or `auth_token` in the YAML settings) sets one
//! shared token. Without it the API is open. `/api/health` and the AquaFlower
//! webhook route are mounted outside the guard.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use secrecy::{ExposeSecret, SecretString};

pub struct AuthConfig {
    token: Option<SecretString>,
}

impl AuthConfig {
    pub fn new(token: Option<String>) -> Self {
        let token = token.filter(|t| !t.is_empty()).map(SecretString::from);
        if token.is_some() {
            tracing::info!("Bridge API requires a bearer token");
        } else {
            tracing::warn!("Bridge API is open: AQUAFLOWER_AUTH_TOKEN not set");
        }
        Self { token }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    /// Constant-time comparison against the configured token.
    pub fn accepts(&self, presented: &str) -> bool {
        let Some(expected) = &self.token else {
            return true;
        };
        let expected = expected.expose_secret().as_bytes();
        let presented = presented.as_bytes();
        expected.len() == presented.len()
            && expected
                .iter()
                .zip(presented)
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }

    /// Whether a request carrying these headers may reach a guarded route.
    pub fn allows(&self, headers: &HeaderMap) -> bool {
        if !self.is_enabled() {
            return true;
        }
        bearer_token(headers).map_or(false, |token| self.accepts(token))
    }
}

/// Token from `Authorization: Bearer <token>`. Other schemes are ignored.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// axum middleware for the guarded routes.
pub async fn require_token(
    State(auth): State<Arc<AuthConfig>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if auth.allows(request.headers()) {
        Ok(next.run(request).await)
    } else {
        tracing::warn!(path = %request.uri().path(), "Rejected bridge API request without a valid token");
        Err(StatusCode::UNAUTHORIZED)
    }
}
