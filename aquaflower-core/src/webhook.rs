//! Inbound webhooks.
//!
//! Integrations register a handler under a webhook id; the hub exposes
//! `POST /api/webhook/{webhook_id}` and routes parsed JSON bodies to it.
//! The id is the only secret: there is no other authentication.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Router,
};
use dashmap::DashMap;
use serde_json::Value;

use crate::hub::Hub;

/// Handler invoked with the hub, the webhook id and the parsed body.
pub type WebhookHandlerFn = Arc<dyn Fn(&Hub, &str, Value) + Send + Sync>;

struct RegisteredWebhook {
    domain: String,
    name: String,
    handler: WebhookHandlerFn,
}

pub struct WebhookRegistry {
    hooks: DashMap<String, RegisteredWebhook>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self {
            hooks: DashMap::new(),
        }
    }

    /// Register a handler. A second registration under the same id replaces
    /// the first.
    pub fn register(&self, domain: &str, name: &str, webhook_id: &str, handler: WebhookHandlerFn) {
        let previous = self.hooks.insert(
            webhook_id.to_string(),
            RegisteredWebhook {
                domain: domain.to_string(),
                name: name.to_string(),
                handler,
            },
        );
        if previous.is_some() {
            tracing::warn!(webhook_id = %webhook_id, "Replaced existing webhook handler");
        }
    }

    pub fn unregister(&self, webhook_id: &str) -> bool {
        self.hooks.remove(webhook_id).is_some()
    }

    pub fn contains(&self, webhook_id: &str) -> bool {
        self.hooks.contains_key(webhook_id)
    }

    fn handler(&self, webhook_id: &str) -> Option<(String, String, WebhookHandlerFn)> {
        self.hooks.get(webhook_id).map(|h| {
            (h.domain.clone(), h.name.clone(), h.handler.clone())
        })
    }
}

impl Default for WebhookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Externally reachable URL for a webhook id.
pub fn generate_url(external_url: &str, webhook_id: &str) -> String {
    format!("{}/api/webhook/{}", external_url.trim_end_matches('/'), webhook_id)
}

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/api/webhook/:webhook_id", post(receive))
        .with_state(hub)
}

/// Always answers 200 with an empty body so the sender learns nothing about
/// which ids exist.
async fn receive(
    State(hub): State<Arc<Hub>>,
    Path(webhook_id): Path<String>,
    body: Bytes,
) -> StatusCode {
    let Some((domain, name, handler)) = hub.webhooks.handler(&webhook_id) else {
        tracing::warn!(webhook_id = %webhook_id, "Received message for unregistered webhook");
        return StatusCode::OK;
    };

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(domain = %domain, webhook = %name, "Webhook body is not JSON: {}", e);
            return StatusCode::OK;
        }
    };

    tracing::debug!(domain = %domain, webhook = %name, "Handling webhook payload");
    handler(&hub, &webhook_id, payload);
    StatusCode::OK
}
