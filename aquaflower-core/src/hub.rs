use crate::dispatcher::Dispatcher;
use crate::state::StateMachine;
use crate::webhook::{self, WebhookRegistry};

/// Host facilities shared by every integration: entity states, the signal
/// dispatcher and the webhook table.
pub struct Hub {
    pub states: StateMachine,
    pub dispatcher: Dispatcher,
    pub webhooks: WebhookRegistry,
    external_url: String,
}

impl Hub {
    pub fn new(external_url: &str) -> Self {
        Self {
            states: StateMachine::new(4096),
            dispatcher: Dispatcher::new(),
            webhooks: WebhookRegistry::new(),
            external_url: external_url.to_string(),
        }
    }

    pub fn webhook_url(&self, webhook_id: &str) -> String {
        webhook::generate_url(&self.external_url, webhook_id)
    }
}
