//! In-progress setup and options flows, keyed by flow id.
//!
//! A flow is taken out of the table while a step runs and put back if it is
//! still waiting for input. Concurrent requests for the same flow id see it
//! as missing rather than racing on it.

use dashmap::DashMap;
use serde::Serialize;

use crate::integrations::aquaflower::config_flow::{ConfigFlow, FlowResult, OptionsFlow};

pub enum ActiveFlow {
    Config(ConfigFlow),
    Options { entry_id: String, flow: OptionsFlow },
}

/// Which endpoint family a flow belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Config,
    Options,
}

impl ActiveFlow {
    pub fn kind(&self) -> FlowKind {
        match self {
            ActiveFlow::Config(_) => FlowKind::Config,
            ActiveFlow::Options { .. } => FlowKind::Options,
        }
    }

    pub fn handler(&self) -> String {
        match self {
            ActiveFlow::Config(flow) => flow.handler().to_string(),
            ActiveFlow::Options { entry_id, .. } => entry_id.clone(),
        }
    }
}

pub struct FlowManager {
    flows: DashMap<String, ActiveFlow>,
}

impl FlowManager {
    pub fn new() -> Self {
        Self {
            flows: DashMap::new(),
        }
    }

    /// Register a new flow and return its id.
    pub fn start(&self, flow: ActiveFlow) -> String {
        let flow_id = uuid::Uuid::new_v4().simple().to_string();
        tracing::debug!(flow_id = %flow_id, handler = %flow.handler(), "Flow started");
        self.flows.insert(flow_id.clone(), flow);
        flow_id
    }

    /// Remove a flow of the given kind. A flow of the other kind stays put.
    pub fn take(&self, flow_id: &str, kind: FlowKind) -> Option<ActiveFlow> {
        self.flows
            .remove_if(flow_id, |_, flow| flow.kind() == kind)
            .map(|(_, flow)| flow)
    }

    pub fn put_back(&self, flow_id: &str, flow: ActiveFlow) {
        self.flows.insert(flow_id.to_string(), flow);
    }

    pub fn abort(&self, flow_id: &str, kind: FlowKind) -> bool {
        let removed = self.take(flow_id, kind).is_some();
        if removed {
            tracing::debug!(flow_id = %flow_id, "Flow aborted");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }
}

impl Default for FlowManager {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP reply for one flow step.
#[derive(Debug, Serialize)]
pub struct FlowReply<T: Serialize> {
    pub flow_id: String,
    pub handler: String,
    #[serde(flatten)]
    pub result: FlowResult<T>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::aquaflower::config_flow::{EntryData, EntryOptions};
    use serde_json::json;

    fn options_flow() -> ActiveFlow {
        let data: EntryData = serde_json::from_value(json!({
            "api_base_url": "http://api",
            "access_token": "tok",
            "user_id": "u1",
            "devices": ["D1"],
            "ha_ip": "10.0.0.2",
            "webhook_url": "http://hub/api/webhook/aquaflower_u1"
        }))
        .unwrap();
        ActiveFlow::Options {
            entry_id: "e1".into(),
            flow: OptionsFlow::new(&data, &EntryOptions::default()),
        }
    }

    #[test]
    fn test_take_and_put_back() {
        let manager = FlowManager::new();
        let id = manager.start(options_flow());
        assert_eq!(manager.len(), 1);

        let flow = manager.take(&id, FlowKind::Options).unwrap();
        assert_eq!(flow.handler(), "e1");
        assert!(manager.take(&id, FlowKind::Options).is_none());

        manager.put_back(&id, flow);
        assert!(manager.abort(&id, FlowKind::Options));
        assert!(!manager.abort(&id, FlowKind::Options));
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_kind_must_match() {
        let manager = FlowManager::new();
        let id = manager.start(options_flow());

        assert!(manager.take(&id, FlowKind::Config).is_none());
        assert!(!manager.abort(&id, FlowKind::Config));
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.take(&id, FlowKind::Options).map(|f| f.kind()), Some(FlowKind::Options));
    }

    #[test]
    fn test_reply_serialization() {
        let reply = FlowReply::<serde_json::Value> {
            flow_id: "f1".into(),
            handler: "aquaflower".into(),
            result: FlowResult::Abort {
                reason: "no_devices_found".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({
                "flow_id": "f1",
                "handler": "aquaflower",
                "type": "abort",
                "reason": "no_devices_found"
            })
        );
    }
}
