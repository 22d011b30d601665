//! Push updates from the AquaFlower backend.

use serde::Deserialize;
use serde_json::Value;

use super::models::FlexId;
use super::update_signal;
use crate::hub::Hub;

/// Body the backend posts when a zone changes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ZonePush {
    pub device_id: String,
    pub zone_id: FlexId,
    pub state: Value,
}

/// Extract a complete `(device_id, zone_id, state)` triple. Each field must
/// be present and non-null, and the ids non-empty.
pub fn parse_push(payload: &Value) -> Result<ZonePush, String> {
    for field in ["device_id", "zone_id", "state"] {
        if payload.get(field).map_or(true, Value::is_null) {
            return Err(format!("missing `{}`", field));
        }
    }
    let push = ZonePush::deserialize(payload).map_err(|e| e.to_string())?;
    if push.device_id.is_empty() {
        return Err("empty `device_id`".to_string());
    }
    if push.zone_id.is_empty() {
        return Err("empty `zone_id`".to_string());
    }
    Ok(push)
}

/// Registered under the entry's webhook id. Re-broadcasts the pushed state on
/// the zone's update signal.
pub fn handle_webhook(hub: &Hub, webhook_id: &str, payload: Value) {
    tracing::info!(webhook_id = %webhook_id, "Received AquaFlower webhook");

    let push = match parse_push(&payload) {
        Ok(push) => push,
        Err(reason) => {
            tracing::error!(webhook_id = %webhook_id, payload = %payload, "Invalid webhook payload: {}", reason);
            return;
        }
    };

    let signal = update_signal(&push.device_id, &push.zone_id.to_string());
    let delivered = hub.dispatcher.send(&signal, push.state);
    tracing::debug!(signal = %signal, delivered, "Dispatched zone update");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_push_requires_all_fields() {
        let push = parse_push(&json!({"device_id": "D1", "zone_id": 3, "state": "on"})).unwrap();
        assert_eq!(push.device_id, "D1");
        assert_eq!(push.zone_id.to_string(), "3");
        assert_eq!(push.state, json!("on"));

        assert!(parse_push(&json!({"device_id": "D1", "state": "on"})).is_err());
        assert!(parse_push(&json!({"device_id": "D1", "zone_id": "3"})).is_err());
        assert!(parse_push(&json!({"zone_id": "3", "state": null, "device_id": "D1"})).is_err());
        assert!(parse_push(&json!({"device_id": "", "zone_id": "3", "state": "on"})).is_err());
        assert!(parse_push(&json!(["D1", 3, "on"])).is_err());
    }

    #[tokio::test]
    async fn test_handle_webhook_emits_signal() {
        let hub = Hub::new("http://hub.local");
        let mut rx = hub.dispatcher.connect("aquaflower_update_D1_3");

        handle_webhook(&hub, "aquaflower_u1", json!({"device_id": "D1", "zone_id": "3", "state": "off"}));
        assert_eq!(rx.recv().await.unwrap(), json!("off"));
    }

    #[tokio::test]
    async fn test_incomplete_payload_emits_nothing() {
        let hub = Hub::new("http://hub.local");
        let mut rx = hub.dispatcher.connect("aquaflower_update_D1_3");

        handle_webhook(&hub, "aquaflower_u1", json!({"device_id": "D1", "zone_id": "3"}));
        assert!(rx.try_recv().is_err());
    }
}
