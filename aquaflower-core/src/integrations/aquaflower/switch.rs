//! Zone on/off switch.

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::client::AquaFlowerClient;
use super::entity::{lock, Command, Commandable, EntityIds, EntityInfo, Pollable, Readable};
use super::models::{Device, ZoneCommand};
use super::update_signal;
use crate::hub::Hub;

struct SwitchState {
    is_on: bool,
    available: bool,
}

pub struct ZoneSwitch {
    info: EntityInfo,
    device_id: String,
    zone: u8,
    client: AquaFlowerClient,
    hub: Arc<Hub>,
    state: Mutex<SwitchState>,
}

impl ZoneSwitch {
    pub fn new(hub: Arc<Hub>, client: AquaFlowerClient, ids: &mut EntityIds, device: &Device, zone: u8) -> Self {
        let name = format!("{} - Zone {}", device.display_name(), zone);
        Self {
            info: EntityInfo {
                entity_id: ids.claim("switch", &name),
                unique_id: format!("{}_zone_{}", device.device_id, zone),
                name,
            },
            device_id: device.device_id.clone(),
            zone,
            client,
            hub,
            state: Mutex::new(SwitchState {
                is_on: false,
                available: true,
            }),
        }
    }

    pub fn is_on(&self) -> bool {
        lock(&self.state).is_on
    }

    pub async fn turn_on(&self) {
        self.send_command(ZoneCommand::On).await;
    }

    pub async fn turn_off(&self) {
        self.send_command(ZoneCommand::Off).await;
    }

    /// Publish the command; only a successful publish flips the local flag.
    async fn send_command(&self, command: ZoneCommand) {
        match self.client.publish(&self.device_id, self.zone, command).await {
            Ok(()) => {
                tracing::info!(entity_id = %self.info.entity_id, "Sent command '{}'", command.action());
                lock(&self.state).is_on = command == ZoneCommand::On;
                self.write_state(&self.hub.states);
            }
            Err(e) => {
                tracing::error!(
                    entity_id = %self.info.entity_id,
                    "Failed to send command '{}': {}",
                    command.action(),
                    e
                );
            }
        }
    }

    /// Apply a state pushed through the webhook.
    pub fn apply_push(&self, pushed: &Value) {
        let Some(is_on) = parse_pushed_state(pushed) else {
            tracing::warn!(entity_id = %self.info.entity_id, state = %pushed, "Ignoring unrecognised pushed state");
            return;
        };
        tracing::info!(entity_id = %self.info.entity_id, is_on, "Applying webhook update");
        {
            let mut st = lock(&self.state);
            st.is_on = is_on;
            st.available = true;
        }
        self.write_state(&self.hub.states);
    }

    /// Listen for webhook pushes addressed to this zone.
    pub fn listen_for_pushes(self: &Arc<Self>) -> JoinHandle<()> {
        let switch = Arc::clone(self);
        let mut rx = self
            .hub
            .dispatcher
            .connect(&update_signal(&self.device_id, &self.zone.to_string()));

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(pushed) => switch.apply_push(&pushed),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(entity_id = %switch.info.entity_id, skipped, "Webhook listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

/// "on"/"off" strings, booleans, or 1/0.
fn parse_pushed_state(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "on" => Some(true),
            "off" => Some(false),
            _ => None,
        },
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        _ => None,
    }
}

impl Readable for ZoneSwitch {
    fn info(&self) -> &EntityInfo {
        &self.info
    }

    fn available(&self) -> bool {
        lock(&self.state).available
    }

    fn state(&self) -> String {
        let state = if self.is_on() { "on" } else { "off" };
        state.to_string()
    }

    fn attributes(&self) -> Map<String, Value> {
        let mut attrs = Map::new();
        attrs.insert("device_id".into(), Value::String(self.device_id.clone()));
        attrs.insert("zone".into(), Value::from(self.zone));
        attrs.insert("entity_category".into(), Value::String("config".into()));
        attrs
    }
}

impl Pollable for ZoneSwitch {
    /// Reconcile with the backend. The availability flag is the only place a
    /// failure becomes visible.
    async fn update(&self) {
        match self.client.zone_status(&self.device_id, self.zone).await {
            Ok(status) => {
                let mut st = lock(&self.state);
                st.available = true;
                match status.is_on() {
                    Some(is_on) => {
                        if st.is_on != is_on {
                            tracing::info!(
                                device_id = %self.device_id,
                                zone = self.zone,
                                is_on,
                                "Zone state updated"
                            );
                        }
                        st.is_on = is_on;
                    }
                    None => {
                        tracing::warn!(entity_id = %self.info.entity_id, "Missing 'state' or 'action' field in status response");
                    }
                }
            }
            Err(e) => {
                tracing::error!(entity_id = %self.info.entity_id, "Error fetching status: {}", e);
                lock(&self.state).available = false;
            }
        }
        self.write_state(&self.hub.states);
    }
}

impl Commandable for ZoneSwitch {
    async fn execute(&self, command: Command) -> bool {
        match command {
            Command::TurnOn => self.turn_on().await,
            Command::TurnOff => self.turn_off().await,
            Command::Toggle => {
                if self.is_on() {
                    self.turn_off().await
                } else {
                    self.turn_on().await
                }
            }
            Command::SetValue(_) => return false,
        }
        true
    }
}
