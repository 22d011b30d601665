//! Per-zone watering timer, in minutes.

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use super::client::AquaFlowerClient;
use super::entity::{lock, Command, Commandable, EntityIds, EntityInfo, Pollable, Readable};
use super::models::{loose_number, Device, ZoneCommand};
use crate::hub::Hub;

pub const TIMER_MIN: f64 = 0.0;
pub const TIMER_MAX: f64 = 120.0;
pub const TIMER_STEP: f64 = 1.0;

struct TimerState {
    value: f64,
    available: bool,
}

pub struct ZoneTimer {
    info: EntityInfo,
    device_id: String,
    zone: u8,
    client: AquaFlowerClient,
    hub: Arc<Hub>,
    state: Mutex<TimerState>,
}

impl ZoneTimer {
    pub fn new(hub: Arc<Hub>, client: AquaFlowerClient, ids: &mut EntityIds, device: &Device, zone: u8) -> Self {
        let name = format!("{} - Zone {} Timer", device.display_name(), zone);
        Self {
            info: EntityInfo {
                entity_id: ids.claim("number", &name),
                unique_id: format!("{}_zone_{}_timer", device.device_id, zone),
                name,
            },
            device_id: device.device_id.clone(),
            zone,
            client,
            hub,
            state: Mutex::new(TimerState {
                value: 0.0,
                available: true,
            }),
        }
    }

    pub fn value(&self) -> f64 {
        lock(&self.state).value
    }

    /// Send `timer:<minutes>` to the zone. The local value only changes once
    /// the backend accepted it.
    pub async fn set_value(&self, value: f64) {
        if !value.is_finite() || !(TIMER_MIN..=TIMER_MAX).contains(&value) {
            tracing::warn!(
                entity_id = %self.info.entity_id,
                value,
                "Timer value outside {}..={} minutes, ignoring",
                TIMER_MIN,
                TIMER_MAX
            );
            return;
        }

        let minutes = value.trunc() as u32;
        match self
            .client
            .publish(&self.device_id, self.zone, ZoneCommand::Timer(minutes))
            .await
        {
            Ok(()) => {
                tracing::info!(entity_id = %self.info.entity_id, minutes, "Timer set");
                lock(&self.state).value = f64::from(minutes);
                self.write_state(&self.hub.states);
            }
            Err(e) => {
                tracing::error!(entity_id = %self.info.entity_id, "Failed to set timer: {}", e);
            }
        }
    }
}

/// Whole minutes from the backend's `timer`, which may arrive as an integer,
/// a float or a numeric string.
fn timer_minutes(timer: &Value) -> Option<f64> {
    loose_number(timer).map(f64::trunc)
}

impl Readable for ZoneTimer {
    fn info(&self) -> &EntityInfo {
        &self.info
    }

    fn available(&self) -> bool {
        lock(&self.state).available
    }

    fn state(&self) -> String {
        format_minutes(self.value())
    }

    fn attributes(&self) -> Map<String, Value> {
        let mut attrs = Map::new();
        attrs.insert("min".into(), Value::from(TIMER_MIN));
        attrs.insert("max".into(), Value::from(TIMER_MAX));
        attrs.insert("step".into(), Value::from(TIMER_STEP));
        attrs.insert("mode".into(), Value::String("box".into()));
        attrs.insert("unit_of_measurement".into(), Value::String("min".into()));
        attrs.insert("device_id".into(), Value::String(self.device_id.clone()));
        attrs.insert("zone".into(), Value::from(self.zone));
        attrs
    }
}

impl Pollable for ZoneTimer {
    async fn update(&self) {
        match self.client.zone_settings(&self.device_id, self.zone).await {
            Ok(settings) => {
                let mut st = lock(&self.state);
                st.available = true;
                match settings.timer.as_ref().and_then(timer_minutes) {
                    Some(minutes) => st.value = minutes,
                    None => {
                        tracing::warn!(entity_id = %self.info.entity_id, "No usable 'timer' in zone settings");
                    }
                }
            }
            Err(e) => {
                tracing::error!(entity_id = %self.info.entity_id, "Error fetching zone settings: {}", e);
                lock(&self.state).available = false;
            }
        }
        self.write_state(&self.hub.states);
    }
}

impl Commandable for ZoneTimer {
    async fn execute(&self, command: Command) -> bool {
        match command {
            Command::SetValue(value) => {
                self.set_value(value).await;
                true
            }
            _ => false,
        }
    }
}

/// Whole numbers render without a fractional part.
pub(super) fn format_minutes(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}
