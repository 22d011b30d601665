//! Wire types for the AquaFlower REST API.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Zones per controller. Fixed by the hardware, never discovered.
pub const ZONES_PER_DEVICE: u8 = 6;

/// Identifier fields the backend sends either as strings or as numbers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FlexId {
    Text(String),
    Number(i64),
}

impl FlexId {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FlexId::Text(s) => s.trim().parse().ok(),
            FlexId::Number(n) => Some(*n),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, FlexId::Text(s) if s.is_empty())
    }
}

impl fmt::Display for FlexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlexId::Text(s) => f.write_str(s),
            FlexId::Number(n) => write!(f, "{}", n),
        }
    }
}

/// Deserialize a string-or-number id straight into its string form.
fn flex_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    FlexId::deserialize(deserializer).map(|id| id.to_string())
}

/// A JSON number, or a string holding one. Anything else is `None`.
pub fn loose_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

/// POST /login response.
#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    #[serde(rename = "accessToken", default)]
    pub access_token: Option<String>,
    #[serde(rename = "userId", default)]
    pub user_id: Option<FlexId>,
}

/// Authenticated account returned by a successful login.
#[derive(Debug, Clone)]
pub struct Session {
    pub access_token: String,
    pub user_id: String,
}

/// One controller from GET /devices.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Device {
    #[serde(deserialize_with = "flex_string")]
    pub device_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl Device {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.device_id)
    }
}

/// One watering program from GET /schedules/{device_id}.
#[derive(Debug, Clone, Deserialize)]
pub struct Schedule {
    pub id: FlexId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub zones: Vec<Value>,
    #[serde(default)]
    pub days: Vec<Value>,
    #[serde(rename = "startTime", default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub duration: Option<Value>,
    #[serde(rename = "isActive", default)]
    pub is_active: Option<bool>,
    #[serde(rename = "rainMode", default)]
    pub rain_mode: Option<Value>,
    #[serde(default)]
    pub rain_amount: Option<Value>,
    #[serde(default)]
    pub look_back_time: Option<Value>,
    #[serde(default)]
    pub look_forward_time: Option<Value>,
    #[serde(rename = "updatedAt", default)]
    pub updated_at: Option<String>,
}

impl Schedule {
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| format!("Schedule {}", self.id))
    }

    /// Entity attributes surfaced for this schedule.
    pub fn attributes(&self) -> Map<String, Value> {
        let mut attrs = Map::new();
        attrs.insert("zones".into(), Value::Array(self.zones.clone()));
        attrs.insert("days".into(), Value::Array(self.days.clone()));
        attrs.insert("start_time".into(), opt_string(&self.start_time));
        attrs.insert("duration".into(), self.duration.clone().unwrap_or(Value::Null));
        attrs.insert("is_active".into(), self.is_active.map(Value::Bool).unwrap_or(Value::Null));
        attrs.insert("rain_mode".into(), self.rain_mode.clone().unwrap_or(Value::Null));
        attrs.insert("rain_threshold".into(), self.rain_amount.clone().unwrap_or(Value::Null));
        attrs.insert("look_back_time".into(), self.look_back_time.clone().unwrap_or(Value::Null));
        attrs.insert("look_forward_time".into(), self.look_forward_time.clone().unwrap_or(Value::Null));
        attrs.insert("last_updated".into(), opt_string(&self.updated_at));
        attrs
    }
}

fn opt_string(v: &Option<String>) -> Value {
    v.clone().map(Value::String).unwrap_or(Value::Null)
}

/// GET /device/{id}/zone/{n}/status
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ZoneStatus {
    #[serde(default)]
    pub state: Option<Value>,
    #[serde(default)]
    pub action: Option<Value>,
}

impl ZoneStatus {
    /// On/off as reported, preferring `state` over `action`. None when the
    /// backend sent neither.
    pub fn is_on(&self) -> Option<bool> {
        self.state
            .as_ref()
            .or(self.action.as_ref())
            .map(|v| v.as_str() == Some("on"))
    }
}

/// GET /zones/{id}/{n}
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ZoneSettings {
    #[serde(default)]
    pub timer: Option<Value>,
}

/// One row of GET /water-data/{user}/{device}.
#[derive(Debug, Clone, Deserialize)]
pub struct WaterData {
    #[serde(default)]
    pub zone_id: Option<FlexId>,
    #[serde(default)]
    pub daily_on_time: Option<Value>,
}

impl WaterData {
    /// Reported minutes. Missing or non-numeric values count as 0.
    pub fn minutes(&self) -> f64 {
        self.daily_on_time.as_ref().and_then(loose_number).unwrap_or(0.0)
    }
}

/// Action published to a zone's command topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneCommand {
    On,
    Off,
    Timer(u32),
}

impl ZoneCommand {
    pub fn action(&self) -> String {
        match self {
            ZoneCommand::On => "on".to_string(),
            ZoneCommand::Off => "off".to_string(),
            ZoneCommand::Timer(minutes) => format!("timer:{}", minutes),
        }
    }
}

/// POST /mqtt/publish body.
#[derive(Debug, Serialize)]
pub struct PublishRequest {
    pub topic: String,
    pub message: PublishMessage,
}

#[derive(Debug, Serialize)]
pub struct PublishMessage {
    pub action: String,
}

impl PublishRequest {
    pub fn new(device_id: &str, zone: u8, command: ZoneCommand) -> Self {
        Self {
            topic: format!("/device/{}/zone/{}/command", device_id, zone),
            message: PublishMessage {
                action: command.action(),
            },
        }
    }
}
