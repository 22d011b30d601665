//! Capability traits shared by the AquaFlower entities, plus the handle the
//! hub keeps for each of them.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};

use super::number::ZoneTimer;
use super::sensor::{ScheduleSensor, ZoneOnTimeSensor};
use super::switch::ZoneSwitch;
use super::DOMAIN;
use crate::state::{EntityState, StateMachine};

/// Identity of one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInfo {
    pub entity_id: String,
    pub unique_id: String,
    pub name: String,
}

/// Anything whose last-known state can be written to the hub.
pub trait Readable: Send + Sync {
    fn info(&self) -> &EntityInfo;

    fn available(&self) -> bool {
        true
    }

    fn state(&self) -> String;

    /// Entity-specific attributes. Identity attributes are added by
    /// `write_state`.
    fn attributes(&self) -> Map<String, Value>;

    fn write_state(&self, states: &StateMachine) -> EntityState {
        let info = self.info();
        let state = if self.available() {
            self.state()
        } else {
            "unavailable".to_string()
        };

        let mut attrs = self.attributes();
        attrs.insert("friendly_name".into(), Value::String(info.name.clone()));
        attrs.insert("unique_id".into(), Value::String(info.unique_id.clone()));
        attrs.insert("integration".into(), Value::String(DOMAIN.to_string()));

        states.set(&info.entity_id, state, attrs)
    }
}

/// Refreshes itself from the remote service.
pub trait Pollable: Readable {
    fn update(&self) -> impl Future<Output = ()> + Send;
}

/// User-issued commands routed from hub services.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    TurnOn,
    TurnOff,
    Toggle,
    SetValue(f64),
}

pub trait Commandable: Readable {
    /// Returns false when the entity does not support `command`.
    fn execute(&self, command: Command) -> impl Future<Output = bool> + Send;
}

/// Every entity kind this integration creates.
#[derive(Clone)]
pub enum AquaFlowerEntity {
    Switch(Arc<ZoneSwitch>),
    Timer(Arc<ZoneTimer>),
    OnTime(Arc<ZoneOnTimeSensor>),
    Schedule(Arc<ScheduleSensor>),
}

impl AquaFlowerEntity {
    pub fn readable(&self) -> &dyn Readable {
        match self {
            AquaFlowerEntity::Switch(e) => &**e as &dyn Readable,
            AquaFlowerEntity::Timer(e) => &**e as &dyn Readable,
            AquaFlowerEntity::OnTime(e) => &**e as &dyn Readable,
            AquaFlowerEntity::Schedule(e) => &**e as &dyn Readable,
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.readable().info().entity_id
    }

    pub fn name(&self) -> &str {
        &self.readable().info().name
    }

    pub async fn update(&self) {
        match self {
            AquaFlowerEntity::Switch(e) => e.update().await,
            AquaFlowerEntity::Timer(e) => e.update().await,
            AquaFlowerEntity::OnTime(e) => e.update().await,
            AquaFlowerEntity::Schedule(e) => e.update().await,
        }
    }

    pub async fn execute(&self, command: Command) -> bool {
        match self {
            AquaFlowerEntity::Switch(e) => e.execute(command).await,
            AquaFlowerEntity::Timer(e) => e.execute(command).await,
            AquaFlowerEntity::OnTime(_) | AquaFlowerEntity::Schedule(_) => {
                tracing::warn!(entity_id = %self.entity_id(), ?command, "Sensor entities accept no commands");
                false
            }
        }
    }
}

/// Hands out entity ids, suffixing `_2`, `_3`, ... on collision.
#[derive(Debug, Default)]
pub struct EntityIds {
    taken: HashSet<String>,
}

impl EntityIds {
    pub fn new<I: IntoIterator<Item = String>>(taken: I) -> Self {
        Self {
            taken: taken.into_iter().collect(),
        }
    }

    pub fn claim(&mut self, platform: &str, name: &str) -> String {
        let base = format!("{}.{}", platform, slugify(name));
        let mut candidate = base.clone();
        let mut n = 2;
        while self.taken.contains(&candidate) {
            candidate = format!("{}_{}", base, n);
            n += 1;
        }
        self.taken.insert(candidate.clone());
        candidate
    }
}

/// Convert a name to an entity-safe slug.
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Poison-tolerant lock: a panicked writer leaves plain data behind.
pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Yard - Zone 1"), "yard_zone_1");
        assert_eq!(slugify("Back Yard - Zone 6 Daily On Time"), "back_yard_zone_6_daily_on_time");
        assert_eq!(slugify("Morning (Schedule)"), "morning_schedule");
        assert_eq!(slugify("  Porch  "), "porch");
    }

    #[test]
    fn test_entity_ids_suffix_collisions() {
        let mut ids = EntityIds::new(vec!["switch.yard_zone_1".to_string()]);
        assert_eq!(ids.claim("switch", "Yard - Zone 1"), "switch.yard_zone_1_2");
        assert_eq!(ids.claim("switch", "Yard - Zone 1"), "switch.yard_zone_1_3");
        assert_eq!(ids.claim("number", "Yard - Zone 1 Timer"), "number.yard_zone_1_timer");
    }
}
