use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

/// Last written state of one hub entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub context_id: String,
}

/// Fired on every write, whether or not the state string moved.
#[derive(Debug, Clone, Serialize)]
pub struct StateChangedEvent {
    pub entity_id: String,
    pub old_state: Option<EntityState>,
    pub new_state: EntityState,
}

impl StateChangedEvent {
    /// True when the state string differs from the previous write.
    pub fn state_moved(&self) -> bool {
        self.old_state
            .as_ref()
            .map_or(true, |old| old.state != self.new_state.state)
    }
}

/// Entity state registry with a state_changed broadcast bus.
///
/// Writers are not reconciled: the most recent `set` for an entity wins.
pub struct StateMachine {
    states: DashMap<String, EntityState>,
    event_tx: broadcast::Sender<StateChangedEvent>,
}

impl StateMachine {
    pub fn new(channel_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(channel_capacity);
        Self {
            states: DashMap::new(),
            event_tx,
        }
    }

    pub fn get_all(&self) -> Vec<EntityState> {
        let mut all: Vec<EntityState> = self
            .states
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        all
    }

    pub fn get(&self, entity_id: &str) -> Option<EntityState> {
        self.states.get(entity_id).map(|entry| entry.value().clone())
    }

    /// Write an entity state and fire state_changed.
    pub fn set(&self, entity_id: &str, state: String, attributes: Map<String, Value>) -> EntityState {
        let now = Utc::now();
        let old_state = self.get(entity_id);

        let (last_changed, last_updated) = match &old_state {
            Some(prev) => {
                let changed = if prev.state != state { now } else { prev.last_changed };
                let updated = if prev.state != state || prev.attributes != attributes {
                    now
                } else {
                    prev.last_updated
                };
                (changed, updated)
            }
            None => (now, now),
        };

        let new_state = EntityState {
            entity_id: entity_id.to_string(),
            state,
            attributes,
            last_changed,
            last_updated,
            context_id: uuid::Uuid::new_v4().to_string(),
        };

        self.states.insert(entity_id.to_string(), new_state.clone());

        // No subscribers is fine
        let _ = self.event_tx.send(StateChangedEvent {
            entity_id: entity_id.to_string(),
            old_state,
            new_state: new_state.clone(),
        });

        new_state
    }

    /// Remove an entity. Returns true if it existed.
    pub fn remove(&self, entity_id: &str) -> bool {
        self.states.remove(entity_id).is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChangedEvent> {
        self.event_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let sm = StateMachine::new(16);
        assert!(sm.get("switch.yard_zone_1").is_none());

        sm.set("switch.yard_zone_1", "on".to_string(), Map::new());
        let st = sm.get("switch.yard_zone_1").unwrap();
        assert_eq!(st.state, "on");
        assert_eq!(sm.len(), 1);
    }

    #[test]
    fn test_last_changed_only_moves_on_state_change() {
        let sm = StateMachine::new(16);
        let first = sm.set("switch.a", "off".to_string(), Map::new());

        let mut attrs = Map::new();
        attrs.insert("friendly_name".into(), Value::String("A".into()));
        let second = sm.set("switch.a", "off".to_string(), attrs);

        assert_eq!(first.last_changed, second.last_changed);
        assert!(second.last_updated >= first.last_updated);
    }

    #[tokio::test]
    async fn test_set_fires_event() {
        let sm = StateMachine::new(16);
        let mut rx = sm.subscribe();

        sm.set("switch.a", "off".to_string(), Map::new());
        sm.set("switch.a", "on".to_string(), Map::new());
        sm.set("switch.a", "on".to_string(), Map::new());

        let first = rx.recv().await.unwrap();
        assert!(first.old_state.is_none());
        assert!(first.state_moved());

        let second = rx.recv().await.unwrap();
        assert_eq!(second.old_state.as_ref().unwrap().state, "off");
        assert_eq!(second.new_state.state, "on");
        assert!(second.state_moved());

        let third = rx.recv().await.unwrap();
        assert!(!third.state_moved());
    }

    #[test]
    fn test_remove() {
        let sm = StateMachine::new(16);
        sm.set("sensor.a", "1".to_string(), Map::new());
        assert!(sm.remove("sensor.a"));
        assert!(!sm.remove("sensor.a"));
        assert_eq!(sm.len(), 0);
    }
}
