//! Read-only sensors: daily on-time per zone and one entity per schedule.

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::client::AquaFlowerClient;
use super::entity::{lock, EntityIds, EntityInfo, Pollable, Readable};
use super::models::{Device, FlexId, Schedule, WaterData};
use super::number::format_minutes;
use crate::hub::Hub;

// ── Daily on-time ───────────────────────────────────────────

pub struct ZoneOnTimeSensor {
    info: EntityInfo,
    user_id: String,
    device_id: String,
    zone: u8,
    switch_entity_id: String,
    client: AquaFlowerClient,
    hub: Arc<Hub>,
    minutes: Mutex<f64>,
}

impl ZoneOnTimeSensor {
    pub fn new(
        hub: Arc<Hub>,
        client: AquaFlowerClient,
        ids: &mut EntityIds,
        user_id: &str,
        device: &Device,
        zone: u8,
        switch_entity_id: &str,
    ) -> Self {
        let name = format!("{} - Zone {} Daily On Time", device.display_name(), zone);
        Self {
            info: EntityInfo {
                entity_id: ids.claim("sensor", &name),
                unique_id: format!("{}_zone_{}_on_time", device.device_id, zone),
                name,
            },
            user_id: user_id.to_string(),
            device_id: device.device_id.clone(),
            zone,
            switch_entity_id: switch_entity_id.to_string(),
            client,
            hub,
            minutes: Mutex::new(0.0),
        }
    }

    pub fn minutes(&self) -> f64 {
        *lock(&self.minutes)
    }

    /// Refresh whenever the zone switch flips, without waiting for the next
    /// scan.
    pub fn listen_to_switch(self: &Arc<Self>) -> JoinHandle<()> {
        let sensor = Arc::clone(self);
        let mut rx = self.hub.states.subscribe();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.entity_id == sensor.switch_entity_id && event.state_moved() {
                            tracing::debug!(
                                entity_id = %sensor.info.entity_id,
                                "Zone switch changed, refreshing on-time"
                            );
                            sensor.update().await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(entity_id = %sensor.info.entity_id, skipped, "State listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Linear scan for the row matching `zone`.
fn on_time_for_zone(rows: &[WaterData], zone: u8) -> Option<f64> {
    rows.iter()
        .find(|row| row.zone_id.as_ref().and_then(FlexId::as_i64) == Some(i64::from(zone)))
        .map(WaterData::minutes)
}

impl Readable for ZoneOnTimeSensor {
    fn info(&self) -> &EntityInfo {
        &self.info
    }

    fn state(&self) -> String {
        format_minutes(self.minutes())
    }

    fn attributes(&self) -> Map<String, Value> {
        let mut attrs = Map::new();
        attrs.insert("unit_of_measurement".into(), Value::String("min".into()));
        attrs.insert("device_id".into(), Value::String(self.device_id.clone()));
        attrs.insert("zone".into(), Value::from(self.zone));
        attrs
    }
}

impl Pollable for ZoneOnTimeSensor {
    async fn update(&self) {
        let minutes = match self.client.water_data(&self.user_id, &self.device_id).await {
            Ok(rows) => on_time_for_zone(&rows, self.zone).unwrap_or(0.0),
            Err(e) => {
                tracing::error!(entity_id = %self.info.entity_id, "Error fetching water data: {}", e);
                0.0
            }
        };
        *lock(&self.minutes) = minutes;
        self.write_state(&self.hub.states);
    }
}

// ── Schedules ───────────────────────────────────────────────

pub struct ScheduleSensor {
    info: EntityInfo,
    schedule_id: FlexId,
    device_id: String,
    client: AquaFlowerClient,
    hub: Arc<Hub>,
    current: Mutex<Schedule>,
}

impl ScheduleSensor {
    pub fn new(hub: Arc<Hub>, client: AquaFlowerClient, ids: &mut EntityIds, device: &Device, schedule: Schedule) -> Self {
        let entity_name = format!("{} Schedule {}", device.display_name(), schedule.id);
        Self {
            info: EntityInfo {
                entity_id: ids.claim("sensor", &entity_name),
                unique_id: format!("{}_schedule_{}", device.device_id, schedule.id),
                name: format!("{} (Schedule)", schedule.display_name()),
            },
            schedule_id: schedule.id.clone(),
            device_id: device.device_id.clone(),
            client,
            hub,
            current: Mutex::new(schedule),
        }
    }
}

impl Readable for ScheduleSensor {
    fn info(&self) -> &EntityInfo {
        &self.info
    }

    fn state(&self) -> String {
        lock(&self.current).display_name()
    }

    fn attributes(&self) -> Map<String, Value> {
        let mut attrs = lock(&self.current).attributes();
        attrs.insert("schedule_id".into(), Value::String(self.schedule_id.to_string()));
        attrs.insert("device_id".into(), Value::String(self.device_id.clone()));
        attrs
    }
}

impl Pollable for ScheduleSensor {
    async fn update(&self) {
        let schedules = self.client.fetch_schedules(&self.device_id).await;
        let wanted = self.schedule_id.to_string();
        match schedules.into_iter().find(|s| s.id.to_string() == wanted) {
            Some(schedule) => {
                *lock(&self.current) = schedule;
                self.write_state(&self.hub.states);
            }
            None => {
                tracing::debug!(
                    entity_id = %self.info.entity_id,
                    schedule_id = %self.schedule_id,
                    "Schedule not in latest fetch, keeping last known values"
                );
                // First miss: publish the schedule captured at setup
                if self.hub.states.get(&self.info.entity_id).is_none() {
                    self.write_state(&self.hub.states);
                }
            }
        }
    }
}
