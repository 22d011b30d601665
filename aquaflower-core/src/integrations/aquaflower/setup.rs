//! Config entry lifecycle: build entities for an entry, keep them polled,
//! and tear everything down again on unload.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::client::AquaFlowerClient;
use super::config_flow::{EntryData, EntryOptions};
use super::entity::{AquaFlowerEntity, EntityIds, Readable};
use super::models::{Device, ZONES_PER_DEVICE};
use super::number::ZoneTimer;
use super::sensor::{ScheduleSensor, ZoneOnTimeSensor};
use super::switch::ZoneSwitch;
use super::{webhook, webhook_id_for_user, DOMAIN};
use crate::hub::Hub;
use crate::settings::Settings;
use crate::store::ConfigEntry;

/// Live entities keyed by entity id.
pub type EntityRegistry = DashMap<String, AquaFlowerEntity>;

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("Entry {entry_id} belongs to `{domain}`, not `aquaflower`")]
    WrongDomain { entry_id: String, domain: String },

    #[error("Entry {entry_id} has unusable data: {source}")]
    InvalidData {
        entry_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything an entry owns while it is loaded.
pub struct EntryRuntime {
    pub entry_id: String,
    pub webhook_id: String,
    pub entity_ids: Vec<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl EntryRuntime {
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

/// Decode an entry's stored data and options.
pub fn entry_payload(entry: &ConfigEntry) -> Result<(EntryData, EntryOptions), SetupError> {
    if entry.domain != DOMAIN {
        return Err(SetupError::WrongDomain {
            entry_id: entry.entry_id.clone(),
            domain: entry.domain.clone(),
        });
    }
    let data: EntryData = serde_json::from_value(entry.data.clone()).map_err(|source| SetupError::InvalidData {
        entry_id: entry.entry_id.clone(),
        source,
    })?;
    let options: EntryOptions = serde_json::from_value(entry.options.clone()).unwrap_or_else(|e| {
        tracing::warn!(entry_id = %entry.entry_id, "Ignoring unreadable entry options: {}", e);
        EntryOptions::default()
    });
    Ok((data, options))
}

/// Existing entry for the same AquaFlower account, if any.
pub fn find_entry_for_user<'a>(entries: &'a [ConfigEntry], user_id: &str) -> Option<&'a ConfigEntry> {
    entries.iter().find(|entry| {
        entry.domain == DOMAIN
            && entry.data.get("user_id").and_then(|v| v.as_str()) == Some(user_id)
    })
}

/// Keep only the selected devices. An empty selection means every device.
pub fn select_devices(devices: Vec<Device>, selected: &[String]) -> Vec<Device> {
    if selected.is_empty() {
        return devices;
    }
    for id in selected {
        if !devices.iter().any(|d| &d.device_id == id) {
            tracing::warn!(device_id = %id, "Selected device no longer reported by the backend");
        }
    }
    devices
        .into_iter()
        .filter(|d| selected.contains(&d.device_id))
        .collect()
}

/// Switch, timer and on-time sensor for every zone of one device.
pub fn zone_entities(
    hub: &Arc<Hub>,
    client: &AquaFlowerClient,
    user_id: &str,
    device: &Device,
    ids: &mut EntityIds,
) -> Vec<AquaFlowerEntity> {
    let mut entities = Vec::with_capacity(usize::from(ZONES_PER_DEVICE) * 3);
    for zone in 1..=ZONES_PER_DEVICE {
        let switch = ZoneSwitch::new(hub.clone(), client.clone(), ids, device, zone);
        let timer = ZoneTimer::new(hub.clone(), client.clone(), ids, device, zone);
        let on_time = ZoneOnTimeSensor::new(
            hub.clone(),
            client.clone(),
            ids,
            user_id,
            device,
            zone,
            &switch.info().entity_id,
        );
        entities.push(AquaFlowerEntity::Switch(Arc::new(switch)));
        entities.push(AquaFlowerEntity::Timer(Arc::new(timer)));
        entities.push(AquaFlowerEntity::OnTime(Arc::new(on_time)));
    }
    entities
}

/// Zone entities plus one sensor per schedule known at setup time.
pub async fn build_entities(
    hub: &Arc<Hub>,
    client: &AquaFlowerClient,
    user_id: &str,
    devices: &[Device],
    ids: &mut EntityIds,
) -> Vec<AquaFlowerEntity> {
    let mut entities = Vec::new();
    for device in devices {
        entities.extend(zone_entities(hub, client, user_id, device, ids));

        let schedules = client.fetch_schedules(&device.device_id).await;
        if schedules.is_empty() {
            tracing::info!(device_id = %device.device_id, "No schedules found");
        }
        for schedule in schedules {
            let sensor = ScheduleSensor::new(hub.clone(), client.clone(), ids, device, schedule);
            entities.push(AquaFlowerEntity::Schedule(Arc::new(sensor)));
        }
    }
    entities
}

/// Load an entry: register its webhook, build and poll its entities, and
/// start the background tasks that keep them current.
pub async fn setup_entry(
    hub: &Arc<Hub>,
    registry: &EntityRegistry,
    settings: &Settings,
    entry: &ConfigEntry,
) -> Result<EntryRuntime, SetupError> {
    let (data, options) = entry_payload(entry)?;
    tracing::info!(entry_id = %entry.entry_id, user_id = %data.user_id, "Setting up AquaFlower entry");

    let client = AquaFlowerClient::new(&data.api_base_url, settings.request_timeout())
        .with_token(&data.access_token);

    let webhook_id = webhook_id_for_user(&data.user_id);
    hub.webhooks.register(DOMAIN, "AquaFlower Webhook", &webhook_id, Arc::new(webhook::handle_webhook));

    // The hub address may have changed since the wizard ran
    let webhook_url = hub.webhook_url(&webhook_id);
    if let Err(e) = client.register_webhook(&data.user_id, &webhook_url).await {
        tracing::warn!(entry_id = %entry.entry_id, url = %webhook_url, "Could not refresh webhook registration: {}", e);
    }

    let devices = select_devices(client.fetch_devices().await, options.selected_devices(&data));
    if devices.is_empty() {
        tracing::warn!(entry_id = %entry.entry_id, "No AquaFlower devices to set up");
    }

    let taken = hub
        .states
        .get_all()
        .into_iter()
        .map(|s| s.entity_id)
        .chain(registry.iter().map(|e| e.key().clone()));
    let mut ids = EntityIds::new(taken);
    let entities = build_entities(hub, &client, &data.user_id, &devices, &mut ids).await;

    let mut runtime = EntryRuntime {
        entry_id: entry.entry_id.clone(),
        webhook_id,
        entity_ids: Vec::with_capacity(entities.len()),
        tasks: Vec::new(),
    };

    for entity in entities {
        // Poll once before the entity is registered
        entity.update().await;
        registry.insert(entity.entity_id().to_string(), entity.clone());
        runtime.entity_ids.push(entity.entity_id().to_string());

        match &entity {
            AquaFlowerEntity::Switch(switch) => runtime.tasks.push(switch.listen_for_pushes()),
            AquaFlowerEntity::OnTime(sensor) => runtime.tasks.push(sensor.listen_to_switch()),
            AquaFlowerEntity::Timer(_) | AquaFlowerEntity::Schedule(_) => {}
        }
        runtime.tasks.push(spawn_poller(entity, settings.scan_interval()));
    }

    tracing::info!(
        entry_id = %entry.entry_id,
        devices = devices.len(),
        entities = runtime.entity_ids.len(),
        "AquaFlower entry loaded"
    );
    Ok(runtime)
}

/// Stop polling, drop the webhook, and remove every entity the entry owned.
pub fn unload_entry(hub: &Hub, registry: &EntityRegistry, runtime: EntryRuntime) {
    for task in &runtime.tasks {
        task.abort();
    }
    hub.webhooks.unregister(&runtime.webhook_id);
    for entity_id in &runtime.entity_ids {
        registry.remove(entity_id);
        hub.states.remove(entity_id);
    }
    tracing::info!(
        entry_id = %runtime.entry_id,
        entities = runtime.entity_ids.len(),
        "AquaFlower entry unloaded"
    );
}

fn spawn_poller(entity: AquaFlowerEntity, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The immediate first tick stands for the poll done during setup
        ticker.tick().await;
        loop {
            ticker.tick().await;
            entity.update().await;
        }
    })
}
