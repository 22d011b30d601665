use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::auth::{self, AuthConfig};
use crate::flows::{ActiveFlow, FlowKind, FlowManager, FlowReply};
use crate::hub::Hub;
use crate::integrations::aquaflower::client::AquaFlowerClient;
use crate::integrations::aquaflower::config_flow::{ConfigFlow, EntryData, FlowResult, OptionsFlow};
use crate::integrations::aquaflower::entity::{AquaFlowerEntity, Command};
use crate::integrations::aquaflower::setup::{self, EntityRegistry, EntryRuntime, SetupError};
use crate::integrations::aquaflower::DOMAIN;
use crate::settings::Settings;
use crate::state::EntityState;
use crate::store::{self, ConfigEntry};

/// Shared application state
pub struct AppState {
    pub hub: Arc<Hub>,
    pub settings: Settings,
    pub entries: DashMap<String, EntryRuntime>,
    pub entities: EntityRegistry,
    pub flows: FlowManager,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(hub: Arc<Hub>, settings: Settings) -> Self {
        Self {
            hub,
            settings,
            entries: DashMap::new(),
            entities: EntityRegistry::new(),
            flows: FlowManager::new(),
            started_at: Instant::now(),
        }
    }

    /// (Re)load one entry. A loaded entry with the same id is unloaded first.
    pub async fn load_entry(&self, entry: &ConfigEntry) -> Result<(), SetupError> {
        self.unload_entry(&entry.entry_id);
        let runtime = setup::setup_entry(&self.hub, &self.entities, &self.settings, entry).await?;
        self.entries.insert(entry.entry_id.clone(), runtime);
        Ok(())
    }

    pub fn unload_entry(&self, entry_id: &str) -> bool {
        match self.entries.remove(entry_id) {
            Some((_, runtime)) => {
                setup::unload_entry(&self.hub, &self.entities, runtime);
                true
            }
            None => false,
        }
    }

    /// Load every persisted entry. Entries that fail are logged and skipped.
    pub async fn restore_entries(&self) -> anyhow::Result<usize> {
        let entries = store::blocking(&self.settings.db_path, store::load_entries).await?;
        let mut loaded = 0usize;
        for entry in &entries {
            match self.load_entry(entry).await {
                Ok(()) => loaded += 1,
                Err(e) => tracing::error!(entry_id = %entry.entry_id, "Failed to restore entry: {}", e),
            }
        }
        Ok(loaded)
    }

    pub fn unload_all(&self) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for entry_id in ids {
            self.unload_entry(&entry_id);
        }
    }

    fn summary(&self, entry: &ConfigEntry) -> EntrySummary {
        let runtime = self.entries.get(&entry.entry_id);
        EntrySummary {
            entry_id: entry.entry_id.clone(),
            domain: entry.domain.clone(),
            title: entry.title.clone(),
            created_at: entry.created_at.clone(),
            state: if runtime.is_some() { "loaded" } else { "not_loaded" }.to_string(),
            entity_count: runtime.map_or(0, |r| r.entity_ids.len()),
        }
    }
}

/// Config entry as listed by the API. Credentials never leave the process.
#[derive(Debug, Serialize)]
pub struct EntrySummary {
    pub entry_id: String,
    pub domain: String,
    pub title: String,
    pub created_at: String,
    pub state: String,
    pub entity_count: usize,
}

/// POST /api/config/config_entries/flow and .../options/flow request body
#[derive(Debug, Deserialize)]
pub struct StartFlowRequest {
    pub handler: String,
}

/// POST /api/services/{domain}/{service} response
#[derive(Serialize)]
struct ServiceResponse {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    changed_states: Vec<EntityState>,
}

pub fn router(state: Arc<AppState>, auth_config: Arc<AuthConfig>) -> Router {
    let protected = Router::new()
        .route("/api/", get(api_status))
        .route("/api/states", get(get_states))
        .route("/api/states/:entity_id", get(get_state))
        .route("/api/services/:domain/:service", post(call_service))
        .route("/api/config/config_entries/entry", get(list_entries))
        .route("/api/config/config_entries/entry/:entry_id", delete(delete_entry))
        .route("/api/config/config_entries/flow", post(start_config_flow))
        .route(
            "/api/config/config_entries/flow/:flow_id",
            post(config_flow_step).delete(abort_config_flow),
        )
        .route("/api/config/config_entries/options/flow", post(start_options_flow))
        .route(
            "/api/config/config_entries/options/flow/:flow_id",
            post(options_flow_step).delete(abort_options_flow),
        )
        .route_layer(middleware::from_fn_with_state(auth_config, auth::require_token));

    Router::new()
        .route("/api/health", get(health))
        .merge(protected)
        .with_state(state)
}

fn message(status: StatusCode, text: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "message": text.into() }))).into_response()
}

fn internal(err: anyhow::Error) -> Response {
    tracing::error!("Request failed: {:#}", err);
    message(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
}

/// GET /api/ — API running check
async fn api_status() -> Json<Value> {
    Json(serde_json::json!({ "message": "API running." }))
}

/// GET /api/states — return all entity states
async fn get_states(State(app): State<Arc<AppState>>) -> Json<Vec<EntityState>> {
    Json(app.hub.states.get_all())
}

/// GET /api/states/{entity_id} — return single entity state
async fn get_state(
    State(app): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
) -> Result<Json<EntityState>, StatusCode> {
    app.hub
        .states
        .get(&entity_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// Entity ids from `entity_id` or `target.entity_id`, string or list.
fn target_entity_ids(body: &Value) -> Vec<String> {
    let raw = body
        .get("entity_id")
        .or_else(|| body.get("target").and_then(|t| t.get("entity_id")));
    match raw {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(arr)) => arr.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
        _ => vec![],
    }
}

fn number_value(body: &Value) -> Option<f64> {
    match body.get("value")? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// POST /api/services/{domain}/{service} — call a service
async fn call_service(
    State(app): State<Arc<AppState>>,
    Path((domain, service)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    tracing::info!(domain = %domain, service = %service, "Service called");

    let action = match (domain.as_str(), service.as_str()) {
        ("switch", "turn_on") => Some(Command::TurnOn),
        ("switch", "turn_off") => Some(Command::TurnOff),
        ("switch", "toggle") => Some(Command::Toggle),
        ("number", "set_value") => match number_value(&body) {
            Some(v) => Some(Command::SetValue(v)),
            None => return message(StatusCode::BAD_REQUEST, "number.set_value requires a numeric `value`"),
        },
        ("homeassistant", "update_entity") => None,
        _ => {
            tracing::warn!(domain = %domain, service = %service, "Unknown service");
            return message(StatusCode::BAD_REQUEST, format!("Service {}.{} not found", domain, service));
        }
    };

    let mut changed = Vec::new();
    for eid in target_entity_ids(&body) {
        // Clone out of the registry so no shard lock is held across the call
        let Some(entity): Option<AquaFlowerEntity> = app.entities.get(&eid).map(|e| e.value().clone()) else {
            tracing::warn!(entity_id = %eid, "Service target is not an AquaFlower entity");
            continue;
        };

        let handled = match action {
            Some(command) => entity.execute(command).await,
            None => {
                entity.update().await;
                true
            }
        };

        if handled {
            if let Some(state) = app.hub.states.get(&eid) {
                changed.push(state);
            }
        } else {
            tracing::warn!(entity_id = %eid, service = %service, "Entity does not support service");
        }
    }

    Json(ServiceResponse {
        changed_states: changed,
    })
    .into_response()
}

// ── Config entries ──────────────────────────────────────────

/// GET /api/config/config_entries/entry
async fn list_entries(State(app): State<Arc<AppState>>) -> Response {
    match store::blocking(&app.settings.db_path, store::load_entries).await {
        Ok(entries) => {
            let summaries: Vec<EntrySummary> = entries.iter().map(|e| app.summary(e)).collect();
            Json(summaries).into_response()
        }
        Err(e) => internal(e),
    }
}

/// DELETE /api/config/config_entries/entry/{entry_id}
async fn delete_entry(State(app): State<Arc<AppState>>, Path(entry_id): Path<String>) -> Response {
    let unloaded = app.unload_entry(&entry_id);
    let id = entry_id.clone();
    match store::blocking(&app.settings.db_path, move |db| store::delete_entry(db, &id)).await {
        Ok(true) => {
            tracing::info!(entry_id = %entry_id, unloaded, "Config entry removed");
            Json(serde_json::json!({ "require_restart": false })).into_response()
        }
        Ok(false) => message(StatusCode::NOT_FOUND, "Entry not found"),
        Err(e) => internal(e),
    }
}

// ── Flows ───────────────────────────────────────────────────

/// POST /api/config/config_entries/flow — start the setup wizard
async fn start_config_flow(
    State(app): State<Arc<AppState>>,
    Json(req): Json<StartFlowRequest>,
) -> Response {
    if req.handler != DOMAIN {
        return message(StatusCode::BAD_REQUEST, "Invalid handler specified");
    }

    let client = AquaFlowerClient::new(&app.settings.api_base_url, app.settings.request_timeout());
    let mut flow = ConfigFlow::new(client, app.hub.clone());
    match flow.handle(Value::Null).await {
        Ok(result) => {
            let flow_id = app.flows.start(ActiveFlow::Config(flow));
            flow_reply(flow_id, DOMAIN.to_string(), result.map(|_| Value::Null))
        }
        Err(e) => message(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// POST /api/config/config_entries/options/flow — revise an entry's devices
async fn start_options_flow(
    State(app): State<Arc<AppState>>,
    Json(req): Json<StartFlowRequest>,
) -> Response {
    let entry_id = req.handler.clone();
    let entry = match store::blocking(&app.settings.db_path, move |db| store::get_entry(db, &entry_id)).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return message(StatusCode::NOT_FOUND, "Entry not found"),
        Err(e) => return internal(e),
    };
    let (data, options) = match setup::entry_payload(&entry) {
        Ok(payload) => payload,
        Err(e) => return message(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let mut flow = OptionsFlow::new(&data, &options);
    match flow.handle(Value::Null) {
        Ok(result) => {
            let flow_id = app.flows.start(ActiveFlow::Options {
                entry_id: entry.entry_id.clone(),
                flow,
            });
            flow_reply(flow_id, entry.entry_id, result.map(|_| Value::Null))
        }
        Err(e) => message(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// POST /api/config/config_entries/flow/{flow_id}
async fn config_flow_step(
    State(app): State<Arc<AppState>>,
    Path(flow_id): Path<String>,
    body: Option<Json<Value>>,
) -> Response {
    flow_step(&app, flow_id, FlowKind::Config, body).await
}

/// POST /api/config/config_entries/options/flow/{flow_id}
async fn options_flow_step(
    State(app): State<Arc<AppState>>,
    Path(flow_id): Path<String>,
    body: Option<Json<Value>>,
) -> Response {
    flow_step(&app, flow_id, FlowKind::Options, body).await
}

/// Feed input to the current step. A flow id of the other kind is not found.
async fn flow_step(app: &AppState, flow_id: String, kind: FlowKind, body: Option<Json<Value>>) -> Response {
    let input = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let Some(active) = app.flows.take(&flow_id, kind) else {
        return message(StatusCode::NOT_FOUND, "Flow not found");
    };
    let handler = active.handler();

    match active {
        ActiveFlow::Config(mut flow) => match flow.handle(input).await {
            Ok(FlowResult::CreateEntry { title, data }) => {
                match create_config_entry(app, title, data).await {
                    Ok(result) => flow_reply(flow_id, handler, result),
                    Err(e) => internal(e),
                }
            }
            Ok(result) => {
                if !result.is_finished() {
                    app.flows.put_back(&flow_id, ActiveFlow::Config(flow));
                }
                flow_reply(flow_id, handler, result.map(|_| Value::Null))
            }
            Err(e) => {
                app.flows.put_back(&flow_id, ActiveFlow::Config(flow));
                message(StatusCode::BAD_REQUEST, e.to_string())
            }
        },
        ActiveFlow::Options { entry_id, mut flow } => match flow.handle(input) {
            Ok(FlowResult::CreateEntry { title, data }) => {
                let options = match serde_json::to_value(&data) {
                    Ok(v) => v,
                    Err(e) => return internal(e.into()),
                };
                match apply_options(app, &entry_id, &options).await {
                    Ok(()) => flow_reply(flow_id, handler, FlowResult::CreateEntry { title, data: options }),
                    Err(e) => internal(e),
                }
            }
            Ok(result) => {
                if !result.is_finished() {
                    app.flows.put_back(&flow_id, ActiveFlow::Options { entry_id, flow });
                }
                flow_reply(flow_id, handler, result.map(|_| Value::Null))
            }
            Err(e) => {
                app.flows.put_back(&flow_id, ActiveFlow::Options { entry_id, flow });
                message(StatusCode::BAD_REQUEST, e.to_string())
            }
        },
    }
}

/// DELETE /api/config/config_entries/flow/{flow_id}
async fn abort_config_flow(State(app): State<Arc<AppState>>, Path(flow_id): Path<String>) -> Response {
    abort_flow(&app, &flow_id, FlowKind::Config)
}

/// DELETE /api/config/config_entries/options/flow/{flow_id}
async fn abort_options_flow(State(app): State<Arc<AppState>>, Path(flow_id): Path<String>) -> Response {
    abort_flow(&app, &flow_id, FlowKind::Options)
}

fn abort_flow(app: &AppState, flow_id: &str, kind: FlowKind) -> Response {
    if app.flows.abort(flow_id, kind) {
        Json(serde_json::json!({ "message": "Flow aborted" })).into_response()
    } else {
        message(StatusCode::NOT_FOUND, "Flow not found")
    }
}

fn flow_reply<T: Serialize>(flow_id: String, handler: String, result: FlowResult<T>) -> Response {
    Json(FlowReply {
        flow_id,
        handler,
        result,
    })
    .into_response()
}

/// Persist and load a finished setup. One entry per AquaFlower account.
async fn create_config_entry(
    app: &AppState,
    title: String,
    data: EntryData,
) -> anyhow::Result<FlowResult<Value>> {
    let existing = store::blocking(&app.settings.db_path, store::load_entries).await?;
    if setup::find_entry_for_user(&existing, &data.user_id).is_some() {
        tracing::warn!(user_id = %data.user_id, "AquaFlower account already configured");
        return Ok(FlowResult::Abort {
            reason: "already_configured".to_string(),
        });
    }

    let entry = ConfigEntry::new(DOMAIN, &title, serde_json::to_value(&data)?);
    let saved = entry.clone();
    store::blocking(&app.settings.db_path, move |db| store::save_entry(db, &saved)).await?;
    tracing::info!(entry_id = %entry.entry_id, "Config entry created");

    if let Err(e) = app.load_entry(&entry).await {
        tracing::error!(entry_id = %entry.entry_id, "Failed to load new entry: {}", e);
    }

    Ok(FlowResult::CreateEntry {
        title,
        data: serde_json::to_value(app.summary(&entry))?,
    })
}

/// Store new options and reload the entry so the device selection applies.
async fn apply_options(app: &AppState, entry_id: &str, options: &Value) -> anyhow::Result<()> {
    let (id, options) = (entry_id.to_string(), options.clone());
    let stored = store::blocking(&app.settings.db_path, move |db| {
        if !store::update_options(db, &id, &options)? {
            return Ok(None);
        }
        store::get_entry(db, &id)
    })
    .await?;
    let Some(entry) = stored else {
        anyhow::bail!("entry {} disappeared while its options flow was open", entry_id);
    };
    if let Err(e) = app.load_entry(&entry).await {
        tracing::error!(entry_id = %entry_id, "Failed to reload entry: {}", e);
    }
    Ok(())
}

/// GET /api/health — health check with metrics
async fn health(State(app): State<Arc<AppState>>) -> Json<Value> {
    let rss_kb = read_rss_kb(std::process::id()).unwrap_or(0);

    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "entity_count": app.hub.states.len(),
        "entry_count": app.entries.len(),
        "memory_rss_kb": rss_kb,
        "uptime_seconds": app.started_at.elapsed().as_secs(),
    }))
}

/// Read RSS from /proc/self/status on Linux
fn read_rss_kb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    for line in status.lines() {
        if line.starts_with("VmRSS:") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            return parts.get(1)?.parse().ok();
        }
    }
    None
}
