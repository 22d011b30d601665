//! Setup wizard and options flow.
//!
//! ```text
//! user ──login ok──▶ confirm_devices ──webhook registered──▶ create_entry
//!  ▲  │                    ▲        │
//!  └──┘ invalid_auth /     └────────┘ cannot_register_webhook /
//!       cannot_connect                cannot_connect
//! ```
//! Any step may end in an abort (`no_devices_found`, `no_devices_selected`).

use std::collections::BTreeMap;
use std::sync::Arc;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::client::{AquaFlowerClient, ApiError};
use super::models::Session;
use super::{webhook_id_for_user, DOMAIN, TITLE};
use crate::hub::Hub;

// ── Flow results ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<BTreeMap<String, String>>,
}

impl FormField {
    fn text(name: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type: "string".to_string(),
            required: true,
            default: None,
            options: None,
        }
    }

    fn password(name: &str) -> Self {
        Self {
            field_type: "password".to_string(),
            ..Self::text(name)
        }
    }

    fn multi_select(name: &str, options: BTreeMap<String, String>, default: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            field_type: "multi_select".to_string(),
            required: true,
            default: Some(Value::from(default)),
            options: Some(options),
        }
    }
}

/// Outcome of one flow step. `T` is what a finished flow produces.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowResult<T> {
    Form {
        step_id: String,
        data_schema: Vec<FormField>,
        errors: BTreeMap<String, String>,
    },
    Abort {
        reason: String,
    },
    CreateEntry {
        title: String,
        data: T,
    },
}

impl<T> FlowResult<T> {
    fn form(step_id: &str, data_schema: Vec<FormField>, error: Option<&str>) -> Self {
        let mut errors = BTreeMap::new();
        if let Some(code) = error {
            errors.insert("base".to_string(), code.to_string());
        }
        FlowResult::Form {
            step_id: step_id.to_string(),
            data_schema,
            errors,
        }
    }

    fn abort(reason: &str) -> Self {
        FlowResult::Abort {
            reason: reason.to_string(),
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, FlowResult::Form { .. })
    }

    /// Swap the payload of a finished entry, e.g. for a redacted summary.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FlowResult<U> {
        match self {
            FlowResult::Form {
                step_id,
                data_schema,
                errors,
            } => FlowResult::Form {
                step_id,
                data_schema,
                errors,
            },
            FlowResult::Abort { reason } => FlowResult::Abort { reason },
            FlowResult::CreateEntry { title, data } => FlowResult::CreateEntry { title, data: f(data) },
        }
    }
}

/// User input that does not fit the current step.
#[derive(Debug, thiserror::Error)]
#[error("Invalid input for step `{step}`: {message}")]
pub struct FlowInputError {
    pub step: &'static str,
    pub message: String,
}

// ── Persisted entry payloads ────────────────────────────────

/// Configuration record written when the wizard completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryData {
    pub api_base_url: String,
    pub access_token: String,
    pub user_id: String,
    pub devices: Vec<String>,
    #[serde(rename = "ha_ip")]
    pub hub_address: String,
    pub webhook_url: String,
}

/// Post-setup overrides. Only the device selection can change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<String>>,
}

impl EntryOptions {
    /// The selection in effect: options first, then the wizard data.
    pub fn selected_devices<'a>(&'a self, data: &'a EntryData) -> &'a [String] {
        self.devices.as_deref().unwrap_or(&data.devices)
    }
}

// ── Step inputs ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CredentialsInput {
    #[serde(alias = "username")]
    pub email: String,
    pub password: SecretString,
    #[serde(alias = "ha_ip")]
    pub hub_address: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeviceSelection {
    #[serde(default)]
    pub devices: Vec<String>,
}

// ── Config flow ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    User,
    ConfirmDevices,
    Done,
}

pub struct ConfigFlow {
    client: AquaFlowerClient,
    hub: Arc<Hub>,
    step: Step,
    session: Option<Session>,
    hub_address: String,
    devices: BTreeMap<String, String>,
}

impl ConfigFlow {
    pub fn new(client: AquaFlowerClient, hub: Arc<Hub>) -> Self {
        Self {
            client,
            hub,
            step: Step::User,
            session: None,
            hub_address: String::new(),
            devices: BTreeMap::new(),
        }
    }

    pub fn handler(&self) -> &'static str {
        DOMAIN
    }

    pub fn step_id(&self) -> &'static str {
        match self.step {
            Step::User => "user",
            Step::ConfirmDevices => "confirm_devices",
            Step::Done => "done",
        }
    }

    /// Feed raw JSON input to whichever step is current. `null` or an empty
    /// object means "show the form".
    pub async fn handle(&mut self, input: Value) -> Result<FlowResult<EntryData>, FlowInputError> {
        let empty = input.is_null() || input.as_object().map_or(false, |o| o.is_empty());
        match self.step {
            Step::User => {
                let parsed = if empty { None } else { Some(parse_input(self.step_id(), input)?) };
                Ok(self.step_user(parsed).await)
            }
            Step::ConfirmDevices => {
                let parsed = if input.is_null() { None } else { Some(parse_input(self.step_id(), input)?) };
                Ok(self.step_confirm_devices(parsed).await)
            }
            Step::Done => Ok(FlowResult::abort("unknown_step")),
        }
    }

    fn credentials_form(error: Option<&str>) -> FlowResult<EntryData> {
        FlowResult::form(
            "user",
            vec![
                FormField::text("email"),
                FormField::password("password"),
                FormField::text("hub_address"),
            ],
            error,
        )
    }

    fn devices_form(&self, error: Option<&str>) -> FlowResult<EntryData> {
        let all: Vec<String> = self.devices.keys().cloned().collect();
        FlowResult::form(
            "confirm_devices",
            vec![FormField::multi_select("devices", self.devices.clone(), all)],
            error,
        )
    }

    /// Credentials step. Failures keep the flow here with an error code.
    pub async fn step_user(&mut self, input: Option<CredentialsInput>) -> FlowResult<EntryData> {
        if self.step != Step::User {
            return FlowResult::abort("unknown_step");
        }
        let Some(input) = input else {
            return Self::credentials_form(None);
        };

        self.hub_address = input.hub_address;

        match self.client.login(&input.email, &input.password).await {
            Ok(session) => {
                self.client = self.client.with_token(&session.access_token);
                self.session = Some(session);
                self.step_select_devices().await
            }
            Err(e) => {
                let code = login_error_code(&e);
                tracing::error!(code = %code, "AquaFlower login failed: {}", e);
                Self::credentials_form(Some(code))
            }
        }
    }

    async fn step_select_devices(&mut self) -> FlowResult<EntryData> {
        match self.client.devices().await {
            Ok(devices) => {
                self.devices = devices
                    .iter()
                    .map(|d| (d.device_id.clone(), d.display_name().to_string()))
                    .collect();
            }
            Err(e) => {
                tracing::error!("Error fetching devices during setup: {}", e);
                self.devices.clear();
            }
        }

        if self.devices.is_empty() {
            self.step = Step::Done;
            return FlowResult::abort("no_devices_found");
        }

        self.step = Step::ConfirmDevices;
        self.devices_form(None)
    }

    /// Device confirmation and webhook registration.
    pub async fn step_confirm_devices(&mut self, input: Option<DeviceSelection>) -> FlowResult<EntryData> {
        if self.step != Step::ConfirmDevices {
            return FlowResult::abort("unknown_step");
        }
        let Some(session) = self.session.clone() else {
            return FlowResult::abort("unknown_step");
        };

        let selected: Vec<String> = input
            .unwrap_or_default()
            .devices
            .into_iter()
            .filter(|id| {
                let known = self.devices.contains_key(id);
                if !known {
                    tracing::warn!(device_id = %id, "Ignoring unknown device in selection");
                }
                known
            })
            .collect();

        if selected.is_empty() {
            self.step = Step::Done;
            return FlowResult::abort("no_devices_selected");
        }

        let webhook_url = self.hub.webhook_url(&webhook_id_for_user(&session.user_id));
        tracing::info!(url = %webhook_url, "Generated AquaFlower webhook URL");

        if let Err(e) = self.client.register_webhook(&session.user_id, &webhook_url).await {
            let code = match &e {
                ApiError::Transport(_) => "cannot_connect",
                _ => "cannot_register_webhook",
            };
            tracing::error!(code = %code, "Failed to register webhook with backend: {}", e);
            return self.devices_form(Some(code));
        }
        tracing::info!("Webhook registered with AquaFlower backend");

        self.step = Step::Done;
        FlowResult::CreateEntry {
            title: TITLE.to_string(),
            data: EntryData {
                api_base_url: self.client.base_url().to_string(),
                access_token: session.access_token,
                user_id: session.user_id,
                devices: selected,
                hub_address: self.hub_address.clone(),
                webhook_url,
            },
        }
    }
}

/// Rejected credentials and malformed-but-successful responses are an auth
/// problem; anything that never produced a usable response is connectivity.
fn login_error_code(err: &ApiError) -> &'static str {
    match err {
        ApiError::Status { .. } | ApiError::MissingField(_) => "invalid_auth",
        ApiError::Transport(_) | ApiError::Decode { .. } => "cannot_connect",
    }
}

fn parse_input<T: serde::de::DeserializeOwned>(step: &'static str, input: Value) -> Result<T, FlowInputError> {
    serde_json::from_value(input).map_err(|e| FlowInputError {
        step,
        message: e.to_string(),
    })
}

// ── Options flow ────────────────────────────────────────────

/// Revises the device subset of an existing entry without logging in again.
pub struct OptionsFlow {
    available: Vec<String>,
    current: Vec<String>,
}

impl OptionsFlow {
    pub fn new(data: &EntryData, options: &EntryOptions) -> Self {
        Self {
            available: data.devices.clone(),
            current: options.selected_devices(data).to_vec(),
        }
    }

    pub fn handle(&mut self, input: Value) -> Result<FlowResult<EntryOptions>, FlowInputError> {
        let parsed = if input.is_null() { None } else { Some(parse_input("init", input)?) };
        Ok(self.step_init(parsed))
    }

    fn init_form(&self, error: Option<&str>) -> FlowResult<EntryOptions> {
        let options = self
            .available
            .iter()
            .map(|id| (id.clone(), id.clone()))
            .collect();
        FlowResult::form(
            "init",
            vec![FormField::multi_select("devices", options, self.current.clone())],
            error,
        )
    }

    /// Device subset. An empty subset stays on the form: stored options with
    /// no devices would read as "no preference" on the next load.
    pub fn step_init(&mut self, input: Option<DeviceSelection>) -> FlowResult<EntryOptions> {
        let Some(selection) = input else {
            return self.init_form(None);
        };

        let devices: Vec<String> = selection
            .devices
            .into_iter()
            .filter(|id| self.available.contains(id))
            .collect();

        if devices.is_empty() {
            tracing::warn!("Options flow submitted without any known device");
            return self.init_form(Some("no_devices_selected"));
        }

        FlowResult::CreateEntry {
            title: String::new(),
            data: EntryOptions {
                devices: Some(devices),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> CredentialsInput {
        serde_json::from_value(json!({
            "email": "gardener@example.com",
            "password": "pw",
            "hub_address": "192.168.1.20"
        }))
        .unwrap()
    }

    fn new_flow(server: &MockServer) -> ConfigFlow {
        let client = AquaFlowerClient::new(&server.uri(), Duration::from_secs(5));
        ConfigFlow::new(client, Arc::new(Hub::new("http://hub.local:8124")))
    }

    async fn mock_login_ok(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"accessToken": "tok", "userId": "u1"})),
            )
            .mount(server)
            .await;
    }

    async fn mock_devices(server: &MockServer, body: Value) {
        Mock::given(method("GET"))
            .and(path("/devices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    fn base_error<T>(result: &FlowResult<T>) -> Option<&str> {
        match result {
            FlowResult::Form { errors, .. } => errors.get("base").map(String::as_str),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_initial_form() {
        let server = MockServer::start().await;
        let mut flow = new_flow(&server);

        let result = flow.step_user(None).await;
        match &result {
            FlowResult::Form { step_id, data_schema, errors } => {
                assert_eq!(step_id, "user");
                assert_eq!(data_schema.len(), 3);
                assert!(errors.is_empty());
            }
            other => panic!("expected form, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_auth_stays_on_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "bad"})))
            .mount(&server)
            .await;

        let mut flow = new_flow(&server);
        for _ in 0..3 {
            let result = flow.step_user(Some(credentials())).await;
            assert_eq!(base_error(&result), Some("invalid_auth"));
            assert_eq!(flow.step_id(), "user");
        }
    }

    #[tokio::test]
    async fn test_missing_user_id_is_invalid_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accessToken": "tok"})))
            .mount(&server)
            .await;

        let mut flow = new_flow(&server);
        let result = flow.step_user(Some(credentials())).await;
        assert_eq!(base_error(&result), Some("invalid_auth"));
        assert_eq!(flow.step_id(), "user");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_cannot_connect() {
        let client = AquaFlowerClient::new("http://127.0.0.1:1", Duration::from_secs(1));
        let mut flow = ConfigFlow::new(client, Arc::new(Hub::new("http://hub.local")));

        let result = flow.step_user(Some(credentials())).await;
        assert_eq!(base_error(&result), Some("cannot_connect"));
        assert_eq!(flow.step_id(), "user");
    }

    #[tokio::test]
    async fn test_empty_directory_aborts() {
        let server = MockServer::start().await;
        mock_login_ok(&server).await;
        mock_devices(&server, json!([])).await;

        let mut flow = new_flow(&server);
        let result = flow.step_user(Some(credentials())).await;
        assert_eq!(result, FlowResult::Abort { reason: "no_devices_found".into() });
        assert_eq!(
            flow.step_confirm_devices(Some(DeviceSelection { devices: vec!["D1".into()] })).await,
            FlowResult::Abort { reason: "unknown_step".into() }
        );
    }

    #[tokio::test]
    async fn test_non_list_directory_aborts() {
        let server = MockServer::start().await;
        mock_login_ok(&server).await;
        mock_devices(&server, json!({"devices": []})).await;

        let mut flow = new_flow(&server);
        let result = flow.step_user(Some(credentials())).await;
        assert_eq!(result, FlowResult::Abort { reason: "no_devices_found".into() });
    }

    #[tokio::test]
    async fn test_full_flow_creates_entry() {
        let server = MockServer::start().await;
        mock_login_ok(&server).await;
        mock_devices(
            &server,
            json!([{"device_id": "D1", "name": "Yard"}, {"device_id": "D2", "name": "Porch"}]),
        )
        .await;
        Mock::given(method("POST"))
            .and(path("/registerWebhook"))
            .and(body_json(json!({
                "user_id": "u1",
                "webhook_url": "http://hub.local:8124/api/webhook/aquaflower_u1"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut flow = new_flow(&server);
        let form = flow.step_user(Some(credentials())).await;
        match &form {
            FlowResult::Form { step_id, data_schema, .. } => {
                assert_eq!(step_id, "confirm_devices");
                let field = &data_schema[0];
                assert_eq!(field.default, Some(json!(["D1", "D2"])));
                assert_eq!(field.options.as_ref().unwrap()["D1"], "Yard");
            }
            other => panic!("expected device form, got {other:?}"),
        }

        let result = flow
            .step_confirm_devices(Some(DeviceSelection { devices: vec!["D2".into()] }))
            .await;
        match result {
            FlowResult::CreateEntry { title, data } => {
                assert_eq!(title, "AquaFlower");
                assert_eq!(data.access_token, "tok");
                assert_eq!(data.user_id, "u1");
                assert_eq!(data.devices, vec!["D2".to_string()]);
                assert_eq!(data.hub_address, "192.168.1.20");
                assert_eq!(data.api_base_url, server.uri());
            }
            other => panic!("expected entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_selection_aborts() {
        let server = MockServer::start().await;
        mock_login_ok(&server).await;
        mock_devices(&server, json!([{"device_id": "D1", "name": "Yard"}])).await;

        let mut flow = new_flow(&server);
        flow.step_user(Some(credentials())).await;
        let result = flow.step_confirm_devices(Some(DeviceSelection::default())).await;
        assert_eq!(result, FlowResult::Abort { reason: "no_devices_selected".into() });
    }

    #[tokio::test]
    async fn test_webhook_rejection_returns_to_selection() {
        let server = MockServer::start().await;
        mock_login_ok(&server).await;
        mock_devices(&server, json!([{"device_id": "D1", "name": "Yard"}])).await;
        Mock::given(method("POST"))
            .and(path("/registerWebhook"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut flow = new_flow(&server);
        flow.step_user(Some(credentials())).await;
        let result = flow
            .step_confirm_devices(Some(DeviceSelection { devices: vec!["D1".into()] }))
            .await;
        assert_eq!(base_error(&result), Some("cannot_register_webhook"));
        assert_eq!(flow.step_id(), "confirm_devices");
    }

    #[tokio::test]
    async fn test_webhook_transport_error_is_cannot_connect() {
        let server = MockServer::start().await;
        mock_login_ok(&server).await;
        mock_devices(
            &server,
            json!([{"device_id": "D1", "name": "Yard"}, {"device_id": "D2", "name": "Porch"}]),
        )
        .await;
        Mock::given(method("POST"))
            .and(path("/registerWebhook"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let client = AquaFlowerClient::new(&server.uri(), Duration::from_millis(300));
        let mut flow = ConfigFlow::new(client, Arc::new(Hub::new("http://hub.local:8124")));
        flow.step_user(Some(credentials())).await;
        assert_eq!(flow.step_id(), "confirm_devices");

        let result = flow
            .step_confirm_devices(Some(DeviceSelection { devices: vec!["D2".into()] }))
            .await;
        match &result {
            FlowResult::Form { step_id, data_schema, errors } => {
                assert_eq!(step_id, "confirm_devices");
                assert_eq!(errors.get("base").map(String::as_str), Some("cannot_connect"));
                assert_eq!(data_schema[0].default, Some(json!(["D1", "D2"])));
            }
            other => panic!("expected device form, got {other:?}"),
        }
        assert_eq!(flow.step_id(), "confirm_devices");
    }

    #[tokio::test]
    async fn test_handle_dispatches_json_input() {
        let server = MockServer::start().await;
        let mut flow = new_flow(&server);

        let result = flow.handle(Value::Null).await.unwrap();
        assert!(!result.is_finished());

        let err = flow.handle(json!({"email": "x"})).await.unwrap_err();
        assert_eq!(err.step, "user");
    }

    #[test]
    fn test_options_flow_rewrites_selection_only() {
        let data = EntryData {
            api_base_url: "https://api".into(),
            access_token: "tok".into(),
            user_id: "u1".into(),
            devices: vec!["D1".into(), "D2".into()],
            hub_address: "10.0.0.2".into(),
            webhook_url: "http://hub/api/webhook/aquaflower_u1".into(),
        };
        let mut flow = OptionsFlow::new(&data, &EntryOptions::default());

        match flow.step_init(None) {
            FlowResult::Form { step_id, data_schema, .. } => {
                assert_eq!(step_id, "init");
                assert_eq!(data_schema[0].default, Some(json!(["D1", "D2"])));
            }
            other => panic!("expected form, got {other:?}"),
        }

        let result = flow.step_init(Some(DeviceSelection {
            devices: vec!["D2".into(), "D9".into()],
        }));
        let FlowResult::CreateEntry { data: options, .. } = result else {
            panic!("expected options entry");
        };
        assert_eq!(options.devices, Some(vec!["D2".to_string()]));
        assert_eq!(options.selected_devices(&data), ["D2".to_string()]);
    }

    #[test]
    fn test_options_flow_keeps_form_on_empty_selection() {
        let data = EntryData {
            api_base_url: "https://api".into(),
            access_token: "tok".into(),
            user_id: "u1".into(),
            devices: vec!["D1".into(), "D2".into()],
            hub_address: "10.0.0.2".into(),
            webhook_url: "http://hub/api/webhook/aquaflower_u1".into(),
        };
        let options = EntryOptions {
            devices: Some(vec!["D1".into()]),
        };
        let mut flow = OptionsFlow::new(&data, &options);

        for devices in [vec![], vec!["D9".to_string()]] {
            let result = flow.step_init(Some(DeviceSelection { devices }));
            assert!(!result.is_finished());
            assert_eq!(base_error(&result), Some("no_devices_selected"));
            match result {
                FlowResult::Form { step_id, data_schema, .. } => {
                    assert_eq!(step_id, "init");
                    assert_eq!(data_schema[0].default, Some(json!(["D1"])));
                }
                other => panic!("expected form, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_entry_data_uses_legacy_keys() {
        let value = json!({
            "api_base_url": "https://api",
            "access_token": "tok",
            "user_id": "u1",
            "devices": ["D1"],
            "ha_ip": "10.0.0.2",
            "webhook_url": "http://hub/api/webhook/aquaflower_u1"
        });
        let data: EntryData = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(data.hub_address, "10.0.0.2");
        assert_eq!(serde_json::to_value(&data).unwrap(), value);
    }
}
