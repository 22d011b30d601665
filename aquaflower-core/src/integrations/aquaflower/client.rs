//! AquaFlower cloud REST client.
//!
//! One `reqwest::Client` per integration entry, cloned into every entity.
//! Every authenticated call carries `Authorization: Bearer <token>`; only an
//! exact HTTP 200 counts as success.

use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use super::models::{
    Device, LoginResponse, PublishRequest, Schedule, Session, WaterData, ZoneCommand,
    ZoneSettings, ZoneStatus,
};

#[derive(Debug, Error)]
pub enum ApiError {
    /// Connection refused, DNS failure, timeout.
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Malformed response: {message}")]
    Decode { message: String },

    #[error("Response is missing `{0}`")]
    MissingField(&'static str),
}

#[derive(Clone)]
pub struct AquaFlowerClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl AquaFlowerClient {
    /// Build a client with its own connection pool and request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::error!(
                    timeout_secs = timeout.as_secs_f64(),
                    "Could not build HTTP client, falling back to defaults without a timeout: {}",
                    e
                );
                reqwest::Client::new()
            });
        Self::with_client(http, base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        }
    }

    /// Same pool, authenticated with `token`.
    pub fn with_token(&self, token: &str) -> Self {
        Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            token: Some(token.to_string()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<String, ApiError> {
        let resp = self.authorized(request).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if status != StatusCode::OK {
            return Err(ApiError::Status { status, body });
        }
        Ok(body)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let body = self.send(self.http.get(self.url(path))).await?;
        decode(&body)
    }

    async fn post_json<B: Serialize>(&self, path: &str, payload: &B) -> Result<String, ApiError> {
        self.send(self.http.post(self.url(path)).json(payload)).await
    }

    // ── Account ─────────────────────────────────────────────────

    /// POST /login. Succeeds only with HTTP 200 and both `accessToken` and
    /// `userId` present.
    pub async fn login(&self, email: &str, password: &SecretString) -> Result<Session, ApiError> {
        let payload = json!({
            "email": email,
            "password": password.expose_secret(),
        });
        let body = self.post_json("/login", &payload).await?;
        let resp: LoginResponse = decode(&body)?;

        let access_token = resp
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(ApiError::MissingField("accessToken"))?;
        let user_id = resp
            .user_id
            .filter(|id| !id.is_empty())
            .ok_or(ApiError::MissingField("userId"))?;

        tracing::debug!(user_id = %user_id, "AquaFlower login succeeded");
        Ok(Session {
            access_token,
            user_id: user_id.to_string(),
        })
    }

    /// POST /registerWebhook
    pub async fn register_webhook(&self, user_id: &str, webhook_url: &str) -> Result<(), ApiError> {
        let payload = json!({ "user_id": user_id, "webhook_url": webhook_url });
        self.post_json("/registerWebhook", &payload).await?;
        Ok(())
    }

    // ── Device directory ────────────────────────────────────────

    /// GET /devices. A body that is not a list is a decode error.
    pub async fn devices(&self) -> Result<Vec<Device>, ApiError> {
        self.get_json("/devices").await
    }

    /// Like `devices`, but any failure is logged and yields an empty list.
    pub async fn fetch_devices(&self) -> Vec<Device> {
        match self.devices().await {
            Ok(devices) => {
                tracing::debug!(count = devices.len(), "Fetched AquaFlower devices");
                devices
            }
            Err(e) => {
                tracing::error!("Failed to fetch AquaFlower devices: {}", e);
                Vec::new()
            }
        }
    }

    /// GET /schedules/{device_id}
    pub async fn schedules(&self, device_id: &str) -> Result<Vec<Schedule>, ApiError> {
        self.get_json(&format!("/schedules/{}", device_id)).await
    }

    pub async fn fetch_schedules(&self, device_id: &str) -> Vec<Schedule> {
        match self.schedules(device_id).await {
            Ok(schedules) => schedules,
            Err(e) => {
                tracing::error!(device_id = %device_id, "Failed to fetch schedules: {}", e);
                Vec::new()
            }
        }
    }

    // ── Zone commands ───────────────────────────────────────────

    /// POST /mqtt/publish to the zone's command topic.
    pub async fn publish(&self, device_id: &str, zone: u8, command: ZoneCommand) -> Result<(), ApiError> {
        let payload = PublishRequest::new(device_id, zone, command);
        self.post_json("/mqtt/publish", &payload).await?;
        Ok(())
    }

    /// GET /device/{id}/zone/{n}/status
    pub async fn zone_status(&self, device_id: &str, zone: u8) -> Result<ZoneStatus, ApiError> {
        self.get_json(&format!("/device/{}/zone/{}/status", device_id, zone))
            .await
    }

    /// GET /zones/{id}/{n}
    pub async fn zone_settings(&self, device_id: &str, zone: u8) -> Result<ZoneSettings, ApiError> {
        self.get_json(&format!("/zones/{}/{}", device_id, zone)).await
    }

    /// GET /water-data/{user}/{device}. Rows are decoded one by one; a row
    /// that does not fit is skipped rather than failing the whole list.
    pub async fn water_data(&self, user_id: &str, device_id: &str) -> Result<Vec<WaterData>, ApiError> {
        let rows: Vec<serde_json::Value> = self
            .get_json(&format!("/water-data/{}/{}", user_id, device_id))
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match serde_json::from_value::<WaterData>(row) {
                Ok(row) => Some(row),
                Err(e) => {
                    tracing::warn!(device_id = %device_id, "Skipping unreadable water data row: {}", e);
                    None
                }
            })
            .collect())
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, ApiError> {
    serde_json::from_str(body).map_err(|e| ApiError::Decode {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup() -> (MockServer, AquaFlowerClient) {
        let server = MockServer::start().await;
        let client = AquaFlowerClient::new(&server.uri(), Duration::from_secs(5)).with_token("tok");
        (server, client)
    }

    fn password() -> SecretString {
        "hunter2".to_string().into()
    }

    #[tokio::test]
    async fn test_login_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .and(body_json(json!({"email": "a@b.c", "password": "hunter2"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"accessToken": "abc", "userId": 42})),
            )
            .mount(&server)
            .await;

        let client = AquaFlowerClient::new(&server.uri(), Duration::from_secs(5));
        let session = client.login("a@b.c", &password()).await.unwrap();
        assert_eq!(session.access_token, "abc");
        assert_eq!(session.user_id, "42");
    }

    #[tokio::test]
    async fn test_login_missing_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"userId": "u1"})))
            .mount(&server)
            .await;

        let client = AquaFlowerClient::new(&server.uri(), Duration::from_secs(5));
        let result = client.login("a@b.c", &password()).await;
        assert!(
            matches!(result, Err(ApiError::MissingField("accessToken"))),
            "expected MissingField, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(401).set_body_string("nope"))
            .mount(&server)
            .await;

        let client = AquaFlowerClient::new(&server.uri(), Duration::from_secs(5));
        let result = client.login("a@b.c", &password()).await;
        assert!(matches!(result, Err(ApiError::Status { status, .. }) if status == StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn test_devices_sends_bearer_token() {
        let (server, client) = setup().await;
        Mock::given(method("GET"))
            .and(path("/devices"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"device_id": "D1", "name": "Yard"}])),
            )
            .mount(&server)
            .await;

        let devices = client.devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_id, "D1");
        assert_eq!(devices[0].display_name(), "Yard");
    }

    #[tokio::test]
    async fn test_devices_non_list_is_decode_error() {
        let (server, client) = setup().await;
        Mock::given(method("GET"))
            .and(path("/devices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "x"})))
            .mount(&server)
            .await;

        assert!(matches!(client.devices().await, Err(ApiError::Decode { .. })));
        assert!(client.fetch_devices().await.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_schedules_swallows_errors() {
        let (server, client) = setup().await;
        Mock::given(method("GET"))
            .and(path("/schedules/D1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        assert!(client.fetch_schedules("D1").await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_posts_command_topic() {
        let (server, client) = setup().await;
        Mock::given(method("POST"))
            .and(path("/mqtt/publish"))
            .and(body_json(json!({
                "topic": "/device/D1/zone/3/command",
                "message": {"action": "on"}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client.publish("D1", 3, ZoneCommand::On).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_non_200_carries_body() {
        let (server, client) = setup().await;
        Mock::given(method("POST"))
            .and(path("/mqtt/publish"))
            .respond_with(ResponseTemplate::new(202).set_body_string("queued"))
            .mount(&server)
            .await;

        match client.publish("D1", 1, ZoneCommand::Off).await {
            Err(ApiError::Status { status, body }) => {
                assert_eq!(status, StatusCode::ACCEPTED);
                assert_eq!(body, "queued");
            }
            other => panic!("expected Status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_register_webhook() {
        let (server, client) = setup().await;
        Mock::given(method("POST"))
            .and(path("/registerWebhook"))
            .and(body_json(json!({"user_id": "u1", "webhook_url": "http://hub/api/webhook/x"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client.register_webhook("u1", "http://hub/api/webhook/x").await.unwrap();
    }

    #[tokio::test]
    async fn test_numeric_device_ids() {
        let (server, client) = setup().await;
        Mock::given(method("GET"))
            .and(path("/devices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"device_id": 17, "name": "Yard"}])))
            .mount(&server)
            .await;

        let devices = client.devices().await.unwrap();
        assert_eq!(devices[0].device_id, "17");
    }

    #[tokio::test]
    async fn test_water_data_skips_bad_rows() {
        let (server, client) = setup().await;
        Mock::given(method("GET"))
            .and(path("/water-data/u1/D1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"zone_id": {"n": 1}, "daily_on_time": 3},
                {"zone_id": 2, "daily_on_time": "bad"},
                {"zone_id": 3, "daily_on_time": 7}
            ])))
            .mount(&server)
            .await;

        let rows = client.water_data("u1", "D1").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].minutes(), 0.0);
        assert_eq!(rows[1].minutes(), 7.0);
    }

    #[tokio::test]
    async fn test_configured_timeout_applies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/devices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let client = AquaFlowerClient::new(&server.uri(), Duration::from_millis(200));
        let started = std::time::Instant::now();
        assert!(matches!(client.devices().await, Err(ApiError::Transport(_))));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_transport_error() {
        let client = AquaFlowerClient::new("http://127.0.0.1:1", Duration::from_secs(1));
        assert!(matches!(client.devices().await, Err(ApiError::Transport(_))));
    }
}
