//! Process settings: optional YAML file, then environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_API_BASE_URL: &str = "https://iot.theaquaflower.com/api";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub http_port: u16,
    pub db_path: PathBuf,
    pub api_base_url: String,
    /// Base URL the vendor backend uses to reach our webhooks.
    pub external_url: String,
    pub scan_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Static bearer token for the hub API. None leaves the API open.
    pub auth_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_port: 8124,
            db_path: PathBuf::from("aquaflower.db"),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            external_url: "http://localhost:8124".to_string(),
            scan_interval_secs: 30,
            request_timeout_secs: 10,
            auth_token: None,
        }
    }
}

impl Settings {
    /// Load from `AQUAFLOWER_CONFIG` (default `aquaflower.yaml`), then apply
    /// environment overrides. A missing file means defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var("AQUAFLOWER_CONFIG")
            .unwrap_or_else(|_| "aquaflower.yaml".to_string());
        let mut settings = Self::from_file(Path::new(&path))?;
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        Self::from_yaml(&raw)
            .with_context(|| format!("Invalid settings file: {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Override fields from environment-style lookups. Unparseable numbers
    /// are ignored with a warning.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = parse_env(&lookup, "AQUAFLOWER_HTTP_PORT") {
            self.http_port = port;
        }
        if let Some(path) = lookup("AQUAFLOWER_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(url) = lookup("AQUAFLOWER_API_BASE_URL") {
            self.api_base_url = url;
        }
        if let Some(url) = lookup("AQUAFLOWER_EXTERNAL_URL") {
            self.external_url = url;
        }
        if let Some(secs) = parse_env(&lookup, "AQUAFLOWER_SCAN_INTERVAL") {
            self.scan_interval_secs = secs;
        }
        if let Some(secs) = parse_env(&lookup, "AQUAFLOWER_REQUEST_TIMEOUT") {
            self.request_timeout_secs = secs;
        }
        if let Some(token) = lookup("AQUAFLOWER_AUTH_TOKEN").filter(|t| !t.is_empty()) {
            self.auth_token = Some(token);
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

fn parse_env<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key = %key, value = %raw, "Ignoring unparseable setting");
            None
        }
    }
}
