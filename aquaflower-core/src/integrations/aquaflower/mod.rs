//! AquaFlower cloud irrigation controllers.
//!
//! Each config entry is one AquaFlower account. Every selected controller
//! gets six zones, and each zone a switch, a timer and a daily on-time
//! sensor. Schedules become read-only sensors. State is polled on the scan
//! interval and pushed by the backend through a per-account webhook.

pub mod client;
pub mod config_flow;
pub mod entity;
pub mod models;
pub mod number;
pub mod sensor;
pub mod setup;
pub mod switch;
pub mod webhook;

pub const DOMAIN: &str = "aquaflower";
pub const TITLE: &str = "AquaFlower";

/// Webhook id for an account. Stable across restarts so the backend's
/// registration stays valid.
pub fn webhook_id_for_user(user_id: &str) -> String {
    format!("{}_{}", DOMAIN, user_id)
}

/// Dispatcher signal carrying pushed state for one zone.
pub fn update_signal(device_id: &str, zone_id: &str) -> String {
    format!("{}_update_{}_{}", DOMAIN, device_id, zone_id)
}
