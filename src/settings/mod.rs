//! Persistent key-value settings
//!
//! Settings live in a single `settings(key, value)` table where every value is
//! a JSON document. [`Settings`] is the merged snapshot of all stored keys over
//! the built-in defaults.

mod sqlite;

pub use sqlite::SqliteSettingsStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use thiserror::Error;

pub const GOOGLE_ACCESS_TOKENS: &str = "google_access_tokens";
pub const RTSP_MAP: &str = "rtsp_map";
pub const RTSP_PATHS: &str = "rtsp_paths";
pub const RTSPS_SNAPSHOT: &str = "rtsps_snapshot";
pub const MQTT_SETTINGS: &str = "mqtt_settings";

/// Settings store errors
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid stored value: {0}")]
    Json(#[from] serde_json::Error),

    #[error("settings worker is unavailable")]
    Closed,
}

/// Broker connection settings for feed-status notifications
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub enabled: bool,
    pub host: String,
    pub user: String,
    pub password: String,
}

/// Merged view of every stored setting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// OAuth token document issued for the upstream device API
    pub google_access_tokens: Option<Value>,
    /// Free-form camera map maintained by the front end
    pub rtsp_map: Value,
    /// Camera id to local mount path
    pub rtsp_paths: HashMap<String, String>,
    /// Camera ids that were running when the snapshot was taken
    pub rtsps_snapshot: Vec<String>,
    pub mqtt_settings: MqttSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            google_access_tokens: None,
            rtsp_map: Value::Object(Map::new()),
            rtsp_paths: HashMap::new(),
            rtsps_snapshot: Vec::new(),
            mqtt_settings: MqttSettings::default(),
        }
    }
}

impl Settings {
    /// Build a snapshot from raw `(key, json)` rows, deep-merging each stored
    /// value over its default.
    pub fn from_rows<I>(rows: I) -> Result<Self, SettingsError>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut merged = serde_json::to_value(Settings::default())?;
        for (key, value) in rows {
            match merged.get_mut(&key) {
                Some(slot) => merge_json(slot, value),
                None => {
                    if let Value::Object(map) = &mut merged {
                        map.insert(key, value);
                    }
                }
            }
        }
        Ok(serde_json::from_value(merged)?)
    }

    /// Access token for the upstream device API, if signed in
    pub fn access_token(&self) -> Option<&str> {
        self.google_access_tokens
            .as_ref()
            .and_then(|tokens| tokens.get("access_token"))
            .and_then(Value::as_str)
    }

    /// Snapshot safe to broadcast to observers: credentials are reduced to flags.
    pub fn public_view(&self) -> Value {
        json!({
            "authenticated": self.google_access_tokens.is_some(),
            "rtsp_map": self.rtsp_map,
            "rtsp_paths": self.rtsp_paths,
            "rtsps_snapshot": self.rtsps_snapshot,
            "mqtt_settings": {
                "enabled": self.mqtt_settings.enabled,
                "host": self.mqtt_settings.host,
                "user": self.mqtt_settings.user,
            },
        })
    }
}

/// Recursive object merge; non-object values replace the base.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Async key-value settings persistence
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Read every stored key merged over the defaults
    async fn load(&self) -> Result<Settings, SettingsError>;

    /// Insert or replace a key
    async fn set(&self, key: &str, value: Value) -> Result<(), SettingsError>;

    /// Remove a key, falling back to its default
    async fn delete(&self, key: &str) -> Result<(), SettingsError>;
}
