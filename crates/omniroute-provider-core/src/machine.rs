use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::kind::ProviderKind;

pub const DEFAULT_PRIORITY: i64 = 999;

/// Root configuration object for one machine (tenant unit).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineRecord {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConnection>,
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,
    #[serde(default)]
    pub combos: Vec<Combo>,
    #[serde(default)]
    pub api_keys: HashSet<String>,
    /// Consumed by accounting; opaque to the routing core.
    #[serde(default)]
    pub pricing: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Combo {
    pub id: String,
    pub name: String,
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Oauth,
    Apikey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Active,
    Unavailable,
}

/// One account held by a machine for a given provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConnection {
    pub id: String,
    pub provider: ProviderKind,
    pub auth_type: AuthType,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,

    // Credential union: api_key for AuthType::Apikey, token fields for oauth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    /// Free-form per-provider state (Cursor machine id, Copilot token and
    /// expiry, custom base URLs, known model lists).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub provider_data: Value,
    /// Google project binding (Gemini CLI / Antigravity).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    #[serde(default)]
    pub health: ConnectionHealth,
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionHealth {
    #[serde(default)]
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option")]
    pub rate_limited_until: Option<OffsetDateTime>,
    #[serde(default)]
    pub backoff_level: u32,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option")]
    pub last_error_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl ProviderConnection {
    pub fn new_api_key(
        id: impl Into<String>,
        provider: ProviderKind,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            provider,
            auth_type: AuthType::Apikey,
            name: String::new(),
            priority: DEFAULT_PRIORITY,
            is_active: true,
            api_key: Some(api_key.into()),
            access_token: None,
            refresh_token: None,
            expires_at: None,
            id_token: None,
            scope: None,
            token_type: None,
            provider_data: Value::Null,
            project_id: None,
            health: ConnectionHealth::default(),
        }
    }

    /// True while `rate_limited_until` lies in the future.
    pub fn is_cooling_down(&self, now: OffsetDateTime) -> bool {
        self.health
            .rate_limited_until
            .map(|until| until > now)
            .unwrap_or(false)
    }

    /// Seconds until the access token expires; `None` when no expiry is
    /// tracked.
    pub fn token_ttl_secs(&self, now: OffsetDateTime) -> Option<i64> {
        self.expires_at
            .map(|at| at - now.unix_timestamp())
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.provider_data.get(key).and_then(Value::as_str)
    }

    pub fn data_i64(&self, key: &str) -> Option<i64> {
        self.provider_data.get(key).and_then(Value::as_i64)
    }
}

/// A field-wise merge applied to a stored connection. `None` leaves the
/// stored value untouched; token refresh therefore can never null out an
/// access token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionUpdate {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    pub id_token: Option<String>,
    pub project_id: Option<String>,
    /// Merged key-by-key into `provider_data`.
    pub provider_data: Option<Value>,
    pub health: Option<ConnectionHealth>,
}

impl ConnectionUpdate {
    pub fn apply(&self, connection: &mut ProviderConnection, now: OffsetDateTime) {
        if let Some(token) = &self.access_token {
            connection.access_token = Some(token.clone());
        }
        if let Some(token) = &self.refresh_token {
            connection.refresh_token = Some(token.clone());
        }
        if let Some(at) = self.expires_at {
            connection.expires_at = Some(at);
        }
        if let Some(token) = &self.id_token {
            connection.id_token = Some(token.clone());
        }
        if let Some(project) = &self.project_id {
            connection.project_id = Some(project.clone());
        }
        if let Some(Value::Object(incoming)) = &self.provider_data {
            if !connection.provider_data.is_object() {
                connection.provider_data = Value::Object(serde_json::Map::new());
            }
            if let Some(existing) = connection.provider_data.as_object_mut() {
                for (key, value) in incoming {
                    existing.insert(key.clone(), value.clone());
                }
            }
        }
        if let Some(health) = &self.health {
            connection.health = health.clone();
        }
        connection.health.updated_at = Some(now);
    }
}
