//! Process configuration.
//!
//! Two layers, per spec §6: a static [`Config`] loaded once at startup from
//! the environment, and a dynamic [`ConfigStore`] of admin-editable system
//! config keys that is re-read on every access and broadcasts a refresh
//! signal on write.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{watch, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Static, process-lifetime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Path to the sqlite file backing the durable (cold) store.
    pub database_path: String,
    /// Optional external hot-store address (e.g. a Redis URL). When absent,
    /// in-process equivalents with the same contract are used (spec §6).
    pub hot_store_url: Option<String>,
    /// Bearer secret accepted as a superuser key in addition to issued API
    /// keys, useful for local tooling. Generated ephemerally if unset.
    pub proxy_secret: String,
    pub request_deadline_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("PORT".to_string(), "not a u16".to_string()))?;
        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "proxy_gateway.sqlite".to_string());
        let hot_store_url = std::env::var("REDIS_URL").ok().filter(|s| !s.trim().is_empty());
        let proxy_secret = std::env::var("PROXY_SECRET")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| {
                let secret = uuid::Uuid::new_v4().to_string();
                tracing::info!("No PROXY_SECRET set; generated ephemeral secret");
                secret
            });
        let request_deadline_secs = std::env::var("REQUEST_DEADLINE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(120);

        Ok(Self {
            host,
            port,
            database_path,
            hot_store_url,
            proxy_secret,
            request_deadline_secs,
        })
    }

    /// Construct directly, bypassing the environment — used by tests.
    pub fn for_test(database_path: impl Into<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            database_path: database_path.into(),
            hot_store_url: None,
            proxy_secret: "test-secret".to_string(),
            request_deadline_secs: 120,
        }
    }
}

/// The admin-editable system config surface (spec §6). Values are re-read
/// from the map on every [`ConfigStore::get`] call — there is no additional
/// caching layer — and [`ConfigStore::set`] broadcasts on `refresh` so
/// long-lived workers (the reconciler, sweepers) can react without polling.
pub struct ConfigStore {
    values: RwLock<HashMap<String, Value>>,
    refresh_tx: watch::Sender<()>,
}

pub type SharedConfigStore = Arc<ConfigStore>;

impl ConfigStore {
    pub fn new() -> Arc<Self> {
        let mut defaults = HashMap::new();
        defaults.insert("session_ttl".to_string(), Value::from(30));
        defaults.insert("sync_enabled".to_string(), Value::from(true));
        defaults.insert("sync_interval".to_string(), Value::from(5));
        defaults.insert("record_retention_days".to_string(), Value::from(30));
        defaults.insert("record_max_count".to_string(), Value::from(1000));
        defaults.insert("global_price_rate".to_string(), Value::from(1.0));
        defaults.insert("account_error_threshold".to_string(), Value::from(5));
        defaults.insert("probe_init_interval_secs".to_string(), Value::from(30));
        defaults.insert("probe_backoff_factor".to_string(), Value::from(2.0));
        defaults.insert("probe_max_interval_secs".to_string(), Value::from(900));
        defaults.insert("account_concurrency_limit".to_string(), Value::from(10));
        defaults.insert("account_unavailable_ttl_secs".to_string(), Value::from(5));
        defaults.insert("max_account_retry_attempts".to_string(), Value::from(3));

        let (refresh_tx, _rx) = watch::channel(());
        Arc::new(Self {
            values: RwLock::new(defaults),
            refresh_tx,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<()> {
        self.refresh_tx.subscribe()
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.values.read().await.get(key).cloned()
    }

    pub async fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key).await.and_then(|v| v.as_u64()).unwrap_or(default)
    }

    pub async fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get(key).await.and_then(|v| v.as_f64()).unwrap_or(default)
    }

    pub async fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).await.and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.values.write().await.insert(key.into(), value);
        let _ = self.refresh_tx.send(());
    }

    /// Admin override for one `(locale, error kind)` pair's user-facing
    /// message, stored under the `message:<locale>:<kind>` key alongside
    /// every other system config value (spec §7: "customizable user-facing
    /// message, admin-editable table").
    pub async fn get_message_override(&self, locale: &str, kind: &str) -> Option<String> {
        match self.get(&format!("message:{locale}:{kind}")).await {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub async fn set_message_override(
        &self,
        locale: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.set(format!("message:{}:{}", locale.into(), kind.into()), Value::String(message.into()))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_are_seeded() {
        let store = ConfigStore::new();
        assert_eq!(store.get_u64("session_ttl", 0).await, 30);
        assert_eq!(store.get_bool("sync_enabled", false).await, true);
    }

    #[tokio::test]
    async fn set_is_visible_immediately_and_broadcasts() {
        let store = ConfigStore::new();
        let mut rx = store.subscribe();
        store.set("session_ttl", Value::from(60)).await;
        assert_eq!(store.get_u64("session_ttl", 0).await, 60);
        rx.changed().await.unwrap();
    }

    #[tokio::test]
    async fn message_override_round_trips_per_locale() {
        let store = ConfigStore::new();
        assert_eq!(store.get_message_override("en", "bad_request").await, None);
        store.set_message_override("en", "bad_request", "Custom message").await;
        assert_eq!(
            store.get_message_override("en", "bad_request").await,
            Some("Custom message".to_string())
        );
        assert_eq!(store.get_message_override("zh", "bad_request").await, None);
    }
}
