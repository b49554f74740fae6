//! API Key store (spec §3 "API Key"): client-facing credentials.
//!
//! Adapted from `api/proxy_keys.rs`'s `ProxyApiKeyStore` (SHA-256 hash,
//! `sk-`-prefixed plaintext shown once, constant-time verify), moved from
//! its JSON-file persistence onto the same sqlite relational store
//! [`crate::accounts::AccountStore`] uses (spec §6: API Keys live in the
//! relational store alongside Accounts/Users), and widened with the richer
//! attribute set — allow-lists, caps, expiry — spec §3 calls for.

use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ApiKeyStatus {
    Active,
    Disabled,
}

impl ApiKeyStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "disabled" => Self::Disabled,
            _ => Self::Active,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub status: ApiKeyStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub allowed_platforms: Vec<String>,
    pub allowed_models: Vec<String>,
    pub allowed_clients: Vec<String>,
    pub rate_limit_per_minute: Option<u32>,
    pub daily_cap_micro_units: Option<i64>,
    pub monthly_cap_micro_units: Option<i64>,
    pub package_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.status == ApiKeyStatus::Active && self.expires_at.map(|exp| exp > now).unwrap_or(true)
    }

    pub fn allows_platform(&self, platform: &str) -> bool {
        self.allowed_platforms.is_empty() || self.allowed_platforms.iter().any(|p| p == platform)
    }

    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }

    pub fn allows_client(&self, client: Option<&str>) -> bool {
        if self.allowed_clients.is_empty() {
            return true;
        }
        match client {
            Some(c) => self.allowed_clients.iter().any(|allowed| allowed == c),
            None => false,
        }
    }
}

pub struct IssuedApiKey {
    pub record: ApiKey,
    /// The raw `sk-<64 hex>` value — shown only once, at issuance (spec §3
    /// invariant).
    pub plaintext: String,
}

pub type SharedApiKeyStore = Arc<ApiKeyStore>;

pub struct ApiKeyStore {
    conn: StdMutex<Connection>,
    cache: RwLock<Vec<ApiKey>>,
}

fn hex_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Constant-time string comparison; verification always scans the whole
/// table so a timing side-channel cannot narrow down which key hash matched.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a_bytes.len() {
        diff |= a_bytes[i] ^ b_bytes[i];
    }
    diff == 0
}

fn join_list(items: &[String]) -> String {
    items.join(",")
}

fn split_list(s: &str) -> Vec<String> {
    if s.is_empty() {
        Vec::new()
    } else {
        s.split(',').map(|s| s.to_string()).collect()
    }
}

impl ApiKeyStore {
    pub async fn new(database_path: &str) -> anyhow::Result<Arc<Self>> {
        let conn = Connection::open(database_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                key_hash TEXT NOT NULL UNIQUE,
                key_prefix TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                expires_at TEXT,
                allowed_platforms TEXT NOT NULL DEFAULT '',
                allowed_models TEXT NOT NULL DEFAULT '',
                allowed_clients TEXT NOT NULL DEFAULT '',
                rate_limit_per_minute INTEGER,
                daily_cap_micro_units INTEGER,
                monthly_cap_micro_units INTEGER,
                package_id TEXT,
                created_at TEXT NOT NULL
            )",
        )?;
        let store = Arc::new(Self {
            conn: StdMutex::new(conn),
            cache: RwLock::new(Vec::new()),
        });
        store.refresh().await?;
        Ok(store)
    }

    fn row_to_key(row: &rusqlite::Row) -> rusqlite::Result<ApiKey> {
        let id: String = row.get("id")?;
        let expires_at: Option<String> = row.get("expires_at")?;
        let created_at: String = row.get("created_at")?;
        let package_id: Option<String> = row.get("package_id")?;
        Ok(ApiKey {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            user_id: row.get("user_id")?,
            name: row.get("name")?,
            key_hash: row.get("key_hash")?,
            key_prefix: row.get("key_prefix")?,
            status: ApiKeyStatus::from_str(&row.get::<_, String>("status")?),
            expires_at: expires_at
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|d| d.with_timezone(&Utc)),
            allowed_platforms: split_list(&row.get::<_, String>("allowed_platforms")?),
            allowed_models: split_list(&row.get::<_, String>("allowed_models")?),
            allowed_clients: split_list(&row.get::<_, String>("allowed_clients")?),
            rate_limit_per_minute: row.get::<_, Option<i64>>("rate_limit_per_minute")?.map(|v| v as u32),
            daily_cap_micro_units: row.get("daily_cap_micro_units")?,
            monthly_cap_micro_units: row.get("monthly_cap_micro_units")?,
            package_id: package_id.and_then(|s| Uuid::parse_str(&s).ok()),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    pub async fn refresh(&self) -> anyhow::Result<()> {
        let keys = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare("SELECT * FROM api_keys")?;
            let rows = stmt.query_map([], Self::row_to_key)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        *self.cache.write().await = keys;
        Ok(())
    }

    /// Issues a new key for `user_id`. The plaintext is never persisted;
    /// only its SHA-256 hash is stored (spec §3 invariant: "the plaintext is
    /// returned exactly once at issuance").
    #[allow(clippy::too_many_arguments)]
    pub async fn issue(
        &self,
        user_id: impl Into<String>,
        name: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
        allowed_platforms: Vec<String>,
        allowed_models: Vec<String>,
        allowed_clients: Vec<String>,
        rate_limit_per_minute: Option<u32>,
        daily_cap_micro_units: Option<i64>,
        monthly_cap_micro_units: Option<i64>,
    ) -> anyhow::Result<IssuedApiKey> {
        let raw_suffix = Uuid::new_v4().simple().to_string() + &Uuid::new_v4().simple().to_string();
        let plaintext = format!("sk-{}", &raw_suffix[..64]);
        let key_hash = hex_sha256(&plaintext);
        let key_prefix = plaintext[..12].to_string();
        let record = ApiKey {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            name: name.into(),
            key_hash,
            key_prefix,
            status: ApiKeyStatus::Active,
            expires_at,
            allowed_platforms,
            allowed_models,
            allowed_clients,
            rate_limit_per_minute,
            daily_cap_micro_units,
            monthly_cap_micro_units,
            package_id: None,
            created_at: Utc::now(),
        };

        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO api_keys (
                    id, user_id, name, key_hash, key_prefix, status, expires_at,
                    allowed_platforms, allowed_models, allowed_clients,
                    rate_limit_per_minute, daily_cap_micro_units, monthly_cap_micro_units,
                    package_id, created_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                params![
                    record.id.to_string(),
                    record.user_id,
                    record.name,
                    record.key_hash,
                    record.key_prefix,
                    record.status.as_str(),
                    record.expires_at.map(|d| d.to_rfc3339()),
                    join_list(&record.allowed_platforms),
                    join_list(&record.allowed_models),
                    join_list(&record.allowed_clients),
                    record.rate_limit_per_minute,
                    record.daily_cap_micro_units,
                    record.monthly_cap_micro_units,
                    record.package_id.map(|p| p.to_string()),
                    record.created_at.to_rfc3339(),
                ],
            )?;
        }
        self.refresh().await?;
        Ok(IssuedApiKey { record, plaintext })
    }

    /// Looks up the key matching `token`'s hash, scanning every stored hash
    /// regardless of an early match (spec §8 "API key verification").
    pub async fn verify(&self, token: &str) -> Option<ApiKey> {
        let token_hash = hex_sha256(token);
        let keys = self.cache.read().await;
        let mut found = None;
        for key in keys.iter() {
            if constant_time_eq(&token_hash, &key.key_hash) {
                found = Some(key.clone());
            }
        }
        found
    }

    pub async fn get(&self, id: Uuid) -> Option<ApiKey> {
        self.cache.read().await.iter().find(|k| k.id == id).cloned()
    }

    pub async fn list_for_user(&self, user_id: &str) -> Vec<ApiKey> {
        self.cache.read().await.iter().filter(|k| k.user_id == user_id).cloned().collect()
    }

    pub async fn disable(&self, id: Uuid) -> anyhow::Result<()> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE api_keys SET status='disabled' WHERE id=?1",
                params![id.to_string()],
            )?;
        }
        self.refresh().await
    }

    /// Binds (or unbinds, with `None`) the key's user-package (spec §3
    /// "optional bound user-package").
    pub async fn bind_package(&self, id: Uuid, package_id: Option<Uuid>) -> anyhow::Result<()> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE api_keys SET package_id=?2 WHERE id=?1",
                params![id.to_string(), package_id.map(|p| p.to_string())],
            )?;
        }
        self.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Arc<ApiKeyStore> {
        ApiKeyStore::new(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn issued_plaintext_hashes_to_the_stored_hash() {
        let store = store().await;
        let issued = store
            .issue("u1", "test key", None, vec![], vec![], vec![], None, None, None)
            .await
            .unwrap();
        assert_eq!(hex_sha256(&issued.plaintext), issued.record.key_hash);
        assert!(issued.plaintext.starts_with("sk-"));
        assert_eq!(issued.plaintext.len(), 67);
    }

    #[tokio::test]
    async fn verify_finds_the_matching_key_and_rejects_garbage() {
        let store = store().await;
        let issued = store
            .issue("u1", "test key", None, vec![], vec![], vec![], None, None, None)
            .await
            .unwrap();
        let found = store.verify(&issued.plaintext).await.unwrap();
        assert_eq!(found.id, issued.record.id);
        assert!(store.verify("sk-not-a-real-key").await.is_none());
    }

    #[tokio::test]
    async fn disabled_key_is_not_usable() {
        let store = store().await;
        let issued = store
            .issue("u1", "test key", None, vec![], vec![], vec![], None, None, None)
            .await
            .unwrap();
        store.disable(issued.record.id).await.unwrap();
        let fetched = store.get(issued.record.id).await.unwrap();
        assert!(!fetched.is_usable(Utc::now()));
    }

    #[tokio::test]
    async fn expired_key_is_not_usable() {
        let store = store().await;
        let issued = store
            .issue(
                "u1",
                "test key",
                Some(Utc::now() - chrono::Duration::seconds(1)),
                vec![],
                vec![],
                vec![],
                None,
                None,
                None,
            )
            .await
            .unwrap();
        assert!(!issued.record.is_usable(Utc::now()));
    }

    #[tokio::test]
    async fn allow_lists_empty_means_unrestricted_but_populated_is_enforced() {
        let store = store().await;
        let issued = store
            .issue(
                "u1",
                "scoped key",
                None,
                vec!["claude".to_string()],
                vec![],
                vec![],
                None,
                None,
                None,
            )
            .await
            .unwrap();
        assert!(issued.record.allows_platform("claude"));
        assert!(!issued.record.allows_platform("openai"));
        assert!(issued.record.allows_model("anything"));
    }
}
