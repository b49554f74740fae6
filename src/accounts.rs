//! Account Store (C2): durable account CRUD and the account status state
//! machine (spec §3 "Account", §4.2).
//!
//! The durable store is sqlite via `rusqlite` (the relational store named in
//! spec §6). `rusqlite::Connection` is synchronous; calls are short-lived
//! single-row reads/writes against a local file, so the connection is held
//! behind a plain `std::sync::Mutex` and used directly inside `async fn`
//! bodies rather than dispatched through `spawn_blocking` — the same
//! tradeoff the reconciler's periodic flush makes for the same reason. An
//! in-memory snapshot (`Arc<RwLock<Vec<Account>>>`) is kept alongside it so
//! hot-path reads (`get_enabled_by_type`) never touch sqlite at all; every
//! mutator updates both. This mirrors the
//! `Arc<RwLock<HashMap<...>>>` + durable-persistence split used by
//! `ai_providers.rs`'s `AIProviderStore`, generalized from a JSON file to a
//! relational table per spec §6.

use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Platform {
    Claude,
    OpenAi,
    Gemini,
    Other,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "claude" => Self::Claude,
            "openai" => Self::OpenAi,
            "gemini" => Self::Gemini,
            _ => Self::Other,
        }
    }

    /// Resolves a platform from a model name via prefix rules (spec §4.5
    /// `SelectAccount`).
    pub fn from_model(model: &str) -> Option<Self> {
        let m = model.to_ascii_lowercase();
        if m.starts_with("claude") {
            Some(Self::Claude)
        } else if m.starts_with("gpt")
            || m.starts_with("o1")
            || m.starts_with("o3")
            || m.starts_with("text-")
            || m.starts_with("davinci")
            || m.starts_with("curie")
            || m.starts_with("babbage")
            || m.starts_with("ada")
        {
            Some(Self::OpenAi)
        } else if m.starts_with("gemini") || m.starts_with("models/gemini") {
            Some(Self::Gemini)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AccountStatus {
    Valid,
    RateLimited,
    Overloaded,
    Suspended,
    Banned,
    Invalid,
    TokenExpired,
}

impl AccountStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::RateLimited => "rate_limited",
            Self::Overloaded => "overloaded",
            Self::Suspended => "suspended",
            Self::Banned => "banned",
            Self::Invalid => "invalid",
            Self::TokenExpired => "token_expired",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "rate_limited" => Self::RateLimited,
            "overloaded" => Self::Overloaded,
            "suspended" => Self::Suspended,
            "banned" => Self::Banned,
            "invalid" => Self::Invalid,
            "token_expired" => Self::TokenExpired,
            _ => Self::Valid,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub session_key: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
    pub organization_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: Uuid,
    pub platform: Platform,
    pub account_type: String,
    pub base_url: Option<String>,
    pub credentials: Credentials,
    pub enabled: bool,
    pub priority: i64,
    pub weight: i64,
    pub status: AccountStatus,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub consecutive_error_count: i64,
    pub suspended_count: i64,
    pub next_health_check_at: Option<DateTime<Utc>>,
    pub request_count: i64,
    pub error_count: i64,
    /// Integer micro-units (1 unit == 10^-6 currency units), per spec §3/§4.3.
    pub total_cost: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub proxy: Option<String>,
}

impl Account {
    /// `enabled=false ∨ status≠valid ⇒ not selectable` (spec §3 invariant).
    pub fn is_selectable(&self) -> bool {
        self.enabled && matches!(self.status, AccountStatus::Valid)
    }
}

pub type SharedAccountStore = Arc<AccountStore>;

pub struct AccountStore {
    conn: StdMutex<Connection>,
    cache: RwLock<Vec<Account>>,
}

impl AccountStore {
    pub async fn new(database_path: &str) -> anyhow::Result<Arc<Self>> {
        let conn = Connection::open(database_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                account_type TEXT NOT NULL,
                base_url TEXT,
                api_key TEXT,
                access_token TEXT,
                refresh_token TEXT,
                session_key TEXT,
                token_expiry TEXT,
                organization_id TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                priority INTEGER NOT NULL DEFAULT 0,
                weight INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'valid',
                last_error TEXT,
                last_error_at TEXT,
                rate_limit_reset_at TEXT,
                consecutive_error_count INTEGER NOT NULL DEFAULT 0,
                suspended_count INTEGER NOT NULL DEFAULT 0,
                next_health_check_at TEXT,
                request_count INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                total_cost INTEGER NOT NULL DEFAULT 0,
                last_used_at TEXT,
                proxy TEXT
            )",
        )?;
        let store = Arc::new(Self {
            conn: StdMutex::new(conn),
            cache: RwLock::new(Vec::new()),
        });
        store.refresh().await?;
        Ok(store)
    }

    fn row_to_account(row: &rusqlite::Row) -> rusqlite::Result<Account> {
        let id: String = row.get("id")?;
        let parse_dt = |s: Option<String>| -> Option<DateTime<Utc>> {
            s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };
        Ok(Account {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            platform: Platform::from_str(&row.get::<_, String>("platform")?),
            account_type: row.get("account_type")?,
            base_url: row.get("base_url")?,
            credentials: Credentials {
                api_key: row.get("api_key")?,
                access_token: row.get("access_token")?,
                refresh_token: row.get("refresh_token")?,
                session_key: row.get("session_key")?,
                token_expiry: parse_dt(row.get("token_expiry")?),
                organization_id: row.get("organization_id")?,
            },
            enabled: row.get::<_, i64>("enabled")? != 0,
            priority: row.get("priority")?,
            weight: row.get("weight")?,
            status: AccountStatus::from_str(&row.get::<_, String>("status")?),
            last_error: row.get("last_error")?,
            last_error_at: parse_dt(row.get("last_error_at")?),
            rate_limit_reset_at: parse_dt(row.get("rate_limit_reset_at")?),
            consecutive_error_count: row.get("consecutive_error_count")?,
            suspended_count: row.get("suspended_count")?,
            next_health_check_at: parse_dt(row.get("next_health_check_at")?),
            request_count: row.get("request_count")?,
            error_count: row.get("error_count")?,
            total_cost: row.get("total_cost")?,
            last_used_at: parse_dt(row.get("last_used_at")?),
            proxy: row.get("proxy")?,
        })
    }

    /// Rebuilds the in-memory snapshot from the durable store. `SelectAccount`
    /// observes either the old or the new snapshot atomically (spec §5).
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let accounts = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare("SELECT * FROM accounts")?;
            let rows = stmt.query_map([], Self::row_to_account)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        *self.cache.write().await = accounts;
        Ok(())
    }

    pub async fn insert(&self, account: Account) -> anyhow::Result<()> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO accounts (
                    id, platform, account_type, base_url, api_key, access_token,
                    refresh_token, session_key, token_expiry, organization_id,
                    enabled, priority, weight, status, last_error, last_error_at,
                    rate_limit_reset_at, consecutive_error_count, suspended_count,
                    next_health_check_at, request_count, error_count, total_cost,
                    last_used_at, proxy
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25)",
                params![
                    account.id.to_string(),
                    account.platform.as_str(),
                    account.account_type,
                    account.base_url,
                    account.credentials.api_key,
                    account.credentials.access_token,
                    account.credentials.refresh_token,
                    account.credentials.session_key,
                    account.credentials.token_expiry.map(|d| d.to_rfc3339()),
                    account.credentials.organization_id,
                    account.enabled as i64,
                    account.priority,
                    account.weight,
                    account.status.as_str(),
                    account.last_error,
                    account.last_error_at.map(|d| d.to_rfc3339()),
                    account.rate_limit_reset_at.map(|d| d.to_rfc3339()),
                    account.consecutive_error_count,
                    account.suspended_count,
                    account.next_health_check_at.map(|d| d.to_rfc3339()),
                    account.request_count,
                    account.error_count,
                    account.total_cost,
                    account.last_used_at.map(|d| d.to_rfc3339()),
                    account.proxy,
                ],
            )?;
        }
        self.refresh().await
    }

    pub async fn get(&self, id: Uuid) -> Option<Account> {
        self.cache.read().await.iter().find(|a| a.id == id).cloned()
    }

    /// Returns only `enabled=true ∧ status=valid` accounts for `platform`,
    /// ordered by `(priority desc, weight desc)` (spec §4.2).
    pub async fn get_enabled_by_platform(&self, platform: Platform) -> Vec<Account> {
        let mut accounts: Vec<Account> = self
            .cache
            .read()
            .await
            .iter()
            .filter(|a| a.platform == platform && a.is_selectable())
            .cloned()
            .collect();
        accounts.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| b.weight.cmp(&a.weight)));
        accounts
    }

    /// Finer routing by `account_type` (spec §4.2 `GetEnabledByType`).
    pub async fn get_enabled_by_type(&self, account_type: &str) -> Vec<Account> {
        let mut accounts: Vec<Account> = self
            .cache
            .read()
            .await
            .iter()
            .filter(|a| a.account_type == account_type && a.is_selectable())
            .cloned()
            .collect();
        accounts.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| b.weight.cmp(&a.weight)));
        accounts
    }

    async fn apply<F>(&self, id: Uuid, mutate: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut Account),
    {
        let mut account = match self.get(id).await {
            Some(a) => a,
            None => return Ok(()),
        };
        mutate(&mut account);
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE accounts SET enabled=?2, status=?3, last_error=?4, last_error_at=?5,
                 rate_limit_reset_at=?6, consecutive_error_count=?7, suspended_count=?8,
                 next_health_check_at=?9, request_count=?10, error_count=?11, total_cost=?12,
                 last_used_at=?13 WHERE id=?1",
                params![
                    account.id.to_string(),
                    account.enabled as i64,
                    account.status.as_str(),
                    account.last_error,
                    account.last_error_at.map(|d| d.to_rfc3339()),
                    account.rate_limit_reset_at.map(|d| d.to_rfc3339()),
                    account.consecutive_error_count,
                    account.suspended_count,
                    account.next_health_check_at.map(|d| d.to_rfc3339()),
                    account.request_count,
                    account.error_count,
                    account.total_cost,
                    account.last_used_at.map(|d| d.to_rfc3339()),
                ],
            )?;
        }
        let mut cache = self.cache.write().await;
        if let Some(slot) = cache.iter_mut().find(|a| a.id == id) {
            *slot = account;
        }
        Ok(())
    }

    /// Non-`rate_limited` transitions clear `rate_limit_reset_at`.
    pub async fn update_status(
        &self,
        id: Uuid,
        status: AccountStatus,
        last_error: Option<String>,
    ) -> anyhow::Result<()> {
        self.apply(id, |a| {
            a.status = status;
            a.last_error = last_error;
            a.last_error_at = Some(Utc::now());
            if !matches!(status, AccountStatus::RateLimited) {
                a.rate_limit_reset_at = None;
            }
        })
        .await
    }

    pub async fn update_status_with_rate_limit(
        &self,
        id: Uuid,
        err: String,
        reset_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.apply(id, |a| {
            a.status = AccountStatus::RateLimited;
            a.last_error = Some(err);
            a.last_error_at = Some(Utc::now());
            a.rate_limit_reset_at = Some(reset_at);
        })
        .await
    }

    /// Marks an account `overloaded` with a probe deadline rather than a
    /// fixed reset time, since 529 responses carry no `retry-after` (spec §9
    /// Open Question 1). `consecutive_error_count` is bumped so a repeat
    /// overload widens the next backoff window; it is only cleared by
    /// [`Self::clear_consecutive_errors`] on a subsequent successful request.
    pub async fn update_status_with_probe(
        &self,
        id: Uuid,
        err: String,
        next_check: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.apply(id, |a| {
            a.status = AccountStatus::Overloaded;
            a.last_error = Some(err);
            a.last_error_at = Some(Utc::now());
            a.next_health_check_at = Some(next_check);
            a.consecutive_error_count += 1;
        })
        .await
    }

    /// Flips every `overloaded` account whose probe deadline has passed back
    /// to `valid`. `consecutive_error_count` is left untouched so a repeat
    /// overload keeps widening the backoff instead of restarting it. Called
    /// every 30s by the reconciler.
    pub async fn recover_probed_accounts(&self) -> anyhow::Result<usize> {
        let now = Utc::now();
        let due: Vec<Uuid> = self
            .cache
            .read()
            .await
            .iter()
            .filter(|a| {
                matches!(a.status, AccountStatus::Overloaded)
                    && a.next_health_check_at.map(|t| now >= t).unwrap_or(false)
            })
            .map(|a| a.id)
            .collect();
        for id in &due {
            self.apply(*id, |a| {
                a.status = AccountStatus::Valid;
                a.next_health_check_at = None;
            })
            .await?;
        }
        Ok(due.len())
    }

    /// Flips every `rate_limited` account whose reset time has passed back
    /// to `valid`, clearing `rate_limit_reset_at`. Returns the count
    /// recovered. Called every 60s by the reconciler.
    pub async fn recover_rate_limited_accounts(&self) -> anyhow::Result<usize> {
        let now = Utc::now();
        let due: Vec<Uuid> = self
            .cache
            .read()
            .await
            .iter()
            .filter(|a| {
                matches!(a.status, AccountStatus::RateLimited)
                    && a.rate_limit_reset_at.map(|t| now >= t).unwrap_or(false)
            })
            .map(|a| a.id)
            .collect();
        for id in &due {
            self.update_status(*id, AccountStatus::Valid, None).await?;
        }
        Ok(due.len())
    }

    pub async fn mark_as_suspended(&self, id: Uuid) -> anyhow::Result<()> {
        self.apply(id, |a| {
            a.status = AccountStatus::Suspended;
            a.suspended_count += 1;
        })
        .await
    }

    pub async fn mark_as_banned(&self, id: Uuid) -> anyhow::Result<()> {
        self.apply(id, |a| {
            a.status = AccountStatus::Banned;
            a.enabled = false;
        })
        .await
    }

    pub async fn mark_as_token_expired(&self, id: Uuid) -> anyhow::Result<()> {
        self.apply(id, |a| {
            a.status = AccountStatus::TokenExpired;
        })
        .await
    }

    pub async fn mark_as_invalid(&self, id: Uuid) -> anyhow::Result<()> {
        self.apply(id, |a| {
            a.status = AccountStatus::Invalid;
            a.enabled = false;
        })
        .await
    }

    /// Zeroes health counters and restores `valid`.
    pub async fn recover_account(&self, id: Uuid) -> anyhow::Result<()> {
        self.apply(id, |a| {
            a.status = AccountStatus::Valid;
            a.consecutive_error_count = 0;
            a.suspended_count = 0;
            a.last_error = None;
            a.last_error_at = None;
            a.rate_limit_reset_at = None;
        })
        .await
    }

    /// The only path out of `banned` (spec §4.2: "Terminal but recoverable:
    /// `banned` only via admin `ForceRecoverAccount`").
    pub async fn force_recover_account(&self, id: Uuid) -> anyhow::Result<()> {
        self.apply(id, |a| {
            a.status = AccountStatus::Valid;
            a.enabled = true;
            a.consecutive_error_count = 0;
            a.suspended_count = 0;
        })
        .await
    }

    pub async fn increment_request_count(&self, id: Uuid) -> anyhow::Result<()> {
        self.apply(id, |a| a.request_count += 1).await
    }

    /// Bumps `error_count`/`consecutive_error_count` and records the
    /// triggering message, for the "otherwise only `errorCount++` and
    /// `lastError` updated; status unchanged" branches (spec §4.5) that
    /// don't go through `update_status`/`update_status_with_probe`.
    pub async fn increment_error_count_with_message(&self, id: Uuid, message: String) -> anyhow::Result<()> {
        self.apply(id, |a| {
            a.error_count += 1;
            a.consecutive_error_count += 1;
            a.last_error = Some(message);
            a.last_error_at = Some(Utc::now());
        })
        .await
    }

    pub async fn increment_total_cost(&self, id: Uuid, delta: i64) -> anyhow::Result<()> {
        self.apply(id, |a| a.total_cost += delta).await
    }

    pub async fn clear_consecutive_errors(&self, id: Uuid) -> anyhow::Result<()> {
        self.apply(id, |a| a.consecutive_error_count = 0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_account(platform: Platform, priority: i64, weight: i64) -> Account {
        Account {
            id: Uuid::new_v4(),
            platform,
            account_type: format!("{}-official", platform.as_str()),
            base_url: None,
            credentials: Credentials::default(),
            enabled: true,
            priority,
            weight,
            status: AccountStatus::Valid,
            last_error: None,
            last_error_at: None,
            rate_limit_reset_at: None,
            consecutive_error_count: 0,
            suspended_count: 0,
            next_health_check_at: None,
            request_count: 0,
            error_count: 0,
            total_cost: 0,
            last_used_at: None,
            proxy: None,
        }
    }

    async fn test_store() -> Arc<AccountStore> {
        AccountStore::new(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn get_enabled_by_platform_orders_by_priority_then_weight() {
        let store = test_store().await;
        let low = new_account(Platform::Claude, 1, 10);
        let high = new_account(Platform::Claude, 5, 1);
        store.insert(low.clone()).await.unwrap();
        store.insert(high.clone()).await.unwrap();
        let accounts = store.get_enabled_by_platform(Platform::Claude).await;
        assert_eq!(accounts[0].id, high.id);
        assert_eq!(accounts[1].id, low.id);
    }

    #[tokio::test]
    async fn disabled_accounts_are_not_selectable() {
        let store = test_store().await;
        let mut acc = new_account(Platform::Claude, 1, 1);
        acc.enabled = false;
        store.insert(acc.clone()).await.unwrap();
        assert!(store.get_enabled_by_platform(Platform::Claude).await.is_empty());
    }

    #[tokio::test]
    async fn rate_limit_invariant_and_recovery() {
        let store = test_store().await;
        let acc = new_account(Platform::Claude, 1, 1);
        store.insert(acc.clone()).await.unwrap();
        let reset_at = Utc::now() - chrono::Duration::seconds(1);
        store
            .update_status_with_rate_limit(acc.id, "429".to_string(), reset_at)
            .await
            .unwrap();
        let fetched = store.get(acc.id).await.unwrap();
        assert!(matches!(fetched.status, AccountStatus::RateLimited));
        assert_eq!(fetched.rate_limit_reset_at, Some(reset_at));

        let recovered = store.recover_rate_limited_accounts().await.unwrap();
        assert_eq!(recovered, 1);
        let fetched = store.get(acc.id).await.unwrap();
        assert!(matches!(fetched.status, AccountStatus::Valid));
        assert!(fetched.rate_limit_reset_at.is_none());
    }

    #[tokio::test]
    async fn banned_disables_and_only_force_recover_reverses_it() {
        let store = test_store().await;
        let acc = new_account(Platform::Claude, 1, 1);
        store.insert(acc.clone()).await.unwrap();
        store.mark_as_banned(acc.id).await.unwrap();
        let fetched = store.get(acc.id).await.unwrap();
        assert!(matches!(fetched.status, AccountStatus::Banned));
        assert!(!fetched.enabled);

        store.force_recover_account(acc.id).await.unwrap();
        let fetched = store.get(acc.id).await.unwrap();
        assert!(matches!(fetched.status, AccountStatus::Valid));
        assert!(fetched.enabled);
    }

    #[tokio::test]
    async fn model_to_platform_prefix_rules() {
        assert_eq!(Platform::from_model("claude-sonnet-4"), Some(Platform::Claude));
        assert_eq!(Platform::from_model("gpt-4o"), Some(Platform::OpenAi));
        assert_eq!(Platform::from_model("o3-mini"), Some(Platform::OpenAi));
        assert_eq!(Platform::from_model("gemini-1.5-pro"), Some(Platform::Gemini));
        assert_eq!(Platform::from_model("models/gemini-pro"), Some(Platform::Gemini));
        assert_eq!(Platform::from_model("mystery-model"), None);
    }
}
