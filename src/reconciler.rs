//! Background reconciliation workers tying the hot (in-process) and cold
//! (sqlite) stores together (spec §6, §9 hot/cold duality).
//!
//! Grounded on the teacher's pattern of spawning independent `tokio::spawn`
//! loops from `serve()` (background OAuth refresher, desktop session
//! cleanup) — here generalized into sweepers for sessions, unavailability
//! marks, rate-limited/overloaded account recovery, stale usage counters,
//! and a periodic hot→cold flush of usage records.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;

use crate::accounts::SharedAccountStore;
use crate::cache::{SessionStore, UnavailabilityMarks};
use crate::config::SharedConfigStore;
use crate::usage::SharedUsageAccumulator;

/// Owns the cold-store connection used for the periodic usage-record flush;
/// every other sweep operates purely on the hot stores already owned by
/// [`crate::api::routes::AppState`].
pub struct Reconciler {
    accounts: SharedAccountStore,
    sessions: Arc<SessionStore>,
    marks: Arc<UnavailabilityMarks>,
    usage: SharedUsageAccumulator,
    config: SharedConfigStore,
    /// Same short-lived-local-sqlite-call tradeoff as [`crate::accounts`]:
    /// held directly inside the flush's `async fn` body rather than
    /// dispatched through `spawn_blocking`.
    cold: std::sync::Mutex<Connection>,
}

pub type SharedReconciler = Arc<Reconciler>;

impl Reconciler {
    pub fn new(
        accounts: SharedAccountStore,
        sessions: Arc<SessionStore>,
        marks: Arc<UnavailabilityMarks>,
        usage: SharedUsageAccumulator,
        config: SharedConfigStore,
        database_path: &str,
    ) -> anyhow::Result<Arc<Self>> {
        let conn = Connection::open(database_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS usage_records_cold (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                api_key_id TEXT NOT NULL,
                model TEXT NOT NULL,
                platform TEXT NOT NULL,
                request_ip TEXT,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                cache_creation_input_tokens INTEGER NOT NULL,
                cache_read_input_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                total_cost INTEGER NOT NULL,
                request_time TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Arc::new(Self {
            accounts,
            sessions,
            marks,
            usage,
            config,
            cold: std::sync::Mutex::new(conn),
        }))
    }

    /// Spawns every sweeper as an independent `tokio::spawn` task. Returns
    /// immediately; the tasks run for the lifetime of the process.
    pub fn spawn_workers(self: &Arc<Self>) {
        self.spawn_session_sweeper();
        self.spawn_unavailability_sweeper();
        self.spawn_rate_limit_recovery();
        self.spawn_overload_probe();
        self.spawn_usage_retention_sweeper();
        self.spawn_usage_flush();
    }

    fn spawn_session_sweeper(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let removed = this.sessions.sweep_expired().await;
                if removed > 0 {
                    tracing::debug!(removed, "swept expired sticky sessions");
                }
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        });
    }

    fn spawn_unavailability_sweeper(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let removed = this.marks.sweep_expired().await;
                if removed > 0 {
                    tracing::debug!(removed, "swept expired unavailability marks");
                }
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });
    }

    /// Recovers `rate_limited` accounts whose `rate_limit_reset_at` has
    /// passed (spec §4.5). Every 60s, matching the upstream-documented
    /// unified-5h rate-limit window granularity.
    fn spawn_rate_limit_recovery(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match this.accounts.recover_rate_limited_accounts().await {
                    Ok(n) if n > 0 => tracing::info!(recovered = n, "recovered rate-limited accounts"),
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "rate-limit recovery sweep failed"),
                }
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        });
    }

    /// Recovers `overloaded` accounts whose exponential-backoff probe
    /// deadline has passed (spec §9 Open Question 1). Runs more often than
    /// the rate-limit sweep since the initial backoff window is as short as
    /// 30s.
    fn spawn_overload_probe(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match this.accounts.recover_probed_accounts().await {
                    Ok(n) if n > 0 => tracing::info!(recovered = n, "probed overloaded accounts back to valid"),
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "overload probe sweep failed"),
                }
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });
    }

    fn spawn_usage_retention_sweeper(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                this.usage.sweep_expired().await;
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        });
    }

    /// Mirrors the hot usage-record ring into the durable store, honoring
    /// `ConfigStore`'s `sync_enabled`/`sync_interval` keys (spec §6, §9).
    /// `INSERT OR IGNORE` on the record id makes repeated flushes of the
    /// same in-memory ring idempotent.
    fn spawn_usage_flush(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let enabled = this.config.get_bool("sync_enabled", true).await;
                let interval_mins = this.config.get_u64("sync_interval", 5).await.max(1);
                if enabled {
                    match this.flush_usage_records().await {
                        Ok(n) if n > 0 => tracing::info!(flushed = n, "flushed usage records to durable store"),
                        Ok(_) => {}
                        Err(err) => tracing::warn!(error = %err, "usage record flush failed"),
                    }
                }
                tokio::time::sleep(Duration::from_secs(interval_mins * 60)).await;
            }
        });
    }

    async fn flush_usage_records(&self) -> anyhow::Result<usize> {
        let records = self.usage.snapshot_records().await;
        let conn = self.cold.lock().unwrap();
        let mut flushed = 0;
        for record in &records {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO usage_records_cold (
                    id, user_id, api_key_id, model, platform, request_ip,
                    input_tokens, output_tokens, cache_creation_input_tokens,
                    cache_read_input_tokens, total_tokens, total_cost, request_time
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                rusqlite::params![
                    record.id.to_string(),
                    record.user_id,
                    record.api_key_id.to_string(),
                    record.model,
                    record.platform,
                    record.request_ip,
                    record.input_tokens,
                    record.output_tokens,
                    record.cache_creation_input_tokens,
                    record.cache_read_input_tokens,
                    record.total_tokens,
                    record.total_cost,
                    record.request_time.to_rfc3339(),
                ],
            )?;
            flushed += changed;
        }
        Ok(flushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountStore;
    use crate::config::ConfigStore;
    use crate::usage::{UsageAccumulator, UsageRecord};
    use uuid::Uuid;

    async fn test_reconciler(database_path: &str) -> Arc<Reconciler> {
        let accounts = AccountStore::new(":memory:").await.unwrap();
        let sessions = SessionStore::new(Duration::from_secs(1800));
        let marks = UnavailabilityMarks::new();
        let usage = UsageAccumulator::new();
        let config = ConfigStore::new();
        Reconciler::new(accounts, sessions, marks, usage, config, database_path).unwrap()
    }

    #[tokio::test]
    async fn flushing_the_same_snapshot_twice_inserts_each_record_once() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("cold.sqlite");
        let reconciler = test_reconciler(db_path.to_str().unwrap()).await;

        let record = UsageRecord {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            api_key_id: Uuid::new_v4(),
            model: "claude-sonnet".to_string(),
            platform: "claude".to_string(),
            request_ip: None,
            input_tokens: 10,
            output_tokens: 5,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
            total_tokens: 15,
            total_cost: 42,
            request_time: chrono::Utc::now(),
        };
        reconciler.usage.record_request(record, None).await.unwrap();

        let first = reconciler.flush_usage_records().await.unwrap();
        let second = reconciler.flush_usage_records().await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0, "re-flushing the same snapshot must not duplicate rows");
    }
}
