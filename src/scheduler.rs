//! Scheduler (C5): account selection — sticky, weighted, and failure
//! classification (spec §4.5).
//!
//! Grounded on `claude-code-relay`'s `scheduler.rs` (sticky-session lookup
//! before falling back to pool selection) and `provider_health.rs`'s
//! `BackoffConfig`/cooldown classification, generalized to the spec's exact
//! weighted-random-draw formula and substring-based error classification.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::accounts::{Account, AccountStatus, Platform, SharedAccountStore};
use crate::cache::{SessionStore, UnavailabilityMarks};

pub struct Scheduler {
    accounts: SharedAccountStore,
    sessions: Arc<SessionStore>,
    marks: Arc<UnavailabilityMarks>,
}

impl Scheduler {
    pub fn new(
        accounts: SharedAccountStore,
        sessions: Arc<SessionStore>,
        marks: Arc<UnavailabilityMarks>,
    ) -> Arc<Self> {
        Arc::new(Self {
            accounts,
            sessions,
            marks,
        })
    }

    async fn filter_available(&self, candidates: Vec<Account>) -> Vec<Account> {
        let mut available = Vec::with_capacity(candidates.len());
        for account in candidates {
            let (unavailable, _) = self.marks.is_unavailable(account.id).await;
            if !unavailable {
                available.push(account);
            }
        }
        available
    }

    /// Weighted selection: `wᵢ = priorityᵢ · weightᵢ`. If `Σw = 0`, pick
    /// uniformly; else draw `r ∈ [0, Σw)` and return the first account whose
    /// cumulative weight exceeds `r`. Deterministic tie-break via the store's
    /// existing order.
    fn weighted_pick(accounts: &[Account]) -> Option<Account> {
        if accounts.is_empty() {
            return None;
        }
        let weights: Vec<i64> = accounts
            .iter()
            .map(|a| (a.priority.max(0) * a.weight.max(0)).max(0))
            .collect();
        let total: i64 = weights.iter().sum();

        if total == 0 {
            let idx = rand::thread_rng().gen_range(0..accounts.len());
            return Some(accounts[idx].clone());
        }

        let r = rand::thread_rng().gen_range(0..total);
        let mut cumulative = 0i64;
        for (account, w) in accounts.iter().zip(weights.iter()) {
            cumulative += w;
            if r < cumulative {
                return Some(account.clone());
            }
        }
        accounts.last().cloned()
    }

    pub async fn select_account_by_type(&self, account_type: &str) -> Option<Account> {
        let candidates = self.accounts.get_enabled_by_type(account_type).await;
        let available = self.filter_available(candidates).await;
        Self::weighted_pick(&available)
    }

    pub async fn select_account_by_types(&self, account_types: &[String]) -> Option<Account> {
        let mut candidates = Vec::new();
        for t in account_types {
            candidates.extend(self.accounts.get_enabled_by_type(t).await);
        }
        let available = self.filter_available(candidates).await;
        Self::weighted_pick(&available)
    }

    /// Resolves `model` to a platform via prefix rules, then picks from
    /// enabled+valid accounts for that platform.
    pub async fn select_account(&self, model: &str) -> Option<Account> {
        let platform = Platform::from_model(model)?;
        let candidates = self.accounts.get_enabled_by_platform(platform).await;
        let available = self.filter_available(candidates).await;
        Self::weighted_pick(&available)
    }

    /// Sticky variant: if a binding exists and the bound account is still
    /// selectable for `platform_hint`, refresh it and return it; otherwise
    /// remove the stale binding and fall through to weighted selection,
    /// then `Set` a new binding (spec §4.5 "Sticky selection").
    async fn select_with_session<F, Fut>(
        &self,
        session_id: Option<&str>,
        user_id: &str,
        api_key_id: Uuid,
        model_for_binding: &str,
        platform_hint: &str,
        pick: F,
    ) -> Option<Account>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Option<Account>>,
    {
        if let Some(session_id) = session_id {
            if let Some(binding) = self.sessions.get(session_id).await {
                if let Some(account) = self.accounts.get(binding.account_id).await {
                    if account.is_selectable() {
                        self.sessions.update_last_used(session_id).await;
                        return Some(account);
                    }
                }
                self.sessions.remove(session_id).await;
            }
        }

        let picked = pick().await?;

        if let Some(session_id) = session_id {
            self.sessions
                .set(
                    session_id.to_string(),
                    picked.id,
                    platform_hint.to_string(),
                    model_for_binding.to_string(),
                    user_id.to_string(),
                    api_key_id,
                )
                .await;
        }

        Some(picked)
    }

    pub async fn select_account_with_session(
        &self,
        session_id: Option<&str>,
        user_id: &str,
        api_key_id: Uuid,
        model: &str,
    ) -> Option<Account> {
        let platform = Platform::from_model(model)?;
        self.select_with_session(
            session_id,
            user_id,
            api_key_id,
            model,
            platform.as_str(),
            || self.select_account(model),
        )
        .await
    }

    pub async fn select_account_by_type_with_session(
        &self,
        session_id: Option<&str>,
        user_id: &str,
        api_key_id: Uuid,
        account_type: &str,
    ) -> Option<Account> {
        self.select_with_session(
            session_id,
            user_id,
            api_key_id,
            account_type,
            account_type,
            || self.select_account_by_type(account_type),
        )
        .await
    }

    /// Classifies an upstream failure and applies the matching account
    /// transition (spec §4.5 `MarkAccountError`). Case-insensitive substring
    /// search on `message`; `status` supplements ambiguous messages.
    pub async fn mark_account_error(
        &self,
        account_id: Uuid,
        account_type: &str,
        message: &str,
        status: Option<u16>,
        reset_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        let lower = message.to_ascii_lowercase();

        if lower.contains("rate limit") || status == Some(429) {
            let reset_at = reset_at.unwrap_or_else(|| Utc::now() + chrono::Duration::hours(1));
            self.accounts
                .update_status_with_rate_limit(account_id, message.to_string(), reset_at)
                .await?;
            return Ok(());
        }

        if lower.contains("overloaded") || status == Some(529) {
            let consecutive = self.accounts.get(account_id).await.map(|a| a.consecutive_error_count).unwrap_or(0);
            let next_check = Utc::now() + chrono::Duration::seconds(probe_backoff_secs(consecutive));
            self.accounts
                .update_status_with_probe(account_id, message.to_string(), next_check)
                .await?;
            return Ok(());
        }

        let looks_like_invalid = lower.contains("token") && lower.contains("expired")
            || lower.contains("authentication_error")
            || lower.contains("oauth token has expired")
            || lower.contains("invalid")
            || status == Some(401)
            || status == Some(403);

        if looks_like_invalid {
            // claude-console accounts authenticate via session key, not an
            // auth token that can "expire" in the usual sense — these
            // signals must not invalidate them (spec §4.5).
            if account_type == "claude-console" {
                self.accounts.increment_error_count_with_message(account_id, message.to_string()).await?;
                return Ok(());
            }
            self.accounts
                .update_status(account_id, AccountStatus::Invalid, Some(message.to_string()))
                .await?;
            self.accounts.mark_as_invalid(account_id).await?;
            return Ok(());
        }

        self.accounts.increment_error_count_with_message(account_id, message.to_string()).await?;
        Ok(())
    }
}

/// Exponential probe backoff for `overloaded` accounts (spec §9 Open
/// Question 1), restructured from `provider_health.rs`'s
/// `BackoffConfig::cooldown_for` (base delay × multiplier^failures, capped).
fn probe_backoff_secs(consecutive_errors: i64) -> i64 {
    const INIT_SECS: f64 = 30.0;
    const FACTOR: f64 = 2.0;
    const MAX_SECS: f64 = 900.0;
    let secs = INIT_SECS * FACTOR.powi(consecutive_errors.max(0) as i32);
    secs.min(MAX_SECS) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_backoff_doubles_then_caps() {
        assert_eq!(probe_backoff_secs(0), 30);
        assert_eq!(probe_backoff_secs(1), 60);
        assert_eq!(probe_backoff_secs(2), 120);
        assert_eq!(probe_backoff_secs(10), 900);
    }
    use crate::accounts::{AccountStore, Credentials};
    use std::time::Duration;

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

    async fn test_scheduler() -> (Arc<Scheduler>, SharedAccountStore) {
        let accounts = AccountStore::new(":memory:").await.unwrap();
        let sessions = SessionStore::new(Duration::from_secs(1800));
        let marks = UnavailabilityMarks::new();
        (Scheduler::new(accounts.clone(), sessions, marks), accounts)
    }

    #[tokio::test]
    async fn weighted_distribution_approximates_ratio() {
        let a = new_account(Platform::Claude, 1, 1);
        let b = new_account(Platform::Claude, 1, 2);
        let c = new_account(Platform::Claude, 1, 7);
        let accounts = vec![a.clone(), b.clone(), c.clone()];

        let mut counts = std::collections::HashMap::new();
        for _ in 0..10_000 {
            let picked = Scheduler::weighted_pick(&accounts).unwrap();
            *counts.entry(picked.id).or_insert(0) += 1;
        }

        let pct_a = *counts.get(&a.id).unwrap_or(&0) as f64 / 10_000.0;
        let pct_c = *counts.get(&c.id).unwrap_or(&0) as f64 / 10_000.0;
        assert!((pct_a - 0.10).abs() < 0.03, "pct_a={pct_a}");
        assert!((pct_c - 0.70).abs() < 0.03, "pct_c={pct_c}");
    }

    #[tokio::test]
    async fn zero_total_weight_picks_uniformly_without_panicking() {
        let mut a = new_account(Platform::Claude, 0, 5);
        a.priority = 0;
        let accounts = vec![a];
        assert!(Scheduler::weighted_pick(&accounts).is_some());
    }

    #[tokio::test]
    async fn sticky_session_reuses_bound_account_then_breaks_on_invalidation() {
        let (scheduler, accounts) = test_scheduler().await;
        let a = new_account(Platform::Claude, 1, 1);
        let b = new_account(Platform::Claude, 1, 1);
        accounts.insert(a.clone()).await.unwrap();
        accounts.insert(b.clone()).await.unwrap();

        let first = scheduler
            .select_account_with_session(Some("s1"), "u1", Uuid::nil(), "claude-sonnet")
            .await
            .unwrap();

        let second = scheduler
            .select_account_with_session(Some("s1"), "u1", Uuid::nil(), "claude-sonnet")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        accounts.mark_as_invalid(first.id).await.unwrap();
        let third = scheduler
            .select_account_with_session(Some("s1"), "u1", Uuid::nil(), "claude-sonnet")
            .await
            .unwrap();
        assert_ne!(third.id, first.id);
    }

    #[tokio::test]
    async fn mark_account_error_classifies_rate_limit() {
        let (scheduler, accounts) = test_scheduler().await;
        let a = new_account(Platform::Claude, 1, 1);
        accounts.insert(a.clone()).await.unwrap();
        scheduler
            .mark_account_error(a.id, "claude-official", "Rate limit exceeded", Some(429), None)
            .await
            .unwrap();
        let fetched = accounts.get(a.id).await.unwrap();
        assert!(matches!(fetched.status, AccountStatus::RateLimited));
    }

    #[tokio::test]
    async fn claude_console_accounts_are_exempt_from_invalidation() {
        let (scheduler, accounts) = test_scheduler().await;
        let mut a = new_account(Platform::Claude, 1, 1);
        a.account_type = "claude-console".to_string();
        accounts.insert(a.clone()).await.unwrap();
        scheduler
            .mark_account_error(a.id, "claude-console", "oauth token has expired", None, None)
            .await
            .unwrap();
        let fetched = accounts.get(a.id).await.unwrap();
        assert!(matches!(fetched.status, AccountStatus::Valid));
        assert_eq!(fetched.error_count, 1);
    }
}
