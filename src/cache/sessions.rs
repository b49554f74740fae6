//! Sticky session store (spec §4.1 "Sessions").
//!
//! Grounded on the `Arc<RwLock<HashMap<...>>>` store idiom used throughout
//! `provider_health.rs`/`ai_providers.rs`, generalized to carry a sliding
//! TTL and secondary indexes the way a session-affinity cache needs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionBinding {
    pub session_id: String,
    pub account_id: Uuid,
    pub platform: String,
    pub model: String,
    pub user_id: String,
    pub api_key_id: Uuid,
    pub bound_at: Instant,
    pub last_used_at: Instant,
    pub expire_at: Instant,
}

#[derive(Default)]
struct Inner {
    bindings: HashMap<String, SessionBinding>,
    by_account: HashMap<Uuid, Vec<String>>,
    by_user: HashMap<String, Vec<String>>,
}

pub struct SessionStore {
    inner: RwLock<Inner>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
            ttl,
        })
    }

    fn index_remove(inner: &mut Inner, binding: &SessionBinding) {
        if let Some(list) = inner.by_account.get_mut(&binding.account_id) {
            list.retain(|s| s != &binding.session_id);
        }
        if let Some(list) = inner.by_user.get_mut(&binding.user_id) {
            list.retain(|s| s != &binding.session_id);
        }
    }

    fn index_add(inner: &mut Inner, binding: &SessionBinding) {
        inner
            .by_account
            .entry(binding.account_id)
            .or_default()
            .push(binding.session_id.clone());
        inner
            .by_user
            .entry(binding.user_id.clone())
            .or_default()
            .push(binding.session_id.clone());
    }

    /// Returns `None` and eagerly evicts if the binding has expired.
    pub async fn get(&self, id: &str) -> Option<SessionBinding> {
        let now = Instant::now();
        {
            let inner = self.inner.read().await;
            match inner.bindings.get(id) {
                Some(b) if b.expire_at > now => return Some(b.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        let mut inner = self.inner.write().await;
        if let Some(b) = inner.bindings.get(id) {
            if b.expire_at <= now {
                let b = b.clone();
                inner.bindings.remove(id);
                Self::index_remove(&mut inner, &b);
                return None;
            }
            return Some(b.clone());
        }
        None
    }

    /// Initializes `bound_at` if this is a new session; always refreshes
    /// `last_used_at`/`expire_at` (sliding TTL) and maintains the secondary
    /// indexes.
    pub async fn set(
        &self,
        session_id: String,
        account_id: Uuid,
        platform: String,
        model: String,
        user_id: String,
        api_key_id: Uuid,
    ) {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let bound_at = inner
            .bindings
            .get(&session_id)
            .map(|b| b.bound_at)
            .unwrap_or(now);

        if let Some(old) = inner.bindings.get(&session_id).cloned() {
            Self::index_remove(&mut inner, &old);
        }

        let binding = SessionBinding {
            session_id: session_id.clone(),
            account_id,
            platform,
            model,
            user_id,
            api_key_id,
            bound_at,
            last_used_at: now,
            expire_at: now + self.ttl,
        };
        Self::index_add(&mut inner, &binding);
        inner.bindings.insert(session_id, binding);
    }

    /// Refreshes `last_used_at = now` and `expire_at = now + ttl`.
    pub async fn update_last_used(&self, id: &str) {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        if let Some(b) = inner.bindings.get_mut(id) {
            b.last_used_at = now;
            b.expire_at = now + self.ttl;
        }
    }

    pub async fn remove(&self, id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(b) = inner.bindings.remove(id) {
            Self::index_remove(&mut inner, &b);
        }
    }

    pub async fn get_by_account(&self, account_id: Uuid) -> Vec<SessionBinding> {
        let inner = self.inner.read().await;
        inner
            .by_account
            .get(&account_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.bindings.get(id).cloned())
            .collect()
    }

    pub async fn get_by_user(&self, user_id: &str) -> Vec<SessionBinding> {
        let inner = self.inner.read().await;
        inner
            .by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.bindings.get(id).cloned())
            .collect()
    }

    /// Stable order: `(lastUsedAt desc, boundAt desc, sessionId asc)` — a
    /// pagination-visible API requirement (spec §4.1).
    pub async fn list_all(&self, offset: usize, limit: usize) -> (Vec<SessionBinding>, usize) {
        let inner = self.inner.read().await;
        let mut all: Vec<SessionBinding> = inner.bindings.values().cloned().collect();
        all.sort_by(|a, b| {
            b.last_used_at
                .cmp(&a.last_used_at)
                .then_with(|| b.bound_at.cmp(&a.bound_at))
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        let total = all.len();
        let page = all.into_iter().skip(offset).take(limit).collect();
        (page, total)
    }

    /// Evicts all bindings whose TTL has elapsed. Intended to run on a 60s
    /// ticker (spec §4.1 "A background sweeper runs every 60s").
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let expired: Vec<SessionBinding> = inner
            .bindings
            .values()
            .filter(|b| b.expire_at <= now)
            .cloned()
            .collect();
        for b in &expired {
            inner.bindings.remove(&b.session_id);
            Self::index_remove(&mut inner, b);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_evicts_expired_binding() {
        let store = SessionStore::new(Duration::from_millis(10));
        store
            .set(
                "s1".to_string(),
                Uuid::nil(),
                "claude".to_string(),
                "claude-sonnet".to_string(),
                "u1".to_string(),
                Uuid::nil(),
            )
            .await;
        assert!(store.get("s1").await.is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn set_slides_ttl_and_preserves_bound_at() {
        let store = SessionStore::new(Duration::from_secs(30));
        store
            .set(
                "s1".to_string(),
                Uuid::nil(),
                "claude".to_string(),
                "m".to_string(),
                "u1".to_string(),
                Uuid::nil(),
            )
            .await;
        let first = store.get("s1").await.unwrap();
        store
            .set(
                "s1".to_string(),
                Uuid::nil(),
                "claude".to_string(),
                "m".to_string(),
                "u1".to_string(),
                Uuid::nil(),
            )
            .await;
        let second = store.get("s1").await.unwrap();
        assert_eq!(first.bound_at, second.bound_at);
        assert!(second.last_used_at >= first.last_used_at);
    }

    #[tokio::test]
    async fn list_all_is_stable_across_repeated_calls() {
        let store = SessionStore::new(Duration::from_secs(30));
        for i in 0..5 {
            store
                .set(
                    format!("s{i}"),
                    Uuid::nil(),
                    "claude".to_string(),
                    "m".to_string(),
                    "u1".to_string(),
                    Uuid::nil(),
                )
                .await;
        }
        let (first, total1) = store.list_all(0, 10).await;
        let (second, total2) = store.list_all(0, 10).await;
        assert_eq!(total1, 5);
        assert_eq!(total2, 5);
        let ids1: Vec<_> = first.iter().map(|b| b.session_id.clone()).collect();
        let ids2: Vec<_> = second.iter().map(|b| b.session_id.clone()).collect();
        assert_eq!(ids1, ids2);
    }

    #[tokio::test]
    async fn remove_clears_secondary_indexes() {
        let store = SessionStore::new(Duration::from_secs(30));
        let account = Uuid::new_v4();
        store
            .set(
                "s1".to_string(),
                account,
                "claude".to_string(),
                "m".to_string(),
                "u1".to_string(),
                Uuid::nil(),
            )
            .await;
        assert_eq!(store.get_by_account(account).await.len(), 1);
        store.remove("s1").await;
        assert_eq!(store.get_by_account(account).await.len(), 0);
    }
}
