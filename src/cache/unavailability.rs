//! Unavailability marks (spec §4.1): a short-lived soft veto layered over
//! an account's durable status. Self-expires; lazily evicted on miss.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

struct Mark {
    reason: String,
    expire_at: Instant,
}

pub struct UnavailabilityMarks {
    marks: RwLock<HashMap<Uuid, Mark>>,
}

impl UnavailabilityMarks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            marks: RwLock::new(HashMap::new()),
        })
    }

    pub async fn mark(&self, account_id: Uuid, reason: impl Into<String>, ttl: Duration) {
        self.marks.write().await.insert(
            account_id,
            Mark {
                reason: reason.into(),
                expire_at: Instant::now() + ttl,
            },
        );
    }

    pub async fn is_unavailable(&self, account_id: Uuid) -> (bool, Option<String>) {
        let now = Instant::now();
        {
            let marks = self.marks.read().await;
            match marks.get(&account_id) {
                Some(m) if m.expire_at > now => return (true, Some(m.reason.clone())),
                Some(_) => {}
                None => return (false, None),
            }
        }
        self.marks.write().await.remove(&account_id);
        (false, None)
    }

    pub async fn clear(&self, account_id: Uuid) {
        self.marks.write().await.remove(&account_id);
    }

    pub async fn list_all(&self) -> Vec<(Uuid, String)> {
        let now = Instant::now();
        self.marks
            .read()
            .await
            .iter()
            .filter(|(_, m)| m.expire_at > now)
            .map(|(id, m)| (*id, m.reason.clone()))
            .collect()
    }

    /// Evicts all expired marks; intended for a periodic sweeper.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut marks = self.marks.write().await;
        let before = marks.len();
        marks.retain(|_, m| m.expire_at > now);
        before - marks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mark_expires_and_evicts_lazily() {
        let marks = UnavailabilityMarks::new();
        let id = Uuid::new_v4();
        marks.mark(id, "cooling down", Duration::from_millis(10)).await;
        assert_eq!(marks.is_unavailable(id).await, (true, Some("cooling down".to_string())));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(marks.is_unavailable(id).await, (false, None));
    }

    #[tokio::test]
    async fn clear_removes_mark_immediately() {
        let marks = UnavailabilityMarks::new();
        let id = Uuid::new_v4();
        marks.mark(id, "busy", Duration::from_secs(30)).await;
        marks.clear(id).await;
        assert_eq!(marks.is_unavailable(id).await.0, false);
    }
}
