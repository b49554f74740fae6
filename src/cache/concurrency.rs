//! Concurrency counters (spec §4.1): per-account and per-user slot limits
//! enforced via a FIFO list of acquisition timestamps with per-slot TTL, so
//! a lost `Release` self-heals instead of leaking a slot forever.
//!
//! Grounded on `atlas-pharmatech/src/middleware/ip_rate_limiter.rs`'s
//! sliding-window-of-`Instant`s pattern, generalized from a fixed rate limit
//! into an acquire/release slot counter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Default)]
struct Bucket {
    slots: Vec<Instant>,
}

pub struct ConcurrencyCounters {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl ConcurrencyCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            buckets: Mutex::new(HashMap::new()),
        })
    }

    fn trim(bucket: &mut Bucket, ttl: Duration, now: Instant) {
        bucket.slots.retain(|t| now.duration_since(*t) < ttl);
    }

    /// Atomically trims stale slots, and if under `limit`, appends `now` and
    /// grants. Returns `(granted, current_count_after_this_call)`.
    pub async fn acquire(&self, key: &str, limit: usize, ttl: Duration) -> (bool, usize) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(key.to_string()).or_default();
        Self::trim(bucket, ttl, now);

        if bucket.slots.len() < limit {
            bucket.slots.push(now);
            (true, bucket.slots.len())
        } else {
            (false, bucket.slots.len())
        }
    }

    /// Removes the oldest slot (FIFO), leak-safe regardless of which logical
    /// request actually released.
    pub async fn release(&self, key: &str) {
        let mut buckets = self.buckets.lock().await;
        if let Some(bucket) = buckets.get_mut(key) {
            if !bucket.slots.is_empty() {
                bucket.slots.remove(0);
            }
        }
    }

    pub async fn count(&self, key: &str, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        match buckets.get_mut(key) {
            Some(bucket) => {
                Self::trim(bucket, ttl, now);
                bucket.slots.len()
            }
            None => 0,
        }
    }

    pub async fn reset(&self, key: &str) {
        let mut buckets = self.buckets.lock().await;
        if let Some(bucket) = buckets.get_mut(key) {
            bucket.slots.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_grants_up_to_limit_then_denies() {
        let counters = ConcurrencyCounters::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(counters.acquire("u1", 3, ttl).await, (true, 1));
        assert_eq!(counters.acquire("u1", 3, ttl).await, (true, 2));
        assert_eq!(counters.acquire("u1", 3, ttl).await, (true, 3));
        assert_eq!(counters.acquire("u1", 3, ttl).await.0, false);
    }

    #[tokio::test]
    async fn release_frees_a_slot_fifo() {
        let counters = ConcurrencyCounters::new();
        let ttl = Duration::from_secs(60);
        counters.acquire("u1", 1, ttl).await;
        assert_eq!(counters.acquire("u1", 1, ttl).await.0, false);
        counters.release("u1").await;
        assert_eq!(counters.acquire("u1", 1, ttl).await.0, true);
    }

    #[tokio::test]
    async fn stale_slot_is_reclaimed_on_next_acquire() {
        let counters = ConcurrencyCounters::new();
        let ttl = Duration::from_millis(20);
        counters.acquire("u1", 1, ttl).await;
        assert_eq!(counters.acquire("u1", 1, ttl).await.0, false);
        tokio::time::sleep(Duration::from_millis(40)).await;
        // The stale slot must be reclaimed automatically.
        assert_eq!(counters.acquire("u1", 1, ttl).await, (true, 1));
    }

    #[tokio::test]
    async fn reset_empties_the_bucket() {
        let counters = ConcurrencyCounters::new();
        let ttl = Duration::from_secs(60);
        counters.acquire("u1", 2, ttl).await;
        counters.acquire("u1", 2, ttl).await;
        counters.reset("u1").await;
        assert_eq!(counters.count("u1", ttl).await, 0);
    }
}
