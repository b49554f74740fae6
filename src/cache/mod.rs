//! Cache Substrate (C1): sticky sessions, unavailability marks, and
//! concurrency counters. All three are TTL-bearing, in-process by default —
//! an external key-value backing (Redis) can implement the same contract
//! without changing callers (spec §4.1, §6).

pub mod concurrency;
pub mod sessions;
pub mod unavailability;

pub use concurrency::ConcurrencyCounters;
pub use sessions::{SessionBinding, SessionStore};
pub use unavailability::UnavailabilityMarks;
