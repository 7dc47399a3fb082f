//! Utility functions for the matchmaking core

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;
use uuid::Uuid;

/// Source of wall-clock time. Swappable so TTL logic can be tested.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Generate a new unique document ID
pub fn generate_document_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Spread `base` uniformly over `[base - jitter, base + jitter]`.
///
/// The result never drops below one millisecond.
pub fn jittered(base: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return base;
    }

    let jitter_ms = jitter.as_millis() as i64;
    let offset = rand::thread_rng().gen_range(-jitter_ms..=jitter_ms);
    let millis = (base.as_millis() as i64 + offset).max(1);
    Duration::from_millis(millis as u64)
}

/// Convert a std duration into a chrono duration, saturating at a century
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}
