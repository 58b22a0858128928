//! Time source and id minting shared by the resolver, orchestrator, and sweeper.
//!
//! Everything that compares against "now" reads it from an injected
//! [`RoutingClock`] so cache expiry, recency scoring, and retry eligibility can
//! be driven deterministically in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

static MINTED_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Trait contract for the engine's time source.
pub trait RoutingClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl RoutingClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, delta: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += delta;
    }
}

impl RoutingClock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Returns true when `expires_at` is present and no longer in the future.
pub fn is_expired_at(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    matches!(expires_at, Some(value) if value <= now)
}

/// Whole days elapsed between `then` and `now`, never negative.
pub fn age_in_days(then: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    now.signed_duration_since(then).num_days().max(0)
}

/// Mints `<prefix>-<unix-ms>-<9 hex chars>`.
///
/// The suffix hashes the timestamp, process id, and a process-wide counter, so
/// two ids minted in the same millisecond still differ.
pub fn mint_routing_id(prefix: &str, now: DateTime<Utc>) -> String {
    let timestamp_ms = now.timestamp_millis().max(0);
    let sequence = MINTED_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut hasher = Sha256::new();
    hasher.update(timestamp_ms.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(sequence.to_le_bytes());
    hasher.update(
        Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_le_bytes(),
    );
    let digest = hasher.finalize();
    let suffix = digest
        .iter()
        .take(5)
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    format!("{prefix}-{timestamp_ms}-{}", &suffix[..9])
}
