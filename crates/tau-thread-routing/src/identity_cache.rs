//! Short-TTL read-through cache for identity lookups.
//!
//! The cache is best-effort: serving a slightly stale user id is acceptable,
//! and writers invalidate a whole organization at once because one identifier
//! change can affect several cached lookups.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};

use crate::clock::RoutingClock;

pub const DEFAULT_IDENTITY_CACHE_TTL_SECONDS: i64 = 300;
pub const DEFAULT_IDENTITY_CACHE_MAX_ENTRIES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityCacheKey {
    pub organization_id: String,
    pub external_identifier: String,
}

impl IdentityCacheKey {
    pub fn new(organization_id: &str, external_identifier: &str) -> Self {
        Self {
            organization_id: organization_id.trim().to_string(),
            external_identifier: external_identifier.trim().to_string(),
        }
    }
}

/// Trait contract for the identity lookup cache.
pub trait IdentityCache: Send + Sync {
    fn get(&self, key: &IdentityCacheKey) -> Option<String>;
    fn set(&self, key: IdentityCacheKey, user_id: String, ttl: Duration);
    /// Drops every entry of `organization_id`.
    fn invalidate_prefix(&self, organization_id: &str);
}

#[derive(Debug, Clone)]
struct CachedUser {
    user_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<IdentityCacheKey, CachedUser>,
    order: VecDeque<IdentityCacheKey>,
}

impl CacheState {
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.entries.retain(|_, entry| entry.expires_at > now);
        let entries = &self.entries;
        self.order.retain(|key| entries.contains_key(key));
    }

    fn insert_with_limit(&mut self, key: IdentityCacheKey, user: CachedUser, max_entries: usize) {
        if let Some(position) = self.order.iter().position(|entry| entry == &key) {
            self.order.remove(position);
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, user);

        while self.entries.len() > max_entries {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

/// In-process TTL cache driven by a [`RoutingClock`].
///
/// Expired entries are purged on every write, and the map never holds more
/// than `max_entries` keys; the oldest insert is evicted first.
pub struct TtlIdentityCache {
    state: RwLock<CacheState>,
    clock: Arc<dyn RoutingClock>,
    max_entries: usize,
}

impl TtlIdentityCache {
    pub fn new(clock: Arc<dyn RoutingClock>) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            clock,
            max_entries: DEFAULT_IDENTITY_CACHE_MAX_ENTRIES,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }
}

impl IdentityCache for TtlIdentityCache {
    fn get(&self, key: &IdentityCacheKey) -> Option<String> {
        let now = self.clock.now();
        {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            match state.entries.get(key) {
                Some(entry) if entry.expires_at > now => return Some(entry.user_id.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .purge_expired(now);
        None
    }

    fn set(&self, key: IdentityCacheKey, user_id: String, ttl: Duration) {
        if ttl <= Duration::zero() || self.max_entries == 0 {
            return;
        }
        let now = self.clock.now();
        let Some(expires_at) = now.checked_add_signed(ttl) else {
            tracing::debug!(
                ttl_seconds = ttl.num_seconds(),
                "identity cache ttl out of range; entry not cached"
            );
            return;
        };
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.purge_expired(now);
        state.insert_with_limit(
            key,
            CachedUser {
                user_id,
                expires_at,
            },
            self.max_entries,
        );
    }

    fn invalidate_prefix(&self, organization_id: &str) {
        let organization_id = organization_id.trim();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state
            .entries
            .retain(|key, _| key.organization_id != organization_id);
        state
            .order
            .retain(|key| key.organization_id != organization_id);
    }
}

/// Cache that never stores anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledIdentityCache;

impl IdentityCache for DisabledIdentityCache {
    fn get(&self, _key: &IdentityCacheKey) -> Option<String> {
        None
    }

    fn set(&self, _key: IdentityCacheKey, _user_id: String, _ttl: Duration) {}

    fn invalidate_prefix(&self, _organization_id: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn cache_with_clock() -> (TtlIdentityCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).unwrap(),
        ));
        (TtlIdentityCache::new(clock.clone()), clock)
    }

    #[test]
    fn unit_cache_entries_expire_after_ttl() {
        let (cache, clock) = cache_with_clock();
        let key = IdentityCacheKey::new("org-1", "+15551234567");
        cache.set(key.clone(), "u1".to_string(), Duration::minutes(5));
        clock.advance(Duration::minutes(4));
        assert_eq!(cache.get(&key).as_deref(), Some("u1"));
        clock.advance(Duration::minutes(1));
        assert_eq!(cache.get(&key), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn functional_invalidate_prefix_only_drops_one_organization() {
        let (cache, _clock) = cache_with_clock();
        cache.set(
            IdentityCacheKey::new("org-1", "a@example.com"),
            "u1".to_string(),
            Duration::minutes(5),
        );
        cache.set(
            IdentityCacheKey::new("org-1", "+15551234567"),
            "u1".to_string(),
            Duration::minutes(5),
        );
        cache.set(
            IdentityCacheKey::new("org-2", "+15551234567"),
            "u9".to_string(),
            Duration::minutes(5),
        );
        cache.invalidate_prefix("org-1");
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache
                .get(&IdentityCacheKey::new("org-2", "+15551234567"))
                .as_deref(),
            Some("u9")
        );
    }

    #[test]
    fn regression_cache_key_ignores_surrounding_whitespace() {
        let (cache, _clock) = cache_with_clock();
        cache.set(
            IdentityCacheKey::new(" org-1 ", " U123 "),
            "u1".to_string(),
            Duration::minutes(5),
        );
        assert_eq!(
            cache.get(&IdentityCacheKey::new("org-1", "U123")).as_deref(),
            Some("u1")
        );
        assert_eq!(cache.get(&IdentityCacheKey::new("org-1", "u123")), None);
    }

    #[test]
    fn regression_one_off_senders_do_not_grow_the_cache_without_bound() {
        let (cache, clock) = cache_with_clock();
        for index in 0..10 {
            cache.set(
                IdentityCacheKey::new("org-1", &format!("+1555000{index:04}")),
                format!("u{index}"),
                Duration::minutes(5),
            );
        }
        clock.advance(Duration::minutes(6));
        cache.set(
            IdentityCacheKey::new("org-1", "+15559999999"),
            "u-new".to_string(),
            Duration::minutes(5),
        );
        assert_eq!(cache.len(), 1);

        let (bounded, _clock) = cache_with_clock();
        let bounded = bounded.with_max_entries(2);
        for sender in ["a@example.com", "b@example.com", "c@example.com"] {
            bounded.set(
                IdentityCacheKey::new("org-1", sender),
                sender.to_string(),
                Duration::minutes(5),
            );
        }
        assert_eq!(bounded.len(), 2);
        assert_eq!(bounded.get(&IdentityCacheKey::new("org-1", "a@example.com")), None);
        assert_eq!(
            bounded
                .get(&IdentityCacheKey::new("org-1", "c@example.com"))
                .as_deref(),
            Some("c@example.com")
        );
    }

    #[test]
    fn regression_out_of_range_ttl_is_not_cached_and_does_not_panic() {
        let (cache, _clock) = cache_with_clock();
        let key = IdentityCacheKey::new("org-1", "+15551234567");
        cache.set(key.clone(), "u1".to_string(), Duration::seconds(10_000_000_000_000));
        assert_eq!(cache.get(&key), None);
        assert_eq!(cache.len(), 0);
    }
}
