//! Fixed-window buckets.
//!
//! One bucket per `(subject, endpoint class)`, created on first use. The whole
//! read-reset-decrement sequence runs while holding the map entry, so two requests
//! for the same key can never both pass the last unit of quota.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

use super::{EndpointClass, RateLimitPolicy};
use crate::clock::{duration_millis, millis_to_epoch_seconds, Clock};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub subject: String,
    pub class: EndpointClass,
}

impl BucketKey {
    #[must_use]
    pub fn new(subject: impl Into<String>, class: EndpointClass) -> Self {
        Self {
            subject: subject.into(),
            class,
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject, self.class.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Bucket {
    limit: u32,
    remaining: u32,
    /// Epoch millis at which the window rolls over.
    reset_at: i64,
}

impl Bucket {
    fn open(limit: u32, now: i64, window: i64) -> Self {
        Self {
            limit,
            remaining: limit,
            reset_at: now.saturating_add(window),
        }
    }
}

/// Outcome of one admission check. Always complete, whether allowed or not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch seconds at which the window rolls over.
    pub reset_at: i64,
    /// Whole seconds until the window rolls over, at least 1.
    pub retry_after: u64,
}

pub struct BucketStore {
    buckets: DashMap<BucketKey, Bucket>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for BucketStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketStore")
            .field("buckets", &self.buckets.len())
            .finish_non_exhaustive()
    }
}

impl BucketStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            clock,
        }
    }

    /// Consume one unit of quota for `key` if any is left.
    pub fn check(&self, key: BucketKey, policy: RateLimitPolicy) -> RateLimitDecision {
        let now = self.clock.now_millis();
        let window = duration_millis(policy.window).max(1);

        let mut entry = self
            .buckets
            .entry(key)
            .or_insert_with(|| Bucket::open(policy.limit, now, window));
        let bucket = entry.value_mut();

        if now >= bucket.reset_at {
            *bucket = Bucket::open(policy.limit, now, window);
        }

        let allowed = bucket.remaining > 0;
        if allowed {
            bucket.remaining -= 1;
        }

        let wait_millis = bucket.reset_at.saturating_sub(now).max(0);
        RateLimitDecision {
            allowed,
            limit: bucket.limit,
            remaining: bucket.remaining,
            reset_at: millis_to_epoch_seconds(bucket.reset_at),
            retry_after: u64::try_from(millis_to_epoch_seconds(wait_millis))
                .unwrap_or(0)
                .max(1),
        }
    }

    /// Drop buckets whose window has ended. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| now < bucket.reset_at);
        before.saturating_sub(self.buckets.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Barrier;
    use std::time::Duration;

    const T0: i64 = 1_700_000_000_000;

    fn store() -> (BucketStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        (BucketStore::new(clock.clone()), clock)
    }

    fn policy(limit: u32) -> RateLimitPolicy {
        RateLimitPolicy::new(limit, Duration::from_secs(60))
    }

    fn key(subject: &str) -> BucketKey {
        BucketKey::new(subject, EndpointClass::Api)
    }

    #[test]
    fn admits_exactly_limit_per_window() {
        let (store, _clock) = store();
        for expected in (0..3).rev() {
            let decision = store.check(key("ip:10.0.0.1"), policy(3));
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }

        let denied = store.check(key("ip:10.0.0.1"), policy(3));
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.limit, 3);
        assert_eq!(denied.reset_at, (T0 + 60_000) / 1000);
        assert_eq!(denied.retry_after, 60);
    }

    #[test]
    fn window_rolls_over_at_reset() {
        let (store, clock) = store();
        for _ in 0..2 {
            assert!(store.check(key("user:a"), policy(2)).allowed);
        }
        assert!(!store.check(key("user:a"), policy(2)).allowed);

        clock.set_millis(T0 + 59_999);
        assert!(!store.check(key("user:a"), policy(2)).allowed);

        clock.set_millis(T0 + 60_000);
        let decision = store.check(key("user:a"), policy(2));
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
        assert_eq!(decision.reset_at, (T0 + 120_000) / 1000);
    }

    #[test]
    fn keys_and_classes_are_independent() {
        let (store, _clock) = store();
        assert!(store.check(key("ip:1.1.1.1"), policy(1)).allowed);
        assert!(!store.check(key("ip:1.1.1.1"), policy(1)).allowed);

        assert!(store.check(key("ip:2.2.2.2"), policy(1)).allowed);
        let auth_key = BucketKey::new("ip:1.1.1.1", EndpointClass::Auth);
        assert!(store.check(auth_key, policy(1)).allowed);
    }

    #[test]
    fn zero_limit_always_denies() {
        let (store, _clock) = store();
        let decision = store.check(key("ip:1.1.1.1"), policy(0));
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn concurrent_requests_never_exceed_limit() {
        const LIMIT: u32 = 16;
        let (store, _clock) = store();
        let threads = usize::try_from(LIMIT * 2).unwrap_or(32);
        let barrier = Barrier::new(threads);
        let (store, barrier) = (&store, &barrier);

        let allowed: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    scope.spawn(move || {
                        barrier.wait();
                        store.check(key("user:hot"), policy(LIMIT)).allowed
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or(false))
                .collect()
        });

        let admitted = allowed.iter().filter(|allowed| **allowed).count();
        assert_eq!(admitted, LIMIT as usize);
        assert_eq!(allowed.len() - admitted, LIMIT as usize);
    }

    #[test]
    fn purge_drops_finished_windows() {
        let (store, clock) = store();
        store.check(key("ip:1.1.1.1"), policy(5));
        store.check(
            key("ip:2.2.2.2"),
            RateLimitPolicy::new(5, Duration::from_secs(300)),
        );
        assert_eq!(store.len(), 2);

        clock.advance(Duration::from_secs(61));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);

        clock.advance(Duration::from_secs(300));
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn key_display() {
        assert_eq!(key("ip:10.0.0.1").to_string(), "ip:10.0.0.1:api");
    }
}
