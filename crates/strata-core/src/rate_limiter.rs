//! Per-key write suppression
//!
//! `try_acquire` grants a key at most once per window. State is in memory
//! only; after a restart keys are granted again, which costs one redundant
//! idempotent write.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::clock::Clock;

pub struct RateLimiter<K: Eq + Hash> {
    not_before: DashMap<K, i64>,
    window_millis: i64,
    clock: Arc<dyn Clock>,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            not_before: DashMap::new(),
            window_millis: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
            clock,
        }
    }

    /// `true` when the caller should write; `false` when a copy was written
    /// within the current window.
    pub fn try_acquire(&self, key: K) -> bool {
        let now = self.clock.now_millis();
        let expires = now.saturating_add(self.window_millis);
        match self.not_before.entry(key) {
            Entry::Occupied(mut slot) => {
                if *slot.get() > now {
                    return false;
                }
                slot.insert(expires);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(expires);
                true
            }
        }
    }

    /// Forget `key` so the next `try_acquire` succeeds; used after a failed write.
    pub fn invalidate(&self, key: &K) {
        self.not_before.remove(key);
    }

    /// Drop keys whose window elapsed. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.not_before.len();
        self.not_before.retain(|_, not_before| *not_before > now);
        before.saturating_sub(self.not_before.len())
    }

    pub fn len(&self) -> usize {
        self.not_before.len()
    }

    pub fn is_empty(&self) -> bool {
        self.not_before.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(clock: Arc<ManualClock>) -> RateLimiter<String> {
        RateLimiter::new(Duration::from_secs(60), clock)
    }

    #[test]
    fn second_acquire_within_window_is_suppressed() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(clock.clone());
        assert!(limiter.try_acquire("k".into()));
        assert!(!limiter.try_acquire("k".into()));
        assert!(limiter.try_acquire("other".into()));
    }

    #[test]
    fn acquire_succeeds_after_window() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(clock.clone());
        assert!(limiter.try_acquire("k".into()));
        clock.advance(59_999);
        assert!(!limiter.try_acquire("k".into()));
        clock.advance(1);
        assert!(limiter.try_acquire("k".into()));
    }

    #[test]
    fn invalidate_clears_immediately() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(clock);
        assert!(limiter.try_acquire("k".into()));
        limiter.invalidate(&"k".to_string());
        assert!(limiter.try_acquire("k".into()));
    }

    #[test]
    fn purge_drops_only_expired_keys() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(clock.clone());
        limiter.try_acquire("old".into());
        clock.advance(30_000);
        limiter.try_acquire("new".into());
        clock.advance(30_000);
        assert_eq!(limiter.purge_expired(), 1);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn concurrent_acquire_grants_once() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = Arc::new(limiter(clock));
        let granted: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let limiter = Arc::clone(&limiter);
                    s.spawn(move || limiter.try_acquire("k".to_string()) as usize)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(granted, 1);
    }
}
