use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

use tpc_transport::now_ms;
use tracing::warn;

/// Default upper bound on remembered nonces.
///
/// At the default rate limit (10 per agent per minute) and a 10 minute
/// TTL this covers 1 000 distinct senders at full rate.
pub const DEFAULT_MAX_NONCES: usize = 100_000;

/// Outcome of [`NonceCache::check_and_insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceVerdict {
    /// First sighting; the nonce is now remembered.
    Accepted,
    /// Seen before and not yet expired.
    Replayed,
    /// Every slot holds a live nonce. Nothing was evicted.
    CacheFull,
}

impl NonceVerdict {
    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }
}

/// Remembers accepted nonces until they expire.
///
/// Paired with the freshness check: an envelope older than the freshness
/// window is rejected anyway, so a nonce only needs to outlive that
/// window. The receiver uses a TTL of twice the window to cover skew.
///
/// Fails closed: a live nonce is never evicted to make room, so while the
/// cache is full of unexpired entries new nonces are refused.
///
/// ```rust
/// use tpc_protocol::{NonceCache, NonceVerdict};
///
/// let cache = NonceCache::new(600_000);
/// assert_eq!(cache.check_and_insert("00ff"), NonceVerdict::Accepted);
/// assert_eq!(cache.check_and_insert("00ff"), NonceVerdict::Replayed);
/// ```
#[derive(Debug)]
pub struct NonceCache {
    inner: Mutex<Seen>,
    ttl_ms: u64,
    max_entries: usize,
}

#[derive(Debug, Default)]
struct Seen {
    /// nonce -> expiry (Unix ms)
    by_nonce: HashMap<String, u64>,
    /// (expiry, nonce), oldest first
    by_expiry: BTreeSet<(u64, String)>,
}

impl Seen {
    /// Forget everything that expired at or before `now`.
    fn sweep(&mut self, now: u64) {
        while let Some((expiry, _)) = self.by_expiry.first() {
            if *expiry > now {
                break;
            }
            if let Some((_, nonce)) = self.by_expiry.pop_first() {
                self.by_nonce.remove(&nonce);
            }
        }
    }
}

impl NonceCache {
    pub fn new(ttl_ms: u64) -> Self {
        Self::with_capacity(ttl_ms, DEFAULT_MAX_NONCES)
    }

    pub fn with_capacity(ttl_ms: u64, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Seen::default()),
            ttl_ms,
            max_entries: max_entries.max(1),
        }
    }

    pub fn check_and_insert(&self, nonce: &str) -> NonceVerdict {
        self.check_and_insert_at(nonce, now_ms())
    }

    pub fn check_and_insert_at(&self, nonce: &str, now: u64) -> NonceVerdict {
        let mut seen = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        seen.sweep(now);

        if seen.by_nonce.contains_key(nonce) {
            return NonceVerdict::Replayed;
        }
        if seen.by_nonce.len() >= self.max_entries {
            warn!(max = self.max_entries, "nonce cache full of live entries, refusing");
            return NonceVerdict::CacheFull;
        }

        let expiry = now.saturating_add(self.ttl_ms);
        seen.by_nonce.insert(nonce.to_string(), expiry);
        seen.by_expiry.insert((expiry, nonce.to_string()));
        NonceVerdict::Accepted
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_nonce
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    pub fn clear(&self) {
        let mut seen = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        seen.by_nonce.clear();
        seen.by_expiry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use super::NonceVerdict::{Accepted, CacheFull, Replayed};

    #[test]
    fn duplicate_rejected_within_ttl() {
        let cache = NonceCache::new(1_000);
        assert_eq!(cache.check_and_insert_at("n1", 0), Accepted);
        assert_eq!(cache.check_and_insert_at("n1", 999), Replayed);
        assert_eq!(cache.check_and_insert_at("n2", 999), Accepted);
    }

    #[test]
    fn expired_nonce_accepted_again() {
        let cache = NonceCache::new(1_000);
        assert_eq!(cache.check_and_insert_at("n1", 0), Accepted);
        assert_eq!(cache.check_and_insert_at("n1", 1_000), Accepted);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.check_and_insert_at("n1", 1_999), Replayed);
    }

    #[test]
    fn expired_entries_swept_before_capacity_check() {
        let cache = NonceCache::with_capacity(10, 2);
        cache.check_and_insert_at("a", 0);
        cache.check_and_insert_at("b", 0);
        assert_eq!(cache.check_and_insert_at("c", 20), Accepted);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn full_of_live_entries_refuses_and_keeps_them() {
        let cache = NonceCache::with_capacity(600_000, 2);
        assert_eq!(cache.check_and_insert_at("victim", 0), Accepted);
        assert_eq!(cache.check_and_insert_at("n2", 1), Accepted);

        assert_eq!(cache.check_and_insert_at("n3", 2), CacheFull);
        // The oldest live nonce was not pushed out to make room.
        assert_eq!(cache.check_and_insert_at("victim", 3), Replayed);
        assert_eq!(cache.len(), 2);

        // Room returns once the oldest entry expires.
        assert_eq!(cache.check_and_insert_at("n3", 600_000), Accepted);
        assert_eq!(cache.check_and_insert_at("victim", 600_001), Accepted);
    }

    #[test]
    fn non_monotonic_clock_keeps_expiry_order() {
        let cache = NonceCache::with_capacity(100, 10);
        cache.check_and_insert_at("late", 500);
        cache.check_and_insert_at("early", 0);
        // "early" expired at 100, "late" lives until 600.
        assert_eq!(cache.check_and_insert_at("early", 300), Accepted);
        assert_eq!(cache.check_and_insert_at("late", 300), Replayed);
    }

    #[test]
    fn clear_empties() {
        let cache = NonceCache::new(1_000);
        cache.check_and_insert("x");
        assert!(!cache.is_empty());
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), DEFAULT_MAX_NONCES);
    }
}
