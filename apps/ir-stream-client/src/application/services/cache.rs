//! Subscription Cache
//!
//! Maps each [`ChannelKey`] to its latest payload, subscription flag and
//! last-access time. The cache is the synchronization point between caller
//! queries, the ingestion path and the idle sweeper.
//!
//! # Locking
//!
//! The key set sits behind one short-lived mutex. Per-entry state lives in a
//! `watch` channel so payload updates and first-message waits never take the
//! key-set lock for longer than a map lookup. Calls into
//! [`SubscriptionControl`] are non-blocking and are made while the key-set
//! lock is held, so subscribe/unsubscribe requests reach the connection in the
//! same order entries are created and removed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::application::ports::{SubscribeError, SubscriptionControl};
use crate::domain::channel::ChannelKey;
use crate::domain::payload::ChannelPayload;
use crate::domain::subscription::{
    CacheStats, CachedPayload, EntryState, Rejection, SubscriptionId,
};
use crate::infrastructure::metrics;

// =============================================================================
// Entries
// =============================================================================

struct CacheEntry {
    subscription: SubscriptionId,
    state: watch::Sender<EntryState>,
    last_access: Mutex<Instant>,
    subscribed: AtomicBool,
}

impl CacheEntry {
    fn new(now: Instant, subscription: SubscriptionId) -> Self {
        let (state, _) = watch::channel(EntryState::Pending);
        Self {
            subscription,
            state,
            last_access: Mutex::new(now),
            subscribed: AtomicBool::new(false),
        }
    }

    /// Refresh recency; never moves backwards.
    fn touch(&self, now: Instant) {
        let mut last = self.last_access.lock();
        if now > *last {
            *last = now;
        }
    }

    fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    /// Whether a caller is blocked on the first payload.
    fn has_waiters(&self) -> bool {
        self.state.receiver_count() > 0
    }
}

/// Result of [`SubscriptionCache::get_or_subscribe`].
#[derive(Debug)]
pub enum Lookup {
    /// A payload is cached (possibly stale).
    Ready(CachedPayload),
    /// Subscribed, no payload yet.
    Pending(PendingEntry),
}

/// Failure while waiting on a pending entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    /// Nothing arrived within the wait bound.
    #[error("no payload within {0:?}")]
    TimedOut(Duration),

    /// The exchange refused the subscription.
    #[error("subscription refused: {}", .0.reason)]
    Rejected(Rejection),

    /// The entry was removed before any payload arrived.
    #[error("entry removed before first payload")]
    Closed,
}

/// Handle for awaiting the first payload of a pending entry.
///
/// Dropping the handle (or timing out) leaves the subscription in place.
#[derive(Debug)]
pub struct PendingEntry {
    rx: watch::Receiver<EntryState>,
}

impl PendingEntry {
    /// Wait up to `timeout` for the entry to leave `Pending`.
    ///
    /// # Errors
    ///
    /// Returns a [`WaitError`] on timeout, rejection or removal.
    pub async fn wait(mut self, timeout: Duration) -> Result<CachedPayload, WaitError> {
        let waited = tokio::time::timeout(timeout, async {
            loop {
                if let Some(outcome) = Self::settled(&self.rx.borrow_and_update()) {
                    return outcome;
                }
                if self.rx.changed().await.is_err() {
                    return Self::settled(&self.rx.borrow()).unwrap_or(Err(WaitError::Closed));
                }
            }
        })
        .await;

        waited.unwrap_or(Err(WaitError::TimedOut(timeout)))
    }

    fn settled(state: &EntryState) -> Option<Result<CachedPayload, WaitError>> {
        match state {
            EntryState::Pending => None,
            EntryState::Ready(cached) => Some(Ok(cached.clone())),
            EntryState::Rejected(rejection) => Some(Err(WaitError::Rejected(rejection.clone()))),
        }
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Subscribe-on-demand payload cache.
pub struct SubscriptionCache {
    entries: Mutex<HashMap<ChannelKey, Arc<CacheEntry>>>,
    control: Arc<dyn SubscriptionControl>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for SubscriptionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionCache")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl SubscriptionCache {
    /// Create an empty cache that subscribes through `control`.
    #[must_use]
    pub fn new(control: Arc<dyn SubscriptionControl>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            control,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a channel, subscribing on a miss.
    ///
    /// An existing entry is touched and its current state returned. A missing
    /// entry is created, marked subscribed and handed to the connection; only
    /// the caller that creates the entry issues the subscribe.
    ///
    /// # Errors
    ///
    /// Returns the [`SubscribeError`] from the connection; the entry is not
    /// kept in that case.
    pub fn get_or_subscribe(&self, key: &ChannelKey) -> Result<Lookup, SubscribeError> {
        let now = Instant::now();

        let entry = {
            let mut entries = self.entries.lock();

            if let Some(entry) = entries.get(key) {
                entry.touch(now);
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_hit(key.kind());
                Arc::clone(entry)
            } else {
                let subscription = self.control.subscribe(key)?;
                let entry = Arc::new(CacheEntry::new(now, subscription));
                entry.subscribed.store(true, Ordering::Release);

                entries.insert(key.clone(), Arc::clone(&entry));
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_miss(key.kind());
                metrics::set_active_subscriptions(entries.len());
                tracing::debug!(channel = %key, %subscription, "subscribed on cache miss");
                entry
            }
        };

        let state = entry.state.borrow().clone();
        let lookup = match state {
            EntryState::Ready(cached) => Lookup::Ready(cached),
            EntryState::Pending | EntryState::Rejected(_) => Lookup::Pending(PendingEntry {
                rx: entry.state.subscribe(),
            }),
        };
        Ok(lookup)
    }

    /// Store a payload for a cached channel. Does not touch recency.
    ///
    /// Returns `false` when the channel is not cached (evicted, never asked
    /// for, or refused); the payload is dropped in that case.
    pub fn update(&self, key: &ChannelKey, payload: ChannelPayload) -> bool {
        let entry = self.entries.lock().get(key).cloned();

        let Some(entry) = entry else {
            tracing::trace!(channel = %key, "payload for uncached channel dropped");
            return false;
        };

        entry
            .state
            .send_replace(EntryState::Ready(CachedPayload::now(payload)));
        true
    }

    /// Remove a channel the exchange refused and notify its waiters.
    ///
    /// Only the entry created by `subscription` is affected; a refusal that
    /// arrives after the channel was evicted and subscribed again is ignored.
    pub fn reject(
        &self,
        key: &ChannelKey,
        subscription: SubscriptionId,
        rejection: Rejection,
    ) -> bool {
        let entry = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(entry) if entry.subscription == subscription => {}
                Some(entry) => {
                    tracing::debug!(
                        channel = %key,
                        refused = %subscription,
                        current = %entry.subscription,
                        "stale refusal ignored"
                    );
                    return false;
                }
                None => return false,
            }
            let entry = entries.remove(key);
            metrics::set_active_subscriptions(entries.len());
            entry
        };

        let Some(entry) = entry else {
            return false;
        };

        tracing::warn!(channel = %key, reason = %rejection.reason, "subscription refused");
        entry.subscribed.store(false, Ordering::Release);
        entry.state.send_replace(EntryState::Rejected(rejection));
        true
    }

    /// Remove a channel and unsubscribe it. Idempotent.
    pub fn evict(&self, key: &ChannelKey) -> bool {
        self.remove_where(key, |_| true)
    }

    /// Evict a channel only if it has been idle for longer than `idle_timeout`
    /// at `now` and nobody is waiting on its first payload. The check is
    /// repeated under the lock, so an access that races the sweeper keeps the
    /// entry alive.
    pub fn evict_if_idle(&self, key: &ChannelKey, now: Instant, idle_timeout: Duration) -> bool {
        self.remove_where(key, |entry| {
            !entry.has_waiters()
                && now.saturating_duration_since(entry.last_access()) > idle_timeout
        })
    }

    fn remove_where(&self, key: &ChannelKey, predicate: impl FnOnce(&CacheEntry) -> bool) -> bool {
        let mut entries = self.entries.lock();

        let Some(entry) = entries.get(key) else {
            return false;
        };
        if !predicate(entry) {
            return false;
        }

        if let Some(entry) = entries.remove(key) {
            entry.subscribed.store(false, Ordering::Release);
        }
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.control.unsubscribe(key);
        metrics::record_eviction(key.kind());
        metrics::set_active_subscriptions(entries.len());
        drop(entries);

        tracing::info!(channel = %key, "evicted idle channel");
        true
    }

    /// Snapshot of every key with its last access time.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(ChannelKey, Instant)> {
        self.entries
            .lock()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.last_access()))
            .collect()
    }

    /// Keys currently marked subscribed.
    #[must_use]
    pub fn subscribed_keys(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<_> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.subscribed.load(Ordering::Acquire))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Current state of a channel without touching it.
    #[must_use]
    pub fn peek(&self, key: &ChannelKey) -> Option<EntryState> {
        self.entries
            .lock()
            .get(key)
            .map(|entry| entry.state.borrow().clone())
    }

    /// Last access time of a channel.
    #[must_use]
    pub fn last_access(&self, key: &ChannelKey) -> Option<Instant> {
        self.entries.lock().get(key).map(|entry| entry.last_access())
    }

    /// Number of cached channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Hit/miss/eviction counters and entry counts.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let (entries, pending) = {
            let entries = self.entries.lock();
            let pending = entries
                .values()
                .filter(|entry| entry.state.borrow().is_pending())
                .count();
            (entries.len(), pending)
        };

        CacheStats {
            entries,
            pending,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockSubscriptionControl;
    use crate::domain::channel::SymbolSet;
    use crate::domain::payload::Ticker;
    use crate::domain::subscription::RejectionKind;
    use mockall::predicate::eq;

    fn ticker_key() -> ChannelKey {
        SymbolSet::default().ticker("xbt", "aud").unwrap()
    }

    fn ticker_payload(last: i64) -> ChannelPayload {
        ChannelPayload::Ticker(Ticker {
            primary_currency_code: "Xbt".to_string(),
            secondary_currency_code: "Aud".to_string(),
            last_price: Some(last.into()),
            best_bid: None,
            best_ask: None,
            volume_24_hour: None,
            day_highest_price: None,
            day_lowest_price: None,
        })
    }

    fn cache_with(control: MockSubscriptionControl) -> SubscriptionCache {
        SubscriptionCache::new(Arc::new(control))
    }

    #[tokio::test]
    async fn miss_subscribes_once_then_hits() {
        let key = ticker_key();
        let mut control = MockSubscriptionControl::new();
        control
            .expect_subscribe()
            .with(eq(key.clone()))
            .times(1)
            .returning(|_| Ok(SubscriptionId::new(1)));
        let cache = cache_with(control);

        assert!(matches!(
            cache.get_or_subscribe(&key).unwrap(),
            Lookup::Pending(_)
        ));
        assert!(matches!(
            cache.get_or_subscribe(&key).unwrap(),
            Lookup::Pending(_)
        ));

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(cache.subscribed_keys(), vec![key]);
    }

    #[tokio::test]
    async fn concurrent_misses_issue_one_subscribe() {
        let key = ticker_key();
        let mut control = MockSubscriptionControl::new();
        control.expect_subscribe().times(1).returning(|_| Ok(SubscriptionId::new(1)));
        let cache = Arc::new(cache_with(control));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                cache.get_or_subscribe(&key).is_ok()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn failed_subscribe_leaves_no_entry() {
        let key = SymbolSet::default().balance("aud").unwrap();
        let mut control = MockSubscriptionControl::new();
        control
            .expect_subscribe()
            .times(2)
            .returning(|key| Err(SubscribeError::MissingCredentials(key.channel_name())));
        let cache = cache_with(control);

        assert!(matches!(
            cache.get_or_subscribe(&key),
            Err(SubscribeError::MissingCredentials(_))
        ));
        assert!(cache.is_empty());
        // A retry hits the connection again instead of a phantom entry.
        assert!(cache.get_or_subscribe(&key).is_err());
    }

    #[tokio::test]
    async fn update_resolves_pending_waiters() {
        let key = ticker_key();
        let mut control = MockSubscriptionControl::new();
        control.expect_subscribe().returning(|_| Ok(SubscriptionId::new(1)));
        let cache = cache_with(control);

        let Lookup::Pending(pending) = cache.get_or_subscribe(&key).unwrap() else {
            panic!("expected pending");
        };
        assert!(cache.update(&key, ticker_payload(100)));

        let cached = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(*cached.payload, ticker_payload(100));

        let Lookup::Ready(cached) = cache.get_or_subscribe(&key).unwrap() else {
            panic!("expected ready");
        };
        assert_eq!(*cached.payload, ticker_payload(100));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_and_keeps_subscription() {
        let key = ticker_key();
        let mut control = MockSubscriptionControl::new();
        control.expect_subscribe().times(1).returning(|_| Ok(SubscriptionId::new(1)));
        let cache = cache_with(control);

        let Lookup::Pending(pending) = cache.get_or_subscribe(&key).unwrap() else {
            panic!("expected pending");
        };
        let err = pending.wait(Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err, WaitError::TimedOut(Duration::from_millis(50)));

        assert_eq!(cache.peek(&key), Some(EntryState::Pending));
        assert_eq!(cache.subscribed_keys(), vec![key]);
    }

    #[tokio::test]
    async fn update_does_not_touch_last_access() {
        let key = ticker_key();
        let mut control = MockSubscriptionControl::new();
        control.expect_subscribe().returning(|_| Ok(SubscriptionId::new(1)));
        let cache = cache_with(control);

        cache.get_or_subscribe(&key).unwrap();
        let before = cache.last_access(&key).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.update(&key, ticker_payload(1));

        assert_eq!(cache.last_access(&key).unwrap(), before);
    }

    #[tokio::test]
    async fn update_for_unknown_key_is_dropped() {
        let cache = cache_with(MockSubscriptionControl::new());
        assert!(!cache.update(&ticker_key(), ticker_payload(1)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn reject_notifies_waiters_and_removes_entry() {
        let key = SymbolSet::default().balance("aud").unwrap();
        let mut control = MockSubscriptionControl::new();
        control.expect_subscribe().returning(|_| Ok(SubscriptionId::new(1)));
        let cache = cache_with(control);

        let Lookup::Pending(pending) = cache.get_or_subscribe(&key).unwrap() else {
            panic!("expected pending");
        };
        assert!(cache.reject(
            &key,
            SubscriptionId::new(1),
            Rejection::for_key(&key, "invalid signature")
        ));

        let err = pending.wait(Duration::from_secs(1)).await.unwrap_err();
        let WaitError::Rejected(rejection) = err else {
            panic!("expected rejection, got {err:?}");
        };
        assert_eq!(rejection.kind, RejectionKind::Authentication);
        assert!(cache.is_empty());
        assert!(!cache.reject(
            &key,
            SubscriptionId::new(1),
            Rejection::for_key(&key, "again")
        ));
    }

    #[tokio::test]
    async fn evict_unsubscribes_and_is_idempotent() {
        let key = ticker_key();
        let mut control = MockSubscriptionControl::new();
        control.expect_subscribe().times(2).returning(|_| Ok(SubscriptionId::new(1)));
        control
            .expect_unsubscribe()
            .with(eq(key.clone()))
            .times(1)
            .return_const(());
        let cache = cache_with(control);

        cache.get_or_subscribe(&key).unwrap();
        assert!(cache.evict(&key));
        assert!(!cache.evict(&key));
        assert_eq!(cache.stats().evictions, 1);

        // Next lookup is a fresh miss, not a stale hit.
        assert!(matches!(
            cache.get_or_subscribe(&key).unwrap(),
            Lookup::Pending(_)
        ));
        assert_eq!(cache.stats().misses, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn evict_if_idle_respects_recent_access() {
        let key = ticker_key();
        let mut control = MockSubscriptionControl::new();
        control.expect_subscribe().returning(|_| Ok(SubscriptionId::new(1)));
        control.expect_unsubscribe().times(1).return_const(());
        let cache = cache_with(control);
        let idle = Duration::from_secs(300);

        cache.get_or_subscribe(&key).unwrap();
        tokio::time::advance(Duration::from_secs(200)).await;
        cache.get_or_subscribe(&key).unwrap();
        tokio::time::advance(Duration::from_secs(200)).await;

        assert!(!cache.evict_if_idle(&key, Instant::now(), idle));

        tokio::time::advance(Duration::from_secs(101)).await;
        assert!(cache.evict_if_idle(&key, Instant::now(), idle));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn last_access_never_moves_backwards() {
        let key = ticker_key();
        let mut control = MockSubscriptionControl::new();
        control.expect_subscribe().returning(|_| Ok(SubscriptionId::new(1)));
        let cache = cache_with(control);

        cache.get_or_subscribe(&key).unwrap();
        let first = cache.last_access(&key).unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.get_or_subscribe(&key).unwrap();
        let second = cache.last_access(&key).unwrap();

        assert!(second > first);
        // A stale eviction check cannot see the entry as idle.
        assert!(!cache.evict_if_idle(&key, first, Duration::ZERO));
    }

    #[tokio::test]
    async fn refusal_for_evicted_subscription_spares_fresh_entry() {
        let key = ticker_key();
        let mut control = MockSubscriptionControl::new();
        let mut next = 0;
        control.expect_subscribe().times(2).returning(move |_| {
            next += 1;
            Ok(SubscriptionId::new(next))
        });
        control.expect_unsubscribe().times(1).return_const(());
        let cache = cache_with(control);

        cache.get_or_subscribe(&key).unwrap();
        assert!(cache.evict(&key));
        cache.get_or_subscribe(&key).unwrap();

        assert!(!cache.reject(
            &key,
            SubscriptionId::new(1),
            Rejection::for_key(&key, "old")
        ));
        assert_eq!(cache.peek(&key), Some(EntryState::Pending));
        assert_eq!(cache.subscribed_keys(), vec![key.clone()]);

        assert!(cache.reject(
            &key,
            SubscriptionId::new(2),
            Rejection::for_key(&key, "current")
        ));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sweep_skips_entry_with_waiter() {
        let key = ticker_key();
        let mut control = MockSubscriptionControl::new();
        control
            .expect_subscribe()
            .times(1)
            .returning(|_| Ok(SubscriptionId::new(1)));
        control.expect_unsubscribe().times(1).return_const(());
        let cache = Arc::new(cache_with(control));
        let idle = Duration::from_millis(200);

        let Lookup::Pending(pending) = cache.get_or_subscribe(&key).unwrap() else {
            panic!("expected pending");
        };
        let waiter = tokio::spawn(pending.wait(Duration::from_secs(2)));
        tokio::time::advance(Duration::from_millis(300)).await;

        assert!(!cache.evict_if_idle(&key, Instant::now(), idle));

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err, WaitError::TimedOut(Duration::from_secs(2)));
        assert_eq!(cache.peek(&key), Some(EntryState::Pending));

        // Once the waiter is gone the idle entry goes as usual.
        assert!(cache.evict_if_idle(&key, Instant::now(), idle));
        assert!(cache.is_empty());
    }
}
