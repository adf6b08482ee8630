//! In-memory credential cache with single-flight wait semantics.
//!
//! Derived encryption keys live here with a sliding expiration. Callers that
//! need a key that is not (yet) present do not fail: [`CredentialCache::get`]
//! hands them a pending [`KeyRequest`] that resolves when a later
//! [`CredentialCache::put`] supplies the key, so any number of concurrent
//! operations share exactly one outstanding "please unlock" signal instead of
//! issuing N redundant prompts.
//!
//! A background sweep task evicts expired entries, and a snapshot of the
//! entries (never the waiters) is persisted to a session-scoped
//! [`SnapshotSlot`] so keys survive a page reload. Derived keys, not
//! passphrases, are the only secret ever cached or serialized.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::crypto::DerivedKey;
use crate::session::SnapshotSlot;

/// Default sliding TTL for cached keys.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Default interval between eviction sweeps.
pub const DEFAULT_RECYCLE_INTERVAL: Duration = Duration::from_secs(1);

/// Milliseconds since the unix epoch. Wall-clock time, so snapshots restored
/// in a later session still expire correctly.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Tuning knobs for the cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    /// Sliding TTL: every `get`/`put` pushes the entry's expiry this far out.
    pub max_age: Duration,
    /// How often the sweep task scans for expired entries.
    pub recycle_interval: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_MAX_AGE,
            recycle_interval: DEFAULT_RECYCLE_INTERVAL,
        }
    }
}

/// A cached credential with its sliding-expiration bookkeeping.
///
/// All timestamps are unix milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The derived key itself.
    pub value: DerivedKey,
    /// When the entry was first created.
    pub created: u64,
    /// Last time the entry was read or refreshed.
    pub accessed: u64,
    /// Absolute expiry; refreshed on every `get`/`put`.
    pub expires: u64,
    /// Entries with this flag cleared read as absent everywhere and are
    /// evicted by the next sweep. Carried in the snapshot so a restored
    /// entry can arrive pre-invalidated.
    pub valid: bool,
}

/// Why a `get` could not resolve immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    /// No entry exists for the key.
    Missing,
    /// An entry existed but its TTL had elapsed.
    Expired,
}

impl fmt::Display for MissReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissReason::Missing => f.write_str("missing"),
            MissReason::Expired => f.write_str("expired"),
        }
    }
}

/// The waiter's request was rejected before a matching `put` arrived,
/// either by an explicit invalidation or by the eviction sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("credential request rejected - key invalidated before a matching put")]
pub struct Rejected;

/// Outcome of [`CredentialCache::get`]: either the key, right now, or a
/// pending result plus the reason it could not resolve immediately.
///
/// The two-phase shape is deliberate: the `Pending` arm is the intermediate
/// "key unavailable" notification, and awaiting it is the eventual
/// resolve/reject.
#[derive(Debug)]
pub enum KeyRequest {
    /// A valid, unexpired entry existed; its TTL has been refreshed.
    Ready(DerivedKey),
    /// The caller has been enqueued and will resolve on a future `put`.
    Pending {
        /// Why the key was unavailable.
        reason: MissReason,
        /// Resolves with the key on `put`, errors on invalidation.
        wait: oneshot::Receiver<DerivedKey>,
    },
}

impl KeyRequest {
    /// Whether the request resolved immediately.
    pub fn is_ready(&self) -> bool {
        matches!(self, KeyRequest::Ready(_))
    }

    /// The miss reason, if the request is pending.
    pub fn miss_reason(&self) -> Option<MissReason> {
        match self {
            KeyRequest::Ready(_) => None,
            KeyRequest::Pending { reason, .. } => Some(*reason),
        }
    }

    /// Wait for the final outcome.
    pub async fn wait(self) -> Result<DerivedKey, Rejected> {
        match self {
            KeyRequest::Ready(key) => Ok(key),
            KeyRequest::Pending { wait, .. } => wait.await.map_err(|_| Rejected),
        }
    }
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Pending requesters per key, resolved FIFO by `put`, rejected by
    /// invalidation. Never persisted; reset to empty on construction.
    waiters: HashMap<String, Vec<oneshot::Sender<DerivedKey>>>,
}

/// Process-wide derived-key cache. One instance is shared (via `Arc`) by
/// every locker; each locker only ever touches its own seed's entry.
pub struct CredentialCache {
    options: CacheOptions,
    slot: Arc<dyn SnapshotSlot>,
    inner: Mutex<CacheInner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCache")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl CredentialCache {
    /// Create a cache, restoring any snapshot the slot holds, and start the
    /// periodic eviction sweep.
    ///
    /// Must be called from within a tokio runtime (the sweep is a spawned
    /// task). Construction never fails: a corrupt snapshot falls back to an
    /// empty cache.
    pub fn new(options: CacheOptions, slot: Arc<dyn SnapshotSlot>) -> Arc<Self> {
        let entries = Self::restore(slot.as_ref());

        let cache = Arc::new(Self {
            options,
            slot,
            inner: Mutex::new(CacheInner {
                entries,
                waiters: HashMap::new(),
            }),
            sweeper: Mutex::new(None),
        });

        // The sweep holds only a weak handle so dropping the last user of the
        // cache also ends the task.
        let weak = Arc::downgrade(&cache);
        let interval = options.recycle_interval;
        let handle = tokio::spawn(run_sweeper(weak, interval));
        *lock(&cache.sweeper) = Some(handle);

        cache
    }

    /// Create a cache with default options.
    pub fn with_defaults(slot: Arc<dyn SnapshotSlot>) -> Arc<Self> {
        Self::new(CacheOptions::default(), slot)
    }

    fn restore(slot: &dyn SnapshotSlot) -> HashMap<String, CacheEntry> {
        let Some(state) = slot.load() else {
            return HashMap::new();
        };
        match serde_json::from_str(&state) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(%err, "corrupt credential snapshot, starting empty");
                HashMap::new()
            }
        }
    }

    fn locked(&self) -> MutexGuard<'_, CacheInner> {
        lock(&self.inner)
    }

    /// Serialize `entries` into the session slot. Waiters are deliberately
    /// excluded; they are in-memory coordination state only.
    fn persist(&self, inner: &CacheInner) {
        match serde_json::to_string(&inner.entries) {
            Ok(state) => self.slot.save(&state),
            Err(err) => tracing::warn!(%err, "failed to serialize credential snapshot"),
        }
    }

    /// Store (or refresh) a key and resolve every waiter queued for it, in
    /// the order they arrived.
    pub fn put(&self, key: &str, value: DerivedKey) {
        let now = now_millis();
        let expires = now.saturating_add(age_millis(self.options.max_age));

        let mut inner = self.locked();
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.accessed = now;
                entry.expires = expires;
                entry.valid = true;
                entry.value = value.clone();
            }
            None => {
                inner.entries.insert(
                    key.to_string(),
                    CacheEntry {
                        value: value.clone(),
                        created: now,
                        accessed: now,
                        expires,
                        valid: true,
                    },
                );
            }
        }

        if let Some(waiters) = inner.waiters.remove(key) {
            tracing::debug!(waiters = waiters.len(), "resolving queued key requests");
            for tx in waiters {
                // A waiter that gave up just drops its receiver; that is fine.
                let _ = tx.send(value.clone());
            }
        }

        self.persist(&inner);
    }

    /// Get a key now, or enqueue for a future `put`.
    ///
    /// On a hit the entry's TTL is refreshed. On a miss (absent or expired)
    /// the stale entry, if any, is dropped and the caller joins the waiter
    /// queue for that key.
    pub fn get(&self, key: &str) -> KeyRequest {
        let now = now_millis();
        let mut inner = self.locked();

        if let Some(entry) = inner.entries.get_mut(key) {
            if entry.valid && entry.expires > now {
                entry.accessed = now;
                entry.expires = now.saturating_add(age_millis(self.options.max_age));
                return KeyRequest::Ready(entry.value.clone());
            }
        }

        let reason = if inner.entries.remove(key).is_some() {
            MissReason::Expired
        } else {
            MissReason::Missing
        };

        let (tx, rx) = oneshot::channel();
        inner.waiters.entry(key.to_string()).or_default().push(tx);
        tracing::debug!(%reason, "credential unavailable, caller enqueued");

        KeyRequest::Pending { reason, wait: rx }
    }

    /// Read-only peek. Never refreshes the TTL, never enqueues a waiter.
    /// Expired or invalidated entries read as absent.
    pub fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let inner = self.locked();
        let entry = inner.entries.get(key)?;
        if entry.valid && entry.expires > now_millis() {
            Some(entry.clone())
        } else {
            None
        }
    }

    /// Forget one key and reject all its queued waiters.
    pub fn invalidate(&self, key: &str) {
        let mut inner = self.locked();
        inner.entries.remove(key);
        // Dropping the senders rejects the receivers.
        inner.waiters.remove(key);
        self.persist(&inner);
    }

    /// Forget everything: all entries gone, all waiters for all keys
    /// rejected.
    pub fn invalidate_all(&self) {
        let mut inner = self.locked();
        inner.entries.clear();
        inner.waiters.clear();
        self.persist(&inner);
    }

    /// Stop the periodic sweep and clear the whole cache.
    pub fn destroy(&self) {
        if let Some(handle) = lock(&self.sweeper).take() {
            handle.abort();
        }
        self.invalidate_all();
    }

    /// One eviction pass: expired entries are removed and, as a consequence,
    /// any waiters still queued on them are rejected. The snapshot is
    /// persisted once per pass.
    fn sweep(&self) {
        let now = now_millis();
        let mut inner = self.locked();

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.valid || entry.expires <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.entries.remove(key);
            inner.waiters.remove(key);
        }
        if !expired.is_empty() {
            tracing::debug!(evicted = expired.len(), "sweep evicted expired credentials");
        }

        self.persist(&inner);
    }

    /// Number of live (valid, unexpired) entries. Mostly for tests and
    /// diagnostics.
    pub fn len(&self) -> usize {
        let now = now_millis();
        self.locked()
            .entries
            .values()
            .filter(|e| e.valid && e.expires > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for CredentialCache {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.sweeper).take() {
            handle.abort();
        }
    }
}

async fn run_sweeper(cache: Weak<CredentialCache>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it so a fresh cache is not
    // swept before anyone has used it.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(cache) = cache.upgrade() else { break };
        cache.sweep();
    }
}

fn age_millis(age: Duration) -> u64 {
    u64::try_from(age.as_millis()).unwrap_or(u64::MAX)
}

/// Lock a mutex, shrugging off poisoning: the cache holds no invariants that
/// a panicked writer could have left half-applied across an entry boundary.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AesGcmProvider, CryptoProvider};
    use crate::session::MemorySlot;
    use std::time::Duration;
    use tokio::time::timeout;

    fn key(name: &str) -> DerivedKey {
        AesGcmProvider::new().derive_key(name, "test-seed")
    }

    fn fast_options() -> CacheOptions {
        CacheOptions {
            max_age: Duration::from_millis(60),
            recycle_interval: Duration::from_millis(20),
        }
    }

    fn new_cache(options: CacheOptions) -> Arc<CredentialCache> {
        CredentialCache::new(options, Arc::new(MemorySlot::new()))
    }

    #[tokio::test]
    async fn put_then_lookup_roundtrip() {
        let cache = new_cache(CacheOptions::default());
        cache.put("seed-a", key("k1"));

        let entry = cache.lookup("seed-a").expect("entry should exist");
        assert_eq!(entry.value, key("k1"));
        assert!(entry.valid);
        assert!(entry.expires > now_millis());
    }

    #[tokio::test]
    async fn unbounded_max_age_saturates_instead_of_overflowing() {
        // Duration::MAX is the natural "never expire" setting.
        let cache = new_cache(CacheOptions {
            max_age: Duration::MAX,
            recycle_interval: DEFAULT_RECYCLE_INTERVAL,
        });

        cache.put("seed-a", key("k1"));
        assert_eq!(cache.lookup("seed-a").unwrap().expires, u64::MAX);

        let request = cache.get("seed-a");
        assert!(request.is_ready());
    }

    #[tokio::test]
    async fn get_hit_refreshes_ttl() {
        let cache = new_cache(CacheOptions::default());
        cache.put("seed-a", key("k1"));
        let before = cache.lookup("seed-a").unwrap().expires;

        tokio::time::sleep(Duration::from_millis(5)).await;
        let request = cache.get("seed-a");
        assert!(request.is_ready());

        let after = cache.lookup("seed-a").unwrap().expires;
        assert!(after > before, "get must extend the expiry");
    }

    #[tokio::test]
    async fn lookup_does_not_refresh_ttl() {
        let cache = new_cache(CacheOptions::default());
        cache.put("seed-a", key("k1"));
        let before = cache.lookup("seed-a").unwrap().expires;

        tokio::time::sleep(Duration::from_millis(5)).await;
        let after = cache.lookup("seed-a").unwrap().expires;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn get_on_empty_cache_blocks_until_put() {
        let cache = new_cache(CacheOptions::default());

        let request = cache.get("seed-a");
        assert_eq!(request.miss_reason(), Some(MissReason::Missing));

        let waiter = tokio::spawn(async move { request.wait().await });
        // Nothing resolves the request yet.
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        cache.put("seed-a", key("k1"));
        let resolved = waiter.await.unwrap().unwrap();
        assert_eq!(resolved, key("k1"));
    }

    #[tokio::test]
    async fn two_waiters_share_one_put() {
        let cache = new_cache(CacheOptions::default());

        let first = cache.get("seed-a");
        let second = cache.get("seed-a");
        assert!(!first.is_ready());
        assert!(!second.is_ready());

        cache.put("seed-a", key("k1"));

        assert_eq!(first.wait().await.unwrap(), key("k1"));
        assert_eq!(second.wait().await.unwrap(), key("k1"));
    }

    #[tokio::test]
    async fn waiters_resolve_in_fifo_order() {
        let cache = new_cache(CacheOptions::default());
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

        for i in 0..4 {
            let request = cache.get("seed-a");
            let done = done_tx.clone();
            tokio::spawn(async move {
                let _ = request.wait().await;
                let _ = done.send(i);
            });
        }
        // Let every waiter reach its await point before the fan-out.
        tokio::task::yield_now().await;

        cache.put("seed-a", key("k1"));

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(done_rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn invalidate_rejects_waiters_and_next_get_blocks_again() {
        let cache = new_cache(CacheOptions::default());

        let request = cache.get("seed-a");
        cache.invalidate("seed-a");
        assert_eq!(request.wait().await, Err(Rejected));

        // No stale resolution: a fresh get still blocks.
        let request = cache.get("seed-a");
        assert_eq!(request.miss_reason(), Some(MissReason::Missing));
        let pending = timeout(Duration::from_millis(30), request.wait()).await;
        assert!(pending.is_err(), "fresh get must keep blocking");
    }

    #[tokio::test]
    async fn invalidate_all_rejects_every_key() {
        let cache = new_cache(CacheOptions::default());
        cache.put("seed-a", key("k1"));

        let wait_b = cache.get("seed-b");
        let wait_c = cache.get("seed-c");

        cache.invalidate_all();

        assert!(cache.lookup("seed-a").is_none());
        assert_eq!(wait_b.wait().await, Err(Rejected));
        assert_eq!(wait_c.wait().await, Err(Rejected));
    }

    #[tokio::test]
    async fn put_after_invalidate_starts_fresh() {
        let cache = new_cache(CacheOptions::default());

        let rejected = cache.get("seed-a");
        cache.invalidate("seed-a");
        cache.put("seed-a", key("k2"));

        // The earlier-rejected waiter is not retroactively resolved.
        assert_eq!(rejected.wait().await, Err(Rejected));
        // But the entry itself is live again.
        assert_eq!(cache.lookup("seed-a").unwrap().value, key("k2"));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_absent() {
        let cache = new_cache(fast_options());
        cache.put("seed-a", key("k1"));
        assert!(cache.lookup("seed-a").is_some());

        tokio::time::sleep(Duration::from_millis(90)).await;

        assert!(cache.lookup("seed-a").is_none());
        let request = cache.get("seed-a");
        // The sweep may have evicted it first (Missing) or the get found the
        // stale entry itself (Expired); either way it does not resolve.
        assert!(!request.is_ready());
    }

    #[tokio::test]
    async fn repeated_puts_keep_entry_alive_past_max_age() {
        let cache = new_cache(fast_options());
        for _ in 0..6 {
            cache.put("seed-a", key("k1"));
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        // 150ms elapsed, well past max_age, but the TTL slid forward.
        assert!(cache.lookup("seed-a").is_some());
    }

    #[tokio::test]
    async fn sweep_rejects_waiters_of_expired_entries() {
        // Housekeeping is coupled to requester-visible failure: when the
        // sweep evicts an expired entry, waiters queued on that key are
        // rejected even though no explicit lock happened.
        let cache = new_cache(CacheOptions {
            max_age: Duration::from_millis(40),
            recycle_interval: Duration::from_millis(20),
        });
        cache.put("seed-a", key("k1"));

        // Expire the entry, then queue a waiter before the next sweep by
        // getting through the expired path.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let request = cache.get("seed-a");
        assert!(!request.is_ready());

        // The waiter queued on an absent entry survives sweeps...
        let outcome = timeout(Duration::from_millis(60), request.wait()).await;
        assert!(outcome.is_err(), "waiter with no entry is retained");

        // ...but a waiter whose key still has an expired entry when the
        // sweep runs is rejected with it.
        cache.put("seed-b", key("k2"));
        let mut inner = cache.locked();
        let (tx, rx) = oneshot::channel::<DerivedKey>();
        inner.waiters.entry("seed-b".to_string()).or_default().push(tx);
        inner.entries.get_mut("seed-b").unwrap().expires = 0;
        drop(inner);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.await.is_err(), "sweep must reject the queued waiter");
    }

    #[tokio::test]
    async fn snapshot_restores_entries_but_not_waiters() {
        let slot = Arc::new(MemorySlot::new());

        let cache = CredentialCache::new(CacheOptions::default(), slot.clone());
        cache.put("seed-a", key("k1"));
        let _pending = cache.get("seed-b");
        drop(cache);

        // A rebuilt cache sees the entry but no waiters.
        let cache = CredentialCache::new(CacheOptions::default(), slot);
        assert_eq!(cache.lookup("seed-a").unwrap().value, key("k1"));
        assert!(cache.locked().waiters.is_empty());
    }

    #[tokio::test]
    async fn corrupt_snapshot_falls_back_to_empty() {
        let slot = Arc::new(MemorySlot::new());
        slot.save("definitely-not-json{");

        let cache = CredentialCache::new(CacheOptions::default(), slot);
        assert!(cache.is_empty());
        // And the cache still works.
        cache.put("seed-a", key("k1"));
        assert!(cache.lookup("seed-a").is_some());
    }

    #[tokio::test]
    async fn destroy_stops_sweep_and_clears() {
        let cache = new_cache(fast_options());
        cache.put("seed-a", key("k1"));
        let pending = cache.get("seed-b");

        cache.destroy();

        assert!(cache.is_empty());
        assert_eq!(pending.wait().await, Err(Rejected));
        assert!(lock(&cache.sweeper).is_none());
    }
}
