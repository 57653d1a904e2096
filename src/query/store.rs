//! Shared query storage.
//!
//! Holds the cache entries and the subscriber lists, both keyed by
//! [`QueryKey`]. Every method takes the store lock once, so a read and the
//! write that depends on it can never interleave with another operation.
//! Listeners are handed back as snapshots and invoked after the lock is
//! released.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::Instant;

use super::events::{Listener, SubscriberId};
use super::keys::QueryKey;
use super::lock::mutex_lock;

const SOURCE: &str = "query::store";

/// Last successfully fetched (or directly written) value for a key.
#[derive(Debug)]
pub struct CacheEntry<V> {
    /// The cached payload.
    pub value: Arc<V>,
    /// Monotonic stamp used for staleness and expiry decisions.
    pub fetched_at: Instant,
    /// Wall-clock time of the same write, for display.
    pub updated_at: OffsetDateTime,
}

impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            fetched_at: self.fetched_at,
            updated_at: self.updated_at,
        }
    }
}

impl<V> CacheEntry<V> {
    fn new(value: Arc<V>) -> Self {
        Self {
            value,
            fetched_at: Instant::now(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    /// Age of the entry at `now`.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.fetched_at)
    }

    /// True while the entry is younger than `stale_time`.
    pub fn is_fresh(&self, now: Instant, stale_time: Duration) -> bool {
        self.age(now) < stale_time
    }
}

struct StoreInner<V> {
    entries: HashMap<QueryKey, CacheEntry<V>>,
    subscribers: HashMap<QueryKey, Vec<(SubscriberId, Listener<V>)>>,
}

/// Entry map plus subscriber map behind one lock.
pub(crate) struct QueryStore<V> {
    inner: Mutex<StoreInner<V>>,
}

impl<V> QueryStore<V> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                entries: HashMap::new(),
                subscribers: HashMap::new(),
            }),
        }
    }

    // ========================================================================
    // Entries
    // ========================================================================

    pub(crate) fn entry(&self, key: &QueryKey) -> Option<CacheEntry<V>> {
        mutex_lock(&self.inner, SOURCE, "entry")
            .entries
            .get(key)
            .cloned()
    }

    pub(crate) fn contains(&self, key: &QueryKey) -> bool {
        mutex_lock(&self.inner, SOURCE, "contains")
            .entries
            .contains_key(key)
    }

    /// Store `value` stamped with the current time and snapshot the listeners for `key`.
    pub(crate) fn write(&self, key: &QueryKey, value: Arc<V>) -> Vec<Listener<V>> {
        let mut inner = mutex_lock(&self.inner, SOURCE, "write");
        inner.entries.insert(key.clone(), CacheEntry::new(value));
        listeners_of(&inner, key)
    }

    /// Compute the next value from the current one and store it, atomically.
    ///
    /// `updater` runs with the store locked and must not call back into the client.
    pub(crate) fn update<F>(&self, key: &QueryKey, updater: F) -> (Arc<V>, Vec<Listener<V>>)
    where
        F: FnOnce(Option<&V>) -> V,
    {
        let mut inner = mutex_lock(&self.inner, SOURCE, "update");
        let next = Arc::new(updater(inner.entries.get(key).map(|e| e.value.as_ref())));
        inner
            .entries
            .insert(key.clone(), CacheEntry::new(Arc::clone(&next)));
        (next, listeners_of(&inner, key))
    }

    /// Drop the entry if it has not been refreshed within `cache_time`.
    ///
    /// Returns true when an entry was removed.
    pub(crate) fn remove_if_expired(&self, key: &QueryKey, cache_time: Duration) -> bool {
        let mut inner = mutex_lock(&self.inner, SOURCE, "remove_if_expired");
        let now = Instant::now();
        let expired = inner
            .entries
            .get(key)
            .is_some_and(|entry| entry.age(now) >= cache_time);
        if expired {
            inner.entries.remove(key);
        }
        expired
    }

    /// Remove the entry only; subscribers stay registered.
    pub(crate) fn remove_entry(&self, key: &QueryKey) -> bool {
        mutex_lock(&self.inner, SOURCE, "remove_entry")
            .entries
            .remove(key)
            .is_some()
    }

    /// Remove every entry under `prefix`, returning each removed key with its listeners.
    pub(crate) fn invalidate_matching(
        &self,
        prefix: &QueryKey,
    ) -> Vec<(QueryKey, Vec<Listener<V>>)> {
        let mut inner = mutex_lock(&self.inner, SOURCE, "invalidate_matching");
        let matching: Vec<QueryKey> = inner
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();

        let mut removed = Vec::with_capacity(matching.len());
        for key in matching {
            inner.entries.remove(&key);
            let listeners = listeners_of(&inner, &key);
            removed.push((key, listeners));
        }
        removed
    }

    /// Remove entries and subscriber lists under `prefix`. Returns the number of keys touched.
    /// Returns the number of distinct keys that had an entry, subscribers, or both.
    pub(crate) fn remove_matching(&self, prefix: &QueryKey) -> usize {
        let mut inner = mutex_lock(&self.inner, SOURCE, "remove_matching");
        let matching: HashSet<QueryKey> = inner
            .entries
            .keys()
            .chain(inner.subscribers.keys())
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        for key in &matching {
            inner.entries.remove(key);
            inner.subscribers.remove(key);
        }
        matching.len()
    }

    pub(crate) fn clear(&self) {
        let mut inner = mutex_lock(&self.inner, SOURCE, "clear");
        inner.entries.clear();
        inner.subscribers.clear();
    }

    pub(crate) fn len(&self) -> usize {
        mutex_lock(&self.inner, SOURCE, "len").entries.len()
    }

    // ========================================================================
    // Subscribers
    // ========================================================================

    pub(crate) fn subscribe(&self, key: &QueryKey, id: SubscriberId, listener: Listener<V>) {
        mutex_lock(&self.inner, SOURCE, "subscribe")
            .subscribers
            .entry(key.clone())
            .or_default()
            .push((id, listener));
    }

    /// Remove one subscriber. Returns false when it was already gone.
    pub(crate) fn unsubscribe(&self, key: &QueryKey, id: SubscriberId) -> bool {
        let mut inner = mutex_lock(&self.inner, SOURCE, "unsubscribe");
        let Some(list) = inner.subscribers.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            inner.subscribers.remove(key);
        }
        removed
    }

    pub(crate) fn subscriber_count(&self, key: &QueryKey) -> usize {
        mutex_lock(&self.inner, SOURCE, "subscriber_count")
            .subscribers
            .get(key)
            .map_or(0, Vec::len)
    }
}

fn listeners_of<V>(inner: &StoreInner<V>, key: &QueryKey) -> Vec<Listener<V>> {
    inner
        .subscribers
        .get(key)
        .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
        .unwrap_or_default()
}
