//! Query client.
//!
//! Owns the shared cache and subscriber lists and exposes the imperative
//! cache operations. Clients are cheap handles: clone one per consumer and
//! every clone sees the same cache.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use metrics::counter;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::config::{QueryClientConfig, QueryOptions};
use super::events::{Listener, QueryNotification, SubscriberId, SubscriberIds};
use super::keys::QueryKey;
use super::store::{CacheEntry, QueryStore};

const METRIC_QUERY_INVALIDATED: &str = "shopdesk_query_invalidated_total";
const METRIC_QUERY_EXPIRED: &str = "shopdesk_query_expired_total";

pub(crate) struct ClientInner<V> {
    config: QueryClientConfig,
    store: QueryStore<V>,
    ids: SubscriberIds,
    runtime: Option<Handle>,
}

/// Handle to a shared query cache.
///
/// # Usage
///
/// ```ignore
/// let client = QueryClient::<serde_json::Value>::new(QueryClientConfig::default());
/// let orders = client.observe(query_key!["orders"], fetch_orders, QueryOptions::default());
/// // After a successful write elsewhere:
/// client.invalidate_queries(&query_key!["orders"]);
/// ```
pub struct QueryClient<V> {
    inner: Arc<ClientInner<V>>,
}

impl<V> Clone for QueryClient<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> QueryClient<V>
where
    V: Send + Sync + 'static,
{
    /// Create a client with an empty cache.
    ///
    /// Background work (expiry sweeps, refetch after invalidation) runs on the
    /// tokio runtime current at construction time, or the one current when the
    /// work is scheduled if the client was built outside a runtime.
    pub fn new(config: QueryClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                store: QueryStore::new(),
                ids: SubscriberIds::default(),
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    /// Client-wide defaults.
    pub fn config(&self) -> &QueryClientConfig {
        &self.inner.config
    }

    /// Observer options seeded from the client defaults.
    pub fn default_options(&self) -> QueryOptions {
        self.inner.config.query_options()
    }

    /// Register `listener` for every notification published on `key`.
    ///
    /// The listener stays registered until the returned [`Subscription`] is
    /// dropped or the key is removed with [`remove_queries`](Self::remove_queries)
    /// or [`clear`](Self::clear).
    pub fn subscribe<F>(&self, key: QueryKey, listener: F) -> Subscription<V>
    where
        F: Fn(&QueryNotification<V>) + Send + Sync + 'static,
    {
        let listener: Listener<V> = Arc::new(listener);
        let id = self.inner.ids.next();
        self.inner.store.subscribe(&key, id, listener);
        debug!(query_key = %key, subscriber_id = id, "Query subscriber registered");
        Subscription {
            key,
            id,
            client: Arc::downgrade(&self.inner),
        }
    }

    /// Drop every entry under `prefix` and tell its subscribers to refetch.
    ///
    /// `prefix` matches whole leading segments: `["orders", 4]` covers
    /// `["orders", 4, "items"]` but not `["orders", 42]`, unlike a raw prefix
    /// match on the serialized string.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate_queries(&self, prefix: &QueryKey) -> usize {
        let removed = self.inner.store.invalidate_matching(prefix);
        let count = removed.len();

        info!(query_prefix = %prefix, invalidated = count, "Queries invalidated");
        counter!(METRIC_QUERY_INVALIDATED).increment(count as u64);

        for (key, listeners) in removed {
            debug!(query_key = %key, subscribers = listeners.len(), "Notifying invalidation");
            notify(&listeners, &QueryNotification::Invalidated);
        }
        count
    }

    /// Write `value` for `key` without fetching and notify its subscribers.
    pub fn set_query_data(&self, key: &QueryKey, value: V) -> Arc<V> {
        let value = Arc::new(value);
        let listeners = self.inner.store.write(key, Arc::clone(&value));
        debug!(query_key = %key, subscribers = listeners.len(), "Query data set");
        notify(&listeners, &QueryNotification::Updated(Arc::clone(&value)));
        value
    }

    /// Replace the value for `key` with `updater(current)` and notify its subscribers.
    ///
    /// `updater` receives `None` when nothing is cached. It runs while the
    /// cache is locked and must not call back into the client.
    pub fn update_query_data<F>(&self, key: &QueryKey, updater: F) -> Arc<V>
    where
        F: FnOnce(Option<&V>) -> V,
    {
        let (value, listeners) = self.inner.store.update(key, updater);
        debug!(query_key = %key, subscribers = listeners.len(), "Query data updated");
        notify(&listeners, &QueryNotification::Updated(Arc::clone(&value)));
        value
    }

    /// Current cached value for `key`.
    pub fn get_query_data(&self, key: &QueryKey) -> Option<Arc<V>> {
        self.inner.store.entry(key).map(|entry| entry.value)
    }

    /// Current cache entry for `key`, including its timestamps.
    pub fn get_query_entry(&self, key: &QueryKey) -> Option<CacheEntry<V>> {
        self.inner.store.entry(key)
    }

    /// Check if an entry is cached for `key`.
    pub fn contains_query(&self, key: &QueryKey) -> bool {
        self.inner.store.contains(key)
    }

    /// Drop every entry and subscriber list under `prefix` without notifying anyone.
    ///
    /// Returns the number of distinct keys removed.
    pub fn remove_queries(&self, prefix: &QueryKey) -> usize {
        let removed = self.inner.store.remove_matching(prefix);
        info!(query_prefix = %prefix, removed, "Queries removed");
        removed
    }

    /// Drop the whole cache and all subscriber lists without notifying anyone.
    pub fn clear(&self) {
        self.inner.store.clear();
        info!("Query cache cleared");
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of subscribers currently registered for `key`.
    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        self.inner.store.subscriber_count(key)
    }

    // ========================================================================
    // Fetch plumbing used by observers
    // ========================================================================

    pub(crate) fn remove_entry(&self, key: &QueryKey) -> bool {
        self.inner.store.remove_entry(key)
    }

    /// Record a successful fetch: store, fan out, then schedule the expiry sweep.
    pub(crate) fn store_fetched(&self, key: &QueryKey, value: Arc<V>, cache_time: Duration) {
        let listeners = self.inner.store.write(key, Arc::clone(&value));
        debug!(query_key = %key, subscribers = listeners.len(), "Fetched data stored");
        notify(&listeners, &QueryNotification::Updated(value));
        self.schedule_expiry(key.clone(), cache_time);
    }

    /// The sweep deletes the entry only if no write landed within `cache_time`
    /// of the sweep firing, so an older timer never drops fresher data.
    fn schedule_expiry(&self, key: QueryKey, cache_time: Duration) {
        let client = Arc::downgrade(&self.inner);
        let _ = self.spawn(async move {
            tokio::time::sleep(cache_time).await;
            let Some(inner) = client.upgrade() else {
                return;
            };
            if inner.store.remove_if_expired(&key, cache_time) {
                debug!(query_key = %key, "Query entry expired");
                counter!(METRIC_QUERY_EXPIRED).increment(1);
            }
        });
    }

    /// Run `task` in the background. Returns false when no runtime is
    /// available and the task was dropped.
    pub(crate) fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self
            .inner
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok());
        match handle {
            Some(handle) => {
                handle.spawn(task);
                true
            }
            None => {
                warn!(
                    hint = "construct the client inside a tokio runtime",
                    "No tokio runtime available; background query task dropped"
                );
                false
            }
        }
    }
}

/// Deliver `notification` to a snapshot of listeners.
///
/// Listeners may subscribe or unsubscribe while this runs; the snapshot is
/// not affected.
fn notify<V>(listeners: &[Listener<V>], notification: &QueryNotification<V>) {
    for listener in listeners {
        listener(notification);
    }
}

/// Registration handle returned by [`QueryClient::subscribe`].
///
/// Dropping it unregisters the listener.
pub struct Subscription<V> {
    key: QueryKey,
    id: SubscriberId,
    client: Weak<ClientInner<V>>,
}

impl<V> Subscription<V> {
    /// Key this subscription listens on.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Unregister now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<V> Drop for Subscription<V> {
    fn drop(&mut self) {
        if let Some(inner) = self.client.upgrade()
            && inner.store.unsubscribe(&self.key, self.id)
        {
            debug!(query_key = %self.key, subscriber_id = self.id, "Query subscriber removed");
        }
    }
}
