//! Query observers.
//!
//! An observer is one consumer's live view of a key: it subscribes to the
//! shared entry, decides whether to fetch, and projects the result into its
//! own [`QueryState`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::client::{QueryClient, Subscription};
use super::config::QueryOptions;
use super::error::{BoxError, QueryError};
use super::events::QueryNotification;
use super::keys::QueryKey;

const METRIC_QUERY_HIT: &str = "shopdesk_query_cache_hit_total";
const METRIC_QUERY_MISS: &str = "shopdesk_query_cache_miss_total";
const METRIC_QUERY_FETCH_ERROR: &str = "shopdesk_query_fetch_error_total";
const METRIC_QUERY_FETCH_MS: &str = "shopdesk_query_fetch_ms";

/// Zero-argument function producing the payload for a key.
pub type QueryFn<V> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<V, BoxError>> + Send + Sync>;

/// One consumer's view of a query.
#[derive(Debug)]
pub struct QueryState<V> {
    /// Last value delivered to this consumer.
    pub data: Option<Arc<V>>,
    /// A fetch is outstanding and there is nothing to show yet.
    pub is_loading: bool,
    /// A fetch started by this consumer is outstanding.
    pub is_fetching: bool,
    /// The last fetch by this consumer failed.
    pub is_error: bool,
    /// Cause of the last failure.
    pub error: Option<QueryError>,
}

impl<V> Default for QueryState<V> {
    fn default() -> Self {
        Self {
            data: None,
            is_loading: false,
            is_fetching: false,
            is_error: false,
            error: None,
        }
    }
}

impl<V> Clone for QueryState<V> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            is_loading: self.is_loading,
            is_fetching: self.is_fetching,
            is_error: self.is_error,
            error: self.error.clone(),
        }
    }
}

impl<V> QueryState<V> {
    fn settled(data: Option<Arc<V>>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    fn failed(error: QueryError) -> Self {
        Self {
            is_error: true,
            error: Some(error),
            ..Self::default()
        }
    }

    /// True when data is present and no fetch is outstanding.
    pub fn is_success(&self) -> bool {
        self.data.is_some() && !self.is_fetching && !self.is_error
    }
}

struct ObserverShared<V> {
    client: QueryClient<V>,
    key: QueryKey,
    fetcher: QueryFn<V>,
    options: QueryOptions,
    state: watch::Sender<QueryState<V>>,
    alive: AtomicBool,
}

impl<V> ObserverShared<V>
where
    V: Send + Sync + 'static,
{
    /// Apply `f` to the local state unless the observer has been detached.
    fn update_state<F>(&self, f: F)
    where
        F: FnOnce(&mut QueryState<V>),
    {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        self.state.send_modify(f);
    }

    fn on_notification(self: &Arc<Self>, notification: &QueryNotification<V>) {
        match notification {
            QueryNotification::Updated(value) => {
                let value = Arc::clone(value);
                self.update_state(|state| state.data = Some(value));
            }
            QueryNotification::Invalidated => {
                self.update_state(|state| state.data = None);
                if self.options.enabled && self.alive.load(Ordering::Acquire) {
                    let shared = Arc::clone(self);
                    let spawned = self.client.spawn(async move {
                        let _ = shared.run(false).await;
                    });
                    if !spawned {
                        self.fail_without_runtime();
                    }
                }
            }
        }
    }

    fn fail_without_runtime(&self) {
        let error = QueryError::NoRuntime {
            key: self.key.clone(),
        };
        self.update_state(|state| *state = QueryState::failed(error));
    }

    /// Decide whether a fetch is needed and reflect the decision in the local state.
    ///
    /// Returns the cached value when the entry is fresh enough to skip fetching.
    fn decide(&self) -> Option<Arc<V>> {
        let cached = self.client.get_query_entry(&self.key);

        if let Some(entry) = cached.as_ref()
            && entry.is_fresh(tokio::time::Instant::now(), self.options.stale_time)
        {
            debug!(query_key = %self.key, outcome = "hit", "Serving cached query data");
            counter!(METRIC_QUERY_HIT).increment(1);
            let value = Arc::clone(&entry.value);
            self.update_state(|state| *state = QueryState::settled(Some(Arc::clone(&value))));
            return Some(value);
        }

        debug!(query_key = %self.key, outcome = "miss", "Query data missing or stale");
        counter!(METRIC_QUERY_MISS).increment(1);
        self.update_state(|state| {
            state.is_fetching = true;
            state.is_loading = state.data.is_none();
        });
        None
    }

    async fn run(self: Arc<Self>, force: bool) -> Result<Arc<V>, QueryError> {
        if !self.options.enabled {
            return Err(QueryError::Disabled {
                key: self.key.clone(),
            });
        }

        if !force {
            if let Some(value) = self.decide() {
                return Ok(value);
            }
        } else {
            self.update_state(|state| {
                state.is_fetching = true;
                state.is_loading = state.data.is_none();
            });
        }

        self.fetch().await
    }

    async fn fetch(&self) -> Result<Arc<V>, QueryError> {
        let started_at = Instant::now();
        let result = (self.fetcher)().await;
        histogram!(METRIC_QUERY_FETCH_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(value) => {
                let value = Arc::new(value);
                self.client
                    .store_fetched(&self.key, Arc::clone(&value), self.options.cache_time);
                self.update_state(|state| *state = QueryState::settled(Some(Arc::clone(&value))));
                Ok(value)
            }
            Err(source) => {
                let error = QueryError::fetch(self.key.clone(), source);
                warn!(query_key = %self.key, error = %error, "Query fetch failed");
                counter!(METRIC_QUERY_FETCH_ERROR).increment(1);
                self.update_state(|state| *state = QueryState::failed(error.clone()));
                Err(error)
            }
        }
    }
}

/// Live view of one key for one consumer.
///
/// Created by [`QueryClient::observe`]. Dropping the observer detaches it:
/// its subscriber is removed and any fetch still in flight completes into the
/// shared cache without touching this observer's state.
pub struct QueryObserver<V>
where
    V: Send + Sync + 'static,
{
    shared: Arc<ObserverShared<V>>,
    _subscription: Subscription<V>,
}

impl<V> QueryObserver<V>
where
    V: Send + Sync + 'static,
{
    /// Key being observed.
    pub fn key(&self) -> &QueryKey {
        &self.shared.key
    }

    /// Options this observer was attached with.
    pub fn options(&self) -> QueryOptions {
        self.shared.options
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> QueryState<V> {
        self.shared.state.borrow().clone()
    }

    /// Current data, if any.
    pub fn data(&self) -> Option<Arc<V>> {
        self.shared.state.borrow().data.clone()
    }

    /// Receiver that wakes on every state change.
    pub fn watch(&self) -> watch::Receiver<QueryState<V>> {
        self.shared.state.subscribe()
    }

    /// Wait until no fetch by this observer is outstanding.
    pub async fn settled(&self) -> QueryState<V> {
        let mut receiver = self.shared.state.subscribe();
        match receiver.wait_for(|state| !state.is_fetching).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }

    /// Fetch now, ignoring staleness.
    ///
    /// The cached entry is dropped first, without notifying anyone. A disabled
    /// observer returns [`QueryError::Disabled`] and leaves the cache alone.
    pub async fn refetch(&self) -> Result<Arc<V>, QueryError> {
        if self.shared.options.enabled {
            self.shared.client.remove_entry(&self.shared.key);
        }
        Arc::clone(&self.shared).run(true).await
    }

    /// Stop observing.
    pub fn detach(self) {
        drop(self);
    }
}

impl<V> Drop for QueryObserver<V>
where
    V: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::Release);
        debug!(query_key = %self.shared.key, "Query observer detached");
    }
}

impl<V> QueryClient<V>
where
    V: Send + Sync + 'static,
{
    /// Attach an observer for `key`.
    ///
    /// The observer starts from whatever is cached. When `options.enabled` is
    /// set and the entry is missing or older than `options.stale_time`, a
    /// fetch is started in the background; otherwise no fetch happens.
    ///
    /// Outside a tokio runtime the fetch cannot start, and the observer
    /// settles at once with [`QueryError::NoRuntime`].
    pub fn observe<F, Fut>(
        &self,
        key: QueryKey,
        fetcher: F,
        options: QueryOptions,
    ) -> QueryObserver<V>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, BoxError>> + Send + 'static,
    {
        let fetcher: QueryFn<V> = Arc::new(move || fetcher().boxed());
        self.observe_with(key, fetcher, options)
    }

    /// Attach an observer with an already boxed fetcher.
    pub fn observe_with(
        &self,
        key: QueryKey,
        fetcher: QueryFn<V>,
        options: QueryOptions,
    ) -> QueryObserver<V> {
        let cached = self.get_query_data(&key);
        let initial = QueryState {
            is_loading: options.enabled && cached.is_none(),
            is_fetching: options.enabled,
            data: cached,
            ..QueryState::default()
        };
        let (state, _) = watch::channel(initial);

        let shared = Arc::new(ObserverShared {
            client: self.clone(),
            key: key.clone(),
            fetcher,
            options,
            state,
            alive: AtomicBool::new(true),
        });

        let weak: Weak<ObserverShared<V>> = Arc::downgrade(&shared);
        let subscription = self.subscribe(key, move |notification| {
            if let Some(shared) = weak.upgrade() {
                shared.on_notification(notification);
            }
        });

        if options.enabled && shared.decide().is_none() {
            let task = Arc::clone(&shared);
            let spawned = self.spawn(async move {
                let _ = task.fetch().await;
            });
            if !spawned {
                shared.fail_without_runtime();
            }
        }

        QueryObserver {
            shared,
            _subscription: subscription,
        }
    }
}
