//! Client-side query cache.
//!
//! Reads are cached per [`QueryKey`] and shared by every [`QueryObserver`]
//! attached to the same key. Writes go through [`Mutation`] and typically end
//! with an [`QueryClient::invalidate_queries`] call so affected screens refetch.
//!
//! ## Lifecycle
//!
//! - An entry is written when a fetch succeeds or `set_query_data` is called.
//! - An observer serves the entry without fetching while it is younger than
//!   `stale_time`.
//! - A sweep scheduled `cache_time` after a fetch drops the entry unless a
//!   newer write replaced it.
//! - Invalidation removes matching entries and tells their observers to run
//!   the fetch decision again.
//!
//! ```toml
//! [query]
//! stale_time_ms = 0
//! cache_time_ms = 300000
//! ```

mod client;
mod config;
mod error;
mod events;
mod keys;
mod lock;
mod mutation;
mod observer;
mod store;

pub use client::{QueryClient, Subscription};
pub use config::{DEFAULT_CACHE_TIME_MS, DEFAULT_STALE_TIME_MS, QueryClientConfig, QueryOptions};
pub use error::{BoxError, MutationError, QueryError};
pub use events::{Listener, QueryNotification, SubscriberId};
pub use keys::{KeySegment, QueryKey};
pub use mutation::{Mutation, MutationState};
pub use observer::{QueryFn, QueryObserver, QueryState};
pub use store::CacheEntry;
