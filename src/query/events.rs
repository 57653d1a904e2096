//! Subscriber notifications.
//!
//! Defines what a subscriber receives when the entry for its key changes and
//! how subscriptions are identified.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one registered subscriber.
///
/// Ids are unique for the lifetime of a client and never reused.
pub type SubscriberId = u64;

/// Callback invoked for every notification published on a key.
pub type Listener<V> = Arc<dyn Fn(&QueryNotification<V>) + Send + Sync>;

/// What changed for a key.
#[derive(Debug)]
pub enum QueryNotification<V> {
    /// A fetch landed or the value was written directly.
    Updated(Arc<V>),
    /// The entry was invalidated; observers should run their fetch decision again.
    Invalidated,
}

impl<V> Clone for QueryNotification<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Updated(value) => Self::Updated(Arc::clone(value)),
            Self::Invalidated => Self::Invalidated,
        }
    }
}

impl<V> QueryNotification<V> {
    /// The new value, or `None` for an invalidation.
    pub fn value(&self) -> Option<&Arc<V>> {
        match self {
            Self::Updated(value) => Some(value),
            Self::Invalidated => None,
        }
    }
}

/// Monotonic subscriber id source.
#[derive(Debug, Default)]
pub(crate) struct SubscriberIds {
    counter: AtomicU64,
}

impl SubscriberIds {
    pub(crate) fn next(&self) -> SubscriberId {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }
}
