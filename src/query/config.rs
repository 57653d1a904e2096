//! Query configuration.
//!
//! Per-observer options plus the client-wide defaults they inherit from.

use std::time::Duration;

use serde::Deserialize;

// Default values for query configuration
pub const DEFAULT_STALE_TIME_MS: u64 = 0;
pub const DEFAULT_CACHE_TIME_MS: u64 = 5 * 60 * 1000;

/// Client-wide query defaults, read from the `[query]` section of `shopdesk.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueryClientConfig {
    /// How long a fetched value counts as fresh, in milliseconds.
    pub stale_time_ms: u64,
    /// How long a fetched value survives before the expiry sweep drops it, in milliseconds.
    pub cache_time_ms: u64,
}

impl Default for QueryClientConfig {
    fn default() -> Self {
        Self {
            stale_time_ms: DEFAULT_STALE_TIME_MS,
            cache_time_ms: DEFAULT_CACHE_TIME_MS,
        }
    }
}

impl QueryClientConfig {
    /// Observer options seeded from these defaults.
    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            enabled: true,
            stale_time: Duration::from_millis(self.stale_time_ms),
            cache_time: Duration::from_millis(self.cache_time_ms),
        }
    }
}

/// Options for a single observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// When false the observer never fetches and only mirrors the cache.
    pub enabled: bool,
    /// A cached value younger than this is served without fetching.
    pub stale_time: Duration,
    /// Delay after a successful fetch before the entry is swept.
    pub cache_time: Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryClientConfig::default().query_options()
    }
}

impl QueryOptions {
    /// Enable or disable fetching.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the staleness window.
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    /// Set the expiry delay.
    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }
}
