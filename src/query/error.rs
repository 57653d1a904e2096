//! Errors surfaced by fetchers and mutation functions.

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

use super::keys::QueryKey;

/// Error type returned by fetchers and mutation functions.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Failure observed by a query observer.
///
/// Cloneable so it can live inside [`QueryState`](super::QueryState) snapshots.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("fetch for {key} failed: {source}")]
    Fetch {
        key: QueryKey,
        #[source]
        source: Arc<dyn StdError + Send + Sync + 'static>,
    },
    #[error("query {key} is disabled")]
    Disabled { key: QueryKey },
    #[error("no tokio runtime available to fetch {key}")]
    NoRuntime { key: QueryKey },
}

impl QueryError {
    pub(crate) fn fetch(key: QueryKey, source: BoxError) -> Self {
        Self::Fetch {
            key,
            source: Arc::from(source),
        }
    }
}

/// Failure of a single mutation invocation.
#[derive(Debug, Clone, Error)]
#[error("mutation failed: {source}")]
pub struct MutationError {
    #[source]
    source: Arc<dyn StdError + Send + Sync + 'static>,
}

impl MutationError {
    pub(crate) fn new(source: BoxError) -> Self {
        Self {
            source: Arc::from(source),
        }
    }

    /// The error returned by the mutation function.
    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.source.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_keeps_source_chain() {
        let error = QueryError::fetch(QueryKey::from("orders"), "connection reset".into());
        assert_eq!(
            error.to_string(),
            r#"fetch for ["orders"] failed: connection reset"#
        );
        let source = error.source().expect("source attached");
        assert_eq!(source.to_string(), "connection reset");
    }

    #[test]
    fn mutation_error_exposes_inner() {
        let error = MutationError::new("422 unprocessable".into());
        assert_eq!(error.inner().to_string(), "422 unprocessable");
        assert_eq!(error.to_string(), "mutation failed: 422 unprocessable");
    }
}
