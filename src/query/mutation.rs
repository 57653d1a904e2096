//! Mutation execution with lifecycle callbacks.
//!
//! A [`Mutation`] wraps a write operation. Every call to
//! [`Mutation::mutate`] runs the function exactly once; there is no retry and
//! no sharing between invocations.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::counter;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::{BoxError, MutationError};
use super::lock::mutex_lock;

const SOURCE: &str = "query::mutation";
const METRIC_MUTATION_ERROR: &str = "shopdesk_mutation_error_total";

type MutationFn<Vars, D> =
    Arc<dyn Fn(Vars) -> BoxFuture<'static, Result<D, BoxError>> + Send + Sync>;
type SuccessCallback<Vars, D> = Arc<dyn Fn(&D, &Vars) + Send + Sync>;
type ErrorCallback<Vars> = Arc<dyn Fn(&MutationError, &Vars) + Send + Sync>;
type SettledCallback<Vars, D> =
    Arc<dyn Fn(Option<&D>, Option<&MutationError>, &Vars) + Send + Sync>;

/// State of the most recent invocation.
#[derive(Debug)]
pub struct MutationState<D> {
    /// Value returned by the last successful invocation.
    pub data: Option<Arc<D>>,
    /// An invocation is running.
    pub is_pending: bool,
    /// The last invocation failed.
    pub is_error: bool,
    /// The last invocation succeeded.
    pub is_success: bool,
    /// Cause of the last failure.
    pub error: Option<MutationError>,
}

impl<D> Default for MutationState<D> {
    fn default() -> Self {
        Self {
            data: None,
            is_pending: false,
            is_error: false,
            is_success: false,
            error: None,
        }
    }
}

impl<D> Clone for MutationState<D> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            is_pending: self.is_pending,
            is_error: self.is_error,
            is_success: self.is_success,
            error: self.error.clone(),
        }
    }
}

impl<D> MutationState<D> {
    fn pending() -> Self {
        Self {
            is_pending: true,
            ..Self::default()
        }
    }

    fn succeeded(data: Arc<D>) -> Self {
        Self {
            data: Some(data),
            is_success: true,
            ..Self::default()
        }
    }

    fn failed(error: MutationError) -> Self {
        Self {
            is_error: true,
            error: Some(error),
            ..Self::default()
        }
    }

    /// True before the first invocation and after [`Mutation::reset`].
    pub fn is_idle(&self) -> bool {
        !self.is_pending && !self.is_error && !self.is_success
    }
}

/// A write operation plus its callbacks.
///
/// # Usage
///
/// ```ignore
/// let client = client.clone();
/// let delete = Mutation::new(move |id: u64| api.delete_product(id))
///     .on_success(move |_, _| {
///         client.invalidate_queries(&query_key!["products"]);
///     });
/// delete.mutate(42).await?;
/// ```
pub struct Mutation<Vars, D> {
    mutation_fn: MutationFn<Vars, D>,
    on_success: Option<SuccessCallback<Vars, D>>,
    on_error: Option<ErrorCallback<Vars>>,
    on_settled: Option<SettledCallback<Vars, D>>,
    state: watch::Sender<MutationState<D>>,
    latest: Mutex<Option<Uuid>>,
}

impl<Vars, D> Mutation<Vars, D>
where
    Vars: Clone + Send + 'static,
    D: Send + Sync + 'static,
{
    /// Wrap `mutation_fn`.
    pub fn new<F, Fut>(mutation_fn: F) -> Self
    where
        F: Fn(Vars) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<D, BoxError>> + Send + 'static,
    {
        let (state, _) = watch::channel(MutationState::default());
        Self {
            mutation_fn: Arc::new(move |vars| mutation_fn(vars).boxed()),
            on_success: None,
            on_error: None,
            on_settled: None,
            state,
            latest: Mutex::new(None),
        }
    }

    /// Called with the result and the variables after a successful run.
    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&D, &Vars) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    /// Called with the error and the variables after a failed run.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MutationError, &Vars) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Called after every run, following `on_success` or `on_error`.
    pub fn on_settled<F>(mut self, callback: F) -> Self
    where
        F: Fn(Option<&D>, Option<&MutationError>, &Vars) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(callback));
        self
    }

    /// Snapshot of the most recent invocation's state.
    pub fn state(&self) -> MutationState<D> {
        self.state.borrow().clone()
    }

    /// Receiver that wakes on every state change.
    pub fn watch(&self) -> watch::Receiver<MutationState<D>> {
        self.state.subscribe()
    }

    /// Run the mutation once with `variables`.
    ///
    /// The state is updated before callbacks run. On failure the error is
    /// returned after `on_error` and `on_settled` have been invoked.
    pub async fn mutate(&self, variables: Vars) -> Result<Arc<D>, MutationError> {
        let invocation = Uuid::new_v4();
        *mutex_lock(&self.latest, SOURCE, "mutate") = Some(invocation);
        self.publish(invocation, MutationState::pending());
        debug!(mutation_id = %invocation, "Mutation started");

        match (self.mutation_fn)(variables.clone()).await {
            Ok(data) => {
                let data = Arc::new(data);
                self.publish(invocation, MutationState::succeeded(Arc::clone(&data)));
                debug!(mutation_id = %invocation, outcome = "success", "Mutation settled");

                if let Some(callback) = &self.on_success {
                    callback(&data, &variables);
                }
                if let Some(callback) = &self.on_settled {
                    callback(Some(&data), None, &variables);
                }
                Ok(data)
            }
            Err(source) => {
                let error = MutationError::new(source);
                self.publish(invocation, MutationState::failed(error.clone()));
                warn!(mutation_id = %invocation, error = %error, "Mutation failed");
                counter!(METRIC_MUTATION_ERROR).increment(1);

                if let Some(callback) = &self.on_error {
                    callback(&error, &variables);
                }
                if let Some(callback) = &self.on_settled {
                    callback(None, Some(&error), &variables);
                }
                Err(error)
            }
        }
    }

    /// Return the state to its initial shape.
    ///
    /// Invocations still in flight keep running but no longer update the state.
    pub fn reset(&self) {
        let mut latest = mutex_lock(&self.latest, SOURCE, "reset");
        *latest = None;
        self.state.send_replace(MutationState::default());
    }

    /// Replace the state if `invocation` is still the most recent one.
    fn publish(&self, invocation: Uuid, next: MutationState<D>) {
        let latest = mutex_lock(&self.latest, SOURCE, "publish");
        if *latest == Some(invocation) {
            self.state.send_replace(next);
        }
    }
}
