use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "shopdesk_query_cache_hit_total",
            Unit::Count,
            "Total number of observer fetch decisions served from fresh cache."
        );
        describe_counter!(
            "shopdesk_query_cache_miss_total",
            Unit::Count,
            "Total number of observer fetch decisions that went to the network."
        );
        describe_counter!(
            "shopdesk_query_fetch_error_total",
            Unit::Count,
            "Total number of failed query fetches."
        );
        describe_counter!(
            "shopdesk_query_invalidated_total",
            Unit::Count,
            "Total number of cache entries removed by invalidation."
        );
        describe_counter!(
            "shopdesk_query_expired_total",
            Unit::Count,
            "Total number of cache entries dropped by the expiry sweep."
        );
        describe_counter!(
            "shopdesk_mutation_error_total",
            Unit::Count,
            "Total number of failed mutations."
        );
        describe_histogram!(
            "shopdesk_query_fetch_ms",
            Unit::Milliseconds,
            "Query fetch latency in milliseconds."
        );
    });
}
