use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_ERROR, METRIC_FILTER_REJECTED, METRIC_GOVERNOR_EVICTED, METRIC_GOVERNOR_RUN_MS,
    METRIC_HIT, METRIC_INVALIDATED, METRIC_LOCK_ACQUIRED, METRIC_LOCK_CONTENDED,
    METRIC_LOCK_WAIT_MS, METRIC_MISS, METRIC_REFRESH, METRIC_STORE,
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

/// Register units and help text for every metric the cache emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_HIT,
            Unit::Count,
            "Cache lookups answered from the store."
        );
        describe_counter!(
            METRIC_MISS,
            Unit::Count,
            "Cache lookups that found nothing usable."
        );
        describe_counter!(METRIC_STORE, Unit::Count, "Values written to the cache.");
        describe_counter!(
            METRIC_ERROR,
            Unit::Count,
            "Store or serialization failures swallowed by the cache."
        );
        describe_counter!(
            METRIC_INVALIDATED,
            Unit::Count,
            "Keys deleted by invalidation, including dependents and groups."
        );
        describe_counter!(
            METRIC_LOCK_ACQUIRED,
            Unit::Count,
            "Distributed locks acquired."
        );
        describe_counter!(
            METRIC_LOCK_CONTENDED,
            Unit::Count,
            "Lock acquisitions that gave up after their timeout."
        );
        describe_histogram!(
            METRIC_LOCK_WAIT_MS,
            Unit::Milliseconds,
            "Time spent polling for a distributed lock."
        );
        describe_counter!(
            METRIC_FILTER_REJECTED,
            Unit::Count,
            "Lookups short-circuited by the membership filter."
        );
        describe_counter!(
            METRIC_REFRESH,
            Unit::Count,
            "Background refreshes started before expiry."
        );
        describe_counter!(
            METRIC_GOVERNOR_EVICTED,
            Unit::Count,
            "Image keys evicted by the memory governor."
        );
        describe_histogram!(
            METRIC_GOVERNOR_RUN_MS,
            Unit::Milliseconds,
            "Duration of one memory governor pass."
        );
    });
}
