use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing::level_filters::LevelFilter;
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
        .with_default_directive(LevelFilter::from(logging.level).into())
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
            "stormo_eviction_announced_total",
            Unit::Count,
            "Total number of eviction requests announced by this instance."
        );
        describe_counter!(
            "stormo_eviction_observed_total",
            Unit::Count,
            "Total number of eviction requests observed and dispatched locally."
        );
        describe_counter!(
            "stormo_eviction_reaped_total",
            Unit::Count,
            "Total number of fully-acknowledged eviction requests deleted."
        );
        describe_histogram!(
            "stormo_eviction_reap_ms",
            Unit::Milliseconds,
            "Eviction reap pass latency in milliseconds."
        );
        describe_counter!(
            "stormo_shared_value_retry_exhausted_total",
            Unit::Count,
            "Total number of shared-value writes abandoned after exhausting CAS retries."
        );
        describe_counter!(
            "stormo_reload_submitted_total",
            Unit::Count,
            "Total number of segment reload jobs submitted."
        );
        describe_counter!(
            "stormo_reload_failed_total",
            Unit::Count,
            "Total number of segment reload jobs that failed."
        );
    });
}
