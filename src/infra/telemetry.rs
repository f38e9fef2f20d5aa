use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
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
            "sitecache_admission_admit_total",
            Unit::Count,
            "Requests admitted to the page cache."
        );
        describe_counter!(
            "sitecache_admission_reject_total",
            Unit::Count,
            "Requests refused by admission, labelled by reason."
        );
        describe_counter!(
            "sitecache_page_hit_total",
            Unit::Count,
            "Page cache lookups served from the store."
        );
        describe_counter!(
            "sitecache_page_miss_total",
            Unit::Count,
            "Page cache lookups that found no fresh entry."
        );
        describe_counter!(
            "sitecache_page_store_total",
            Unit::Count,
            "Responses written to the page store."
        );
        describe_gauge!(
            "sitecache_event_queue_len",
            Unit::Count,
            "Current number of pending invalidation events."
        );
        describe_counter!(
            "sitecache_event_dropped_total",
            Unit::Count,
            "Invalidation events dropped due to queue overflow."
        );
        describe_histogram!(
            "sitecache_consume_ms",
            Unit::Milliseconds,
            "Invalidation consumption latency in milliseconds."
        );
        describe_counter!(
            "sitecache_object_hit_total",
            Unit::Count,
            "Object cache lookups that found a value."
        );
        describe_counter!(
            "sitecache_object_miss_total",
            Unit::Count,
            "Object cache lookups that found nothing."
        );
        describe_counter!(
            "sitecache_object_backend_error_total",
            Unit::Count,
            "Object cache backend calls that failed, labelled by backend and operation."
        );
    });
}
