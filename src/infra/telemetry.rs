use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::{
    application::render::{
        METRIC_ENGINE_CONTEXT_DISCARDED_TOTAL, METRIC_ENGINE_POOL_SIZE,
        METRIC_ENGINE_POOL_TIMEOUT_TOTAL, METRIC_RENDER_FALLBACK_TOTAL, METRIC_RENDER_MS,
        METRIC_RENDER_TOTAL,
    },
    config::{LogFormat, LoggingSettings},
};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Describe the render metrics and install the global tracing subscriber.
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
            METRIC_RENDER_TOTAL,
            Unit::Count,
            "Render attempts by outcome (ok, timeout, pool_exhausted, engine_fault)."
        );
        describe_histogram!(
            METRIC_RENDER_MS,
            Unit::Milliseconds,
            "Render latency in milliseconds, including failed attempts."
        );
        describe_counter!(
            METRIC_RENDER_FALLBACK_TOTAL,
            Unit::Count,
            "Pages served as the client-side fallback."
        );
        describe_gauge!(
            METRIC_ENGINE_POOL_SIZE,
            Unit::Count,
            "Execution contexts currently in existence."
        );
        describe_counter!(
            METRIC_ENGINE_POOL_TIMEOUT_TOTAL,
            Unit::Count,
            "Checkouts that gave up waiting for an execution context."
        );
        describe_counter!(
            METRIC_ENGINE_CONTEXT_DISCARDED_TOTAL,
            Unit::Count,
            "Execution contexts discarded instead of returned to the pool."
        );
    });
}
