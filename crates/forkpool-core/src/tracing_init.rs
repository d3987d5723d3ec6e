//! Shared tracing/logging initialization.
//!
//! Both forkpool binaries use the same pattern for setting up
//! `tracing_subscriber` with an env-filter and optional JSON output.
//! Log output goes to stderr so the worker's stdout stays a clean protocol
//! channel.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn env_filter(default_filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    )
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"forkpool_daemon=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = env_filter(default_filter);
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Guard returned by [`init_tracing_with_metrics`].
#[cfg(feature = "metrics")]
pub type TelemetryGuard = Option<crate::metrics::OtlpPipeline>;

/// Guard returned by [`init_tracing_with_metrics`].
#[cfg(not(feature = "metrics"))]
pub type TelemetryGuard = ();

/// Initialise tracing and, when an endpoint is given, the OTLP pipeline.
///
/// Falls back to plain tracing (with a warning) when the exporter cannot be
/// built, so a missing collector never prevents startup.
#[cfg(feature = "metrics")]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    metrics_endpoint: Option<&str>,
) -> TelemetryGuard {
    let Some(endpoint) = metrics_endpoint else {
        init_tracing(default_filter, log_json);
        return None;
    };

    match crate::metrics::init_otlp(endpoint) {
        Ok(guard) => {
            let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if log_json {
                tracing_subscriber::registry()
                    .with(env_filter(default_filter))
                    .with(fmt_layer.json())
                    .with(tracing_opentelemetry::layer().with_tracer(guard.tracer()))
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(env_filter(default_filter))
                    .with(fmt_layer)
                    .with(tracing_opentelemetry::layer().with_tracer(guard.tracer()))
                    .init();
            }
            Some(guard)
        }
        Err(e) => {
            init_tracing(default_filter, log_json);
            tracing::warn!(error = %e, endpoint, "OTLP pipeline unavailable, metrics disabled");
            None
        }
    }
}

/// Initialise tracing; the endpoint is ignored without the `metrics` feature.
#[cfg(not(feature = "metrics"))]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    _metrics_endpoint: Option<&str>,
) -> TelemetryGuard {
    init_tracing(default_filter, log_json);
}
