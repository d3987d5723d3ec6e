//! OTLP export of forkpool spans and pool counters.
//!
//! Compiled only with the `metrics` feature. Spans from the operation tracer
//! and the daemon's client counters share one endpoint and one
//! instrumentation scope.

use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::{SdkTracerProvider, Tracer};

/// Instrumentation scope of every forkpool tracer and meter.
pub const SCOPE: &str = "forkpool";

#[derive(Debug, thiserror::Error)]
pub enum OtlpError {
    #[error("cannot build OTLP exporter: {0}")]
    Exporter(#[from] opentelemetry_otlp::ExporterBuildError),

    #[error("OTLP pipeline shutdown failed: {0}")]
    Shutdown(#[from] opentelemetry_sdk::error::OTelSdkError),
}

/// Installed span and metric providers.
///
/// Hold it for as long as telemetry should flow. Dropping it does not flush;
/// [`OtlpPipeline::shutdown`] does.
pub struct OtlpPipeline {
    spans: SdkTracerProvider,
    meters: SdkMeterProvider,
}

impl OtlpPipeline {
    /// Tracer for the `tracing-opentelemetry` layer.
    pub fn tracer(&self) -> Tracer {
        self.spans.tracer(SCOPE)
    }

    /// Flush and stop both providers. Both are shut down even when the
    /// first one fails; the first failure is returned.
    pub fn shutdown(self) -> Result<(), OtlpError> {
        let spans = self.spans.shutdown();
        let meters = self.meters.shutdown();
        spans?;
        meters?;
        Ok(())
    }
}

/// Export spans and metrics over gRPC to `endpoint` and install both
/// providers globally.
pub fn init_otlp(endpoint: &str) -> Result<OtlpPipeline, OtlpError> {
    let spans = span_provider(endpoint)?;
    let meters = meter_provider(endpoint)?;
    global::set_tracer_provider(spans.clone());
    global::set_meter_provider(meters.clone());
    Ok(OtlpPipeline { spans, meters })
}

fn span_provider(endpoint: &str) -> Result<SdkTracerProvider, OtlpError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .build())
}

fn meter_provider(endpoint: &str) -> Result<SdkMeterProvider, OtlpError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .build())
}
