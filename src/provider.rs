//! Meter pipeline construction for each export backend.

use std::time::Duration;

use opentelemetry::{global, metrics::MeterProvider as _, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_prometheus_text_exporter::PrometheusExporter;
use opentelemetry_resource_detectors::{OsResourceDetector, ProcessResourceDetector};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    resource::{EnvResourceDetector, SdkProvidedResourceDetector, TelemetryResourceDetector},
    Resource,
};
use opentelemetry_semantic_conventions::resource as res;
use tracing::debug_span;

use crate::{
    config::{PushConfig, ScrapeConfig},
    errors::Error,
    events::EventHandler,
    instruments::HttpInstruments,
    registry::CustomRegistry,
};

/// Instrumentation scope under which all instruments are created.
pub(crate) const SCOPE_NAME: &str = "telemeter";

/// Pipeline state bound exactly once per recorder, either at construction or
/// on start for the push backend.
pub(crate) struct Bound {
    /// The meter provider measurements flow through.
    pub(crate) provider: SdkMeterProvider,
    /// Built-in HTTP instruments.
    pub(crate) instruments: HttpInstruments,
    /// Custom instrument registry.
    pub(crate) registry: CustomRegistry,
    /// Text exposition exporter, present on the scrape backend only.
    pub(crate) exporter: Option<PrometheusExporter>,
}

/// Build the OpenTelemetry resource describing this process.
pub(crate) fn build_resource(service_name: &str, service_version: &str) -> Resource {
    Resource::builder()
        .with_detectors(&[
            Box::new(OsResourceDetector),
            Box::new(ProcessResourceDetector),
            Box::new(SdkProvidedResourceDetector),
            Box::new(EnvResourceDetector::new()),
            Box::new(TelemetryResourceDetector),
        ])
        .with_attributes([
            KeyValue::new(res::SERVICE_NAME, service_name.to_owned()),
            KeyValue::new(res::SERVICE_VERSION, service_version.to_owned()),
        ])
        .build()
}

/// Build the pull pipeline: a text exposition exporter acting as the reader.
pub(crate) fn scrape_provider(
    cfg: &ScrapeConfig,
    resource: Resource,
) -> (SdkMeterProvider, PrometheusExporter) {
    let _span = debug_span!("build_scrape_pipeline").entered();
    let exporter = cfg.build_exporter();
    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(exporter.clone())
        .build();
    (provider, exporter)
}

/// Build the push pipeline: an OTLP exporter behind a periodic reader.
///
/// # Errors
///
/// Returns `Err` if the exporter cannot be constructed.
pub(crate) fn push_provider(
    cfg: &PushConfig,
    resource: Resource,
    interval: Duration,
) -> Result<SdkMeterProvider, Error> {
    let _span = debug_span!("build_push_pipeline").entered();
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(cfg.endpoint.clone())
        .with_timeout(cfg.timeout)
        .with_temporality(cfg.temporality.into())
        .build()?;
    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();
    Ok(SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build())
}

/// Build the debug pipeline: a stdout exporter behind a periodic reader.
pub(crate) fn stdout_provider(resource: Resource, interval: Duration) -> SdkMeterProvider {
    let _span = debug_span!("build_stdout_pipeline").entered();
    let exporter = opentelemetry_stdout::MetricExporter::default();
    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();
    SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build()
}

/// Install `provider` as the process-wide default meter provider.
pub(crate) fn register_global(provider: &SdkMeterProvider) {
    global::set_meter_provider(provider.clone());
}

/// Obtain a meter and create the instrument set and registry on `provider`.
pub(crate) fn bind(
    provider: SdkMeterProvider,
    exporter: Option<PrometheusExporter>,
    duration_buckets: &[f64],
    size_buckets: &[f64],
    cardinality_cap: usize,
    events: EventHandler,
) -> Bound {
    let meter = provider.meter(SCOPE_NAME);
    let instruments = HttpInstruments::new(&meter, duration_buckets, size_buckets);
    let registry = CustomRegistry::new(
        meter,
        instruments.custom_failures.clone(),
        events,
        cardinality_cap,
    );
    Bound {
        provider,
        instruments,
        registry,
        exporter,
    }
}
