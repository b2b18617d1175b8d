//! Recorder configuration and construction options.

use std::{fmt, time::Duration};

use opentelemetry_prometheus_text_exporter::PrometheusExporter;
use opentelemetry_sdk::metrics::{SdkMeterProvider, Temporality};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{errors::Error, events::EventHandler, instruments, recorder::Recorder};

/// Default cap on the number of distinct custom instruments.
pub(crate) const DEFAULT_CARDINALITY_CAP: usize = 1000;

/// Which export backend a recorder is bound to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BackendKind {
    /// Pull-based Prometheus text endpoint.
    Scrape,
    /// Push-based OTLP collector.
    Push,
    /// Periodic stdout debug writer.
    Stdout,
    /// Caller-supplied meter provider.
    External,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Scrape => "scrape",
            Self::Push => "push",
            Self::Stdout => "stdout",
            Self::External => "external",
        };
        f.write_str(name)
    }
}

/// Export backend selection.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Expose collected metrics for scraping in Prometheus text format.
    #[serde(alias = "prometheus")]
    Scrape(ScrapeConfig),
    /// Push metrics to a remote OTLP collector.
    #[serde(alias = "otlp")]
    Push(PushConfig),
    /// Dump collected metrics periodically to standard output.
    Stdout(StdoutConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Scrape(ScrapeConfig::default())
    }
}

/// Configuration for the Prometheus scrape backend.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct ScrapeConfig {
    /// Listen port for the scrape server, in `:N` form.
    #[serde(default = "ScrapeConfig::default_port")]
    pub(crate) port: String,
    /// URL path of the exposition endpoint.
    #[serde(default = "ScrapeConfig::default_path")]
    pub(crate) path: String,
    /// Use automatic unit suffixes (e.g. `_seconds`, `_bytes`).
    #[serde(default = "default_true")]
    pub(crate) with_units: bool,
    /// Use `_total` suffix on counter metrics.
    #[serde(default = "default_true")]
    pub(crate) with_counter_suffixes: bool,
    /// Generate `target_info` metric from resource attributes.
    #[serde(default = "default_true")]
    pub(crate) with_target_info: bool,
    /// Generate `otel_scope_info` metric with instrumentation scope labels.
    #[serde(default = "default_true")]
    pub(crate) with_scope_info: bool,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            port: Self::default_port(),
            path: Self::default_path(),
            with_units: true,
            with_counter_suffixes: true,
            with_target_info: true,
            with_scope_info: true,
        }
    }
}

impl ScrapeConfig {
    /// Default value for [`Self::port`].
    #[must_use]
    #[inline]
    fn default_port() -> String {
        String::from(":9090")
    }

    /// Default value for [`Self::path`].
    #[must_use]
    #[inline]
    fn default_path() -> String {
        String::from("/metrics")
    }

    /// Create a scrape configuration for `port` and `path`.
    ///
    /// The port is normalized to `:N` form and the path to a leading slash.
    #[must_use]
    pub fn new(port: impl AsRef<str>, path: impl AsRef<str>) -> Self {
        Self {
            port: normalize_port(port.as_ref()),
            path: normalize_path(path.as_ref()),
            ..Self::default()
        }
    }

    /// Re-apply normalization, e.g. after deserialization.
    pub(crate) fn normalized(mut self) -> Self {
        self.port = normalize_port(&self.port);
        self.path = normalize_path(&self.path);
        self
    }

    /// Build the text exposition exporter.
    #[must_use]
    pub(crate) fn build_exporter(&self) -> PrometheusExporter {
        let mut builder = PrometheusExporter::builder();
        if !self.with_units {
            builder = builder.without_units();
        }
        if !self.with_counter_suffixes {
            builder = builder.without_counter_suffixes();
        }
        if !self.with_target_info {
            builder = builder.without_target_info();
        }
        if !self.with_scope_info {
            builder = builder.without_scope_info();
        }
        builder.build()
    }
}

/// Configuration for the OTLP push backend.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PushConfig {
    /// Collector endpoint.
    ///
    /// `http://` selects a plaintext transport, `https://` TLS; a bare
    /// `host:port` implies TLS. A trailing URL path is stripped before use.
    pub(crate) endpoint: String,
    /// Timeout for an outbound exporter request.
    #[serde(default = "PushConfig::default_timeout", with = "humantime_serde")]
    pub(crate) timeout: Duration,
    /// Default temporality for collected metrics.
    #[serde(default)]
    pub(crate) temporality: PushTemporality,
}

impl PushConfig {
    /// Default value for [`Self::timeout`].
    #[must_use]
    #[inline]
    fn default_timeout() -> Duration {
        opentelemetry_otlp::OTEL_EXPORTER_OTLP_TIMEOUT_DEFAULT
    }

    /// Create a push configuration for `endpoint`.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Self::default_timeout(),
            temporality: PushTemporality::default(),
        }
    }

    /// Set the timeout for outbound exporter requests.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the aggregation temporality.
    #[must_use]
    pub fn with_temporality(mut self, temporality: PushTemporality) -> Self {
        self.temporality = temporality;
        self
    }

    /// Validate and normalize the endpoint.
    pub(crate) fn normalized(mut self) -> Result<Self, Error> {
        self.endpoint = normalize_push_endpoint(&self.endpoint)?;
        Ok(self)
    }
}

/// Configuration for the stdout debug backend.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct StdoutConfig {}

impl StdoutConfig {
    /// Create a stdout configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Defines the window that an aggregation was calculated over.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum PushTemporality {
    /// A measurement interval that continues to expand forward in time from a
    /// starting point.
    #[default]
    Cumulative,
    /// A measurement interval that resets each export cycle.
    Delta,
    /// Delta temporality for synchronous counters and histograms, letting
    /// them shed memory after a cardinality explosion.
    LowMemory,
}

impl From<PushTemporality> for Temporality {
    fn from(value: PushTemporality) -> Self {
        match value {
            PushTemporality::Cumulative => Self::Cumulative,
            PushTemporality::Delta => Self::Delta,
            PushTemporality::LowMemory => Self::LowMemory,
        }
    }
}

/// Builder for [`Recorder`].
///
/// All options have working defaults; an unconfigured builder produces an
/// enabled recorder with a scrape backend on `:9090` at `/metrics`.
#[must_use]
pub struct RecorderBuilder {
    pub(crate) service_name: String,
    pub(crate) service_version: String,
    pub(crate) enabled: bool,
    pub(crate) backends: Vec<BackendConfig>,
    pub(crate) external: Option<SdkMeterProvider>,
    pub(crate) register_global: bool,
    pub(crate) duration_buckets: Vec<f64>,
    pub(crate) size_buckets: Vec<f64>,
    pub(crate) export_interval: Duration,
    pub(crate) cardinality_cap: usize,
    pub(crate) strict_port: bool,
    pub(crate) serve_metrics: bool,
    pub(crate) events: Option<EventHandler>,
}

impl Default for RecorderBuilder {
    fn default() -> Self {
        Self {
            service_name: String::from("metrics-service"),
            service_version: String::from("0.0.0"),
            enabled: true,
            backends: Vec::new(),
            external: None,
            register_global: false,
            duration_buckets: instruments::default_duration_buckets(),
            size_buckets: instruments::default_size_buckets(),
            export_interval: Duration::from_secs(60),
            cardinality_cap: DEFAULT_CARDINALITY_CAP,
            strict_port: false,
            serve_metrics: true,
            events: None,
        }
    }
}

impl RecorderBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `service.name` resource attribute.
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Set the `service.version` resource attribute.
    pub fn with_service_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = version.into();
        self
    }

    /// Enable or disable the recorder.
    ///
    /// A disabled recorder accepts every call and records nothing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Select the export backend.
    ///
    /// Selecting more than one backend is a configuration error reported by
    /// [`Self::build`].
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backends.push(backend);
        self
    }

    /// Use a caller-supplied meter provider instead of building one.
    ///
    /// The recorder never shuts a supplied provider down.
    pub fn with_meter_provider(mut self, provider: SdkMeterProvider) -> Self {
        self.external = Some(provider);
        self
    }

    /// Install the pipeline as the process-wide default meter provider.
    pub fn with_global_registration(mut self) -> Self {
        self.register_global = true;
        self
    }

    /// Set histogram buckets for request durations, in seconds.
    pub fn with_duration_buckets<B, I>(mut self, buckets: B) -> Self
    where
        B: IntoIterator<Item = I>,
        I: Into<f64>,
    {
        self.duration_buckets = buckets.into_iter().map(Into::into).collect();
        self
    }

    /// Set histogram buckets for request and response sizes, in bytes.
    pub fn with_size_buckets<B, I>(mut self, buckets: B) -> Self
    where
        B: IntoIterator<Item = I>,
        I: Into<f64>,
    {
        self.size_buckets = buckets.into_iter().map(Into::into).collect();
        self
    }

    /// Set the export period for the push and stdout backends.
    ///
    /// Intervals below one second emit a warning event at build time.
    pub fn with_export_interval(mut self, interval: Duration) -> Self {
        self.export_interval = interval;
        self
    }

    /// Set the cap on distinct custom instruments. Must be at least 1.
    pub fn with_cardinality_cap(mut self, cap: usize) -> Self {
        self.cardinality_cap = cap;
        self
    }

    /// Scrape backend: fail on a busy port instead of probing for a free one.
    pub fn with_strict_port(mut self) -> Self {
        self.strict_port = true;
        self
    }

    /// Scrape backend: build the exposition handler but never listen.
    pub fn with_server_disabled(mut self) -> Self {
        self.serve_metrics = false;
        self
    }

    /// Replace the default operational event sink.
    pub fn with_event_handler(mut self, handler: EventHandler) -> Self {
        self.events = Some(handler);
        self
    }

    /// Validate the configuration and construct the recorder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for inconsistent options and
    /// [`Error::BackendInit`] if the pipeline cannot be constructed.
    pub fn build(self) -> Result<Recorder, Error> {
        Recorder::from_builder(self)
    }

    /// Check option consistency without building anything.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.service_name.trim().is_empty() {
            return Err(invalid("service name is empty"));
        }
        if self.service_version.trim().is_empty() {
            return Err(invalid("service version is empty"));
        }
        if self.cardinality_cap == 0 {
            return Err(invalid("cardinality cap must be at least 1"));
        }
        let selected = self.backends.len() + usize::from(self.external.is_some());
        if selected > 1 {
            return Err(invalid("more than one export backend selected"));
        }
        match self.backends.first() {
            Some(BackendConfig::Scrape(cfg)) => {
                if cfg.port.trim().is_empty() {
                    return Err(invalid("scrape port is empty"));
                }
                if cfg.path.trim().is_empty() {
                    return Err(invalid("scrape path is empty"));
                }
                parse_port(&normalize_port(&cfg.port))?;
            }
            Some(BackendConfig::Push(cfg)) => {
                normalize_push_endpoint(&cfg.endpoint)?;
            }
            Some(BackendConfig::Stdout(_)) | None => {}
        }
        Ok(())
    }
}

/// Shorthand for an [`Error::InvalidConfig`].
fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidConfig {
        reason: reason.into(),
    }
}

/// Helper function used for default boolean values in [`serde`].
#[must_use]
#[inline]
fn default_true() -> bool {
    true
}

/// Normalize a port specification to `:N` form. Empty input stays empty so
/// validation can report it.
pub(crate) fn normalize_port(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    match trimmed.strip_prefix(':') {
        Some(rest) => format!(":{rest}"),
        None => format!(":{trimmed}"),
    }
}

/// Normalize a URL path to have a leading slash. Empty input stays empty.
pub(crate) fn normalize_path(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    match trimmed.strip_prefix('/') {
        Some(_) => trimmed.to_owned(),
        None => format!("/{trimmed}"),
    }
}

/// Parse a normalized `:N` port specification.
pub(crate) fn parse_port(spec: &str) -> Result<u16, Error> {
    spec.trim_start_matches(':')
        .parse()
        .map_err(|err| invalid(format!("invalid scrape port {spec:?}: {err}")))
}

/// Normalize a push endpoint to `scheme://host[:port]`.
///
/// `http://` and `https://` prefixes are kept; anything else is treated as a
/// `host:port` with TLS. A trailing URL path is stripped.
pub(crate) fn normalize_push_endpoint(raw: &str) -> Result<String, Error> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid("push endpoint is empty"));
    }
    let prefixed;
    let candidate = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed
    } else {
        prefixed = format!("https://{trimmed}");
        &prefixed
    };
    let url = Url::parse(candidate)
        .map_err(|err| invalid(format!("invalid push endpoint {raw:?}: {err}")))?;
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| invalid(format!("push endpoint {raw:?} has no host")))?;
    let endpoint = match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    };
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_normalization() {
        assert_eq!(normalize_port("9090"), ":9090");
        assert_eq!(normalize_port(":9090"), ":9090");
        assert_eq!(normalize_port("  19091 "), ":19091");
        assert_eq!(normalize_port(""), "");
    }

    #[test]
    fn path_normalization() {
        assert_eq!(normalize_path("metrics"), "/metrics");
        assert_eq!(normalize_path("/metrics"), "/metrics");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn endpoint_keeps_explicit_scheme() {
        assert_eq!(
            normalize_push_endpoint("http://collector:4317/v1/metrics").unwrap(),
            "http://collector:4317"
        );
        assert_eq!(
            normalize_push_endpoint("https://collector.example.com/path").unwrap(),
            "https://collector.example.com"
        );
    }

    #[test]
    fn bare_endpoint_implies_tls() {
        assert_eq!(
            normalize_push_endpoint("collector:4317").unwrap(),
            "https://collector:4317"
        );
    }

    #[test]
    fn empty_endpoint_is_rejected() {
        assert!(matches!(
            normalize_push_endpoint("   "),
            Err(Error::InvalidConfig { .. })
        ));
        assert!(matches!(
            normalize_push_endpoint("http://"),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn backend_config_deserializes_with_aliases() {
        let cfg: BackendConfig =
            serde_json::from_str(r#"{"type": "prometheus", "port": ":9464"}"#).unwrap();
        match cfg {
            BackendConfig::Scrape(scrape) => {
                assert_eq!(scrape.port, ":9464");
                assert_eq!(scrape.path, "/metrics");
                assert!(scrape.with_target_info);
            }
            other => panic!("unexpected backend: {other:?}"),
        }

        let cfg: BackendConfig = serde_json::from_str(
            r#"{"type": "otlp", "endpoint": "http://collector:4317", "timeout": "5s"}"#,
        )
        .unwrap();
        match cfg {
            BackendConfig::Push(push) => {
                assert_eq!(push.endpoint, "http://collector:4317");
                assert_eq!(push.timeout, Duration::from_secs(5));
                assert_eq!(push.temporality, PushTemporality::Cumulative);
            }
            other => panic!("unexpected backend: {other:?}"),
        }
    }

    #[test]
    fn validation_rejects_conflicting_backends() {
        let builder = RecorderBuilder::new()
            .with_backend(BackendConfig::Stdout(StdoutConfig::new()))
            .with_backend(BackendConfig::Scrape(ScrapeConfig::default()));
        assert!(matches!(
            builder.validate(),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn validation_rejects_backend_plus_external() {
        let provider = SdkMeterProvider::builder().build();
        let builder = RecorderBuilder::new()
            .with_backend(BackendConfig::Stdout(StdoutConfig::new()))
            .with_meter_provider(provider);
        assert!(matches!(
            builder.validate(),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn validation_rejects_empty_identity() {
        assert!(RecorderBuilder::new()
            .with_service_name("")
            .validate()
            .is_err());
        assert!(RecorderBuilder::new()
            .with_service_version(" ")
            .validate()
            .is_err());
        assert!(RecorderBuilder::new()
            .with_cardinality_cap(0)
            .validate()
            .is_err());
    }

    #[test]
    fn validation_rejects_bad_scrape_settings() {
        let builder = RecorderBuilder::new()
            .with_backend(BackendConfig::Scrape(ScrapeConfig::new("", "/metrics")));
        assert!(builder.validate().is_err());

        let builder = RecorderBuilder::new()
            .with_backend(BackendConfig::Scrape(ScrapeConfig::new(":9090", "")));
        assert!(builder.validate().is_err());

        let builder = RecorderBuilder::new()
            .with_backend(BackendConfig::Scrape(ScrapeConfig::new(":not-a-port", "/metrics")));
        assert!(builder.validate().is_err());
    }

    #[test]
    fn defaults_are_valid() {
        assert!(RecorderBuilder::new().validate().is_ok());
    }
}
