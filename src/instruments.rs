//! Built-in HTTP instruments owned by the recorder.

use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};

/// Default histogram buckets for request durations.
///
/// Measured in seconds.
#[must_use]
#[inline]
pub(crate) fn default_duration_buckets() -> Vec<f64> {
    [0.005_f64, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0].into()
}

/// Default histogram buckets for request and response sizes.
///
/// Measured in bytes.
#[must_use]
#[inline]
pub(crate) fn default_size_buckets() -> Vec<f64> {
    [100.0_f64, 1_000.0, 10_000.0, 100_000.0, 1_000_000.0, 10_000_000.0].into()
}

/// Container for the built-in HTTP instruments.
///
/// Created once when the recorder binds its pipeline and only read afterwards.
#[derive(Clone, Debug)]
pub(crate) struct HttpInstruments {
    /// Distribution of request handling durations.
    pub(crate) request_duration: Histogram<f64>,
    /// Lifetime counter of received requests.
    pub(crate) requests_total: Counter<u64>,
    /// Currently active requests.
    pub(crate) requests_active: UpDownCounter<i64>,
    /// Distribution of request body sizes.
    pub(crate) request_size: Histogram<u64>,
    /// Distribution of response body sizes.
    pub(crate) response_size: Histogram<u64>,
    /// Requests that finished with a 4xx or 5xx status.
    pub(crate) errors_total: Counter<u64>,
    /// Custom measurements rejected by the registry.
    pub(crate) custom_failures: Counter<u64>,
}

impl HttpInstruments {
    /// Build the instrument set on `meter` with the given bucket boundaries.
    pub(crate) fn new(meter: &Meter, duration_buckets: &[f64], size_buckets: &[f64]) -> Self {
        let request_duration = meter
            .f64_histogram("http_request_duration_seconds")
            .with_unit("s")
            .with_boundaries(duration_buckets.to_vec())
            .with_description("The HTTP request latencies in seconds.")
            .build();
        let requests_total = meter
            .u64_counter("http_requests_total")
            .with_description("How many HTTP requests were processed.")
            .build();
        let requests_active = meter
            .i64_up_down_counter("http_requests_active")
            .with_description("The number of requests currently being handled.")
            .build();
        let request_size = meter
            .u64_histogram("http_request_size_bytes")
            .with_unit("By")
            .with_boundaries(size_buckets.to_vec())
            .with_description("The HTTP request body sizes in bytes.")
            .build();
        let response_size = meter
            .u64_histogram("http_response_size_bytes")
            .with_unit("By")
            .with_boundaries(size_buckets.to_vec())
            .with_description("The HTTP response body sizes in bytes.")
            .build();
        let errors_total = meter
            .u64_counter("http_errors_total")
            .with_description("How many HTTP requests finished with an error status.")
            .build();
        let custom_failures = meter
            .u64_counter("custom_metric_failures_total")
            .with_description("How many custom metric operations were rejected.")
            .build();
        Self {
            request_duration,
            requests_total,
            requests_active,
            request_size,
            response_size,
            errors_total,
            custom_failures,
        }
    }
}
