//! Request lifecycle instrumentation: begin/finish token pairs.

use std::time::Instant;

use opentelemetry::KeyValue;

use crate::recorder::Recorder;

/// Attribute capacity reserved beyond the seed for middleware additions.
const EXTRA_ATTR_CAPACITY: usize = 8;

/// Per-request state returned by [`Recorder::begin_request`] and consumed by
/// [`Recorder::finish_request`].
///
/// Ownership enforces the lifecycle: a token can be finished at most once,
/// and attributes can only be appended before it is handed to finish.
#[derive(Debug)]
pub struct RequestToken {
    pub(crate) start: Instant,
    pub(crate) attributes: Vec<KeyValue>,
}

impl RequestToken {
    /// Append attributes recorded with the final request measurements.
    pub fn add_attributes(&mut self, attrs: impl IntoIterator<Item = KeyValue>) {
        self.attributes.extend(attrs);
    }
}

impl Recorder {
    /// Open a request measurement.
    ///
    /// Increments the active-requests gauge and returns a token seeded with
    /// the service attributes. Returns `None` when the recorder is disabled
    /// or its pipeline is not bound yet; callers then skip finish entirely.
    #[must_use]
    pub fn begin_request(&self) -> Option<RequestToken> {
        let bound = self.bound()?;
        let mut attributes =
            Vec::with_capacity(self.base_attrs.len() + EXTRA_ATTR_CAPACITY);
        attributes.extend_from_slice(&self.base_attrs);
        bound.instruments.requests_active.add(1, &self.base_attrs);
        Some(RequestToken {
            start: Instant::now(),
            attributes,
        })
    }

    /// Record the request body size for an open request.
    ///
    /// Sizes of zero or less are ignored.
    pub fn record_request_size(&self, token: &RequestToken, size: i64) {
        if size <= 0 {
            return;
        }
        if let Some(bound) = self.bound() {
            bound
                .instruments
                .request_size
                .record(size as u64, &token.attributes);
        }
    }

    /// Close a request measurement.
    ///
    /// Records duration, request count, error count and response size with
    /// the token's attributes extended by status and route. The
    /// active-requests decrement deliberately reuses the seed attributes the
    /// increment was recorded with, so every series of the gauge aggregates
    /// back to zero once all requests finish.
    ///
    /// `route` should be a route template (`/users/{id}`), not a raw path;
    /// raw paths make the series cardinality proportional to traffic.
    pub fn finish_request(
        &self,
        token: RequestToken,
        status: u16,
        response_size: i64,
        route: &str,
    ) {
        let Some(bound) = self.bound() else { return };
        let elapsed = token.start.elapsed().as_secs_f64();
        let mut attributes = token.attributes;
        attributes.push(KeyValue::new("http.status_code", i64::from(status)));
        attributes.push(KeyValue::new("http.status_class", status_class(status)));
        attributes.push(KeyValue::new("http.route", route.to_owned()));

        let instruments = &bound.instruments;
        instruments.request_duration.record(elapsed, &attributes);
        instruments.requests_total.add(1, &attributes);
        instruments.requests_active.add(-1, &self.base_attrs);
        if status >= 400 {
            instruments.errors_total.add(1, &attributes);
        }
        if response_size > 0 {
            instruments
                .response_size
                .record(response_size as u64, &attributes);
        }
    }
}

/// Bucket a status code into its class label.
fn status_class(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "unknown",
    }
}
