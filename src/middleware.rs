//! Request instrumentation [`tower`] middleware.
//!
//! Wraps a downstream service, filters excluded paths, captures allow-listed
//! request headers and counts response body bytes. The request token is
//! finished exactly once, when the response body reaches end-of-stream or is
//! dropped, so durations cover body streaming and the active-requests gauge
//! balances even for abandoned responses.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use axum::extract::MatchedPath;
use bytes::Buf;
use http::{header, HeaderName, Request, Response};
use hyper::body::{Body, Frame, SizeHint};
use opentelemetry::KeyValue;
use pin_project::{pin_project, pinned_drop};
use tower::{Layer, Service};

use crate::{errors::Error, filter::PathFilter, recorder::Recorder, request::RequestToken};

/// Request headers never recorded as attributes, lowercase.
const SENSITIVE_HEADERS: [&str; 7] = [
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
    "proxy-authorization",
    "www-authenticate",
];

/// Attribute key prefix for captured request headers.
const HEADER_ATTR_PREFIX: &str = "http.request.header.";

/// Extension marker placed on requests already claimed by a metrics layer.
#[derive(Clone, Copy, Debug)]
pub struct Instrumented;

/// Returns `true` if a metrics layer already claimed this request.
///
/// Other observability layers can use this to avoid double-wrapping.
#[must_use]
pub fn is_instrumented<T>(req: &Request<T>) -> bool {
    req.extensions().get::<Instrumented>().is_some()
}

/// Builder for [`MetricsLayer`].
#[derive(Clone, Debug, Default)]
#[must_use]
pub struct MetricsLayerBuilder {
    exclude_paths: Vec<String>,
    exclude_prefixes: Vec<String>,
    exclude_patterns: Vec<String>,
    headers: Vec<String>,
}

impl MetricsLayerBuilder {
    /// Create a builder with no exclusions and no header captures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude an exact request path from instrumentation.
    pub fn exclude_path(mut self, path: impl Into<String>) -> Self {
        self.exclude_paths.push(path.into());
        self
    }

    /// Exclude several exact request paths.
    pub fn exclude_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Exclude every path starting with `prefix`.
    pub fn exclude_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.exclude_prefixes.push(prefix.into());
        self
    }

    /// Exclude every path starting with one of `prefixes`.
    pub fn exclude_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_prefixes
            .extend(prefixes.into_iter().map(Into::into));
        self
    }

    /// Exclude every path matching the regex `pattern`.
    pub fn exclude_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_patterns.push(pattern.into());
        self
    }

    /// Exclude every path matching one of the regex `patterns`.
    pub fn exclude_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_patterns
            .extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Record the named request headers as attributes.
    ///
    /// Sensitive header names (authorization, cookies, API keys and friends)
    /// are silently dropped from the allow-list.
    pub fn capture_headers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.headers.extend(names.into_iter().map(Into::into));
        self
    }

    /// Compile the filter and header captures into a layer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for invalid exclude patterns or
    /// header names.
    pub fn build(self, recorder: Recorder) -> Result<MetricsLayer, Error> {
        let filter = PathFilter::new(
            self.exclude_paths,
            self.exclude_prefixes,
            &self.exclude_patterns,
        )?;
        let mut headers = Vec::with_capacity(self.headers.len());
        for name in self.headers {
            let lower = name.to_ascii_lowercase();
            if SENSITIVE_HEADERS.contains(&lower.as_str()) {
                continue;
            }
            let header = HeaderName::try_from(lower.as_str()).map_err(|err| {
                Error::InvalidConfig {
                    reason: format!("invalid capture header {name:?}: {err}"),
                }
            })?;
            let attr_key = format!("{HEADER_ATTR_PREFIX}{lower}");
            headers.push(HeaderCapture { header, attr_key });
        }
        Ok(MetricsLayer {
            shared: Arc::new(LayerShared {
                recorder,
                filter,
                headers,
            }),
        })
    }
}

/// Request instrumentation [`tower`] layer.
#[derive(Clone)]
pub struct MetricsLayer {
    shared: Arc<LayerShared>,
}

impl MetricsLayer {
    /// Start building a layer.
    pub fn builder() -> MetricsLayerBuilder {
        MetricsLayerBuilder::new()
    }

    /// Create a layer with no exclusions and no header captures.
    ///
    /// Infallible shorthand for an unconfigured [`Self::builder`].
    #[must_use]
    pub fn new(recorder: Recorder) -> Self {
        Self {
            shared: Arc::new(LayerShared {
                recorder,
                filter: PathFilter::default(),
                headers: Vec::new(),
            }),
        }
    }
}

/// State shared by all services of one layer.
struct LayerShared {
    recorder: Recorder,
    filter: PathFilter,
    headers: Vec<HeaderCapture>,
}

/// One allow-listed header and its precomputed attribute key.
struct HeaderCapture {
    header: HeaderName,
    attr_key: String,
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            shared: Arc::clone(&self.shared),
            inner,
        }
    }
}

/// Request instrumentation [`tower`] service.
#[derive(Clone)]
pub struct MetricsService<S> {
    shared: Arc<LayerShared>,
    inner: S,
}

impl<S, T, U> Service<Request<T>> for MetricsService<S>
where
    S: Service<Request<T>, Response = Response<U>>,
    U: Body,
{
    type Response = Response<CountingBody<U>>;
    type Error = S::Error;
    type Future = MetricsFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<T>) -> Self::Future {
        let shared = Arc::clone(&self.shared);
        if !shared.recorder.is_enabled()
            || shared.filter.should_exclude(req.uri().path())
            || is_instrumented(&req)
        {
            return MetricsFuture {
                inner: self.inner.call(req),
                capture: None,
            };
        }
        let Some(mut token) = shared.recorder.begin_request() else {
            return MetricsFuture {
                inner: self.inner.call(req),
                capture: None,
            };
        };

        let scheme = req
            .uri()
            .scheme()
            .map(ToString::to_string)
            .unwrap_or_default();
        token.add_attributes([
            KeyValue::new("http.request.method", req.method().to_string()),
            KeyValue::new("url.scheme", scheme),
            KeyValue::new("server.address", header_value(&req, header::HOST)),
            KeyValue::new("user_agent.original", header_value(&req, header::USER_AGENT)),
        ]);
        if let Some(size) = content_length(&req) {
            shared.recorder.record_request_size(&token, size);
        }
        for capture in &shared.headers {
            if let Some(value) = req
                .headers()
                .get(&capture.header)
                .and_then(|value| value.to_str().ok())
            {
                token.add_attributes([KeyValue::new(capture.attr_key.clone(), value.to_owned())]);
            }
        }

        // Prefer the matched route template over the raw path; raw paths are
        // a known cardinality hazard on variable segments.
        let route = req
            .extensions()
            .get::<MatchedPath>()
            .map(|path| path.as_str().to_owned())
            .unwrap_or_else(|| req.uri().path().to_owned());
        req.extensions_mut().insert(Instrumented);
        MetricsFuture {
            inner: self.inner.call(req),
            capture: Some(Capture {
                recorder: shared.recorder.clone(),
                token,
                route,
            }),
        }
    }
}

/// First value of `name`, or an empty string.
fn header_value<T>(req: &Request<T>, name: HeaderName) -> String {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

/// Positive `Content-Length` of the request, if present.
fn content_length<T>(req: &Request<T>) -> Option<i64> {
    req.headers()
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
        .filter(|length| *length > 0)
}

/// In-flight request state carried from call to response.
struct Capture {
    recorder: Recorder,
    token: RequestToken,
    route: String,
}

impl Capture {
    /// Attach the response status, producing the body finisher.
    fn into_finisher(self, status: u16) -> Finisher {
        Finisher {
            recorder: self.recorder,
            token: Some(self.token),
            status,
            route: self.route,
        }
    }

    /// Close the token for a request whose service errored out.
    fn abort(self) {
        self.recorder.finish_request(self.token, 500, 0, &self.route);
    }
}

/// Finishes a request token exactly once with the counted body size.
struct Finisher {
    recorder: Recorder,
    token: Option<RequestToken>,
    status: u16,
    route: String,
}

impl Finisher {
    fn finish(mut self, bytes: u64) {
        if let Some(token) = self.token.take() {
            let size = i64::try_from(bytes).unwrap_or(i64::MAX);
            self.recorder
                .finish_request(token, self.status, size, &self.route);
        }
    }
}

/// Response future for [`MetricsService`].
#[pin_project]
pub struct MetricsFuture<F> {
    #[pin]
    inner: F,
    capture: Option<Capture>,
}

impl<F, U, E> Future for MetricsFuture<F>
where
    F: Future<Output = Result<Response<U>, E>>,
    U: Body,
{
    type Output = Result<Response<CountingBody<U>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.inner.poll(cx));
        Poll::Ready(match result {
            Ok(resp) => Ok(match this.capture.take() {
                Some(capture) => {
                    let status = resp.status().as_u16();
                    resp.map(|body| CountingBody::finishing(body, capture.into_finisher(status)))
                }
                None => resp.map(CountingBody::passthrough),
            }),
            Err(err) => {
                if let Some(capture) = this.capture.take() {
                    capture.abort();
                }
                Err(err)
            }
        })
    }
}

/// Response body wrapper that counts data bytes written.
///
/// Frames, size hints and end-of-stream signals are forwarded untouched, so
/// streaming responses and protocol upgrades keep working. The finisher runs
/// at end-of-stream, on a body error, or on drop, whichever comes first.
#[pin_project(PinnedDrop)]
pub struct CountingBody<B> {
    #[pin]
    inner: B,
    counted: u64,
    finisher: Option<Finisher>,
}

impl<B> std::fmt::Debug for CountingBody<B>
where
    B: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingBody")
            .field("inner", &self.inner)
            .field("counted", &self.counted)
            .finish_non_exhaustive()
    }
}

impl<B> CountingBody<B> {
    /// Wrap without recording anything; keeps the service types uniform for
    /// excluded and pass-through requests.
    fn passthrough(inner: B) -> Self {
        Self {
            inner,
            counted: 0,
            finisher: None,
        }
    }

    /// Wrap and finish `finisher` once the body completes.
    fn finishing(inner: B, finisher: Finisher) -> Self {
        Self {
            inner,
            counted: 0,
            finisher: Some(finisher),
        }
    }
}

impl<B> Body for CountingBody<B>
where
    B: Body,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        match ready!(this.inner.poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    *this.counted += data.remaining() as u64;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(err)) => {
                if let Some(finisher) = this.finisher.take() {
                    finisher.finish(*this.counted);
                }
                Poll::Ready(Some(Err(err)))
            }
            None => {
                if let Some(finisher) = this.finisher.take() {
                    finisher.finish(*this.counted);
                }
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[pinned_drop]
impl<B> PinnedDrop for CountingBody<B> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if let Some(finisher) = this.finisher.take() {
            finisher.finish(*this.counted);
        }
    }
}
