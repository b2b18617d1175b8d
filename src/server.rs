//! Scrape server: exposition endpoint, health probe and port discovery.

use std::{
    net::{Ipv4Addr, SocketAddr, TcpListener},
    time::Duration,
};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{self, Router},
    Json,
};
use opentelemetry_prometheus_text_exporter::PrometheusExporter;
use serde_json::json;
use tokio::task::JoinHandle;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug_span, error, info};

use crate::{
    config::parse_port,
    errors::Error,
    events::{self, Event, EventKind},
    recorder::Recorder,
};

/// How many successor ports flexible discovery probes after the configured
/// one.
const MAX_PORT_PROBES: u16 = 99;

/// Bound on request handling time, covering both read and write.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Content type of the Prometheus text exposition format.
const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// A running scrape listener.
pub(crate) struct ServerHandle {
    /// Graceful-shutdown handle of the serve loop.
    pub(crate) handle: axum_server::Handle,
    /// The spawned serve task.
    pub(crate) task: JoinHandle<()>,
    /// Address the listener actually bound.
    pub(crate) addr: SocketAddr,
}

/// Bind the scrape listener and spawn the serve loop.
///
/// Must be called from within a tokio runtime. A no-op when the server is
/// already running, the recorder is shutting down, or no exposition exporter
/// exists.
pub(crate) fn start(recorder: &Recorder) -> Result<(), Error> {
    let mut guard = recorder.server.lock();
    if guard.is_some() || recorder.shutting_down.load(std::sync::atomic::Ordering::SeqCst) {
        return Ok(());
    }
    let Some(cfg) = recorder.scrape.as_ref() else {
        return Ok(());
    };
    let Some(exporter) = recorder.bound().and_then(|bound| bound.exporter.clone()) else {
        return Ok(());
    };

    let requested = parse_port(&cfg.port)?;
    let (listener, addr) = bind_listener(requested, recorder.strict_port, recorder)?;
    let router = build_router(exporter, &cfg.path);
    let handle = axum_server::Handle::new();
    let server = axum_server::from_tcp(listener).handle(handle.clone());
    let task = tokio::spawn(async move {
        if let Err(err) = server.serve(router.into_make_service()).await {
            error!("scrape server terminated: {err}");
        }
    });
    info!(%addr, "metrics scrape server started");
    *guard = Some(ServerHandle { handle, task, addr });
    Ok(())
}

/// Bind a listening socket for `requested`, probing successor ports unless
/// strict mode is on.
fn bind_listener(
    requested: u16,
    strict: bool,
    recorder: &Recorder,
) -> Result<(TcpListener, SocketAddr), Error> {
    let probes = if strict { 0 } else { MAX_PORT_PROBES };
    let mut last = None;
    for offset in 0..=probes {
        let Some(port) = requested.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)) {
            Ok(listener) => {
                listener
                    .set_nonblocking(true)
                    .map_err(|err| Error::ServerBind {
                        port,
                        cause: err.into(),
                    })?;
                let addr = listener.local_addr().map_err(|err| Error::ServerBind {
                    port,
                    cause: err.into(),
                })?;
                if port != requested {
                    events::emit(
                        &recorder.events,
                        Event::new(EventKind::Warning, "configured scrape port is busy")
                            .with("requested", requested)
                            .with("actual", addr.port()),
                    );
                }
                return Ok((listener, addr));
            }
            Err(err) => last = Some(err),
        }
    }
    let cause = last.unwrap_or_else(|| std::io::Error::other("no port available"));
    let err = Error::ServerBind {
        port: requested,
        cause: cause.into(),
    };
    events::emit(
        &recorder.events,
        Event::new(EventKind::Error, "unable to bind scrape server").with("error", &err),
    );
    Err(err)
}

/// Build the router serving the exposition endpoint and `/health`.
pub(crate) fn build_router(exporter: PrometheusExporter, metrics_path: &str) -> Router {
    let _span = debug_span!("build_scrape_router").entered();
    Router::new()
        .route(metrics_path, routing::get(serve_exposition))
        .route("/health", routing::get(health))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(ScrapeState { exporter })
}

/// Shared state of the scrape routes.
#[derive(Clone)]
struct ScrapeState {
    exporter: PrometheusExporter,
}

/// Method handler serving collected metrics in text format.
async fn serve_exposition(State(state): State<ScrapeState>) -> Response {
    let mut buf = Vec::with_capacity(4096);
    match state.exporter.export(&mut buf) {
        Ok(()) => ([(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], buf).into_response(),
        Err(err) => {
            error!("error collecting metrics: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Health probe handler.
async fn health() -> impl IntoResponse {
    Json(json!({"status": "healthy", "service": "metrics-server"}))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::{
        config::{BackendConfig, ScrapeConfig},
        testing::{self, EventCapture},
    };

    /// Minimal HTTP/1.1 GET returning status code and body.
    async fn http_get(port: u16, path: &str) -> (u16, String) {
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        let request =
            format!("GET {path} HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8_lossy(&raw).into_owned();
        let status = text
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .unwrap();
        let body = text
            .split_once("\r\n\r\n")
            .map(|(_, body)| body.to_owned())
            .unwrap_or_default();
        (status, body)
    }

    fn bound_port(recorder: &crate::Recorder) -> u16 {
        recorder
            .server_address()
            .rsplit(':')
            .next()
            .and_then(|port| port.parse().ok())
            .unwrap()
    }

    #[tokio::test]
    async fn serves_exposition_and_health() {
        let recorder = crate::Recorder::builder()
            .with_service_name("scrape-test")
            .with_service_version("1.2.3")
            .with_backend(BackendConfig::Scrape(ScrapeConfig::new(":0", "/metrics")))
            .with_strict_port()
            .build()
            .unwrap();
        recorder.start().await.unwrap();

        let token = recorder.begin_request().unwrap();
        recorder.finish_request(token, 200, 123, "/x");

        let port = bound_port(&recorder);
        let (status, body) = http_get(port, "/metrics").await;
        assert_eq!(status, 200);
        assert!(body.contains("http_requests_total"));
        assert!(body.contains("http_request_duration_seconds"));
        assert!(body.contains("target_info"));
        assert!(body.contains("service_name=\"scrape-test\""));
        assert!(body.contains("service_version=\"1.2.3\""));
        let active = testing::sample_value(&body, "http_requests_active").unwrap();
        assert_eq!(active, "0");

        let (status, body) = http_get(port, "/health").await;
        assert_eq!(status, 200);
        let health: serde_json::Value = serde_json::from_str(body.trim()).unwrap();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["service"], "metrics-server");

        recorder.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(recorder.server_address(), "");
    }

    #[tokio::test]
    async fn strict_mode_surfaces_bind_failure() {
        let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let capture = EventCapture::new();
        let recorder = crate::Recorder::builder()
            .with_backend(BackendConfig::Scrape(ScrapeConfig::new(
                format!(":{port}"),
                "/metrics",
            )))
            .with_strict_port()
            .with_event_handler(capture.handler())
            .build()
            .unwrap();

        let err = recorder.start().await.unwrap_err();
        assert!(matches!(err, Error::ServerBind { port: p, .. } if p == port));
        assert_eq!(capture.count_of(EventKind::Error), 1);
        assert_eq!(recorder.server_address(), "");
        // The recorder keeps working without a listener.
        recorder.increment_counter("still_alive", &[]).unwrap();
        assert_eq!(recorder.custom_metric_count(), 1);
    }

    #[tokio::test]
    async fn flexible_mode_falls_back_to_a_free_port() {
        let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let capture = EventCapture::new();
        let recorder = crate::Recorder::builder()
            .with_backend(BackendConfig::Scrape(ScrapeConfig::new(
                format!(":{port}"),
                "/metrics",
            )))
            .with_event_handler(capture.handler())
            .build()
            .unwrap();

        recorder.start().await.unwrap();
        let actual = bound_port(&recorder);
        assert_ne!(actual, port);
        assert_eq!(capture.count_of(EventKind::Warning), 1);
        recorder.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn server_disabled_builds_handler_but_never_listens() {
        let recorder = crate::Recorder::builder()
            .with_backend(BackendConfig::Scrape(ScrapeConfig::new(":0", "/metrics")))
            .with_server_disabled()
            .build()
            .unwrap();
        recorder.start().await.unwrap();
        assert_eq!(recorder.server_address(), "");
        assert!(recorder.handler().is_ok());
        recorder.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
