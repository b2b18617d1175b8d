//! The recorder façade tying configuration, pipeline and server together.

use std::{
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use axum::Router;
use opentelemetry::KeyValue;
use opentelemetry_semantic_conventions::resource as res;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::{BackendConfig, BackendKind, PushConfig, RecorderBuilder, ScrapeConfig},
    errors::Error,
    events::{self, Event, EventHandler, EventKind},
    provider::{self, Bound},
    registry::CustomRegistry,
    server::{self, ServerHandle},
};

/// Process-embedded metrics recorder.
///
/// Cheap to clone; all clones share the same pipeline, instruments and
/// registry. Multiple independent recorders may coexist in one process.
#[derive(Clone)]
pub struct Recorder(pub(crate) Arc<RecorderInner>);

impl Deref for Recorder {
    type Target = RecorderInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Shared state behind a [`Recorder`].
pub struct RecorderInner {
    pub(crate) enabled: bool,
    pub(crate) service_name: String,
    pub(crate) service_version: String,
    pub(crate) backend: BackendKind,
    /// Seed attributes carried by every request token; also the attribute set
    /// used for both sides of the active-requests gauge.
    pub(crate) base_attrs: Vec<KeyValue>,
    pub(crate) duration_buckets: Vec<f64>,
    pub(crate) size_buckets: Vec<f64>,
    pub(crate) export_interval: Duration,
    pub(crate) cardinality_cap: usize,
    pub(crate) register_global: bool,
    /// Pipeline is caller-supplied; never shut it down.
    pub(crate) caller_owned: bool,
    pub(crate) strict_port: bool,
    pub(crate) serve_metrics: bool,
    pub(crate) scrape: Option<ScrapeConfig>,
    pub(crate) push: Option<PushConfig>,
    pub(crate) events: EventHandler,
    /// Pipeline state, set at most once.
    pub(crate) bound: OnceLock<Bound>,
    /// Serializes the lazy push bind.
    pub(crate) init_lock: Mutex<()>,
    /// Monotonic: once set it never clears.
    pub(crate) shutting_down: AtomicBool,
    pub(crate) server: Mutex<Option<ServerHandle>>,
}

impl Recorder {
    /// Start building a recorder.
    pub fn builder() -> RecorderBuilder {
        RecorderBuilder::new()
    }

    /// Consume a validated builder and construct the recorder.
    pub(crate) fn from_builder(builder: RecorderBuilder) -> Result<Self, Error> {
        builder.validate()?;
        let events = builder.events.clone().unwrap_or_else(events::default_handler);
        if builder.export_interval < Duration::from_secs(1) {
            events::emit(
                &events,
                Event::new(EventKind::Warning, "export interval is below one second")
                    .with("interval", format!("{:?}", builder.export_interval)),
            );
            warn!(interval = ?builder.export_interval, "very short export interval configured");
        }

        let caller_owned = builder.external.is_some();
        let mut scrape = None;
        let mut push = None;
        let external = builder.external;
        let backend = if external.is_some() {
            BackendKind::External
        } else {
            match builder.backends.into_iter().next() {
                None => {
                    scrape = Some(ScrapeConfig::default());
                    BackendKind::Scrape
                }
                Some(BackendConfig::Scrape(cfg)) => {
                    scrape = Some(cfg.normalized());
                    BackendKind::Scrape
                }
                Some(BackendConfig::Push(cfg)) => {
                    push = Some(cfg.normalized()?);
                    BackendKind::Push
                }
                Some(BackendConfig::Stdout(_)) => BackendKind::Stdout,
            }
        };

        let base_attrs = vec![
            KeyValue::new(res::SERVICE_NAME, builder.service_name.clone()),
            KeyValue::new(res::SERVICE_VERSION, builder.service_version.clone()),
        ];
        let recorder = Self(Arc::new(RecorderInner {
            enabled: builder.enabled,
            service_name: builder.service_name,
            service_version: builder.service_version,
            backend,
            base_attrs,
            duration_buckets: builder.duration_buckets,
            size_buckets: builder.size_buckets,
            export_interval: builder.export_interval,
            cardinality_cap: builder.cardinality_cap,
            register_global: builder.register_global,
            caller_owned,
            strict_port: builder.strict_port,
            serve_metrics: builder.serve_metrics,
            scrape,
            push,
            events,
            bound: OnceLock::new(),
            init_lock: Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            server: Mutex::new(None),
        }));

        if recorder.enabled {
            match external {
                Some(provider) => recorder.publish(provider, None),
                None => recorder.bind_eager(),
            }
        }
        Ok(recorder)
    }

    /// Bind the pipeline for backends that initialize in the constructor.
    fn bind_eager(&self) {
        match self.backend {
            BackendKind::Scrape => {
                let Some(cfg) = &self.scrape else { return };
                let resource = provider::build_resource(&self.service_name, &self.service_version);
                let (provider, exporter) = provider::scrape_provider(cfg, resource);
                self.publish(provider, Some(exporter));
            }
            BackendKind::Stdout => {
                let resource = provider::build_resource(&self.service_name, &self.service_version);
                let provider = provider::stdout_provider(resource, self.export_interval);
                self.publish(provider, None);
            }
            // Deferred to start so the lifecycle governs connection attempts.
            BackendKind::Push | BackendKind::External => {}
        }
    }

    /// Install the pipeline state and the process-default registration.
    fn publish(
        &self,
        provider: opentelemetry_sdk::metrics::SdkMeterProvider,
        exporter: Option<opentelemetry_prometheus_text_exporter::PrometheusExporter>,
    ) {
        if self.register_global {
            provider::register_global(&provider);
        }
        self.install(provider, exporter);
        debug!(backend = %self.backend, "metrics pipeline bound");
    }

    /// Create instruments and registry on `provider` and publish the state.
    fn install(
        &self,
        provider: opentelemetry_sdk::metrics::SdkMeterProvider,
        exporter: Option<opentelemetry_prometheus_text_exporter::PrometheusExporter>,
    ) {
        let bound = provider::bind(
            provider,
            exporter,
            &self.duration_buckets,
            &self.size_buckets,
            self.cardinality_cap,
            self.events.clone(),
        );
        let _ = self.bound.set(bound);
    }

    /// Start the recorder.
    ///
    /// Binds the push pipeline if deferred, and starts the scrape server when
    /// one is configured. Safe to call on disabled recorders.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendInit`] if the push exporter cannot be built and
    /// [`Error::ServerBind`] if the scrape listener cannot bind.
    pub async fn start(&self) -> Result<(), Error> {
        if !self.enabled || self.shutting_down.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.backend == BackendKind::Push {
            self.bind_push()?;
        }
        if self.backend == BackendKind::Scrape && self.serve_metrics {
            server::start(self)?;
        }
        Ok(())
    }

    /// Lazily bind the push pipeline, first caller wins.
    fn bind_push(&self) -> Result<(), Error> {
        if self.bound.get().is_some() {
            return Ok(());
        }
        let _guard = self.init_lock.lock();
        if self.bound.get().is_some() {
            return Ok(());
        }
        let Some(cfg) = &self.push else { return Ok(()) };
        let resource = provider::build_resource(&self.service_name, &self.service_version);
        let provider = match provider::push_provider(cfg, resource, self.export_interval) {
            Ok(provider) => provider,
            Err(err) => {
                events::emit(
                    &self.events,
                    Event::new(EventKind::Error, "failed to initialize push exporter")
                        .with("endpoint", &cfg.endpoint)
                        .with("error", &err),
                );
                return Err(err);
            }
        };
        self.publish(provider, None);
        info!(endpoint = %cfg.endpoint, "push pipeline bound");
        Ok(())
    }

    /// Flush buffered measurements through the pipeline.
    ///
    /// A no-op on the scrape backend, where collection happens on demand.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PipelineShutdown`] if the flush fails.
    pub fn force_flush(&self) -> Result<(), Error> {
        if !self.enabled || self.backend == BackendKind::Scrape {
            return Ok(());
        }
        let Some(bound) = self.bound.get() else {
            return Ok(());
        };
        bound.provider.force_flush().map_err(|err| Error::PipelineShutdown {
            cause: err.to_string(),
        })
    }

    /// Shut the recorder down: drain the scrape server, then flush and stop
    /// the pipeline unless it is caller-owned.
    ///
    /// Idempotent: the first call does the work, every later call returns
    /// `Ok` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PipelineShutdown`] aggregating drain and flush
    /// failures.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), Error> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut failures: Vec<String> = Vec::new();

        // Clear the handle before waiting so a late start cannot re-bind.
        let server = self.server.lock().take();
        if let Some(server) = server {
            server.handle.graceful_shutdown(Some(timeout));
            match tokio::time::timeout(timeout, server.task).await {
                Ok(Ok(())) => debug!("scrape server drained"),
                Ok(Err(err)) => failures.push(format!("scrape server task failed: {err}")),
                Err(_) => failures.push("scrape server drain timed out".into()),
            }
        }

        if !self.caller_owned {
            if let Some(bound) = self.bound.get() {
                let provider = bound.provider.clone();
                let flush = tokio::task::spawn_blocking(move || provider.shutdown());
                match tokio::time::timeout(timeout, flush).await {
                    Ok(Ok(Ok(()))) => debug!("meter pipeline shut down"),
                    Ok(Ok(Err(err))) => {
                        failures.push(format!("meter pipeline shutdown failed: {err}"));
                    }
                    Ok(Err(err)) => failures.push(format!("pipeline shutdown task failed: {err}")),
                    Err(_) => failures.push("meter pipeline flush timed out".into()),
                }
            }
        }

        if failures.is_empty() {
            info!("recorder shut down");
            Ok(())
        } else {
            let err = Error::PipelineShutdown {
                cause: failures.join("; "),
            };
            events::emit(
                &self.events,
                Event::new(EventKind::Error, "shutdown finished with failures").with("error", &err),
            );
            Err(err)
        }
    }

    /// Axum router serving the exposition endpoint and `/health`.
    ///
    /// Useful for mounting the scrape surface into an existing server instead
    /// of letting the recorder listen on its own.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandlerUnavailable`] on non-scrape backends and on
    /// disabled recorders.
    pub fn handler(&self) -> Result<Router, Error> {
        let unavailable = || Error::HandlerUnavailable {
            backend: self.backend,
        };
        if !self.enabled || self.backend != BackendKind::Scrape {
            return Err(unavailable());
        }
        let bound = self.bound.get().ok_or_else(unavailable)?;
        let exporter = bound.exporter.clone().ok_or_else(unavailable)?;
        let cfg = self.scrape.as_ref().ok_or_else(unavailable)?;
        Ok(server::build_router(exporter, &cfg.path))
    }

    /// Address of the bound scrape listener, or an empty string when no bind
    /// has succeeded.
    #[must_use]
    pub fn server_address(&self) -> String {
        self.server
            .lock()
            .as_ref()
            .map(|server| server.addr.to_string())
            .unwrap_or_default()
    }

    /// Collected metrics in Prometheus text format, or `None` when the
    /// backend has no text exposition.
    ///
    /// # Errors
    ///
    /// Returns `Err` if collecting metrics fails.
    pub fn export_text(&self) -> Result<Option<Vec<u8>>, std::io::Error> {
        let Some(bound) = self.bound.get() else {
            return Ok(None);
        };
        match &bound.exporter {
            Some(exporter) => {
                let mut buf = Vec::with_capacity(256);
                exporter.export(&mut buf)?;
                Ok(Some(buf))
            }
            None => Ok(None),
        }
    }

    /// Record `value` into the custom histogram `name`.
    ///
    /// # Errors
    ///
    /// Returns the registry admission errors of [`Error`] for new names.
    pub fn record_histogram(
        &self,
        name: &str,
        value: f64,
        attrs: &[KeyValue],
    ) -> Result<(), Error> {
        match self.registry() {
            Some(registry) => registry.record_histogram(name, value, attrs),
            None => Ok(()),
        }
    }

    /// Add 1 to the custom counter `name`.
    ///
    /// # Errors
    ///
    /// Returns the registry admission errors of [`Error`] for new names.
    pub fn increment_counter(&self, name: &str, attrs: &[KeyValue]) -> Result<(), Error> {
        self.add_counter(name, 1, attrs)
    }

    /// Add `delta` to the custom counter `name`.
    ///
    /// # Errors
    ///
    /// Returns the registry admission errors of [`Error`] for new names.
    pub fn add_counter(&self, name: &str, delta: u64, attrs: &[KeyValue]) -> Result<(), Error> {
        match self.registry() {
            Some(registry) => registry.add_counter(name, delta, attrs),
            None => Ok(()),
        }
    }

    /// Set the custom gauge `name` to `value`.
    ///
    /// # Errors
    ///
    /// Returns the registry admission errors of [`Error`] for new names.
    pub fn set_gauge(&self, name: &str, value: f64, attrs: &[KeyValue]) -> Result<(), Error> {
        match self.registry() {
            Some(registry) => registry.set_gauge(name, value, attrs),
            None => Ok(()),
        }
    }

    /// Number of distinct custom instruments admitted so far.
    ///
    /// Always within `[0, cardinality cap]`.
    #[must_use]
    pub fn custom_metric_count(&self) -> usize {
        self.registry().map_or(0, CustomRegistry::count)
    }

    /// Whether this recorder records anything at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The backend this recorder was configured with.
    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        self.backend
    }

    /// Registry accessor gating disabled and not-yet-bound recorders.
    fn registry(&self) -> Option<&CustomRegistry> {
        if !self.enabled {
            return None;
        }
        self.bound.get().map(|bound| &bound.registry)
    }

    /// Pipeline state accessor gating disabled recorders.
    pub(crate) fn bound(&self) -> Option<&Bound> {
        if !self.enabled {
            return None;
        }
        self.0.bound.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let recorder = testing::stdout_recorder(8);
        recorder.increment_counter("shutdown_probe", &[]).unwrap();
        assert!(recorder.shutdown(Duration::from_secs(1)).await.is_ok());
        assert!(recorder.shutdown(Duration::from_secs(1)).await.is_ok());
        assert!(recorder.shutdown(Duration::from_millis(1)).await.is_ok());
    }

    #[tokio::test]
    async fn disabled_recorder_accepts_everything_and_records_nothing() {
        let recorder = testing::disabled_recorder();
        assert!(!recorder.is_enabled());
        assert!(recorder.begin_request().is_none());
        recorder.increment_counter("anything", &[]).unwrap();
        recorder.record_histogram("x y z !", 1.0, &[]).unwrap();
        recorder.set_gauge("", 0.0, &[]).unwrap();
        assert_eq!(recorder.custom_metric_count(), 0);
        assert!(matches!(
            recorder.handler(),
            Err(Error::HandlerUnavailable { .. })
        ));
        assert!(recorder.start().await.is_ok());
        assert!(recorder.shutdown(Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn push_measurements_before_start_are_dropped() {
        let recorder = Recorder::builder()
            .with_backend(BackendConfig::Push(PushConfig::new("http://127.0.0.1:1")))
            .build()
            .unwrap();
        assert!(recorder.begin_request().is_none());
        recorder.increment_counter("early_bird", &[]).unwrap();
        assert_eq!(recorder.custom_metric_count(), 0);

        recorder.start().await.unwrap();
        recorder.increment_counter("early_bird", &[]).unwrap();
        assert_eq!(recorder.custom_metric_count(), 1);
        let _ = recorder.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn push_shutdown_surfaces_transport_failure_once() {
        let recorder = Recorder::builder()
            .with_backend(BackendConfig::Push(
                PushConfig::new("http://127.0.0.1:1").with_timeout(Duration::from_millis(50)),
            ))
            .build()
            .unwrap();
        recorder.start().await.unwrap();
        recorder
            .record_histogram("latency_probe", 0.25, &[])
            .unwrap();
        let err = recorder
            .shutdown(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PipelineShutdown { .. }));
        assert!(recorder.shutdown(Duration::from_millis(100)).await.is_ok());
    }

    #[test]
    fn stdout_recorder_enforces_the_cap_in_order() {
        let recorder = testing::stdout_recorder(3);
        for name in ["a", "b", "c"] {
            recorder.increment_counter(name, &[]).unwrap();
        }
        let err = recorder.increment_counter("d", &[]).unwrap_err();
        assert!(matches!(err, Error::CapReached { current: 3, cap: 3, .. }));
        assert_eq!(recorder.custom_metric_count(), 3);
    }

    #[test]
    fn cap_failures_show_up_in_the_failure_counter() {
        let cap = 10;
        let recorder = Recorder::builder()
            .with_backend(BackendConfig::Scrape(ScrapeConfig::new(":0", "/metrics")))
            .with_server_disabled()
            .with_cardinality_cap(cap)
            .build()
            .unwrap();
        let threads = 100;
        let names_per_thread = 20;
        std::thread::scope(|scope| {
            for t in 0..threads {
                let recorder = recorder.clone();
                scope.spawn(move || {
                    for n in 0..names_per_thread {
                        let name = format!("load_{t}_{n}");
                        match recorder.increment_counter(&name, &[]) {
                            Ok(()) | Err(Error::CapReached { .. }) => {}
                            Err(other) => panic!("unexpected error: {other}"),
                        }
                    }
                });
            }
        });
        assert_eq!(recorder.custom_metric_count(), cap);
        let text = testing::exposition(&recorder);
        let failures = testing::sample_value(&text, "custom_metric_failures_total").unwrap();
        assert_eq!(failures, (threads * names_per_thread - cap).to_string());
    }

    #[test]
    fn handler_requires_the_scrape_backend() {
        let recorder = testing::stdout_recorder(4);
        assert!(matches!(
            recorder.handler(),
            Err(Error::HandlerUnavailable {
                backend: BackendKind::Stdout
            })
        ));

        let recorder = Recorder::builder()
            .with_backend(BackendConfig::Scrape(ScrapeConfig::new(":0", "/metrics")))
            .with_server_disabled()
            .build()
            .unwrap();
        assert!(recorder.handler().is_ok());
    }

    #[test]
    fn force_flush_is_a_noop_on_scrape() {
        let recorder = Recorder::builder()
            .with_backend(BackendConfig::Scrape(ScrapeConfig::new(":0", "/metrics")))
            .with_server_disabled()
            .build()
            .unwrap();
        assert!(recorder.force_flush().is_ok());
    }

    #[test]
    fn stdout_backend_flushes_on_demand() {
        let recorder = testing::stdout_recorder(4);
        recorder.add_counter("flushed", 3, &[]).unwrap();
        assert!(recorder.force_flush().is_ok());
    }

    #[test]
    fn external_pipeline_is_never_shut_down() {
        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder().build();
        let recorder = Recorder::builder()
            .with_meter_provider(provider.clone())
            .build()
            .unwrap();
        assert_eq!(recorder.backend_kind(), BackendKind::External);
        recorder.increment_counter("external_counter", &[]).unwrap();
        assert_eq!(recorder.custom_metric_count(), 1);
        // The recorder must not have shut the provider down on teardown; a
        // fresh meter from it still works afterwards.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime
            .block_on(recorder.shutdown(Duration::from_millis(100)))
            .unwrap();
        assert!(provider.force_flush().is_ok());
    }
}
