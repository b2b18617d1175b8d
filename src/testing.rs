//! Deterministic construction helpers for test suites.
//!
//! Everything here is also usable from downstream crates' tests; nothing in
//! this module is wired into the production paths.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    config::{BackendConfig, ScrapeConfig, StdoutConfig},
    events::{Event, EventHandler, EventKind},
    recorder::Recorder,
};

/// Event sink that stores everything it sees for later assertions.
#[derive(Clone, Debug, Default)]
pub struct EventCapture(Arc<Mutex<Vec<Event>>>);

impl EventCapture {
    /// Create an empty capture sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler to pass into a recorder or middleware builder.
    #[must_use]
    pub fn handler(&self) -> EventHandler {
        let events = Arc::clone(&self.0);
        Arc::new(move |event: &Event| events.lock().push(event.clone()))
    }

    /// Snapshot of all captured events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.0.lock().clone()
    }

    /// Number of captured events of `kind`.
    #[must_use]
    pub fn count_of(&self, kind: EventKind) -> usize {
        self.0.lock().iter().filter(|event| event.kind == kind).count()
    }
}

/// Recorder with a scrape pipeline but no listening server.
///
/// The text exposition doubles as the assertion surface: use
/// [`exposition`] and [`sample_value`] to read recorded values back.
#[must_use]
pub fn scrape_recorder() -> Recorder {
    Recorder::builder()
        .with_service_name("test-service")
        .with_service_version("0.0.1")
        .with_backend(BackendConfig::Scrape(ScrapeConfig::new(":0", "/metrics")))
        .with_server_disabled()
        .build()
        .expect("test recorder configuration is valid")
}

/// Recorder with a stdout pipeline and the given cardinality cap.
#[must_use]
pub fn stdout_recorder(cardinality_cap: usize) -> Recorder {
    Recorder::builder()
        .with_service_name("test-service")
        .with_service_version("0.0.1")
        .with_backend(BackendConfig::Stdout(StdoutConfig::new()))
        .with_cardinality_cap(cardinality_cap)
        .build()
        .expect("test recorder configuration is valid")
}

/// Recorder that accepts every call and records nothing.
#[must_use]
pub fn disabled_recorder() -> Recorder {
    Recorder::builder()
        .with_enabled(false)
        .build()
        .expect("test recorder configuration is valid")
}

/// Current text exposition of a scrape recorder.
///
/// # Panics
///
/// Panics if the recorder has no text exposition.
#[must_use]
pub fn exposition(recorder: &Recorder) -> String {
    let buf = recorder
        .export_text()
        .expect("collecting metrics succeeds")
        .expect("recorder has a text exposition");
    String::from_utf8(buf).expect("exposition is valid UTF-8")
}

/// Value of the first sample whose metric name starts with `prefix`.
///
/// Comment lines are skipped; the value is the last whitespace-separated
/// token of the sample line.
#[must_use]
pub fn sample_value(exposition: &str, prefix: &str) -> Option<String> {
    exposition
        .lines()
        .filter(|line| !line.starts_with('#'))
        .find(|line| line.starts_with(prefix))
        .and_then(|line| line.rsplit(' ').next())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_counts_by_kind() {
        let capture = EventCapture::new();
        let handler = capture.handler();
        crate::events::emit(&handler, Event::new(EventKind::Warning, "one"));
        crate::events::emit(&handler, Event::new(EventKind::Error, "two"));
        crate::events::emit(&handler, Event::new(EventKind::Error, "three"));
        assert_eq!(capture.count_of(EventKind::Warning), 1);
        assert_eq!(capture.count_of(EventKind::Error), 2);
        assert_eq!(capture.count_of(EventKind::Debug), 0);
        assert_eq!(capture.events().len(), 3);
    }

    #[test]
    fn sample_value_skips_comments() {
        let text = "# HELP x_total help\n# TYPE x_total counter\nx_total{a=\"b\"} 7\n";
        assert_eq!(sample_value(text, "x_total").unwrap(), "7");
        assert!(sample_value(text, "y_total").is_none());
    }

    #[test]
    fn scrape_recorder_has_an_exposition() {
        let recorder = scrape_recorder();
        recorder.increment_counter("smoke_test", &[]).unwrap();
        let text = exposition(&recorder);
        assert!(text.contains("smoke_test"));
    }
}
