//! Pluggable sink for internal operational events.

use std::{borrow::Cow, fmt, sync::Arc};

use tracing::{debug, error, info, warn};

/// Severity of an operational [`Event`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    /// Diagnostic detail, usually uninteresting in production.
    Debug,
    /// Normal lifecycle progress.
    Info,
    /// Something degraded but the recorder keeps working.
    Warning,
    /// An operation failed.
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Internal operational message emitted by the recorder.
///
/// Events never reach the metric pipeline itself; they describe what the
/// recorder is doing, e.g. port fallbacks or rejected custom metrics.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Event {
    /// Severity.
    pub kind: EventKind,
    /// Human-readable message.
    pub message: Cow<'static, str>,
    /// Additional key/value context.
    pub fields: Vec<(Cow<'static, str>, String)>,
}

impl Event {
    /// Create a new event without context fields.
    #[must_use]
    pub fn new(kind: EventKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// Attach a key/value context field.
    #[must_use]
    pub fn with(mut self, key: impl Into<Cow<'static, str>>, value: impl fmt::Display) -> Self {
        self.fields.push((key.into(), value.to_string()));
        self
    }
}

/// Handler invoked for every internal operational event.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Deliver `event` to `handler`.
pub(crate) fn emit(handler: &EventHandler, event: Event) {
    handler.as_ref()(&event);
}

/// Default sink: forwards events to the [`tracing`] dispatcher at the matching
/// level. With no subscriber installed, events are discarded.
pub(crate) fn default_handler() -> EventHandler {
    Arc::new(|event: &Event| match event.kind {
        EventKind::Debug => debug!(fields = ?event.fields, "{}", event.message),
        EventKind::Info => info!(fields = ?event.fields, "{}", event.message),
        EventKind::Warning => warn!(fields = ?event.fields, "{}", event.message),
        EventKind::Error => error!(fields = ?event.fields, "{}", event.message),
    })
}
