//! Error types used across the recorder.

use std::{fmt, io};

use opentelemetry_otlp::ExporterBuildError;
use thiserror::Error as ThisError;

use crate::config::BackendKind;

/// Wrapper for [`std::io::Error`] that renders the error kind and raw OS errno.
#[derive(Debug)]
#[repr(transparent)]
pub struct IoError(io::Error);

impl From<io::Error> for IoError {
    fn from(value: io::Error) -> Self {
        Self(value)
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, kind={:?}", self.0, self.0.kind())?;
        if let Some(raw) = self.0.raw_os_error() {
            write!(f, ", raw={raw}")?;
        }
        Ok(())
    }
}

/// Error type returned by recorder construction, lifecycle and record operations.
#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum Error {
    /// Recorder construction was given an inconsistent configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What was wrong with the configuration.
        reason: String,
    },
    /// A custom metric name failed validation.
    #[error("invalid metric name {name:?}: {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why the name was rejected.
        reason: &'static str,
    },
    /// The custom instrument cardinality cap is exhausted.
    #[error("cardinality cap reached admitting {name:?}: {current} of {cap} instruments in use")]
    CapReached {
        /// The name that could not be admitted.
        name: String,
        /// Number of instruments currently admitted.
        current: usize,
        /// The configured cap.
        cap: usize,
    },
    /// Slot reservation lost too many races and gave up.
    #[error("registry update conflict admitting a {operation} after {retries} attempts")]
    UpdateConflict {
        /// The instrument kind that was being admitted.
        operation: &'static str,
        /// How many attempts were made before giving up.
        retries: u32,
    },
    /// Failure while building the export pipeline.
    #[error("backend initialization failed: {0}")]
    BackendInit(#[from] ExporterBuildError),
    /// The scrape server could not bind its listening socket.
    #[error("unable to bind scrape server to port {port}: {cause}")]
    ServerBind {
        /// The port that could not be bound.
        port: u16,
        /// The underlying socket error.
        cause: IoError,
    },
    /// Flushing or draining the pipeline failed during teardown.
    #[error("pipeline shutdown failed: {cause}")]
    PipelineShutdown {
        /// Joined messages of the underlying drain and flush failures.
        cause: String,
    },
    /// A scrape handler was requested from a backend that has none.
    #[error("no scrape handler available on the {backend} backend")]
    HandlerUnavailable {
        /// The backend the recorder is actually bound to.
        backend: BackendKind,
    },
}
