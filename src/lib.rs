#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(
    missing_docs,
    clippy::doc_link_with_quotes,
    clippy::doc_markdown,
    clippy::missing_errors_doc
)]

mod config;
mod errors;
mod events;
mod filter;
mod instruments;
mod middleware;
mod provider;
mod recorder;
mod registry;
mod request;
mod server;
pub mod testing;

pub use self::{
    config::{
        BackendConfig, BackendKind, PushConfig, PushTemporality, RecorderBuilder, ScrapeConfig,
        StdoutConfig,
    },
    errors::{Error, IoError},
    events::{Event, EventHandler, EventKind},
    filter::PathFilter,
    middleware::{
        is_instrumented, CountingBody, Instrumented, MetricsFuture, MetricsLayer,
        MetricsLayerBuilder, MetricsService,
    },
    recorder::{Recorder, RecorderInner},
    request::RequestToken,
};
