//! Concurrent registry for caller-defined instruments.
//!
//! The registry is the hot path of the recorder: repeated record calls must
//! resolve to an existing instrument without validation or allocation, while
//! new names are admitted under a hard cardinality cap that is never exceeded,
//! not even transiently.
//!
//! Admission is lock-free. The cardinality counter is reserved with a CAS
//! before any map is touched; the name→kind namespace map is the
//! linearization point that guarantees at most one instrument per name, and
//! every non-success exit after a reservation releases the slot again.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        LazyLock,
    },
    thread,
    time::Duration,
};

use dashmap::{mapref::entry::Entry, DashMap};
use opentelemetry::{
    metrics::{Counter, Gauge, Histogram, Meter},
    KeyValue,
};
use regex::Regex;

use crate::{
    errors::Error,
    events::{self, Event, EventHandler, EventKind},
};

/// Upper bound on metric name length.
const MAX_NAME_LEN: usize = 255;

/// Name prefixes reserved for the recorder's own instruments.
const RESERVED_PREFIXES: [&str; 3] = ["__", "http_", "router_"];

/// Attempt budget for slot reservation and admission races.
const RESERVE_ATTEMPTS: u32 = 100;

/// Shape every metric name must have.
#[allow(clippy::unwrap_used)]
static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z][A-Za-z0-9_.-]*$").unwrap());

/// What kind of instrument a name resolves to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum InstrumentKind {
    Counter,
    Histogram,
    Gauge,
}

impl InstrumentKind {
    /// Name used in conflict errors and events.
    fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Histogram => "histogram",
            Self::Gauge => "gauge",
        }
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a slot reservation attempt.
enum ReserveFailure {
    /// The cap is exhausted; `current` is the value observed last.
    CapExhausted { current: usize },
    /// The CAS lost its full attempt budget.
    Contended { retries: u32 },
}

/// Name→instrument registry shared by all record operations.
pub(crate) struct CustomRegistry {
    meter: Meter,
    /// Rejected-operation counter, shared with the built-in instrument set.
    failures: Counter<u64>,
    events: EventHandler,
    counters: DashMap<String, Counter<u64>>,
    histograms: DashMap<String, Histogram<f64>>,
    gauges: DashMap<String, Gauge<f64>>,
    /// Authoritative namespace: which kind a name was admitted as.
    kinds: DashMap<String, InstrumentKind>,
    /// Admitted instruments plus in-flight reservations. Never exceeds `cap`.
    cardinality: AtomicUsize,
    cap: usize,
    /// Reservations that needed more than one CAS attempt.
    contended: AtomicU64,
}

impl CustomRegistry {
    pub(crate) fn new(
        meter: Meter,
        failures: Counter<u64>,
        events: EventHandler,
        cap: usize,
    ) -> Self {
        Self {
            meter,
            failures,
            events,
            counters: DashMap::new(),
            histograms: DashMap::new(),
            gauges: DashMap::new(),
            kinds: DashMap::new(),
            cardinality: AtomicUsize::new(0),
            cap,
            contended: AtomicU64::new(0),
        }
    }

    /// Record `value` into the histogram `name`, admitting it if new.
    pub(crate) fn record_histogram(
        &self,
        name: &str,
        value: f64,
        attrs: &[KeyValue],
    ) -> Result<(), Error> {
        if let Some(histogram) = self.histograms.get(name) {
            histogram.record(value, attrs);
            return Ok(());
        }
        let histogram = self.admit(name, InstrumentKind::Histogram, &self.histograms, |meter| {
            meter.f64_histogram(name.to_owned()).build()
        })?;
        histogram.record(value, attrs);
        Ok(())
    }

    /// Add `delta` to the counter `name`, admitting it if new.
    pub(crate) fn add_counter(
        &self,
        name: &str,
        delta: u64,
        attrs: &[KeyValue],
    ) -> Result<(), Error> {
        if let Some(counter) = self.counters.get(name) {
            counter.add(delta, attrs);
            return Ok(());
        }
        let counter = self.admit(name, InstrumentKind::Counter, &self.counters, |meter| {
            meter.u64_counter(name.to_owned()).build()
        })?;
        counter.add(delta, attrs);
        Ok(())
    }

    /// Set the gauge `name` to `value`, admitting it if new.
    pub(crate) fn set_gauge(&self, name: &str, value: f64, attrs: &[KeyValue]) -> Result<(), Error> {
        if let Some(gauge) = self.gauges.get(name) {
            gauge.record(value, attrs);
            return Ok(());
        }
        let gauge = self.admit(name, InstrumentKind::Gauge, &self.gauges, |meter| {
            meter.f64_gauge(name.to_owned()).build()
        })?;
        gauge.record(value, attrs);
        Ok(())
    }

    /// Number of admitted custom instruments, including in-flight
    /// reservations. Always within `[0, cap]`.
    pub(crate) fn count(&self) -> usize {
        self.cardinality.load(Ordering::Acquire)
    }

    /// How many reservations lost at least one CAS race.
    pub(crate) fn contention_retries(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }

    /// Cold path: validate, reserve a cardinality slot and create the
    /// instrument, resolving races through the namespace map.
    fn admit<T: Clone>(
        &self,
        name: &str,
        kind: InstrumentKind,
        map: &DashMap<String, T>,
        make: impl FnOnce(&Meter) -> T,
    ) -> Result<T, Error> {
        if let Err(reason) = validate_name(name) {
            return Err(self.fail(Error::InvalidName {
                name: name.to_owned(),
                reason,
            }));
        }
        match self.reserve() {
            Ok(()) => {}
            Err(ReserveFailure::CapExhausted { current }) => {
                // Another caller may have admitted this very name while the
                // cap filled up; serve the existing instrument in that case.
                if let Some(existing) = map.get(name) {
                    return Ok(existing.clone());
                }
                return Err(self.fail(Error::CapReached {
                    name: name.to_owned(),
                    current,
                    cap: self.cap,
                }));
            }
            Err(ReserveFailure::Contended { retries }) => {
                return Err(self.fail(Error::UpdateConflict {
                    operation: kind.as_str(),
                    retries,
                }));
            }
        }
        match self.kinds.entry(name.to_owned()) {
            Entry::Vacant(slot) => {
                let instrument = make(&self.meter);
                map.insert(name.to_owned(), instrument.clone());
                slot.insert(kind);
                Ok(instrument)
            }
            Entry::Occupied(entry) => {
                // Lost the admission race; the reservation is not needed.
                self.release();
                let existing = *entry.get();
                drop(entry);
                if existing != kind {
                    return Err(self.fail(Error::InvalidName {
                        name: name.to_owned(),
                        reason: "name is already registered as a different instrument kind",
                    }));
                }
                // The winner publishes the typed instrument before the kind,
                // so this resolves on the first pass in practice.
                let mut attempts: u32 = 0;
                loop {
                    if let Some(existing) = map.get(name) {
                        return Ok(existing.clone());
                    }
                    attempts += 1;
                    if attempts >= RESERVE_ATTEMPTS {
                        return Err(self.fail(Error::UpdateConflict {
                            operation: kind.as_str(),
                            retries: attempts,
                        }));
                    }
                    backoff(attempts);
                }
            }
        }
    }

    /// Move the cardinality counter from `n` to `n + 1` while `n < cap`.
    fn reserve(&self) -> Result<(), ReserveFailure> {
        let mut attempts: u32 = 0;
        loop {
            let current = self.cardinality.load(Ordering::Acquire);
            if current >= self.cap {
                return Err(ReserveFailure::CapExhausted { current });
            }
            match self.cardinality.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if attempts > 0 {
                        self.contended.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(());
                }
                Err(_) => {
                    attempts += 1;
                    if attempts >= RESERVE_ATTEMPTS {
                        return Err(ReserveFailure::Contended { retries: attempts });
                    }
                    backoff(attempts);
                }
            }
        }
    }

    /// Give a speculatively reserved slot back.
    fn release(&self) {
        self.cardinality.fetch_sub(1, Ordering::AcqRel);
    }

    /// Count a rejected operation and surface it through the event stream.
    fn fail(&self, err: Error) -> Error {
        self.failures.add(1, &[]);
        events::emit(
            &self.events,
            Event::new(EventKind::Error, "custom metric rejected").with("error", &err),
        );
        err
    }
}

/// Escalating backoff for lost races: spin first, then yield, then sleep with
/// capped exponential growth (at most 1 ms).
fn backoff(attempt: u32) {
    match attempt {
        0..=3 => std::hint::spin_loop(),
        4..=15 => thread::yield_now(),
        _ => {
            let exp = (attempt - 15).min(10);
            let micros = (1_u64 << exp).min(1_000);
            thread::sleep(Duration::from_micros(micros));
        }
    }
}

/// Check a custom metric name against the naming rules.
///
/// Only called on the cold path, never on cache hits.
pub(crate) fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name is empty");
    }
    if name.len() > MAX_NAME_LEN {
        return Err("name is longer than 255 characters");
    }
    for prefix in RESERVED_PREFIXES {
        if name.starts_with(prefix) {
            return Err("name starts with a reserved prefix");
        }
    }
    if !NAME_PATTERN.is_match(name) {
        return Err("name must start with a letter and contain only letters, digits, '_', '.' or '-'");
    }
    Ok(())
}
