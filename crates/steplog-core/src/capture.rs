//! Capture of ambient warnings and log events.
//!
//! A [`CaptureSink`] is an explicit handle shared between the tick engine
//! and whatever produces diagnostics. The engine switches each record kind
//! on and off, stamps the current tick into the sink, and drains the
//! buffered records into the store on every save.
//!
//! Warnings are pushed with [`CaptureSink::warning`]. Log events reach the
//! sink through [`CaptureLayer`], a `tracing` layer that can sit next to
//! any other subscriber layer:
//!
//! ```no_run
//! use tracing_subscriber::prelude::*;
//! # let sink = steplog_core::capture::CaptureSink::new();
//! tracing_subscriber::registry()
//!     .with(steplog_core::capture::CaptureLayer::new(sink.clone()))
//!     .init();
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use steplog_types::{CapturedRecord, RecordKind};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

#[derive(Debug, Default)]
struct SinkState {
    rank: AtomicU32,
    step: AtomicU64,
    warnings_enabled: AtomicBool,
    logging_enabled: AtomicBool,
    warnings: Mutex<Vec<CapturedRecord>>,
    logging: Mutex<Vec<CapturedRecord>>,
}

impl SinkState {
    const fn flag(&self, kind: RecordKind) -> &AtomicBool {
        match kind {
            RecordKind::Warning => &self.warnings_enabled,
            RecordKind::Logging => &self.logging_enabled,
        }
    }

    const fn buffer(&self, kind: RecordKind) -> &Mutex<Vec<CapturedRecord>> {
        match kind {
            RecordKind::Warning => &self.warnings,
            RecordKind::Logging => &self.logging,
        }
    }
}

/// Shared buffer for captured warnings and log events.
///
/// Clones share the same buffers and switches.
#[derive(Debug, Clone, Default)]
pub struct CaptureSink {
    inner: Arc<SinkState>,
}

impl CaptureSink {
    /// A sink with both kinds switched off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether records of this kind are currently kept.
    pub fn is_enabled(&self, kind: RecordKind) -> bool {
        self.inner.flag(kind).load(Ordering::Acquire)
    }

    /// Switch capture of one kind, returning the previous setting.
    pub(crate) fn set_enabled(&self, kind: RecordKind, enabled: bool) -> bool {
        self.inner.flag(kind).swap(enabled, Ordering::AcqRel)
    }

    pub(crate) fn set_rank(&self, rank: u32) {
        self.inner.rank.store(rank, Ordering::Release);
    }

    pub(crate) fn set_step(&self, step: u64) {
        self.inner.step.store(step, Ordering::Release);
    }

    /// Record a warning attributed to the caller's source location.
    ///
    /// Returns whether the warning was kept (warnings capture is on).
    #[track_caller]
    pub fn warning(&self, category: &str, message: impl Into<String>) -> bool {
        let location = core::panic::Location::caller();
        self.record(
            RecordKind::Warning,
            category,
            message.into(),
            Some(location.file()),
            Some(location.line()),
        )
    }

    /// Record one event of the given kind if that kind is enabled.
    pub fn record(
        &self,
        kind: RecordKind,
        category: &str,
        message: String,
        filename: Option<&str>,
        lineno: Option<u32>,
    ) -> bool {
        if !self.is_enabled(kind) {
            return false;
        }
        let record = CapturedRecord {
            rank: self.inner.rank.load(Ordering::Acquire),
            step: self.inner.step.load(Ordering::Acquire),
            unixtime: unix_now(),
            category: category.to_owned(),
            message,
            filename: filename.map(str::to_owned),
            lineno,
        };
        self.lock(kind).push(record);
        true
    }

    /// Number of records waiting to be flushed.
    pub fn pending(&self, kind: RecordKind) -> usize {
        self.lock(kind).len()
    }

    /// Take every buffered record of one kind.
    pub(crate) fn drain(&self, kind: RecordKind) -> Vec<CapturedRecord> {
        core::mem::take(&mut *self.lock(kind))
    }

    /// Put records back at the front of the buffer after a failed flush.
    pub(crate) fn requeue(&self, kind: RecordKind, mut records: Vec<CapturedRecord>) {
        let mut buffer = self.lock(kind);
        records.append(&mut buffer);
        *buffer = records;
    }

    fn lock(&self, kind: RecordKind) -> std::sync::MutexGuard<'_, Vec<CapturedRecord>> {
        self.inner
            .buffer(kind)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Seconds since the Unix epoch with sub-second precision.
pub(crate) fn unix_now() -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let micros = chrono::Utc::now().timestamp_micros() as f64;
    micros / 1e6
}

// ---------------------------------------------------------------------------
// tracing layer
// ---------------------------------------------------------------------------

/// `tracing` layer forwarding events into a [`CaptureSink`].
///
/// By default only `WARN` and `ERROR` events are kept.
#[derive(Debug, Clone)]
pub struct CaptureLayer {
    sink: CaptureSink,
    max_level: Level,
}

impl CaptureLayer {
    /// Forward `WARN` and more severe events into `sink`.
    pub const fn new(sink: CaptureSink) -> Self {
        Self {
            sink,
            max_level: Level::WARN,
        }
    }

    /// Also keep events up to `level` in verbosity.
    #[must_use]
    pub const fn with_max_level(mut self, level: Level) -> Self {
        self.max_level = level;
        self
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > self.max_level || !self.sink.is_enabled(RecordKind::Logging) {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.sink.record(
            RecordKind::Logging,
            meta.level().as_str(),
            visitor.finish(),
            meta.file(),
            meta.line(),
        );
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.join(" ")
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            value.clone_into(&mut self.message);
        } else {
            self.fields.push(format!("{}={value}", field.name()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn core::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={value:?}", field.name()));
        }
    }
}
