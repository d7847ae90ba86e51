use crate::model::Span;
use std::fmt;
use std::sync::Mutex;

/// Sink for finished spans.
///
/// Implementations receive every span the tracer decided to report and own
/// everything from there: batching, encoding, transport, retries. A reporter
/// must not panic back into the caller; misbehavior is contained upstream, but
/// well-behaved reporters swallow their own failures.
pub trait Reporter: Send + Sync + fmt::Debug {
    fn report(&self, span: Span);
}

/// Discards every span.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn report(&self, _span: Span) {}
}

/// Logs each span as a JSON line through `tracing`.
///
/// The default sink: useful until a real transport is wired in, and harmless
/// if it never is.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingReporter;

impl Reporter for LoggingReporter {
    fn report(&self, span: Span) {
        match serde_json::to_string(&span) {
            Ok(json) => tracing::info!(target: "braid_zipkin", span = %json),
            Err(error) => tracing::warn!(target: "braid_zipkin", %error, "span did not encode"),
        }
    }
}

/// Buffers reported spans in memory for inspection from tests.
#[derive(Debug, Default)]
pub struct InMemoryReporter {
    spans: Mutex<Vec<Span>>,
}

impl InMemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything reported so far.
    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().unwrap().clone()
    }

    /// Drains and returns everything reported so far.
    pub fn take(&self) -> Vec<Span> {
        std::mem::take(&mut *self.spans.lock().unwrap())
    }
}

impl Reporter for InMemoryReporter {
    fn report(&self, span: Span) {
        self.spans.lock().unwrap().push(span);
    }
}
