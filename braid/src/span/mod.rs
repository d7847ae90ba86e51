//! The span API: the handle instrumentation uses to mutate and finish one
//! unit of work.

mod mutable;
mod scoped;

pub use mutable::{Kind, MutableSpan};
pub use scoped::ScopedSpan;

use crate::clock::Clock;
use crate::context::TraceContext;
use crate::handler::FinishedSpanHandler;
use crate::recorder::{PendingSpans, TickClock};
use crate::tracer::Tracer;
use once_cell::sync::OnceCell;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Shared recording machinery behind a sampled span.
#[derive(Clone)]
pub(crate) struct RealSpan {
    pub(crate) state: Arc<Mutex<MutableSpan>>,
    pub(crate) clock: Arc<TickClock>,
    pub(crate) pending: Arc<PendingSpans>,
    pub(crate) handler: Arc<dyn FinishedSpanHandler>,
}

impl RealSpan {
    fn finish_at(&self, context: &TraceContext, timestamp: u64) {
        // the first remover wins; a second finish is a no-op
        if !self.pending.remove(context) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.set_finish_timestamp(timestamp);
        self.handler.handle(context, &mut state);
    }

    fn flush(&self, context: &TraceContext) {
        self.pending.remove(context);
        let mut state = self.state.lock().unwrap();
        self.handler.handle(context, &mut state);
    }
}

#[derive(Clone)]
struct LazySpan {
    tracer: Tracer,
    // the decorated context rides along so the pending-span table sees it
    // as reachable for as long as this handle lives
    resolved: Arc<OnceCell<Option<(TraceContext, RealSpan)>>>,
}

impl LazySpan {
    /// Duplicate resolution under a concurrent first touch converges on the
    /// same pending state, so the cell only guards the allocation.
    fn resolve(&self, context: &TraceContext) -> Option<&RealSpan> {
        self.resolved
            .get_or_init(|| self.tracer.recorder(context))
            .as_ref()
            .map(|(_, real)| real)
    }

    fn is_resolved(&self) -> bool {
        self.resolved.get().is_some()
    }
}

#[derive(Clone)]
enum SpanInner {
    Real(RealSpan),
    Noop,
    Lazy(LazySpan),
}

/// One in-flight span.
///
/// Handles are cheap to clone and may be mutated from any thread; every
/// mutator serializes on the shared state, so concurrent tags or annotations
/// interleave but never corrupt. Unsampled spans are no-ops end to end: no
/// state, no clock reads, no reporting.
///
/// Spans created by looking at the current context resolve lazily: until the
/// first mutator call they cost nothing beyond the handle itself.
#[derive(Clone)]
pub struct Span {
    context: TraceContext,
    inner: SpanInner,
}

impl Span {
    pub(crate) fn real(context: TraceContext, real: RealSpan) -> Span {
        Span {
            context,
            inner: SpanInner::Real(real),
        }
    }

    pub(crate) fn noop(context: TraceContext) -> Span {
        Span {
            context,
            inner: SpanInner::Noop,
        }
    }

    pub(crate) fn lazy(context: TraceContext, tracer: Tracer) -> Span {
        Span {
            context,
            inner: SpanInner::Lazy(LazySpan {
                tracer,
                resolved: Arc::new(OnceCell::new()),
            }),
        }
    }

    /// When true, no recording happens and nothing reaches the handlers,
    /// though the context still propagates on outgoing requests.
    pub fn is_noop(&self) -> bool {
        matches!(self.inner, SpanInner::Noop)
    }

    pub fn context(&self) -> &TraceContext {
        &self.context
    }

    /// A restricted view for user code that may decorate the span but must
    /// not control its lifecycle.
    pub fn customizer(&self) -> SpanCustomizer {
        SpanCustomizer {
            span: if self.is_noop() { None } else { Some(self.clone()) },
        }
    }

    fn delegate(&self) -> Option<&RealSpan> {
        match &self.inner {
            SpanInner::Real(real) => Some(real),
            SpanInner::Noop => None,
            SpanInner::Lazy(lazy) => lazy.resolve(&self.context),
        }
    }

    /// Records the start of work as of now.
    pub fn start(&self) -> &Self {
        if let Some(real) = self.delegate() {
            let timestamp = real.clock.current_time_micros();
            real.state.lock().unwrap().set_start_timestamp(timestamp);
        }
        self
    }

    /// Records the start of work at an explicit time.
    pub fn start_at(&self, timestamp: u64) -> &Self {
        if let Some(real) = self.delegate() {
            real.state.lock().unwrap().set_start_timestamp(timestamp);
        }
        self
    }

    pub fn name(&self, name: impl Into<String>) -> &Self {
        if let Some(real) = self.delegate() {
            real.state.lock().unwrap().set_name(name);
        }
        self
    }

    pub fn kind(&self, kind: Kind) -> &Self {
        if let Some(real) = self.delegate() {
            real.state.lock().unwrap().set_kind(kind);
        }
        self
    }

    /// Associates an event explaining latency with the current time.
    pub fn annotate(&self, value: impl Into<String>) -> &Self {
        let Some(real) = self.delegate() else {
            return self;
        };
        let timestamp = real.clock.current_time_micros();
        self.annotate_at(timestamp, value)
    }

    /// Associates an event explaining latency with an explicit time.
    ///
    /// The two-annotation span style predating span kinds is still accepted:
    /// `cs`/`sr` set the kind and start timestamp, `cr`/`ss` set the kind
    /// and finish the span. Anything else is recorded literally.
    pub fn annotate_at(&self, timestamp: u64, value: impl Into<String>) -> &Self {
        let Some(real) = self.delegate() else {
            return self;
        };
        let value = value.into();
        match value.as_str() {
            "cs" => {
                let mut state = real.state.lock().unwrap();
                state.set_kind(Kind::Client);
                state.set_start_timestamp(timestamp);
            }
            "sr" => {
                let mut state = real.state.lock().unwrap();
                state.set_kind(Kind::Server);
                state.set_start_timestamp(timestamp);
            }
            "cr" => {
                real.state.lock().unwrap().set_kind(Kind::Client);
                real.finish_at(&self.context, timestamp);
            }
            "ss" => {
                real.state.lock().unwrap().set_kind(Kind::Server);
                real.finish_at(&self.context, timestamp);
            }
            _ => real.state.lock().unwrap().annotate(timestamp, value),
        }
        self
    }

    pub fn tag(&self, key: impl Into<String>, value: impl Into<String>) -> &Self {
        if let Some(real) = self.delegate() {
            real.state.lock().unwrap().set_tag(key, value);
        }
        self
    }

    pub fn error(&self, error: Box<dyn Error + Send + Sync>) -> &Self {
        if let Some(real) = self.delegate() {
            real.state.lock().unwrap().set_error(error);
        }
        self
    }

    pub fn remote_service_name(&self, service_name: impl Into<String>) -> &Self {
        if let Some(real) = self.delegate() {
            real.state.lock().unwrap().set_remote_service_name(service_name);
        }
        self
    }

    /// Records the remote address. Returns true on a no-op span to prevent
    /// callers from taking fallback paths while unsampled.
    pub fn remote_ip_and_port(&self, ip: &str, port: u16) -> bool {
        match self.delegate() {
            Some(real) => real.state.lock().unwrap().remote_ip_and_port(ip, port),
            None => true,
        }
    }

    /// Reports the span complete as of now. At most one finish or flush is
    /// ever delivered; later calls are no-ops.
    pub fn finish(&self) {
        if let Some(real) = self.delegate() {
            real.finish_at(&self.context, real.clock.current_time_micros());
        }
    }

    /// Reports the span complete at an explicit time.
    pub fn finish_at(&self, timestamp: u64) {
        if let SpanInner::Lazy(lazy) = &self.inner {
            if !lazy.is_resolved() {
                return;
            }
        }
        if let Some(real) = self.delegate() {
            real.finish_at(&self.context, timestamp);
        }
    }

    /// Discards the span without reporting it.
    pub fn abandon(&self) {
        if let Some(real) = self.delegate() {
            real.pending.remove(&self.context);
        }
    }

    /// Reports whatever was recorded so far, even without a finish
    /// timestamp. Used for early or partial reporting.
    pub fn flush(&self) {
        if let SpanInner::Lazy(lazy) = &self.inner {
            if !lazy.is_resolved() {
                return;
            }
        }
        if let Some(real) = self.delegate() {
            real.flush(&self.context);
        }
    }
}

/// Real and lazy spans over the same context compare equal: code should not
/// behave differently depending on which it was handed.
impl PartialEq for Span {
    fn eq(&self, other: &Self) -> bool {
        match (&self.inner, &other.inner) {
            (SpanInner::Noop, SpanInner::Noop) => self.context == other.context,
            (SpanInner::Noop, _) | (_, SpanInner::Noop) => false,
            _ => self.context == other.context,
        }
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match &self.inner {
            SpanInner::Real(_) => "Span",
            SpanInner::Noop => "NoopSpan",
            SpanInner::Lazy(_) => "LazySpan",
        };
        write!(f, "{variant}({})", self.context)
    }
}

/// Mutation-only facade over a span: name, tags and annotations, but no
/// lifecycle hooks. Safe to hand to user code.
#[derive(Clone, Debug)]
pub struct SpanCustomizer {
    span: Option<Span>,
}

impl SpanCustomizer {
    /// A customizer that ignores everything.
    pub fn noop() -> Self {
        SpanCustomizer { span: None }
    }

    /// Guard potentially expensive decoration on this.
    pub fn is_noop(&self) -> bool {
        self.span.is_none()
    }

    pub fn name(&self, name: impl Into<String>) -> &Self {
        if let Some(span) = &self.span {
            span.name(name);
        }
        self
    }

    pub fn tag(&self, key: impl Into<String>, value: impl Into<String>) -> &Self {
        if let Some(span) = &self.span {
            span.tag(key, value);
        }
        self
    }

    pub fn annotate(&self, value: impl Into<String>) -> &Self {
        if let Some(span) = &self.span {
            span.annotate(value);
        }
        self
    }
}
