//! The tracer and the [`Tracing`] component that wires everything together.
//!
//! All tracing starts with a [`Span`]; a [`Tracer`] is how you get one,
//! whether fresh, continued from an extracted carrier, or joined onto a
//! client's span. [`Tracing`] owns the configured object graph and registers
//! itself as the process-wide current instance so statically configured
//! instrumentation can find it.

use crate::clock::{Clock, SystemClock};
use crate::context::{
    sampled_from, with_sampled, Extracted, ExtraItem, SamplingFlags, TraceContext,
    FLAG_SAMPLED_LOCAL, FLAG_SHARED,
};
use crate::current::{CurrentTraceContext, Scope, ThreadLocalCurrentTraceContext};
use crate::error::ConfigError;
use crate::handler::{compose, noop_aware, FinishedSpanHandler};
use crate::propagation::b3::B3Propagation;
use crate::propagation::{Extractor, Injector, Propagation, PropagationFactory};
use crate::recorder::PendingSpans;
use crate::reporter::{DefaultErrorParser, ErrorParser, MutableSpanConverter, ZipkinReportingHandler};
use crate::sampler::{AlwaysSample, Sampler};
use crate::span::{RealSpan, ScopedSpan, Span};
use braid_zipkin::{LoggingReporter, Reporter};
use rand::Rng;
use std::cell::RefCell;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// Creates and manages spans.
///
/// Handles are cheap to clone; every clone shares the same pending-span
/// table, sampler and handler pipeline, so spans materialized from any
/// thread converge on one shared state per trace/span identity.
#[derive(Clone)]
pub struct Tracer {
    pending: Arc<PendingSpans>,
    propagation_factory: Arc<dyn PropagationFactory>,
    propagation: Arc<dyn Propagation>,
    handler: Arc<dyn FinishedSpanHandler>,
    sampler: Arc<dyn Sampler>,
    current: Arc<dyn CurrentTraceContext>,
    trace_id_128: bool,
    supports_join: bool,
    always_sample_local: bool,
    noop: Arc<AtomicBool>,
}

thread_local! {
    // entry/exit spans opened by the interception seam, paired with their
    // scopes so stop_span restores correctly under nesting
    static ACTIVE_SPANS: RefCell<Vec<(Span, Scope)>> = const { RefCell::new(Vec::new()) };
}

impl Tracer {
    /// Explicitly creates a new trace: a root span unrelated to any context
    /// in scope.
    pub fn new_trace(&self) -> Span {
        let context = self.next_context(0, 0, 0, 0, 0, Vec::new());
        self.to_span_decorated(context)
    }

    /// Creates a span from whatever is in scope: a child of the current
    /// context, or a new trace when there is none.
    pub fn next_span(&self) -> Span {
        match self.current.get() {
            Some(parent) => self.new_child(&parent),
            None => self.new_trace(),
        }
    }

    /// Creates a child of `parent`, inheriting its sampling decision,
    /// propagated extras, and per-trace clock.
    pub fn new_child(&self, parent: &TraceContext) -> Span {
        let context = self.child_context(parent);
        self.to_span_decorated(context)
    }

    /// Continues whatever an extractor produced: a child of a full context,
    /// a root under a caller-chosen trace ID, or a fresh root honoring bare
    /// sampling flags.
    pub fn next_span_with(&self, extracted: Extracted) -> Span {
        if let Some(parent) = extracted.context().cloned() {
            return self.new_child(&parent);
        }
        let context = if let Some(id_context) = extracted.trace_id_context().copied() {
            self.next_context(
                id_context.flags(),
                id_context.trace_id_high(),
                id_context.trace_id(),
                0,
                0,
                extracted.extra().to_vec(),
            )
        } else {
            let flags = extracted.sampling_flags().unwrap_or(SamplingFlags::EMPTY);
            self.next_context(flags.flags, 0, 0, 0, 0, extracted.extra().to_vec())
        };
        self.to_span_decorated(context)
    }

    /// Joins an extracted server-side context, sharing the client's span ID
    /// instead of minting a child. Falls back to a child span when joining
    /// is unsupported by configuration or the propagation format.
    pub fn join_span(&self, context: &TraceContext) -> Span {
        if !self.supports_join {
            return self.new_child(context);
        }
        let mut flags = context.flags();
        if sampled_from(flags).is_none() {
            flags = with_sampled(self.sampler.is_sampled(context.trace_id()), flags);
        }
        flags |= FLAG_SHARED;
        if self.always_sample_local {
            flags |= FLAG_SAMPLED_LOCAL;
        }
        let local_root_id = if context.local_root_id() != 0 {
            context.local_root_id()
        } else {
            context.span_id()
        };
        let joined = context.with_flags_and_local_root(flags, local_root_id);
        self.to_span_decorated(joined)
    }

    /// Turns an existing context into a span handle. Views of the same
    /// trace and span identity share their recording state.
    pub fn to_span(&self, context: &TraceContext) -> Span {
        self.to_span_decorated(context.clone())
    }

    /// The span in scope, if any, as a handle that defers allocation until
    /// first use. Asking for the current span and never touching it is the
    /// common case, and it stays free.
    pub fn current_span(&self) -> Option<Span> {
        self.current
            .get()
            .map(|context| Span::lazy(context, self.clone()))
    }

    /// Sets `span`'s context current until the returned scope drops.
    pub fn with_span_in_scope(&self, span: &Span) -> Scope {
        self.current.new_scope(Some(span.context().clone()))
    }

    /// Starts a span scoped to the current thread, as a child of whatever
    /// was in scope.
    pub fn start_scoped_span(&self, name: impl Into<String>) -> ScopedSpan {
        let context = match self.current.get() {
            Some(parent) => self.child_context(&parent),
            None => self.next_context(0, 0, 0, 0, 0, Vec::new()),
        };
        let scope = self.current.new_scope(Some(context.clone()));
        if self.noop.load(Ordering::Relaxed) || !recordable(&context) {
            return ScopedSpan::noop(context, scope);
        }
        let pending = self.pending.get_or_create(&context, true);
        pending.state().lock().unwrap().set_name(name);
        ScopedSpan::real(context, scope, self.real_span(&pending))
    }

    /// Entry point for method interception: extracts the carrier, joins or
    /// continues the result, starts the span and puts it in scope until the
    /// matching [`stop_span`](Self::stop_span).
    pub fn create_entry_span(&self, carrier: &dyn Extractor) -> Span {
        let extracted = self.propagation.extract(carrier);
        let span = match extracted.context().cloned() {
            Some(context) if self.supports_join => self.join_span(&context),
            _ => self.next_span_with(extracted),
        };
        span.start();
        self.push_active(&span);
        span
    }

    /// Exit counterpart of [`create_entry_span`](Self::create_entry_span):
    /// opens a span for an outgoing call and injects its context into the
    /// carrier.
    pub fn create_exit_span(&self, carrier: &mut dyn Injector) -> Span {
        let span = self.next_span();
        span.start();
        self.propagation.inject(span.context(), carrier);
        self.push_active(&span);
        span
    }

    /// The innermost span opened by the seam on this thread, else the span
    /// in ambient scope.
    pub fn active_span(&self) -> Option<Span> {
        ACTIVE_SPANS
            .with(|stack| stack.borrow().last().map(|(span, _)| span.clone()))
            .or_else(|| self.current_span())
    }

    /// Closes the innermost seam-opened span: restores the previous scope,
    /// then finishes the span.
    pub fn stop_span(&self) {
        let popped = ACTIVE_SPANS.with(|stack| stack.borrow_mut().pop());
        if let Some((span, scope)) = popped {
            drop(scope);
            span.finish();
        }
    }

    fn push_active(&self, span: &Span) {
        let scope = self.current.new_scope(Some(span.context().clone()));
        ACTIVE_SPANS.with(|stack| stack.borrow_mut().push((span.clone(), scope)));
    }

    /// Resolution target for lazy spans: the decorated context rides along
    /// so it stays reachable while the handle is alive.
    pub(crate) fn recorder(&self, context: &TraceContext) -> Option<(TraceContext, RealSpan)> {
        if self.noop.load(Ordering::Relaxed) || !recordable(context) {
            return None;
        }
        let decorated = self.propagation_factory.decorate(context.clone());
        let pending = self.pending.get_or_create(&decorated, false);
        Some((decorated, self.real_span(&pending)))
    }

    pub(crate) fn pending_spans(&self) -> &Arc<PendingSpans> {
        &self.pending
    }

    fn to_span_decorated(&self, context: TraceContext) -> Span {
        let context = self.propagation_factory.decorate(context);
        if self.noop.load(Ordering::Relaxed) || !recordable(&context) {
            return Span::noop(context);
        }
        let pending = self.pending.get_or_create(&context, false);
        Span::real(context, self.real_span(&pending))
    }

    fn real_span(&self, pending: &crate::recorder::PendingSpan) -> RealSpan {
        RealSpan {
            state: pending.state().clone(),
            clock: pending.clock().clone(),
            pending: self.pending.clone(),
            handler: self.handler.clone(),
        }
    }

    fn child_context(&self, parent: &TraceContext) -> TraceContext {
        self.next_context(
            parent.flags() & !FLAG_SHARED,
            parent.trace_id_high(),
            parent.trace_id(),
            parent.span_id(),
            parent.local_root_id(),
            parent.extra().to_vec(),
        )
    }

    /// Mints identity and settles the sampling decision. A zero trace ID
    /// means "new trace": the root span ID doubles as the trace ID. The
    /// local root is carried from the parent or becomes this span.
    fn next_context(
        &self,
        flags: u8,
        trace_id_high: u64,
        trace_id: u64,
        parent_id: u64,
        local_root_id: u64,
        extra: Vec<ExtraItem>,
    ) -> TraceContext {
        let span_id = self.next_id();
        let (trace_id_high, trace_id) = if trace_id == 0 {
            let high = if self.trace_id_128 { self.next_id() } else { 0 };
            (high, span_id)
        } else {
            (trace_id_high, trace_id)
        };
        let mut flags = flags;
        if sampled_from(flags).is_none() {
            flags = with_sampled(self.sampler.is_sampled(trace_id), flags);
        }
        if self.always_sample_local {
            flags |= FLAG_SAMPLED_LOCAL;
        }
        let local_root_id = if local_root_id != 0 { local_root_id } else { span_id };
        let context = TraceContext::builder()
            .trace_id_high(trace_id_high)
            .trace_id(trace_id)
            .parent_id(if parent_id == 0 { None } else { Some(parent_id) })
            .span_id(span_id)
            .local_root_id(local_root_id)
            .flags(flags)
            .extra(extra)
            .build();
        self.propagation_factory.decorate(context)
    }

    fn next_id(&self) -> u64 {
        let mut rng = rand::rng();
        loop {
            let id: u64 = rng.random();
            if id != 0 {
                return id;
            }
        }
    }
}

fn recordable(context: &TraceContext) -> bool {
    context.sampled() == Some(true) || context.sampled_local()
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("sampler", &self.sampler)
            .field("supports_join", &self.supports_join)
            .field("trace_id_128", &self.trace_id_128)
            .finish()
    }
}

struct TracingInner {
    tracer: Tracer,
    propagation: Arc<dyn Propagation>,
    propagation_factory: Arc<dyn PropagationFactory>,
    sampler: Arc<dyn Sampler>,
    current: Arc<dyn CurrentTraceContext>,
    noop: Arc<AtomicBool>,
}

/// The configured tracing component.
///
/// Instances built via [`Tracing::builder`] register themselves as the
/// process-wide current instance when none exists, so statically configured
/// instrumentation can reach tracing through [`Tracing::current`]. Dropping
/// the handle does not deregister; call [`close`](Self::close).
#[derive(Clone)]
pub struct Tracing {
    inner: Arc<TracingInner>,
}

static CURRENT_TRACING: OnceLock<RwLock<Option<Tracing>>> = OnceLock::new();

fn registry() -> &'static RwLock<Option<Tracing>> {
    CURRENT_TRACING.get_or_init(|| RwLock::new(None))
}

impl Tracing {
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn tracer(&self) -> Tracer {
        self.inner.tracer.clone()
    }

    /// The propagation used to inject or extract contexts on remote
    /// requests.
    pub fn propagation(&self) -> Arc<dyn Propagation> {
        self.inner.propagation.clone()
    }

    pub fn propagation_factory(&self) -> Arc<dyn PropagationFactory> {
        self.inner.propagation_factory.clone()
    }

    pub fn sampler(&self) -> Arc<dyn Sampler> {
        self.inner.sampler.clone()
    }

    pub fn current_trace_context(&self) -> Arc<dyn CurrentTraceContext> {
        self.inner.current.clone()
    }

    /// The microsecond clock coherent for all spans of `context`'s trace.
    /// Useful for timing things by hand: system clock adjustments mid-trace
    /// do not affect it.
    pub fn clock(&self, context: &TraceContext) -> Arc<dyn Clock> {
        self.inner
            .tracer
            .pending_spans()
            .get_or_create(context, false)
            .clock()
            .clone()
    }

    /// When true, nothing records or reports, though contexts still
    /// propagate on outgoing requests.
    pub fn is_noop(&self) -> bool {
        self.inner.noop.load(Ordering::Relaxed)
    }

    /// Kill switch for risk scenarios: set true to drop all data without
    /// reconfiguring instrumentation.
    pub fn set_noop(&self, noop: bool) {
        self.inner.noop.store(noop, Ordering::Relaxed);
    }

    /// The most recently registered instance that has not been closed.
    /// Do not cache the result.
    pub fn current() -> Option<Tracing> {
        registry().read().unwrap().clone()
    }

    /// The current instance's tracer, if one is registered.
    pub fn current_tracer() -> Option<Tracer> {
        Tracing::current().map(|tracing| tracing.tracer())
    }

    fn maybe_set_current(&self) {
        let mut current = registry().write().unwrap();
        if current.is_none() {
            *current = Some(self.clone());
        }
    }

    /// Deregisters this instance if it is current. Safe to call more than
    /// once, and never clears an instance other than itself.
    pub fn close(&self) {
        let mut current = registry().write().unwrap();
        if let Some(existing) = current.as_ref() {
            if Arc::ptr_eq(&existing.inner, &self.inner) {
                *current = None;
            }
        }
    }
}

impl fmt::Debug for Tracing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracing")
            .field("tracer", &self.inner.tracer)
            .field("noop", &self.is_noop())
            .finish()
    }
}

/// Configures a [`Tracing`] instance.
pub struct Builder {
    local_service_name: String,
    local_ip: Option<IpAddr>,
    local_port: u16,
    span_reporter: Option<Arc<dyn Reporter>>,
    clock: Option<Arc<dyn Clock>>,
    sampler: Arc<dyn Sampler>,
    current_trace_context: Arc<dyn CurrentTraceContext>,
    propagation_factory: Arc<dyn PropagationFactory>,
    trace_id_128: bool,
    supports_join: bool,
    error_parser: Arc<dyn ErrorParser>,
    finished_span_handlers: Vec<Arc<dyn FinishedSpanHandler>>,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            local_service_name: "unknown".to_owned(),
            local_ip: None,
            local_port: 0,
            span_reporter: None,
            clock: None,
            sampler: Arc::new(AlwaysSample),
            current_trace_context: Arc::new(ThreadLocalCurrentTraceContext::new()),
            propagation_factory: B3Propagation::factory(),
            trace_id_128: false,
            supports_join: true,
            error_parser: Arc::new(DefaultErrorParser),
            finished_span_handlers: Vec::new(),
        }
    }
}

impl Builder {
    /// Label of this node in the service graph, such as "favstar". Used as
    /// the local endpoint of reported spans; lower-cased for consistency of
    /// lookups. Defaults to "unknown".
    pub fn local_service_name(mut self, local_service_name: impl Into<String>) -> Self {
        self.local_service_name = local_service_name.into();
        self
    }

    /// The primary IP address associated with this service.
    pub fn local_ip(mut self, local_ip: IpAddr) -> Self {
        self.local_ip = Some(local_ip);
        self
    }

    /// The primary listen port associated with this service. No default.
    pub fn local_port(mut self, local_port: u16) -> Self {
        self.local_port = local_port;
        self
    }

    /// Where finished spans go. Defaults to logging them; batching and
    /// transport belong to the reporter implementation.
    pub fn span_reporter(mut self, span_reporter: Arc<dyn Reporter>) -> Self {
        self.span_reporter = Some(span_reporter);
        self
    }

    /// Wall-clock source read once per trace; ticks carry the timestamps
    /// from there so one trace never sees clock skew.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Decides whether the overhead of tracing occurs and whether a trace
    /// is reported. Defaults to always sampling.
    pub fn sampler(mut self, sampler: Arc<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// In-process propagation, thread-local by default. Override to
    /// synchronize with other scoping mechanisms.
    pub fn current_trace_context(
        mut self,
        current_trace_context: Arc<dyn CurrentTraceContext>,
    ) -> Self {
        self.current_trace_context = current_trace_context;
        self
    }

    /// How contexts are injected and extracted on remote requests.
    /// Defaults to the B3 multi-header format.
    pub fn propagation_factory(mut self, propagation_factory: Arc<dyn PropagationFactory>) -> Self {
        self.propagation_factory = propagation_factory;
        self
    }

    /// When true, new root spans get 128-bit trace IDs. Defaults to false.
    pub fn trace_id_128(mut self, trace_id_128: bool) -> Self {
        self.trace_id_128 = trace_id_128;
        self
    }

    /// Whether a server may reuse a client's span ID. Set false for
    /// backends that reject shared IDs; implicitly false when the
    /// propagation format cannot carry them. Defaults to true.
    pub fn supports_join(mut self, supports_join: bool) -> Self {
        self.supports_join = supports_join;
        self
    }

    pub fn error_parser(mut self, error_parser: Arc<dyn ErrorParser>) -> Self {
        self.error_parser = error_parser;
        self
    }

    /// Adds a handler invoked once per finished span, before the reporter.
    /// Handlers see the trace context and may mutate the span; they also
    /// run for spans the reporter will never see when they request local
    /// sampling.
    pub fn add_finished_span_handler(mut self, handler: Arc<dyn FinishedSpanHandler>) -> Self {
        self.finished_span_handlers.push(handler);
        self
    }

    pub fn build(self) -> Result<Tracing, ConfigError> {
        let local_service_name = self.local_service_name.trim().to_ascii_lowercase();
        if local_service_name.is_empty() {
            return Err(ConfigError::EmptyServiceName);
        }
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let noop = Arc::new(AtomicBool::new(false));

        // the reporter runs last, after user-supplied handlers
        let reporter = self
            .span_reporter
            .unwrap_or_else(|| Arc::new(LoggingReporter));
        let converter = MutableSpanConverter::new(
            self.error_parser,
            local_service_name,
            self.local_ip,
            self.local_port,
        );
        let mut handlers = self.finished_span_handlers;
        handlers.push(Arc::new(ZipkinReportingHandler::new(reporter, converter)));

        let handler = noop_aware(compose(handlers), noop.clone());
        let always_sample_local = handler.always_sample_local();
        let pending = Arc::new(PendingSpans::new(clock.clone(), handler.clone(), noop.clone()));
        let propagation = self.propagation_factory.create();

        let tracer = Tracer {
            pending,
            propagation_factory: self.propagation_factory.clone(),
            propagation: propagation.clone(),
            handler,
            sampler: self.sampler.clone(),
            current: self.current_trace_context.clone(),
            trace_id_128: self.trace_id_128 || self.propagation_factory.requires_128bit_trace_id(),
            supports_join: self.supports_join && self.propagation_factory.supports_join(),
            always_sample_local,
            noop: noop.clone(),
        };
        let tracing = Tracing {
            inner: Arc::new(TracingInner {
                tracer,
                propagation,
                propagation_factory: self.propagation_factory,
                sampler: self.sampler,
                current: self.current_trace_context,
                noop,
            }),
        };
        tracing.maybe_set_current();
        Ok(tracing)
    }
}

/// [`Tracer::create_entry_span`] on the registered current instance, or
/// `None` when tracing is not configured.
pub fn create_entry_span(carrier: &dyn Extractor) -> Option<Span> {
    Tracing::current_tracer().map(|tracer| tracer.create_entry_span(carrier))
}

/// [`Tracer::create_exit_span`] on the registered current instance, or
/// `None` when tracing is not configured.
pub fn create_exit_span(carrier: &mut dyn Injector) -> Option<Span> {
    Tracing::current_tracer().map(|tracer| tracer.create_exit_span(carrier))
}

/// [`Tracer::active_span`] on the registered current instance.
pub fn active_span() -> Option<Span> {
    Tracing::current_tracer().and_then(|tracer| tracer.active_span())
}

/// [`Tracer::stop_span`] on the registered current instance.
pub fn stop_span() {
    if let Some(tracer) = Tracing::current_tracer() {
        tracer.stop_span();
    }
}
