//! Distributed tracing core: create, mutate, propagate and report trace
//! spans describing units of work in a running service.
//!
//! # Overview
//!
//! All instrumentation starts with a [`Span`], obtained from a [`Tracer`]:
//! fresh ([`Tracer::new_trace`]), continued from a remote carrier
//! ([`Tracer::next_span_with`]), or sharing a client's identity
//! ([`Tracer::join_span`]). Spans accumulate a name, kind, tags, annotations
//! and timing; on [`Span::finish`] the state runs once through the
//! configured [`FinishedSpanHandler`] pipeline and on to a span reporter.
//!
//! ```
//! use braid::Tracing;
//!
//! let tracing = Tracing::builder()
//!     .local_service_name("favstar")
//!     .build()
//!     .expect("valid configuration");
//! let tracer = tracing.tracer();
//!
//! let span = tracer.new_trace();
//! span.name("encode").start();
//! // ... the work being timed ...
//! span.finish();
//! ```
//!
//! Trace identity crosses process boundaries in the B3 formats (multi-header
//! and single-header), via [`propagation`]; user-defined baggage rides along
//! with [`propagation::extra`]. In-process, the current context propagates
//! through a thread-local scope ([`CurrentTraceContext`]).
//!
//! Tracing never breaks the instrumented application: malformed inbound
//! headers fall back to a fresh trace, double finishes are no-ops, handler
//! failures are contained and logged, and spans dropped without a finish are
//! recovered and reported by the pending-span table when every handle to
//! their context is gone.

mod clock;
mod context;
mod current;
mod error;
mod handler;
pub mod propagation;
mod recorder;
mod reporter;
mod sampler;
pub mod span;
mod tracer;

pub use clock::{Clock, SystemClock};
pub use context::{
    Builder as TraceContextBuilder, Extracted, ExtraItem, SamplingFlags, TraceContext,
    TraceIdContext,
};
pub use current::{CurrentTraceContext, Scope, ThreadLocalCurrentTraceContext};
pub use error::ConfigError;
pub use handler::{compose, noop_aware, FinishedSpanHandler, NoopHandler};
pub use reporter::{DefaultErrorParser, ErrorParser};
pub use sampler::{AlwaysSample, CountingSampler, NeverSample, Sampler};
pub use span::{Kind, MutableSpan, ScopedSpan, Span, SpanCustomizer};
pub use tracer::{
    active_span, create_entry_span, create_exit_span, stop_span, Builder as TracingBuilder,
    Tracer, Tracing,
};
