//! A span bound to a scope, for modeling the latency of one method block.

use crate::clock::Clock;
use crate::context::TraceContext;
use crate::current::Scope;
use crate::span::mutable::Kind;
use crate::span::RealSpan;
use std::error::Error;
use std::fmt;

enum ScopedInner {
    Real(RealSpan),
    Noop,
}

/// A span in scope on the current thread until [`finish`](Self::finish).
///
/// Intended for in-process synchronous code; the scope it holds is bound to
/// the creating thread, so this type cannot leave it. For remote work or
/// anything crossing threads, use [`Span`](crate::Span) instead.
///
/// Dropping without `finish` restores the previous context but does not
/// report; the span is then recovered later by the pending-span table like
/// any other abandoned span.
pub struct ScopedSpan {
    context: TraceContext,
    scope: Option<Scope>,
    inner: ScopedInner,
}

impl ScopedSpan {
    pub(crate) fn real(context: TraceContext, scope: Scope, real: RealSpan) -> Self {
        ScopedSpan {
            context,
            scope: Some(scope),
            inner: ScopedInner::Real(real),
        }
    }

    pub(crate) fn noop(context: TraceContext, scope: Scope) -> Self {
        ScopedSpan {
            context,
            scope: Some(scope),
            inner: ScopedInner::Noop,
        }
    }

    /// When true, nothing is recorded, though the context stays in scope
    /// until [`finish`](Self::finish).
    pub fn is_noop(&self) -> bool {
        matches!(self.inner, ScopedInner::Noop)
    }

    /// There is always a context in scope by definition; it is exposed for
    /// uses like setting extra fields.
    pub fn context(&self) -> &TraceContext {
        &self.context
    }

    pub fn name(&self, name: impl Into<String>) -> &Self {
        if let ScopedInner::Real(real) = &self.inner {
            real.state.lock().unwrap().set_name(name);
        }
        self
    }

    pub fn kind(&self, kind: Kind) -> &Self {
        if let ScopedInner::Real(real) = &self.inner {
            real.state.lock().unwrap().set_kind(kind);
        }
        self
    }

    pub fn annotate(&self, value: impl Into<String>) -> &Self {
        if let ScopedInner::Real(real) = &self.inner {
            let timestamp = real.clock.current_time_micros();
            real.state.lock().unwrap().annotate(timestamp, value);
        }
        self
    }

    pub fn tag(&self, key: impl Into<String>, value: impl Into<String>) -> &Self {
        if let ScopedInner::Real(real) = &self.inner {
            real.state.lock().unwrap().set_tag(key, value);
        }
        self
    }

    pub fn error(&self, error: Box<dyn Error + Send + Sync>) -> &Self {
        if let ScopedInner::Real(real) = &self.inner {
            real.state.lock().unwrap().set_error(error);
        }
        self
    }

    /// Closes the scope, then reports the span with the most precise
    /// duration possible.
    pub fn finish(mut self) {
        self.scope.take();
        if let ScopedInner::Real(real) = &self.inner {
            let timestamp = real.clock.current_time_micros();
            if !real.pending.remove(&self.context) {
                return; // don't double-report
            }
            let mut state = real.state.lock().unwrap();
            state.set_finish_timestamp(timestamp);
            real.handler.handle(&self.context, &mut state);
        }
    }
}

impl fmt::Debug for ScopedSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match &self.inner {
            ScopedInner::Real(_) => "ScopedSpan",
            ScopedInner::Noop => "NoopScopedSpan",
        };
        write!(f, "{variant}({})", self.context)
    }
}
