//! The finished-span handler pipeline.
//!
//! Handlers run exactly once per finished (or flushed) span, before any
//! reporting. Returning `false` stops later handlers and keeps the span from
//! the reporter. A handler must never be able to break the instrumented
//! request path: the [`noop_aware`] boundary catches panics and treats them
//! as a refusal.

use crate::context::TraceContext;
use crate::span::MutableSpan;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Receives spans at completion, with mutable access for late adjustments.
pub trait FinishedSpanHandler: Send + Sync + fmt::Debug {
    /// Processes a finished span. Return `true` to pass the span along to
    /// later handlers and the reporter, `false` to drop it here.
    fn handle(&self, context: &TraceContext, span: &mut MutableSpan) -> bool;

    /// When true, spans are recorded and delivered to handlers even if the
    /// remote sampling decision was negative. Used for local aggregation
    /// without affecting what goes on the wire.
    fn always_sample_local(&self) -> bool {
        false
    }

    /// True only for the no-op handler; lets composition absorb it.
    fn is_noop(&self) -> bool {
        false
    }
}

/// Drops every span.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHandler;

impl FinishedSpanHandler for NoopHandler {
    fn handle(&self, _context: &TraceContext, _span: &mut MutableSpan) -> bool {
        false
    }

    fn is_noop(&self) -> bool {
        true
    }
}

/// Composes handlers into a right-nested chain that runs them in order and
/// stops at the first refusal. No-op handlers are absorbed rather than
/// wrapped; an empty list composes to the no-op handler.
pub fn compose(handlers: Vec<Arc<dyn FinishedSpanHandler>>) -> Arc<dyn FinishedSpanHandler> {
    let mut result: Option<Arc<dyn FinishedSpanHandler>> = None;
    for next in handlers {
        if next.is_noop() {
            continue;
        }
        result = Some(match result {
            None => next,
            Some(first) => Arc::new(Composite::new(first, next)),
        });
    }
    result.unwrap_or_else(|| Arc::new(NoopHandler))
}

/// Wraps `handler` so a raised process-wide noop flag short-circuits to
/// `false` without invoking it, and so a panicking handler is logged and
/// counted as a refusal instead of unwinding into application code.
pub fn noop_aware(
    handler: Arc<dyn FinishedSpanHandler>,
    noop: Arc<AtomicBool>,
) -> Arc<dyn FinishedSpanHandler> {
    if handler.is_noop() {
        return handler;
    }
    Arc::new(NoopAware { delegate: handler, noop })
}

struct Composite {
    first: Arc<dyn FinishedSpanHandler>,
    second: Arc<dyn FinishedSpanHandler>,
    always_sample_local: bool,
}

impl Composite {
    fn new(first: Arc<dyn FinishedSpanHandler>, second: Arc<dyn FinishedSpanHandler>) -> Self {
        let always_sample_local = first.always_sample_local() || second.always_sample_local();
        Composite {
            first,
            second,
            always_sample_local,
        }
    }
}

impl FinishedSpanHandler for Composite {
    fn handle(&self, context: &TraceContext, span: &mut MutableSpan) -> bool {
        self.first.handle(context, span) && self.second.handle(context, span)
    }

    fn always_sample_local(&self) -> bool {
        self.always_sample_local
    }
}

impl fmt::Debug for Composite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Composite({:?}, {:?})", self.first, self.second)
    }
}

struct NoopAware {
    delegate: Arc<dyn FinishedSpanHandler>,
    noop: Arc<AtomicBool>,
}

impl FinishedSpanHandler for NoopAware {
    fn handle(&self, context: &TraceContext, span: &mut MutableSpan) -> bool {
        if self.noop.load(Ordering::Relaxed) {
            return false;
        }
        match catch_unwind(AssertUnwindSafe(|| self.delegate.handle(context, span))) {
            Ok(accepted) => accepted,
            Err(_) => {
                warn!(target: "braid", context = %context, "finished span handler panicked");
                false
            }
        }
    }

    fn always_sample_local(&self) -> bool {
        self.delegate.always_sample_local()
    }
}

impl fmt::Debug for NoopAware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NoopAware({:?})", self.delegate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn context() -> TraceContext {
        TraceContext::builder().trace_id(1).span_id(2).sampled(true).build()
    }

    #[derive(Debug, Default)]
    struct Recording {
        calls: AtomicUsize,
        accept: bool,
    }

    impl Recording {
        fn accepting() -> Arc<Self> {
            Arc::new(Recording { calls: AtomicUsize::new(0), accept: true })
        }

        fn refusing() -> Arc<Self> {
            Arc::new(Recording { calls: AtomicUsize::new(0), accept: false })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }
    }

    impl FinishedSpanHandler for Recording {
        fn handle(&self, _context: &TraceContext, _span: &mut MutableSpan) -> bool {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.accept
        }
    }

    #[derive(Debug)]
    struct Panicking;

    impl FinishedSpanHandler for Panicking {
        fn handle(&self, _context: &TraceContext, _span: &mut MutableSpan) -> bool {
            panic!("misbehaving handler");
        }
    }

    #[test]
    fn compose_runs_in_order_and_short_circuits() {
        let first = Recording::refusing();
        let second = Recording::accepting();
        let handlers: Vec<Arc<dyn FinishedSpanHandler>> = vec![first.clone(), second.clone()];
        let composed = compose(handlers);

        let mut span = MutableSpan::new();
        assert!(!composed.handle(&context(), &mut span));
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 0);
    }

    #[test]
    fn compose_absorbs_noop() {
        let only = Recording::accepting();
        let handlers: Vec<Arc<dyn FinishedSpanHandler>> =
            vec![Arc::new(NoopHandler), only.clone(), Arc::new(NoopHandler)];
        let composed = compose(handlers);
        // the single real handler is returned unwrapped
        assert!(composed.handle(&context(), &mut MutableSpan::new()));
        assert_eq!(only.calls(), 1);

        assert!(compose(vec![]).is_noop());
    }

    #[test]
    fn noop_aware_short_circuits_on_flag() {
        let inner = Recording::accepting();
        let noop = Arc::new(AtomicBool::new(false));
        let handler = noop_aware(inner.clone(), noop.clone());

        assert!(handler.handle(&context(), &mut MutableSpan::new()));
        noop.store(true, Ordering::Relaxed);
        assert!(!handler.handle(&context(), &mut MutableSpan::new()));
        assert_eq!(inner.calls(), 1);
    }

    #[test]
    fn noop_aware_contains_panics() {
        let handler = noop_aware(Arc::new(Panicking), Arc::new(AtomicBool::new(false)));
        assert!(!handler.handle(&context(), &mut MutableSpan::new()));
    }

    #[test]
    fn composite_always_sample_local_is_an_or() {
        #[derive(Debug)]
        struct Local;
        impl FinishedSpanHandler for Local {
            fn handle(&self, _context: &TraceContext, _span: &mut MutableSpan) -> bool {
                true
            }
            fn always_sample_local(&self) -> bool {
                true
            }
        }

        let handlers: Vec<Arc<dyn FinishedSpanHandler>> =
            vec![Recording::accepting(), Arc::new(Local)];
        let composed = compose(handlers);
        assert!(composed.always_sample_local());
    }
}
