//! Ambient "current" trace context, propagated per thread.

use crate::context::TraceContext;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;

thread_local! {
    // One static slot shared by every tracer in the process, so ambient
    // propagation is visible no matter which tracing instance is current.
    static CURRENT: RefCell<Option<TraceContext>> = const { RefCell::new(None) };
}

/// In-process context propagation, typically across call frames on one
/// thread.
///
/// `new_scope` swaps the current context and returns a [`Scope`] that
/// restores the exact previous value when dropped, including on unwind.
/// Scopes nest; closing an inner scope reinstates the outer context, not an
/// empty one.
pub trait CurrentTraceContext: Send + Sync + fmt::Debug {
    /// The context currently in scope on this thread, if any.
    fn get(&self) -> Option<TraceContext>;

    /// Sets `context` current on this thread until the returned scope drops.
    fn new_scope(&self, context: Option<TraceContext>) -> Scope;
}

/// Restores the previously current context when dropped.
///
/// Bound to the thread that created it; it cannot be sent elsewhere.
pub struct Scope {
    restore: Option<Box<dyn FnOnce()>>,
    // relies on thread locals
    _not_send: PhantomData<*const ()>,
}

impl Scope {
    /// Builds a scope around an arbitrary restore action, for alternative
    /// [`CurrentTraceContext`] implementations.
    pub fn new(restore: impl FnOnce() + 'static) -> Self {
        Scope {
            restore: Some(Box::new(restore)),
            _not_send: PhantomData,
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if let Some(restore) = self.restore.take() {
            restore();
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Scope")
    }
}

/// The default scope manager: one static thread-local slot per thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadLocalCurrentTraceContext;

impl ThreadLocalCurrentTraceContext {
    pub fn new() -> Self {
        Self
    }
}

impl CurrentTraceContext for ThreadLocalCurrentTraceContext {
    fn get(&self) -> Option<TraceContext> {
        CURRENT.with(|current| current.borrow().clone())
    }

    fn new_scope(&self, context: Option<TraceContext>) -> Scope {
        let previous = CURRENT.with(|current| current.replace(context));
        Scope::new(move || {
            CURRENT.with(|current| {
                *current.borrow_mut() = previous;
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(span_id: u64) -> TraceContext {
        TraceContext::builder().trace_id(1).span_id(span_id).build()
    }

    #[test]
    fn scope_restores_previous_on_drop() {
        let current = ThreadLocalCurrentTraceContext::new();
        assert!(current.get().is_none());

        let outer = current.new_scope(Some(context(2)));
        assert_eq!(current.get().unwrap().span_id(), 2);
        {
            let _inner = current.new_scope(Some(context(3)));
            assert_eq!(current.get().unwrap().span_id(), 3);
        }
        assert_eq!(current.get().unwrap().span_id(), 2);

        drop(outer);
        assert!(current.get().is_none());
    }

    #[test]
    fn scope_can_clear_the_current_context() {
        let current = ThreadLocalCurrentTraceContext::new();
        let _outer = current.new_scope(Some(context(2)));
        {
            let _cleared = current.new_scope(None);
            assert!(current.get().is_none());
        }
        assert_eq!(current.get().unwrap().span_id(), 2);
    }

    #[test]
    fn all_instances_share_the_thread_slot() {
        let a = ThreadLocalCurrentTraceContext::new();
        let b = ThreadLocalCurrentTraceContext::new();
        let _scope = a.new_scope(Some(context(9)));
        assert_eq!(b.get().unwrap().span_id(), 9);
    }

    #[test]
    fn other_threads_see_their_own_slot() {
        let current = ThreadLocalCurrentTraceContext::new();
        let _scope = current.new_scope(Some(context(2)));
        std::thread::spawn(move || {
            assert!(ThreadLocalCurrentTraceContext::new().get().is_none());
        })
        .join()
        .unwrap();
    }
}
