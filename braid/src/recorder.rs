//! The pending-span table: in-flight mutable state keyed by trace identity,
//! with garbage-driven recovery of spans that were never finished.
//!
//! Like a deadline-based span map, except reclamation is driven by dropped
//! context handles instead of timeouts, so no bookkeeping thread exists.
//! Spans are weakly referenced by their owning context; once every handle to
//! a context is gone, any later table operation notices and reports the
//! abandoned state with a `braid.flush` annotation rather than losing it.

use crate::clock::Clock;
use crate::context::{ContextData, TraceContext};
use crate::handler::FinishedSpanHandler;
use crate::span::MutableSpan;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;
use tracing::debug;

/// Per-trace clock: one wall-clock reading plus a monotonic base, taken at
/// the first span of the trace. Every later read derives from the monotonic
/// elapsed time, so timestamps within one trace cannot go backwards even if
/// the system clock is adjusted mid-trace.
#[derive(Debug)]
pub(crate) struct TickClock {
    base_epoch_micros: u64,
    base_tick: Instant,
}

impl TickClock {
    fn new(base_epoch_micros: u64) -> Self {
        TickClock {
            base_epoch_micros,
            base_tick: Instant::now(),
        }
    }

    pub(crate) fn base_epoch_micros(&self) -> u64 {
        self.base_epoch_micros
    }
}

impl Clock for TickClock {
    fn current_time_micros(&self) -> u64 {
        self.base_epoch_micros + self.base_tick.elapsed().as_micros() as u64
    }
}

/// The state and clock currently accumulated for one trace and span ID.
#[derive(Clone)]
pub(crate) struct PendingSpan {
    state: Arc<Mutex<MutableSpan>>,
    clock: Arc<TickClock>,
}

impl PendingSpan {
    pub(crate) fn state(&self) -> &Arc<Mutex<MutableSpan>> {
        &self.state
    }

    pub(crate) fn clock(&self) -> &Arc<TickClock> {
        &self.clock
    }
}

/// Identity copied out of a context so lookups and orphan reports survive
/// the context allocation itself.
#[derive(Clone, PartialEq, Eq, Hash)]
struct SpanKey {
    trace_id_high: u64,
    trace_id: u64,
    span_id: u64,
    shared: bool,
}

impl SpanKey {
    fn of(context: &TraceContext) -> Self {
        SpanKey {
            trace_id_high: context.trace_id_high(),
            trace_id: context.trace_id(),
            span_id: context.span_id(),
            shared: context.shared(),
        }
    }
}

struct Entry {
    span: PendingSpan,
    context: Weak<ContextData>,
    sampled: bool,
    local_root_id: u64,
}

pub(crate) struct PendingSpans {
    clock: Arc<dyn Clock>,
    handler: Arc<dyn FinishedSpanHandler>,
    noop: Arc<AtomicBool>,
    spans: RwLock<HashMap<SpanKey, Entry>>,
}

impl PendingSpans {
    pub(crate) fn new(
        clock: Arc<dyn Clock>,
        handler: Arc<dyn FinishedSpanHandler>,
        noop: Arc<AtomicBool>,
    ) -> Self {
        PendingSpans {
            clock,
            handler,
            noop,
            spans: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the pending state for `context`, allocating it on first use.
    ///
    /// Two threads may race to materialize the same span, legitimately so
    /// when both ends of a joined client/server span initialize at once;
    /// the loser discards its allocation and adopts the winner's.
    pub(crate) fn get_or_create(&self, context: &TraceContext, start: bool) -> PendingSpan {
        self.report_orphaned_spans();
        let key = SpanKey::of(context);
        if let Some(entry) = self.spans.read().unwrap().get(&key) {
            return entry.span.clone();
        }

        let mut state = MutableSpan::new();
        if context.shared() {
            state.set_shared();
        }

        // reuse the parent's clock when it is still in progress (usually is)
        let clock = match self.clock_from_parent(context) {
            Some(clock) => {
                if start {
                    state.set_start_timestamp(clock.current_time_micros());
                }
                clock
            }
            None => {
                let clock = Arc::new(TickClock::new(self.clock.current_time_micros()));
                if start {
                    state.set_start_timestamp(clock.base_epoch_micros());
                }
                clock
            }
        };

        let span = PendingSpan {
            state: Arc::new(Mutex::new(state)),
            clock,
        };
        let sampled = context.sampled() == Some(true);
        let local_root_id = context.local_root_id();
        let weak = context.downgrade();
        let mut spans = self.spans.write().unwrap();
        let entry = spans.entry(key).or_insert_with(|| Entry {
            span,
            context: weak,
            sampled,
            local_root_id,
        });
        entry.span.clone()
    }

    /// A client span can be a root, and a server span can share its ID, so
    /// the shared-id lookup runs even without a parent ID.
    fn clock_from_parent(&self, context: &TraceContext) -> Option<Arc<TickClock>> {
        let parent_id = context.parent_id().unwrap_or(0);
        if parent_id == 0 && !context.shared() {
            return None;
        }
        let key = SpanKey {
            trace_id_high: context.trace_id_high(),
            trace_id: context.trace_id(),
            span_id: if parent_id != 0 { parent_id } else { context.span_id() },
            shared: false,
        };
        self.spans
            .read()
            .unwrap()
            .get(&key)
            .map(|entry| entry.span.clock.clone())
    }

    /// Removes the entry for `context`, reporting whether it existed. The
    /// first and only remover wins the right to report the span.
    pub(crate) fn remove(&self, context: &TraceContext) -> bool {
        let removed = self
            .spans
            .write()
            .unwrap()
            .remove(&SpanKey::of(context))
            .is_some();
        self.report_orphaned_spans();
        removed
    }

    /// Reports spans whose owning context was dropped without an explicit
    /// finish. Runs inline on whichever caller touches the table; the time
    /// is read once per sweep to keep the cost off unrelated request paths.
    fn report_orphaned_spans(&self) {
        let dead: Vec<SpanKey> = {
            let spans = self.spans.read().unwrap();
            spans
                .iter()
                .filter(|(_, entry)| entry.context.strong_count() == 0)
                .map(|(key, _)| key.clone())
                .collect()
        };
        if dead.is_empty() {
            return;
        }

        let noop = self.noop.load(Ordering::Relaxed) || self.handler.is_noop();
        let mut flush_time = 0u64;
        for key in dead {
            let Some(entry) = self.spans.write().unwrap().remove(&key) else {
                continue; // another sweep got here first
            };
            if noop || !entry.sampled {
                continue;
            }
            if flush_time == 0 {
                flush_time = self.clock.current_time_micros();
            }
            let context = TraceContext::builder()
                .trace_id_high(key.trace_id_high)
                .trace_id(key.trace_id)
                .span_id(key.span_id)
                .shared(key.shared)
                .local_root_id(entry.local_root_id)
                .sampled(true)
                .build();
            debug!(target: "braid", context = %context, "span neither finished nor flushed before drop");
            let mut state = entry.span.state.lock().unwrap();
            state.annotate(flush_time, "braid.flush");
            self.handler.handle(&context, &mut state);
        }
    }
}
