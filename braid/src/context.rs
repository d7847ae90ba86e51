//! Trace identity: sampling flags, the immutable [`TraceContext`], and the
//! partial forms an extractor may produce when a carrier holds less than a
//! full context.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

/// An opaque propagated value attached to a trace context, looked up by type.
pub type ExtraItem = Arc<dyn Any + Send + Sync>;

pub(crate) const FLAG_SAMPLED: u8 = 1 << 1;
pub(crate) const FLAG_SAMPLED_SET: u8 = 1 << 2;
pub(crate) const FLAG_DEBUG: u8 = 1 << 3;
pub(crate) const FLAG_SHARED: u8 = 1 << 4;
pub(crate) const FLAG_SAMPLED_LOCAL: u8 = 1 << 5;

/// Folds a sampling decision into a flag word.
pub(crate) fn with_sampled(sampled: bool, flags: u8) -> u8 {
    let set = flags | FLAG_SAMPLED_SET;
    if sampled {
        set | FLAG_SAMPLED
    } else {
        set & !FLAG_SAMPLED
    }
}

/// Folds the debug bit into a flag word. Debug implies a positive sampling
/// decision: it is a request to override downstream sampling policy.
pub(crate) fn with_debug(debug: bool, flags: u8) -> u8 {
    if debug {
        flags | FLAG_DEBUG | FLAG_SAMPLED | FLAG_SAMPLED_SET
    } else {
        flags & !FLAG_DEBUG
    }
}

/// Sampling state carried on the wire when no trace identity is present.
///
/// `sampled` is three-valued: a carrier can demand reporting, refuse it, or
/// stay silent and defer the decision to the receiver.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplingFlags {
    pub(crate) flags: u8,
}

impl SamplingFlags {
    /// No decision: the receiver samples as it sees fit.
    pub const EMPTY: SamplingFlags = SamplingFlags { flags: 0 };
    /// An explicit refusal to report.
    pub const NOT_SAMPLED: SamplingFlags = SamplingFlags { flags: FLAG_SAMPLED_SET };
    /// An explicit request to report.
    pub const SAMPLED: SamplingFlags = SamplingFlags {
        flags: FLAG_SAMPLED_SET | FLAG_SAMPLED,
    };
    /// Sampled, and a request to override collection-tier sampling policy.
    pub const DEBUG: SamplingFlags = SamplingFlags {
        flags: FLAG_DEBUG | FLAG_SAMPLED_SET | FLAG_SAMPLED,
    };

    pub(crate) fn from_bits(flags: u8) -> Self {
        SamplingFlags { flags }
    }

    /// Builds flags from an optional decision plus the debug bit.
    pub fn new(sampled: Option<bool>, debug: bool) -> Self {
        if debug {
            return SamplingFlags::DEBUG;
        }
        match sampled {
            None => SamplingFlags::EMPTY,
            Some(true) => SamplingFlags::SAMPLED,
            Some(false) => SamplingFlags::NOT_SAMPLED,
        }
    }

    pub fn sampled(&self) -> Option<bool> {
        sampled_from(self.flags)
    }

    pub fn debug(&self) -> bool {
        self.flags & FLAG_DEBUG != 0
    }

    pub fn sampled_local(&self) -> bool {
        self.flags & FLAG_SAMPLED_LOCAL != 0
    }
}

impl fmt::Debug for SamplingFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplingFlags")
            .field("sampled", &self.sampled())
            .field("debug", &self.debug())
            .finish()
    }
}

pub(crate) fn sampled_from(flags: u8) -> Option<bool> {
    if flags & FLAG_SAMPLED_SET != 0 {
        Some(flags & FLAG_SAMPLED != 0)
    } else {
        None
    }
}

pub(crate) struct ContextData {
    pub(crate) trace_id_high: u64,
    pub(crate) trace_id: u64,
    pub(crate) local_root_id: u64,
    pub(crate) parent_id: u64,
    pub(crate) span_id: u64,
    pub(crate) flags: u8,
    pub(crate) extra: Vec<ExtraItem>,
}

/// Unique identity of one span within one trace, plus its sampling state and
/// any propagated extras.
///
/// A `TraceContext` is an immutable value: deriving a variant (new flags, new
/// extras) produces a new context, and the trace/span/parent identifiers are
/// never renumbered. Equality and hashing cover only
/// (`trace_id_high`, `trace_id`, `span_id`), so two views of the same span
/// compare equal regardless of decoration.
///
/// Cloning is cheap; clones share one allocation. The pending-span table
/// watches that allocation to recover spans whose every handle was dropped
/// without a `finish` call.
#[derive(Clone)]
pub struct TraceContext {
    pub(crate) data: Arc<ContextData>,
}

impl TraceContext {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// When non-zero, this trace uses 128-bit trace identifiers.
    pub fn trace_id_high(&self) -> u64 {
        self.data.trace_id_high
    }

    /// Lower 64 bits of the trace identifier, set on all spans within it.
    pub fn trace_id(&self) -> u64 {
        self.data.trace_id
    }

    /// Span ID of the first span created in this process for the trace, used
    /// to correlate everything that happened here.
    pub fn local_root_id(&self) -> u64 {
        self.data.local_root_id
    }

    /// The parent span ID, absent on a root span.
    pub fn parent_id(&self) -> Option<u64> {
        if self.data.parent_id == 0 {
            None
        } else {
            Some(self.data.parent_id)
        }
    }

    /// Unique identifier of this span within the trace.
    pub fn span_id(&self) -> u64 {
        self.data.span_id
    }

    pub fn sampled(&self) -> Option<bool> {
        sampled_from(self.data.flags)
    }

    pub fn debug(&self) -> bool {
        self.data.flags & FLAG_DEBUG != 0
    }

    /// True when this span ID is reused across a client/server boundary.
    pub fn shared(&self) -> bool {
        self.data.flags & FLAG_SHARED != 0
    }

    /// True when the span is recorded for local handlers regardless of the
    /// remote sampling decision.
    pub fn sampled_local(&self) -> bool {
        self.data.flags & FLAG_SAMPLED_LOCAL != 0
    }

    /// The ordered propagated state attached to this context.
    pub fn extra(&self) -> &[ExtraItem] {
        &self.data.extra
    }

    /// Returns the first extra of the requested type, if any.
    pub fn find_extra<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.data
            .extra
            .iter()
            .find_map(|item| item.clone().downcast::<T>().ok())
    }

    /// True when both handles share one context allocation (not merely equal
    /// identity). Decoration idempotency is defined in these terms.
    pub fn ptr_eq(a: &TraceContext, b: &TraceContext) -> bool {
        Arc::ptr_eq(&a.data, &b.data)
    }

    /// Lower-hex trace ID, 32 characters when 128-bit, 16 otherwise.
    pub fn trace_id_string(&self) -> String {
        if self.data.trace_id_high != 0 {
            format!("{:016x}{:016x}", self.data.trace_id_high, self.data.trace_id)
        } else {
            format!("{:016x}", self.data.trace_id)
        }
    }

    pub fn span_id_string(&self) -> String {
        format!("{:016x}", self.data.span_id)
    }

    pub fn parent_id_string(&self) -> Option<String> {
        self.parent_id().map(|id| format!("{id:016x}"))
    }

    pub(crate) fn flags(&self) -> u8 {
        self.data.flags
    }

    pub(crate) fn downgrade(&self) -> Weak<ContextData> {
        Arc::downgrade(&self.data)
    }

    pub(crate) fn with_flags(&self, flags: u8) -> TraceContext {
        if flags == self.data.flags {
            return self.clone();
        }
        TraceContext {
            data: Arc::new(ContextData {
                flags,
                extra: self.data.extra.clone(),
                ..*self.data
            }),
        }
    }

    pub(crate) fn with_flags_and_local_root(&self, flags: u8, local_root_id: u64) -> TraceContext {
        if flags == self.data.flags && local_root_id == self.data.local_root_id {
            return self.clone();
        }
        TraceContext {
            data: Arc::new(ContextData {
                flags,
                local_root_id,
                extra: self.data.extra.clone(),
                ..*self.data
            }),
        }
    }

    pub(crate) fn with_extra(&self, extra: Vec<ExtraItem>) -> TraceContext {
        TraceContext {
            data: Arc::new(ContextData {
                extra,
                ..*self.data
            }),
        }
    }
}

impl PartialEq for TraceContext {
    fn eq(&self, other: &Self) -> bool {
        self.data.trace_id_high == other.data.trace_id_high
            && self.data.trace_id == other.data.trace_id
            && self.data.span_id == other.data.span_id
    }
}

impl Eq for TraceContext {}

impl Hash for TraceContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.trace_id_high.hash(state);
        self.data.trace_id.hash(state);
        self.data.span_id.hash(state);
    }
}

impl fmt::Debug for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceContext")
            .field("trace_id", &self.trace_id_string())
            .field("parent_id", &self.parent_id_string())
            .field("span_id", &self.span_id_string())
            .field("sampled", &self.sampled())
            .field("shared", &self.shared())
            .finish()
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.trace_id_string(), self.span_id_string())
    }
}

/// Builder for [`TraceContext`].
///
/// Trace and span IDs are required and must be non-zero; violating that is a
/// configuration error and panics at build time, never at extraction time
/// (extractors validate identifiers before building).
#[derive(Default)]
pub struct Builder {
    trace_id_high: u64,
    trace_id: u64,
    local_root_id: u64,
    parent_id: u64,
    span_id: u64,
    flags: u8,
    extra: Vec<ExtraItem>,
}

impl Builder {
    pub fn trace_id_high(mut self, trace_id_high: u64) -> Self {
        self.trace_id_high = trace_id_high;
        self
    }

    pub fn trace_id(mut self, trace_id: u64) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn parent_id(mut self, parent_id: impl Into<Option<u64>>) -> Self {
        self.parent_id = parent_id.into().unwrap_or(0);
        self
    }

    pub fn span_id(mut self, span_id: u64) -> Self {
        self.span_id = span_id;
        self
    }

    pub fn sampled(mut self, sampled: impl Into<Option<bool>>) -> Self {
        match sampled.into() {
            Some(value) => self.flags = with_sampled(value, self.flags),
            None => self.flags &= !(FLAG_SAMPLED_SET | FLAG_SAMPLED),
        }
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.flags = with_debug(debug, self.flags);
        self
    }

    pub fn shared(mut self, shared: bool) -> Self {
        if shared {
            self.flags |= FLAG_SHARED;
        } else {
            self.flags &= !FLAG_SHARED;
        }
        self
    }

    pub fn extra(mut self, extra: Vec<ExtraItem>) -> Self {
        self.extra = extra;
        self
    }

    pub fn add_extra(mut self, item: ExtraItem) -> Self {
        self.extra.push(item);
        self
    }

    pub(crate) fn local_root_id(mut self, local_root_id: u64) -> Self {
        self.local_root_id = local_root_id;
        self
    }

    pub(crate) fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn build(self) -> TraceContext {
        assert!(self.trace_id != 0, "missing trace_id");
        assert!(self.span_id != 0, "missing span_id");
        TraceContext {
            data: Arc::new(ContextData {
                trace_id_high: self.trace_id_high,
                trace_id: self.trace_id,
                local_root_id: self.local_root_id,
                parent_id: self.parent_id,
                span_id: self.span_id,
                flags: self.flags,
                extra: self.extra,
            }),
        }
    }
}

/// Inbound trace ID and sampling flags without a span ID, produced when a
/// caller controls the root trace ID but not span identity (X-Ray style
/// correlation).
#[derive(Clone, Copy, Debug)]
pub struct TraceIdContext {
    trace_id_high: u64,
    trace_id: u64,
    flags: u8,
}

impl TraceIdContext {
    pub fn new(trace_id_high: u64, trace_id: u64, sampled: Option<bool>, debug: bool) -> Self {
        assert!(trace_id != 0, "missing trace_id");
        TraceIdContext {
            trace_id_high,
            trace_id,
            flags: SamplingFlags::new(sampled, debug).flags,
        }
    }

    pub fn trace_id_high(&self) -> u64 {
        self.trace_id_high
    }

    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    pub fn sampled(&self) -> Option<bool> {
        sampled_from(self.flags)
    }

    pub fn debug(&self) -> bool {
        self.flags & FLAG_DEBUG != 0
    }

    pub(crate) fn flags(&self) -> u8 {
        self.flags
    }
}

enum ExtractedValue {
    Context(TraceContext),
    TraceId(TraceIdContext),
    Flags(SamplingFlags),
}

/// Result of extracting a carrier: exactly one of a full context, a trace-ID
/// context, or bare sampling flags, plus any extras the propagation decoded.
///
/// Inbound carriers routinely hold partial information (only a sampling
/// decision, or a trace ID without span identity); this union keeps those
/// shapes distinct so the tracer can mint whatever identity is missing.
pub struct Extracted {
    value: ExtractedValue,
    extra: Vec<ExtraItem>,
}

impl Extracted {
    /// The neutral result: nothing usable on the carrier. Malformed input
    /// maps here, never to an error.
    pub const EMPTY: Extracted = Extracted {
        value: ExtractedValue::Flags(SamplingFlags::EMPTY),
        extra: Vec::new(),
    };

    pub fn from_context(context: TraceContext) -> Self {
        Extracted {
            value: ExtractedValue::Context(context),
            extra: Vec::new(),
        }
    }

    pub fn from_trace_id_context(context: TraceIdContext) -> Self {
        Extracted {
            value: ExtractedValue::TraceId(context),
            extra: Vec::new(),
        }
    }

    pub fn from_flags(flags: SamplingFlags) -> Self {
        Extracted {
            value: ExtractedValue::Flags(flags),
            extra: Vec::new(),
        }
    }

    pub fn from_sampled(sampled: Option<bool>, debug: bool) -> Self {
        Extracted::from_flags(SamplingFlags::new(sampled, debug))
    }

    pub fn context(&self) -> Option<&TraceContext> {
        match &self.value {
            ExtractedValue::Context(context) => Some(context),
            _ => None,
        }
    }

    pub fn trace_id_context(&self) -> Option<&TraceIdContext> {
        match &self.value {
            ExtractedValue::TraceId(context) => Some(context),
            _ => None,
        }
    }

    pub fn sampling_flags(&self) -> Option<SamplingFlags> {
        match &self.value {
            ExtractedValue::Flags(flags) => Some(*flags),
            _ => None,
        }
    }

    /// The sampling decision, regardless of which shape was extracted.
    pub fn sampled(&self) -> Option<bool> {
        match &self.value {
            ExtractedValue::Context(context) => context.sampled(),
            ExtractedValue::TraceId(context) => context.sampled(),
            ExtractedValue::Flags(flags) => flags.sampled(),
        }
    }

    pub fn debug(&self) -> bool {
        match &self.value {
            ExtractedValue::Context(context) => context.debug(),
            ExtractedValue::TraceId(context) => context.debug(),
            ExtractedValue::Flags(flags) => flags.debug(),
        }
    }

    /// True when nothing at all was extracted.
    pub fn is_empty(&self) -> bool {
        matches!(self.value, ExtractedValue::Flags(SamplingFlags { flags: 0 })) && self.extra.is_empty()
    }

    /// Extras that arrived without a full context; empty when `context()` is
    /// present, because those extras were folded into the context itself.
    pub fn extra(&self) -> &[ExtraItem] {
        &self.extra
    }

    /// Attaches a decoded extra. When a full context was extracted the extra
    /// joins the context's own list, so it survives into spans made from it.
    pub fn with_extra(mut self, item: ExtraItem) -> Self {
        match self.value {
            ExtractedValue::Context(context) => {
                let mut extra = context.extra().to_vec();
                extra.push(item);
                Extracted {
                    value: ExtractedValue::Context(context.with_extra(extra)),
                    extra: self.extra,
                }
            }
            _ => {
                self.extra.push(item);
                self
            }
        }
    }
}

impl fmt::Debug for Extracted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Extracted");
        match &self.value {
            ExtractedValue::Context(context) => s.field("context", context),
            ExtractedValue::TraceId(context) => s.field("trace_id_context", context),
            ExtractedValue::Flags(flags) => s.field("sampling_flags", flags),
        };
        s.field("extra", &self.extra.len()).finish()
    }
}

/// Parses exactly 16 lower-hex characters into a non-zero u64.
pub(crate) fn parse_lower_hex_u64(value: &str) -> Option<u64> {
    if value.len() != 16 || !is_lower_hex(value) {
        return None;
    }
    match u64::from_str_radix(value, 16) {
        Ok(0) | Err(_) => None,
        Ok(parsed) => Some(parsed),
    }
}

/// Parses a 16- or 32-character lower-hex trace ID into (high, low) halves.
pub(crate) fn parse_lower_hex_trace_id(value: &str) -> Option<(u64, u64)> {
    match value.len() {
        16 => parse_lower_hex_u64(value).map(|low| (0, low)),
        32 => {
            if !is_lower_hex(value) {
                return None;
            }
            let high = u64::from_str_radix(&value[..16], 16).ok()?;
            let low = u64::from_str_radix(&value[16..], 16).ok()?;
            if high == 0 && low == 0 {
                return None;
            }
            Some((high, low))
        }
        _ => None,
    }
}

fn is_lower_hex(value: &str) -> bool {
    value
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(span_id: u64) -> TraceContext {
        TraceContext::builder()
            .trace_id(1)
            .span_id(span_id)
            .sampled(true)
            .build()
    }

    #[test]
    fn equality_ignores_flags_and_extra() {
        let a = TraceContext::builder().trace_id(1).span_id(2).sampled(true).build();
        let b = TraceContext::builder().trace_id(1).span_id(2).debug(true).shared(true).build();
        assert_eq!(a, b);

        let decorated = a.with_extra(vec![Arc::new("payload".to_owned())]);
        assert_eq!(a, decorated);
    }

    #[test]
    fn equality_covers_identity() {
        assert_ne!(context(2), context(3));
        let other_trace = TraceContext::builder().trace_id(9).span_id(2).build();
        assert_ne!(context(2), other_trace);
    }

    #[test]
    fn debug_implies_sampled() {
        let context = TraceContext::builder().trace_id(1).span_id(2).debug(true).build();
        assert_eq!(context.sampled(), Some(true));
        assert!(context.debug());
    }

    #[test]
    fn sampled_is_three_valued() {
        let deferred = TraceContext::builder().trace_id(1).span_id(2).build();
        assert_eq!(deferred.sampled(), None);
        let refused = TraceContext::builder().trace_id(1).span_id(2).sampled(false).build();
        assert_eq!(refused.sampled(), Some(false));
    }

    #[test]
    fn trace_id_string_uses_128_bits_when_high_set() {
        let context = TraceContext::builder()
            .trace_id_high(0x80f1_98ee_5634_3ba8)
            .trace_id(0x64fe_8b2a_57d3_eff7)
            .span_id(0xe457_b5a2_e4d8_6bd1)
            .build();
        assert_eq!(context.trace_id_string(), "80f198ee56343ba864fe8b2a57d3eff7");
        assert_eq!(context.span_id_string(), "e457b5a2e4d86bd1");
    }

    #[test]
    fn find_extra_matches_by_type() {
        struct Marker(&'static str);
        let context = context(2).with_extra(vec![Arc::new(Marker("hi")), Arc::new(7_u32)]);
        assert_eq!(context.find_extra::<Marker>().unwrap().0, "hi");
        assert_eq!(*context.find_extra::<u32>().unwrap(), 7);
        assert!(context.find_extra::<String>().is_none());
    }

    #[test]
    fn extracted_with_extra_folds_into_context() {
        let extracted = Extracted::from_context(context(2)).with_extra(Arc::new(5_u8));
        assert!(extracted.extra().is_empty());
        assert_eq!(
            *extracted.context().unwrap().find_extra::<u8>().unwrap(),
            5
        );

        let flags_only = Extracted::from_sampled(Some(true), false).with_extra(Arc::new(5_u8));
        assert_eq!(flags_only.extra().len(), 1);
    }

    #[test]
    fn empty_extraction_is_empty() {
        assert!(Extracted::EMPTY.is_empty());
        assert!(!Extracted::from_sampled(Some(false), false).is_empty());
        assert!(!Extracted::from_context(context(2)).is_empty());
    }

    #[test]
    fn hex_parsing_rejects_bad_input() {
        assert_eq!(parse_lower_hex_u64("e457b5a2e4d86bd1"), Some(0xe457_b5a2_e4d8_6bd1));
        assert_eq!(parse_lower_hex_u64("E457B5A2E4D86BD1"), None);
        assert_eq!(parse_lower_hex_u64("e457b5a2e4d86bd"), None);
        assert_eq!(parse_lower_hex_u64("0000000000000000"), None);
        assert_eq!(parse_lower_hex_u64("e457b5a2e4d86bdg"), None);
        assert_eq!(
            parse_lower_hex_trace_id("80f198ee56343ba864fe8b2a57d3eff7"),
            Some((0x80f1_98ee_5634_3ba8, 0x64fe_8b2a_57d3_eff7))
        );
        assert_eq!(parse_lower_hex_trace_id("80f198ee56343ba8"), Some((0, 0x80f1_98ee_5634_3ba8)));
        assert_eq!(parse_lower_hex_trace_id("80f198ee56343ba864fe8b2a57d3eff"), None);
        assert_eq!(parse_lower_hex_trace_id(""), None);
    }
}
