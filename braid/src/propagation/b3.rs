//! The multi-header B3 format: `X-B3-TraceId`, `X-B3-SpanId`,
//! `X-B3-ParentSpanId`, `X-B3-Sampled` and `X-B3-Flags`.
//!
//! Extraction first consults the single `b3` key so that senders may upgrade
//! independently of receivers; only when it yields nothing do the individual
//! headers apply.

use crate::context::{parse_lower_hex_trace_id, parse_lower_hex_u64, Extracted, TraceContext};
use crate::propagation::b3_single::{parse_b3_single, B3_HEADER};
use crate::propagation::{Extractor, Injector, Propagation, PropagationFactory};
use std::sync::Arc;

/// 128- or 64-bit trace ID, lower-hex encoded into 32 or 16 characters.
pub const TRACE_ID_HEADER: &str = "X-B3-TraceId";
/// 64-bit span ID, lower-hex encoded into 16 characters.
pub const SPAN_ID_HEADER: &str = "X-B3-SpanId";
/// 64-bit parent span ID, absent on a root span.
pub const PARENT_SPAN_ID_HEADER: &str = "X-B3-ParentSpanId";
/// "1" reports this span, "0" does not; absent defers to the receiver.
pub const SAMPLED_HEADER: &str = "X-B3-Sampled";
/// "1" implies sampled and requests a collection-tier sampling override.
pub const FLAGS_HEADER: &str = "X-B3-Flags";

/// Propagates contexts over the `X-B3-*` header family.
#[derive(Debug)]
pub struct B3Propagation {
    keys: [String; 6],
}

impl B3Propagation {
    pub fn new() -> Self {
        B3Propagation {
            keys: [
                B3_HEADER.to_string(),
                TRACE_ID_HEADER.to_string(),
                SPAN_ID_HEADER.to_string(),
                PARENT_SPAN_ID_HEADER.to_string(),
                SAMPLED_HEADER.to_string(),
                FLAGS_HEADER.to_string(),
            ],
        }
    }

    /// The default propagation factory.
    pub fn factory() -> Arc<dyn PropagationFactory> {
        Arc::new(B3Factory)
    }
}

impl Default for B3Propagation {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct B3Factory;

impl PropagationFactory for B3Factory {
    fn create(&self) -> Arc<dyn Propagation> {
        Arc::new(B3Propagation::new())
    }

    fn supports_join(&self) -> bool {
        true
    }
}

impl Propagation for B3Propagation {
    fn keys(&self) -> &[String] {
        &self.keys
    }

    fn inject(&self, context: &TraceContext, carrier: &mut dyn Injector) {
        carrier.set(TRACE_ID_HEADER, context.trace_id_string());
        carrier.set(SPAN_ID_HEADER, context.span_id_string());
        if let Some(parent_id) = context.parent_id_string() {
            carrier.set(PARENT_SPAN_ID_HEADER, parent_id);
        }
        if context.debug() {
            carrier.set(FLAGS_HEADER, "1".to_string());
        } else if let Some(sampled) = context.sampled() {
            carrier.set(SAMPLED_HEADER, if sampled { "1" } else { "0" }.to_string());
        }
    }

    fn extract(&self, carrier: &dyn Extractor) -> Extracted {
        // single-header format takes precedence when it decodes
        if let Some(extracted) = carrier.get(B3_HEADER).and_then(parse_b3_single) {
            if !extracted.is_empty() {
                return extracted;
            }
        }

        // The sampled state applies whether or not identity is present.
        // The official value is "1", but old senders put "true".
        let sampled = carrier
            .get(SAMPLED_HEADER)
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"));
        let debug = carrier.get(FLAGS_HEADER) == Some("1");

        let Some(trace_id) = carrier.get(TRACE_ID_HEADER) else {
            // flags without identity are still usable
            return Extracted::from_sampled(sampled, debug);
        };
        let Some((trace_id_high, trace_id)) = parse_lower_hex_trace_id(trace_id) else {
            return Extracted::EMPTY;
        };
        let Some(span_id) = carrier.get(SPAN_ID_HEADER).and_then(parse_lower_hex_u64) else {
            return Extracted::EMPTY;
        };
        let parent_id = match carrier.get(PARENT_SPAN_ID_HEADER) {
            None => None,
            Some(value) => match parse_lower_hex_u64(value) {
                Some(parent_id) => Some(parent_id),
                None => return Extracted::EMPTY,
            },
        };

        let mut builder = TraceContext::builder()
            .trace_id_high(trace_id_high)
            .trace_id(trace_id)
            .parent_id(parent_id)
            .span_id(span_id);
        if let Some(sampled) = sampled {
            builder = builder.sampled(sampled);
        }
        if debug {
            builder = builder.debug(true);
        }
        Extracted::from_context(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const TRACE_ID: &str = "0000000000000001";
    const SPAN_ID: &str = "0000000000000002";

    fn carrier(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn injects_ids_and_sampled() {
        let context = TraceContext::builder()
            .trace_id(1)
            .span_id(2)
            .sampled(true)
            .build();
        let mut injected = HashMap::new();
        B3Propagation::new().inject(&context, &mut injected);

        assert_eq!(injected.get(TRACE_ID_HEADER).unwrap(), TRACE_ID);
        assert_eq!(injected.get(SPAN_ID_HEADER).unwrap(), SPAN_ID);
        assert_eq!(injected.get(SAMPLED_HEADER).unwrap(), "1");
        assert!(!injected.contains_key(PARENT_SPAN_ID_HEADER));
        assert!(!injected.contains_key(FLAGS_HEADER));
    }

    #[test]
    fn injects_debug_instead_of_sampled() {
        let context = TraceContext::builder()
            .trace_id(1)
            .parent_id(3_u64)
            .span_id(2)
            .debug(true)
            .build();
        let mut injected = HashMap::new();
        B3Propagation::new().inject(&context, &mut injected);

        assert_eq!(injected.get(FLAGS_HEADER).unwrap(), "1");
        assert!(!injected.contains_key(SAMPLED_HEADER));
        assert_eq!(injected.get(PARENT_SPAN_ID_HEADER).unwrap(), "0000000000000003");
    }

    #[test]
    fn injects_nothing_for_deferred_sampling() {
        let context = TraceContext::builder().trace_id(1).span_id(2).build();
        let mut injected = HashMap::new();
        B3Propagation::new().inject(&context, &mut injected);
        assert!(!injected.contains_key(SAMPLED_HEADER));
        assert!(!injected.contains_key(FLAGS_HEADER));
    }

    #[test]
    fn extracts_a_full_context() {
        let propagation = B3Propagation::new();
        let extracted = propagation.extract(&carrier(&[
            (TRACE_ID_HEADER, TRACE_ID),
            (SPAN_ID_HEADER, SPAN_ID),
            (PARENT_SPAN_ID_HEADER, "0000000000000003"),
            (SAMPLED_HEADER, "1"),
        ]));
        let context = extracted.context().unwrap();
        assert_eq!(context.trace_id(), 1);
        assert_eq!(context.span_id(), 2);
        assert_eq!(context.parent_id(), Some(3));
        assert_eq!(context.sampled(), Some(true));
    }

    #[rustfmt::skip]
    fn sampled_values() -> Vec<(&'static str, Option<bool>)> {
        vec![
            ("1", Some(true)),
            ("true", Some(true)),
            ("True", Some(true)),
            ("0", Some(false)),
            ("false", Some(false)),
            ("junk", Some(false)),
        ]
    }

    #[test]
    fn tolerates_legacy_sampled_values() {
        let propagation = B3Propagation::new();
        for (value, expected) in sampled_values() {
            let extracted = propagation.extract(&carrier(&[
                (TRACE_ID_HEADER, TRACE_ID),
                (SPAN_ID_HEADER, SPAN_ID),
                (SAMPLED_HEADER, value),
            ]));
            assert_eq!(extracted.context().unwrap().sampled(), expected, "{value}");
        }
    }

    #[test]
    fn debug_takes_precedence_over_sampled() {
        let propagation = B3Propagation::new();
        let extracted = propagation.extract(&carrier(&[
            (TRACE_ID_HEADER, TRACE_ID),
            (SPAN_ID_HEADER, SPAN_ID),
            (SAMPLED_HEADER, "0"),
            (FLAGS_HEADER, "1"),
        ]));
        let context = extracted.context().unwrap();
        assert!(context.debug());
        assert_eq!(context.sampled(), Some(true));
    }

    #[test]
    fn flags_without_identity_extract_as_sampling_flags() {
        let propagation = B3Propagation::new();
        let extracted = propagation.extract(&carrier(&[(SAMPLED_HEADER, "0")]));
        assert!(extracted.context().is_none());
        assert_eq!(extracted.sampled(), Some(false));

        let extracted = propagation.extract(&carrier(&[(FLAGS_HEADER, "1")]));
        assert_eq!(extracted.sampled(), Some(true));
        assert!(extracted.debug());
    }

    #[rustfmt::skip]
    fn malformed_carriers() -> Vec<Vec<(&'static str, &'static str)>> {
        vec![
            vec![(TRACE_ID_HEADER, "garbage-not-hex"), (SPAN_ID_HEADER, SPAN_ID)],
            vec![(TRACE_ID_HEADER, "000000000000001"), (SPAN_ID_HEADER, SPAN_ID)],
            vec![(TRACE_ID_HEADER, TRACE_ID)],
            vec![(TRACE_ID_HEADER, TRACE_ID), (SPAN_ID_HEADER, "shorty")],
            vec![(TRACE_ID_HEADER, TRACE_ID), (SPAN_ID_HEADER, SPAN_ID), (PARENT_SPAN_ID_HEADER, "nope")],
            vec![(TRACE_ID_HEADER, "0000000000000000"), (SPAN_ID_HEADER, SPAN_ID)],
        ]
    }

    #[test]
    fn malformed_identity_extracts_as_empty() {
        let propagation = B3Propagation::new();
        for entries in malformed_carriers() {
            let extracted = propagation.extract(&carrier(&entries));
            assert!(extracted.is_empty(), "{entries:?}");
        }
    }

    #[test]
    fn nothing_extracts_as_empty() {
        let carrier: HashMap<String, String> = HashMap::new();
        assert!(B3Propagation::new().extract(&carrier).is_empty());
    }

    #[test]
    fn single_header_takes_precedence() {
        let propagation = B3Propagation::new();
        let extracted = propagation.extract(&carrier(&[
            (B3_HEADER, "000000000000000a-000000000000000b-0"),
            (TRACE_ID_HEADER, TRACE_ID),
            (SPAN_ID_HEADER, SPAN_ID),
            (SAMPLED_HEADER, "1"),
        ]));
        let context = extracted.context().unwrap();
        assert_eq!(context.trace_id(), 0xa);
        assert_eq!(context.span_id(), 0xb);
        assert_eq!(context.sampled(), Some(false));
    }

    #[test]
    fn malformed_single_header_falls_back_to_multi() {
        let propagation = B3Propagation::new();
        let extracted = propagation.extract(&carrier(&[
            (B3_HEADER, "-"),
            (TRACE_ID_HEADER, TRACE_ID),
            (SPAN_ID_HEADER, SPAN_ID),
        ]));
        assert_eq!(extracted.context().unwrap().trace_id(), 1);
    }

    #[test]
    fn round_trips_through_a_carrier() {
        let propagation = B3Propagation::new();
        let context = TraceContext::builder()
            .trace_id_high(0x80f1_98ee_5634_3ba8)
            .trace_id(0x64fe_8b2a_57d3_eff7)
            .parent_id(0xcd_u64)
            .span_id(0xe457_b5a2_e4d8_6bd1)
            .sampled(false)
            .build();

        let mut injected = HashMap::new();
        propagation.inject(&context, &mut injected);
        let extracted = propagation.extract(&injected);
        let decoded = extracted.context().unwrap();

        assert_eq!(decoded, &context);
        assert_eq!(decoded.trace_id_high(), context.trace_id_high());
        assert_eq!(decoded.parent_id(), context.parent_id());
        assert_eq!(decoded.sampled(), Some(false));
        assert!(!decoded.debug());
    }
}
