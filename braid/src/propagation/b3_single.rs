//! The single-header B3 format: one `b3` key holding
//! `{traceId}-{spanId}-{samplingState}-{parentId}` with trailing fields
//! optional, or a lone sampling state when no identity is known.

use crate::context::{parse_lower_hex_trace_id, parse_lower_hex_u64, Extracted, SamplingFlags, TraceContext};
use crate::propagation::{Extractor, Injector, Propagation, PropagationFactory};
use std::sync::Arc;

pub(crate) const B3_HEADER: &str = "b3";

/// Propagates contexts on the single `b3` key.
#[derive(Debug)]
pub struct B3SinglePropagation {
    keys: [String; 1],
}

impl B3SinglePropagation {
    pub fn new() -> Self {
        B3SinglePropagation {
            keys: [B3_HEADER.to_string()],
        }
    }

    pub fn factory() -> Arc<dyn PropagationFactory> {
        Arc::new(B3SingleFactory)
    }
}

impl Default for B3SinglePropagation {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct B3SingleFactory;

impl PropagationFactory for B3SingleFactory {
    fn create(&self) -> Arc<dyn Propagation> {
        Arc::new(B3SinglePropagation::new())
    }

    fn supports_join(&self) -> bool {
        true
    }
}

impl Propagation for B3SinglePropagation {
    fn keys(&self) -> &[String] {
        &self.keys
    }

    fn inject(&self, context: &TraceContext, carrier: &mut dyn Injector) {
        carrier.set(B3_HEADER, write_b3_single(context));
    }

    fn extract(&self, carrier: &dyn Extractor) -> Extracted {
        match carrier.get(B3_HEADER) {
            // absent or malformed both decode as "no context"
            None => Extracted::EMPTY,
            Some(value) => parse_b3_single(value).unwrap_or(Extracted::EMPTY),
        }
    }
}

/// Encodes `context` in the single-header format.
pub fn write_b3_single(context: &TraceContext) -> String {
    let mut value = format!("{}-{}", context.trace_id_string(), context.span_id_string());
    let sampling = if context.debug() {
        Some("d")
    } else {
        context.sampled().map(|sampled| if sampled { "1" } else { "0" })
    };
    if let Some(state) = sampling {
        value.push('-');
        value.push_str(state);
        // the grammar is positional: a parent can only follow a sampling state
        if let Some(parent) = context.parent_id_string() {
            value.push('-');
            value.push_str(&parent);
        }
    }
    value
}

/// Decodes a single-header value. `None` means malformed.
pub fn parse_b3_single(value: &str) -> Option<Extracted> {
    match value {
        "0" => return Some(Extracted::from_flags(SamplingFlags::NOT_SAMPLED)),
        "1" => return Some(Extracted::from_flags(SamplingFlags::SAMPLED)),
        "d" => return Some(Extracted::from_flags(SamplingFlags::DEBUG)),
        _ => {}
    }

    let parts: Vec<&str> = value.split('-').collect();
    if !(2..=4).contains(&parts.len()) {
        return None;
    }

    let (trace_id_high, trace_id) = parse_lower_hex_trace_id(parts[0])?;
    let span_id = parse_lower_hex_u64(parts[1])?;

    let mut builder = TraceContext::builder()
        .trace_id_high(trace_id_high)
        .trace_id(trace_id)
        .span_id(span_id);

    if parts.len() > 2 {
        builder = match parts[2] {
            "d" => builder.debug(true),
            "1" => builder.sampled(true),
            "0" => builder.sampled(false),
            _ => return None,
        };
    }
    if parts.len() == 4 {
        builder = builder.parent_id(parse_lower_hex_u64(parts[3])?);
    }
    Some(Extracted::from_context(builder.build()))
}
