//! Injecting and extracting trace identity into carriers that travel in-band
//! across process boundaries, usually as request headers.
//!
//! A [`Propagation`] owns a wire format: which keys it reads and writes, how a
//! [`TraceContext`](crate::TraceContext) is encoded, and how an inbound
//! carrier is decoded into an [`Extracted`](crate::Extracted) result. The
//! carrier itself is abstracted behind [`Injector`] / [`Extractor`], so the
//! same codec serves HTTP headers, messaging properties, or a plain map.
//!
//! Extraction is total: malformed input decodes to an empty result and never
//! returns an error, so a bad header at worst starts a fresh trace.

pub mod b3;
pub mod b3_single;
pub mod extra;

use crate::context::{Extracted, TraceContext};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Write half of a carrier: assigns propagation keys.
pub trait Injector {
    /// Replaces the value of `key` in the carrier.
    fn set(&mut self, key: &str, value: String);
}

/// Read half of a carrier: looks up propagation keys.
pub trait Extractor {
    /// Returns the first value of `key`, if present.
    fn get(&self, key: &str) -> Option<&str>;
}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, String, S> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    fn get(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }
}

/// One wire format for trace identity.
pub trait Propagation: Send + Sync + fmt::Debug {
    /// The keys this format reads and writes. Carriers that are reused
    /// should clear these before injection. Extra-field keys are not listed
    /// here so that generic tooling does not delete user data.
    fn keys(&self) -> &[String];

    /// Encodes `context` onto the carrier.
    fn inject(&self, context: &TraceContext, carrier: &mut dyn Injector);

    /// Decodes the carrier. Missing or malformed state yields
    /// [`Extracted::EMPTY`].
    fn extract(&self, carrier: &dyn Extractor) -> Extracted;
}

/// Builds [`Propagation`] instances and describes format capabilities.
pub trait PropagationFactory: Send + Sync + fmt::Debug {
    fn create(&self) -> Arc<dyn Propagation>;

    /// Whether this format can share one span ID between the client and
    /// server side of a call. Formats that never carry a parent ID cannot.
    fn supports_join(&self) -> bool {
        false
    }

    /// Whether this format requires 128-bit trace identifiers.
    fn requires_128bit_trace_id(&self) -> bool {
        false
    }

    /// Decorates a freshly created context with whatever state this format
    /// propagates in-process (for example, extra-field storage).
    ///
    /// Must be idempotent: re-decorating an already decorated context
    /// returns the identical context, not a copy.
    fn decorate(&self, context: TraceContext) -> TraceContext {
        context
    }
}
