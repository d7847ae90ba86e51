//! # Zipkin wire model for braid
//!
//! This crate carries the [Zipkin v2 span model] and the [`Reporter`] contract
//! used by the `braid` tracer to hand off finished spans. It deliberately
//! contains no transport: a `Reporter` is a fire-and-forget sink, and sending
//! the encoded spans anywhere (HTTP, Kafka, a file) is the concern of whatever
//! implements it.
//!
//! Three reporters ship with the crate:
//!
//! - [`LoggingReporter`] — logs each span as JSON through `tracing`. This is
//!   the default sink so that a freshly configured tracer is observable
//!   without any infrastructure.
//! - [`NoopReporter`] — drops everything.
//! - [`InMemoryReporter`] — buffers spans for inspection, intended for tests.
//!
//! [Zipkin v2 span model]: https://zipkin.io/zipkin-api/#/default/post_spans
mod model;
mod reporter;

pub use model::{Annotation, Endpoint, Kind, ListOfSpans, Span};
pub use reporter::{InMemoryReporter, LoggingReporter, NoopReporter, Reporter};
