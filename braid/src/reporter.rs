//! Conversion of finished spans into the Zipkin wire model, and the handler
//! that forwards them to a [`Reporter`].

use crate::context::TraceContext;
use crate::handler::FinishedSpanHandler;
use crate::span::{Kind, MutableSpan};
use braid_zipkin::{Annotation, Endpoint, Reporter};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// Derives the `error` tag from an error recorded on a span, when the
/// instrumentation did not set one explicitly.
pub trait ErrorParser: Send + Sync + fmt::Debug {
    fn error_tag(&self, error: &(dyn Error + Send + Sync)) -> String {
        error.to_string()
    }
}

/// Tags the error's display form.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultErrorParser;

impl ErrorParser for DefaultErrorParser {}

/// Fills Zipkin span fields from accumulated span state.
pub(crate) struct MutableSpanConverter {
    error_parser: Arc<dyn ErrorParser>,
    local_service_name: String,
    local_ip: Option<IpAddr>,
    local_port: u16,
    // reused whenever a span carries no endpoint overrides, which is the
    // common case on the reporting path
    local_endpoint: Endpoint,
}

impl MutableSpanConverter {
    pub(crate) fn new(
        error_parser: Arc<dyn ErrorParser>,
        local_service_name: String,
        local_ip: Option<IpAddr>,
        local_port: u16,
    ) -> Self {
        let local_endpoint = endpoint(Some(local_service_name.clone()), local_ip, local_port);
        MutableSpanConverter {
            error_parser,
            local_service_name,
            local_ip,
            local_port,
            local_endpoint,
        }
    }

    pub(crate) fn convert(&self, span: &mut MutableSpan, out: &mut braid_zipkin::Span) {
        out.name = span.name().map(str::to_owned);

        let start = span.start_timestamp();
        let finish = span.finish_timestamp();
        if start != 0 {
            out.timestamp = Some(start);
            if finish != 0 {
                out.duration = Some(finish.saturating_sub(start).max(1));
            }
        }

        out.kind = span.kind().map(|kind| match kind {
            Kind::Client => braid_zipkin::Kind::Client,
            Kind::Server => braid_zipkin::Kind::Server,
            Kind::Producer => braid_zipkin::Kind::Producer,
            Kind::Consumer => braid_zipkin::Kind::Consumer,
        });

        out.local_endpoint = Some(self.local_endpoint_for(span));
        if span.remote_service_name().is_some() || span.remote_ip().is_some() {
            out.remote_endpoint = Some(endpoint(
                span.remote_service_name().map(str::to_owned),
                span.remote_ip(),
                span.remote_port(),
            ));
        }

        let derived_error_tag = if span.tag("error").is_none() {
            span.error().map(|error| self.error_parser.error_tag(error))
        } else {
            None
        };
        if let Some(tag) = derived_error_tag {
            span.set_tag("error", tag);
        }

        out.tags = span
            .tags()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect::<HashMap<_, _>>();
        out.annotations = span
            .annotations()
            .iter()
            .map(|(timestamp, value)| {
                Annotation::builder()
                    .timestamp(*timestamp)
                    .value(value.clone())
                    .build()
            })
            .collect();

        if span.shared() {
            out.shared = true;
        }
    }

    fn local_endpoint_for(&self, span: &MutableSpan) -> Endpoint {
        let service_name = span
            .local_service_name()
            .unwrap_or(&self.local_service_name);
        let ip = span.local_ip().or(self.local_ip);
        let port = if span.local_port() > 0 {
            span.local_port()
        } else {
            self.local_port
        };
        if service_name == self.local_service_name && ip == self.local_ip && port == self.local_port
        {
            self.local_endpoint.clone()
        } else {
            endpoint(Some(service_name.to_owned()), ip, port)
        }
    }
}

fn endpoint(service_name: Option<String>, ip: Option<IpAddr>, port: u16) -> Endpoint {
    let mut endpoint = Endpoint {
        service_name,
        ..Endpoint::default()
    };
    match ip {
        Some(IpAddr::V4(ipv4)) => endpoint.ipv4 = Some(ipv4),
        Some(IpAddr::V6(ipv6)) => endpoint.ipv6 = Some(ipv6),
        None => {}
    }
    if port != 0 {
        endpoint.port = Some(port);
    }
    endpoint
}

/// Terminal handler: encodes remotely-sampled spans and hands them to the
/// reporter. Spans recorded only for local handlers pass through untouched.
pub(crate) struct ZipkinReportingHandler {
    reporter: Arc<dyn Reporter>,
    converter: MutableSpanConverter,
}

impl ZipkinReportingHandler {
    pub(crate) fn new(reporter: Arc<dyn Reporter>, converter: MutableSpanConverter) -> Self {
        ZipkinReportingHandler { reporter, converter }
    }
}

impl FinishedSpanHandler for ZipkinReportingHandler {
    fn handle(&self, context: &TraceContext, span: &mut MutableSpan) -> bool {
        if context.sampled() != Some(true) {
            return true;
        }

        let mut out = braid_zipkin::Span {
            trace_id: Some(context.trace_id_string()),
            parent_id: context.parent_id_string(),
            id: Some(context.span_id_string()),
            debug: context.debug(),
            ..braid_zipkin::Span::default()
        };
        self.converter.convert(span, &mut out);
        self.reporter.report(out);
        true
    }
}

impl fmt::Debug for ZipkinReportingHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ZipkinReportingHandler({:?})", self.reporter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_zipkin::InMemoryReporter;
    use std::net::Ipv4Addr;

    fn handler(reporter: Arc<InMemoryReporter>) -> ZipkinReportingHandler {
        let converter = MutableSpanConverter::new(
            Arc::new(DefaultErrorParser),
            "favstar".to_owned(),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            0,
        );
        ZipkinReportingHandler::new(reporter, converter)
    }

    fn context() -> TraceContext {
        TraceContext::builder()
            .trace_id(1)
            .parent_id(2_u64)
            .span_id(3)
            .sampled(true)
            .build()
    }

    #[test]
    fn converts_identity_timing_and_tags() {
        let reporter = Arc::new(InMemoryReporter::new());
        let handler = handler(reporter.clone());

        let mut span = MutableSpan::new();
        span.set_name("get");
        span.set_kind(Kind::Server);
        span.set_start_timestamp(1_000);
        span.set_finish_timestamp(1_500);
        span.set_tag("http.path", "/api");
        span.annotate(1_100, "ws");

        assert!(handler.handle(&context(), &mut span));
        let spans = reporter.take();
        assert_eq!(spans.len(), 1);
        let reported = &spans[0];
        assert_eq!(reported.trace_id.as_deref(), Some("0000000000000001"));
        assert_eq!(reported.parent_id.as_deref(), Some("0000000000000002"));
        assert_eq!(reported.id.as_deref(), Some("0000000000000003"));
        assert_eq!(reported.kind, Some(braid_zipkin::Kind::Server));
        assert_eq!(reported.name.as_deref(), Some("get"));
        assert_eq!(reported.timestamp, Some(1_000));
        assert_eq!(reported.duration, Some(500));
        assert_eq!(reported.tags.get("http.path").map(String::as_str), Some("/api"));
        assert_eq!(reported.annotations[0].value, "ws");
        assert_eq!(
            reported.local_endpoint.as_ref().unwrap().service_name.as_deref(),
            Some("favstar")
        );
    }

    #[test]
    fn duration_is_at_least_one_microsecond() {
        let reporter = Arc::new(InMemoryReporter::new());
        let handler = handler(reporter.clone());

        let mut span = MutableSpan::new();
        span.set_start_timestamp(1_000);
        span.set_finish_timestamp(1_000);
        handler.handle(&context(), &mut span);

        assert_eq!(reporter.take()[0].duration, Some(1));
    }

    #[test]
    fn unsampled_spans_pass_through_without_reporting() {
        let reporter = Arc::new(InMemoryReporter::new());
        let handler = handler(reporter.clone());

        let unsampled = TraceContext::builder().trace_id(1).span_id(3).sampled(false).build();
        assert!(handler.handle(&unsampled, &mut MutableSpan::new()));
        assert!(reporter.take().is_empty());
    }

    #[test]
    fn derives_error_tag_when_none_set() {
        let reporter = Arc::new(InMemoryReporter::new());
        let handler = handler(reporter.clone());

        let mut span = MutableSpan::new();
        span.set_error("connection refused".into());
        handler.handle(&context(), &mut span);

        let spans = reporter.take();
        assert_eq!(
            spans[0].tags.get("error").map(String::as_str),
            Some("connection refused")
        );
    }

    #[test]
    fn explicit_error_tag_wins_over_derivation() {
        let reporter = Arc::new(InMemoryReporter::new());
        let handler = handler(reporter.clone());

        let mut span = MutableSpan::new();
        span.set_tag("error", "custom");
        span.set_error("connection refused".into());
        handler.handle(&context(), &mut span);

        assert_eq!(reporter.take()[0].tags.get("error").map(String::as_str), Some("custom"));
    }

    #[test]
    fn shared_and_remote_endpoint_carry_through() {
        let reporter = Arc::new(InMemoryReporter::new());
        let handler = handler(reporter.clone());

        let mut span = MutableSpan::new();
        span.set_shared();
        span.set_remote_service_name("Backend");
        span.remote_ip_and_port("127.0.0.1", 9411);
        handler.handle(&context(), &mut span);

        let spans = reporter.take();
        assert!(spans[0].shared);
        let remote = spans[0].remote_endpoint.as_ref().unwrap();
        assert_eq!(remote.service_name.as_deref(), Some("backend"));
        assert_eq!(remote.ipv4, Some(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(remote.port, Some(9411));
    }
}
