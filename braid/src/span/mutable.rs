//! The mutable accumulator behind one in-flight span.

use std::error::Error;
use std::net::IpAddr;

/// The kind of span, signalling the RPC or messaging role it played.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Client,
    Server,
    Producer,
    Consumer,
}

/// Everything recorded about a span except its trace context.
///
/// One of these exists per in-flight span. While shared between threads it
/// lives behind a mutex owned by the span handle; handlers receive it
/// exclusively and may mutate it for late adjustments. Timestamps are epoch
/// microseconds with zero meaning unset.
#[derive(Debug, Default)]
pub struct MutableSpan {
    kind: Option<Kind>,
    shared: bool,
    start_timestamp: u64,
    finish_timestamp: u64,
    name: Option<String>,
    local_service_name: Option<String>,
    local_ip: Option<IpAddr>,
    local_port: u16,
    remote_service_name: Option<String>,
    remote_ip: Option<IpAddr>,
    remote_port: u16,
    tags: Vec<(String, String)>,
    annotations: Vec<(u64, String)>,
    error: Option<Box<dyn Error + Send + Sync>>,
}

impl MutableSpan {
    pub fn new() -> Self {
        MutableSpan::default()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn kind(&self) -> Option<Kind> {
        self.kind
    }

    pub fn set_kind(&mut self, kind: Kind) {
        self.kind = Some(kind);
    }

    /// True if this span ID is shared with a remote client.
    pub fn shared(&self) -> bool {
        self.shared
    }

    /// Marks this span as contributing to one started by another tracer,
    /// typically on a different host.
    pub fn set_shared(&mut self) {
        self.shared = true;
    }

    pub fn start_timestamp(&self) -> u64 {
        self.start_timestamp
    }

    pub fn set_start_timestamp(&mut self, timestamp: u64) {
        self.start_timestamp = timestamp;
    }

    pub fn finish_timestamp(&self) -> u64 {
        self.finish_timestamp
    }

    pub fn set_finish_timestamp(&mut self, timestamp: u64) {
        self.finish_timestamp = timestamp;
    }

    pub fn local_service_name(&self) -> Option<&str> {
        self.local_service_name.as_deref()
    }

    pub fn set_local_service_name(&mut self, service_name: impl Into<String>) {
        self.local_service_name = Some(service_name.into());
    }

    pub fn local_ip(&self) -> Option<IpAddr> {
        self.local_ip
    }

    pub fn set_local_ip(&mut self, ip: IpAddr) {
        self.local_ip = Some(ip);
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn set_local_port(&mut self, port: u16) {
        self.local_port = port;
    }

    pub fn remote_service_name(&self) -> Option<&str> {
        self.remote_service_name.as_deref()
    }

    pub fn set_remote_service_name(&mut self, service_name: impl Into<String>) {
        self.remote_service_name = Some(service_name.into().to_ascii_lowercase());
    }

    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.remote_ip
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Records the remote side of the connection. Returns false and records
    /// nothing when `ip` is not a literal IP address.
    pub fn remote_ip_and_port(&mut self, ip: &str, port: u16) -> bool {
        let Ok(parsed) = ip.parse::<IpAddr>() else {
            return false;
        };
        self.remote_ip = Some(parsed);
        self.remote_port = port;
        true
    }

    /// Records a timestamped event. Zero timestamps are dropped.
    pub fn annotate(&mut self, timestamp: u64, value: impl Into<String>) {
        if timestamp == 0 {
            return;
        }
        self.annotations.push((timestamp, value.into()));
    }

    pub fn annotations(&self) -> &[(u64, String)] {
        &self.annotations
    }

    /// Returns the value last associated with `key`.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .rev()
            .find(|(tag_key, _)| tag_key == key)
            .map(|(_, value)| value.as_str())
    }

    /// Sets a tag; a later write to the same key replaces the earlier value.
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        for entry in &mut self.tags {
            if entry.0 == key {
                entry.1 = value;
                return;
            }
        }
        self.tags.push((key, value));
    }

    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    pub fn error(&self) -> Option<&(dyn Error + Send + Sync)> {
        self.error.as_deref()
    }

    pub fn set_error(&mut self, error: Box<dyn Error + Send + Sync>) {
        self.error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_last_write_wins_per_key() {
        let mut span = MutableSpan::new();
        span.set_tag("http.method", "GET");
        span.set_tag("http.path", "/api");
        span.set_tag("http.method", "POST");

        assert_eq!(span.tag("http.method"), Some("POST"));
        assert_eq!(span.tags().len(), 2);
        assert_eq!(span.tags()[0], ("http.method".to_owned(), "POST".to_owned()));
    }

    #[test]
    fn zero_timestamp_annotations_are_dropped() {
        let mut span = MutableSpan::new();
        span.annotate(0, "lost");
        span.annotate(5, "kept");
        assert_eq!(span.annotations(), &[(5, "kept".to_owned())]);
    }

    #[test]
    fn remote_ip_requires_a_literal() {
        let mut span = MutableSpan::new();
        assert!(!span.remote_ip_and_port("zipkin.example.com", 9411));
        assert_eq!(span.remote_ip(), None);

        assert!(span.remote_ip_and_port("2001:db8::c001", 9411));
        assert_eq!(span.remote_port(), 9411);
    }

    #[test]
    fn remote_service_name_is_lower_cased() {
        let mut span = MutableSpan::new();
        span.set_remote_service_name("FavStar");
        assert_eq!(span.remote_service_name(), Some("favstar"));
    }
}
