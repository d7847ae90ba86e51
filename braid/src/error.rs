use thiserror::Error;

/// Errors raised while assembling a tracing configuration.
///
/// These are the only hard failures in the crate: misconfiguration surfaces
/// at startup, while anything that happens on a request path (malformed
/// headers, handler failures, double finishes) degrades silently instead.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("local service name must not be empty")]
    EmptyServiceName,

    #[error("sampling rate {0} is outside 0.0..=1.0")]
    InvalidSamplingRate(f32),

    #[error("extra field propagation needs at least one field name")]
    NoExtraFields,

    #[error("extra field name must not be empty")]
    EmptyExtraFieldName,

    #[error("extra field prefix must not be empty")]
    EmptyExtraFieldPrefix,
}
