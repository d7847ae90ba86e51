use serde::Serialize;
use typed_builder::TypedBuilder;

/// A timestamped event that explains latency within a span.
#[derive(TypedBuilder, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    /// Epoch microseconds of the event.
    pub timestamp: u64,
    /// Short event description, e.g. `"retry"`.
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::Annotation;

    #[test]
    fn serializes_timestamp_and_value() {
        let annotation = Annotation::builder()
            .timestamp(1_502_787_600_000_000)
            .value("cache miss".to_owned())
            .build();
        assert_eq!(
            serde_json::to_string(&annotation).unwrap(),
            "{\"timestamp\":1502787600000000,\"value\":\"cache miss\"}"
        );
    }
}
