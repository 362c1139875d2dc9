//! Record-to-metric extraction

use crate::models::{
    ExecutionRecord, MetricKey, MetricSample, ERRORS_LOGGED, FAILED_INVOCATIONS, INVOCATIONS,
};

/// Field carried by every delivery attempt record
const ATTEMPT_FIELD: &str = "attempt";

/// Normalize a severity level for comparison ("ERROR " -> "error")
pub fn normalize_level(level: &str) -> String {
    level.trim().to_ascii_lowercase()
}

/// Which records an extractor counts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordMatcher {
    /// Records whose normalized level equals the normalized marker
    Level(String),
    /// Records carrying the named field
    HasField(String),
    /// Records matched by every inner matcher
    All(Vec<RecordMatcher>),
}

impl RecordMatcher {
    /// Match records at `level`, in any letter case
    pub fn level(marker: &str) -> Self {
        Self::Level(normalize_level(marker))
    }

    fn matches(&self, record: &ExecutionRecord) -> bool {
        match self {
            Self::Level(marker) => normalize_level(&record.level) == *marker,
            Self::HasField(field) => record.fields.contains_key(field),
            Self::All(matchers) => matchers.iter().all(|m| m.matches(record)),
        }
    }
}

/// Derives a counter sample from matching records
///
/// Extraction is a pure function of the record: a matching record yields one
/// sample of value 1, anything else yields nothing (not a zero).
#[derive(Debug, Clone)]
pub struct MetricExtractor {
    namespace: String,
    metric: String,
    matcher: RecordMatcher,
}

impl MetricExtractor {
    /// Create a new extractor
    pub fn new(
        namespace: impl Into<String>,
        metric: impl Into<String>,
        matcher: RecordMatcher,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            metric: metric.into(),
            matcher,
        }
    }

    /// Count records logged at the error marker level as `errorsLogged`
    pub fn errors(namespace: impl Into<String>, marker: &str) -> Self {
        Self::new(namespace, ERRORS_LOGGED, RecordMatcher::level(marker))
    }

    /// Count delivery attempts as `invocations`
    pub fn invocations(namespace: impl Into<String>) -> Self {
        Self::new(namespace, INVOCATIONS, RecordMatcher::HasField(ATTEMPT_FIELD.to_string()))
    }

    /// Count failed delivery attempts as `failedInvocations`.
    ///
    /// Unlike [`MetricExtractor::errors`], error records that are not attempts are
    /// ignored, so the share of failed attempts never exceeds 1.
    pub fn failed_invocations(namespace: impl Into<String>, marker: &str) -> Self {
        Self::new(
            namespace,
            FAILED_INVOCATIONS,
            RecordMatcher::All(vec![
                RecordMatcher::level(marker),
                RecordMatcher::HasField(ATTEMPT_FIELD.to_string()),
            ]),
        )
    }

    /// Metric name written by this extractor
    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Extract at most one sample from a record
    pub fn extract(&self, record: &ExecutionRecord) -> Option<MetricSample> {
        if !self.matcher.matches(record) {
            return None;
        }

        Some(MetricSample::new(
            MetricKey::new(&self.namespace, &self.metric, &record.component),
            1.0,
            record.timestamp,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("error", true)]
    #[case("ERROR", true)]
    #[case("Error", true)]
    #[case(" error ", true)]
    #[case("info", false)]
    #[case("warn", false)]
    #[case("errors", false)]
    fn test_error_level_matching(#[case] level: &str, #[case] expected: bool) {
        let extractor = MetricExtractor::errors("ns", "error");
        let record = ExecutionRecord::new(level, "on-event", "msg");

        assert_eq!(extractor.extract(&record).is_some(), expected);
    }

    #[test]
    fn test_sample_shape() {
        let extractor = MetricExtractor::errors("DeadLetterPipeline", "ERROR");
        let record = ExecutionRecord::new("error", "http", "500 error");

        let sample = extractor.extract(&record).unwrap();

        assert_eq!(sample.value, 1.0);
        assert_eq!(sample.timestamp, record.timestamp);
        assert_eq!(
            sample.key,
            MetricKey::new("DeadLetterPipeline", "errorsLogged", "http")
        );
    }

    #[test]
    fn test_invocations_count_attempt_records_only() {
        let extractor = MetricExtractor::invocations("ns");

        let attempt = ExecutionRecord::new("info", "c", "message processed").with_field("attempt", 0);
        let other = ExecutionRecord::new("info", "c", "started");

        assert!(extractor.extract(&attempt).is_some());
        assert!(extractor.extract(&other).is_none());
    }

    #[test]
    fn test_failed_invocations_need_error_level_and_attempt() {
        let extractor = MetricExtractor::failed_invocations("ns", "error");

        let failed = ExecutionRecord::new("ERROR", "on-event", "failed").with_field("attempt", 1);
        let ok = ExecutionRecord::new("info", "on-event", "processed").with_field("attempt", 0);
        let http = ExecutionRecord::new("error", "http", "500 Internal Server Error");

        let sample = extractor.extract(&failed).unwrap();
        assert_eq!(sample.key, MetricKey::new("ns", "failedInvocations", "on-event"));
        assert!(extractor.extract(&ok).is_none());
        assert!(extractor.extract(&http).is_none());
    }

    fn level_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("error".to_string()),
            Just("ERROR".to_string()),
            Just("info".to_string()),
            "[a-zA-Z]{1,8}",
        ]
    }

    proptest! {
        #[test]
        fn prop_extraction_is_idempotent(levels in proptest::collection::vec(level_strategy(), 0..50)) {
            let extractor = MetricExtractor::errors("ns", "error");
            let records: Vec<_> = levels
                .iter()
                .map(|level| ExecutionRecord::new(level.as_str(), "c", "m"))
                .collect();

            let first: Vec<_> = records.iter().filter_map(|r| extractor.extract(r)).collect();
            let second: Vec<_> = records.iter().filter_map(|r| extractor.extract(r)).collect();

            prop_assert_eq!(&first, &second);
            prop_assert!(first.iter().all(|s| s.value == 1.0));
        }
    }
}
