//! Alarm data models

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::metrics::MetricSelector;

/// Metric name written for every error-level record
pub const ERRORS_LOGGED: &str = "errorsLogged";

/// Metric name written for every delivery attempt
pub const INVOCATIONS: &str = "invocations";

/// Metric name written for every failed delivery attempt
pub const FAILED_INVOCATIONS: &str = "failedInvocations";

/// Metric name of the sampled dead-letter depth
pub const DEAD_LETTER_DEPTH: &str = "ApproximateNumberOfMessagesVisible";

/// Aggregation applied to the samples of one window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    /// Sum of all values
    #[default]
    Sum,
    /// Arithmetic mean
    Average,
    /// Largest value
    Maximum,
}

impl Statistic {
    /// Apply the statistic to a non-empty set of values
    pub fn apply(self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }

        let value = match self {
            Self::Sum => values.iter().sum(),
            Self::Average => values.iter().sum::<f64>() / values.len() as f64,
            Self::Maximum => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        };

        Some(value)
    }
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    /// Greater than
    Gt,
    /// Less than
    Lt,
    /// Equal to
    Eq,
    /// Greater than or equal to
    Gte,
    /// Less than or equal to
    Lte,
}

impl Operator {
    /// Evaluate `value <op> threshold`
    pub fn compare(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Lt => value < threshold,
            Self::Eq => (value - threshold).abs() < f64::EPSILON,
            Self::Gte => value >= threshold,
            Self::Lte => value <= threshold,
        }
    }

    /// Symbol used in messages
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Eq => "==",
            Self::Gte => ">=",
            Self::Lte => "<=",
        }
    }
}

/// How a window without samples is judged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingDataPolicy {
    /// Treat the window as within threshold
    #[default]
    NotBreaching,
    /// Treat the window as breaching
    Breaching,
    /// Keep the current state; the window does not count
    Ignore,
    /// Record an unknown datapoint; only unknowns lead to INSUFFICIENT_DATA
    Missing,
}

/// Alarm severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational
    Info,
    /// Warning
    #[default]
    Warning,
    /// Critical
    Critical,
}

/// Shape of the monitored quantity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricSource {
    /// Absolute value of a single series, aggregated with the rule's statistic
    Count {
        /// Series to watch
        metric: MetricSelector,
    },
    /// Ratio of two correlated series: `sum(failures) / sum(total)` per window
    Ratio {
        /// Failing attempts
        failures: MetricSelector,
        /// All attempts
        total: MetricSelector,
    },
}

impl std::fmt::Display for MetricSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Count { metric } => write!(f, "{metric}"),
            Self::Ratio { failures, total } => write!(f, "{failures} / {total}"),
        }
    }
}

/// An alarm rule definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRule {
    /// Unique identifier
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    /// Human-readable name
    pub name: String,

    /// Description of what this alarm monitors
    #[serde(default)]
    pub description: Option<String>,

    /// Alarm severity
    #[serde(default)]
    pub severity: Severity,

    /// Monitored quantity
    pub source: MetricSource,

    /// Statistic applied per window (count sources only)
    #[serde(default)]
    pub statistic: Statistic,

    /// Window duration
    #[serde(with = "humantime_serde", default = "default_window")]
    pub window: Duration,

    /// Number of most recent windows considered
    #[serde(default = "default_periods")]
    pub evaluation_periods: u32,

    /// Breaching windows among those needed to fire
    #[serde(default = "default_periods")]
    pub datapoints_to_alarm: u32,

    /// Consecutive non-breaching windows needed to leave ALARM
    #[serde(default = "default_periods")]
    pub recovery_periods: u32,

    /// Comparison operator
    pub operator: Operator,

    /// Threshold value
    pub threshold: f64,

    /// Missing data handling
    #[serde(default)]
    pub missing_data: MissingDataPolicy,
}

fn default_window() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_periods() -> u32 {
    1
}

impl AlarmRule {
    /// Create a rule with the reference evaluation settings: 5 minute windows,
    /// one period, one datapoint, missing data not breaching.
    pub fn new(
        name: impl Into<String>,
        source: MetricSource,
        operator: Operator,
        threshold: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            severity: Severity::default(),
            source,
            statistic: Statistic::Sum,
            window: default_window(),
            evaluation_periods: 1,
            datapoints_to_alarm: 1,
            recovery_periods: 1,
            operator,
            threshold,
            missing_data: MissingDataPolicy::NotBreaching,
        }
    }

    /// Alarm as soon as any record sits in the dead-letter store
    pub fn dead_letter_depth(namespace: &str, queue: &str) -> Self {
        Self::new(
            format!("QueueDepthAlarm-{queue}"),
            MetricSource::Count {
                metric: MetricSelector::new(namespace, DEAD_LETTER_DEPTH).for_component(queue),
            },
            Operator::Gte,
            1.0,
        )
        .with_statistic(Statistic::Maximum)
        .with_description("Queue depth alarm for the dead-letter store.")
        .with_severity(Severity::Critical)
    }

    /// Alarm when any error is logged by any component of the namespace
    pub fn errors_logged(namespace: &str) -> Self {
        Self::new(
            format!("{namespace}ErrorsLogged"),
            MetricSource::Count {
                metric: MetricSelector::new(namespace, ERRORS_LOGGED),
            },
            Operator::Gte,
            1.0,
        )
        .with_description("Error logged by service.")
    }

    /// Alarm when the share of failing attempts exceeds `fraction`
    pub fn error_rate(namespace: &str, fraction: f64) -> Self {
        Self::new(
            format!("{namespace}ErrorRate"),
            MetricSource::Ratio {
                failures: MetricSelector::new(namespace, FAILED_INVOCATIONS),
                total: MetricSelector::new(namespace, INVOCATIONS),
            },
            Operator::Gt,
            fraction,
        )
        .with_description("Share of failing handler attempts.")
    }

    /// Set the statistic
    pub fn with_statistic(mut self, statistic: Statistic) -> Self {
        self.statistic = statistic;
        self
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the severity
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Set the window duration
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Require `datapoints` breaching windows out of the latest `periods`
    pub fn with_periods(mut self, periods: u32, datapoints: u32) -> Self {
        self.evaluation_periods = periods;
        self.datapoints_to_alarm = datapoints;
        self
    }

    /// Set the number of clean windows needed to recover
    pub fn with_recovery_periods(mut self, periods: u32) -> Self {
        self.recovery_periods = periods;
        self
    }

    /// Set the missing data policy
    pub fn with_missing_data(mut self, policy: MissingDataPolicy) -> Self {
        self.missing_data = policy;
        self
    }

    /// Check if a window value breaches this rule
    pub fn check(&self, value: f64) -> bool {
        self.operator.compare(value, self.threshold)
    }

    /// Window duration in milliseconds
    pub fn window_millis(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }

    /// Number of judged windows the evaluator has to remember
    pub fn history_len(&self) -> usize {
        self.evaluation_periods.max(self.recovery_periods) as usize
    }

    /// Reject rules that can never be evaluated meaningfully
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("alarm rule name must not be empty"));
        }
        if self.window.as_millis() == 0 {
            return Err(Error::config(format!(
                "alarm rule '{}': window must be greater than zero",
                self.name
            )));
        }
        if self.evaluation_periods == 0 {
            return Err(Error::config(format!(
                "alarm rule '{}': evaluation_periods must be at least 1",
                self.name
            )));
        }
        if self.datapoints_to_alarm == 0 || self.datapoints_to_alarm > self.evaluation_periods {
            return Err(Error::config(format!(
                "alarm rule '{}': datapoints_to_alarm ({}) must be between 1 and evaluation_periods ({})",
                self.name, self.datapoints_to_alarm, self.evaluation_periods
            )));
        }
        if self.recovery_periods == 0 {
            return Err(Error::config(format!(
                "alarm rule '{}': recovery_periods must be at least 1",
                self.name
            )));
        }
        if !self.threshold.is_finite() {
            return Err(Error::config(format!(
                "alarm rule '{}': threshold must be a finite number",
                self.name
            )));
        }
        Ok(())
    }
}

/// Current state of an alarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmStatus {
    /// Within threshold
    Ok,
    /// Threshold breached according to the rule's policy
    Alarm,
    /// Not enough data to decide
    #[default]
    InsufficientData,
}

impl std::fmt::Display for AlarmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::Alarm => "ALARM",
            Self::InsufficientData => "INSUFFICIENT_DATA",
        };
        f.write_str(s)
    }
}

/// Per-rule alarm state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmState {
    /// The rule this state belongs to
    pub rule_id: Uuid,

    /// Current state
    pub status: AlarmStatus,

    /// When the state last changed (None = never left the initial state)
    pub last_transition: Option<DateTime<Utc>>,
}

impl AlarmState {
    /// Initial state for a rule
    pub fn new(rule_id: Uuid) -> Self {
        Self {
            rule_id,
            status: AlarmStatus::InsufficientData,
            last_transition: None,
        }
    }
}

/// An observed change of alarm state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmTransition {
    /// Unique identifier
    pub id: Uuid,

    /// The rule that changed state
    pub rule_id: Uuid,

    /// Rule name
    pub rule_name: String,

    /// Rule severity
    pub severity: Severity,

    /// Previous state
    pub from: AlarmStatus,

    /// New state
    pub to: AlarmStatus,

    /// Start of the window that caused the change
    pub window_start: DateTime<Utc>,

    /// End of the window that caused the change
    pub window_end: DateTime<Utc>,

    /// Window value, if the window had data
    pub value: Option<f64>,

    /// Threshold of the rule
    pub threshold: f64,

    /// Human-readable explanation
    pub reason: String,

    /// When the transition was observed
    pub timestamp: DateTime<Utc>,
}

impl AlarmTransition {
    /// Whether this transition raises an alarm (the only kind that notifies)
    pub fn is_alarm_raised(&self) -> bool {
        self.to == AlarmStatus::Alarm && self.from != AlarmStatus::Alarm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Operator::Gt, 2.0, 1.0, true)]
    #[case(Operator::Gt, 1.0, 1.0, false)]
    #[case(Operator::Gte, 1.0, 1.0, true)]
    #[case(Operator::Lt, 0.5, 1.0, true)]
    #[case(Operator::Lte, 1.0, 1.0, true)]
    #[case(Operator::Eq, 1.0, 1.0, true)]
    #[case(Operator::Eq, 1.1, 1.0, false)]
    fn test_operator(
        #[case] op: Operator,
        #[case] value: f64,
        #[case] threshold: f64,
        #[case] expected: bool,
    ) {
        assert_eq!(op.compare(value, threshold), expected);
    }

    #[rstest]
    #[case(Statistic::Sum, 6.0)]
    #[case(Statistic::Average, 2.0)]
    #[case(Statistic::Maximum, 3.0)]
    fn test_statistic(#[case] statistic: Statistic, #[case] expected: f64) {
        assert_eq!(statistic.apply(&[1.0, 2.0, 3.0]), Some(expected));
    }

    #[test]
    fn test_statistic_of_nothing() {
        assert_eq!(Statistic::Maximum.apply(&[]), None);
    }

    #[test]
    fn test_rejects_more_datapoints_than_periods() {
        let rule = AlarmRule::errors_logged("ns").with_periods(2, 3);
        let err = rule.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_zero_window() {
        let rule = AlarmRule::errors_logged("ns").with_window(Duration::ZERO);
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(AlarmRule::dead_letter_depth("ns", "dlq").validate().is_ok());
        assert!(AlarmRule::errors_logged("ns").validate().is_ok());
        assert!(AlarmRule::error_rate("ns", 0.4).validate().is_ok());
    }

    #[test]
    fn test_rule_from_toml_like_json() {
        let rule: AlarmRule = serde_json::from_value(serde_json::json!({
            "name": "rate",
            "source": {
                "type": "ratio",
                "failures": {"namespace": "ns", "name": "errorsLogged"},
                "total": {"namespace": "ns", "name": "invocations"}
            },
            "window": "10m",
            "evaluation_periods": 3,
            "datapoints_to_alarm": 2,
            "operator": "gt",
            "threshold": 0.4,
            "missing_data": "ignore"
        }))
        .unwrap();

        assert_eq!(rule.window, Duration::from_secs(600));
        assert_eq!(rule.recovery_periods, 1);
        assert_eq!(rule.missing_data, MissingDataPolicy::Ignore);
        assert!(rule.validate().is_ok());
    }
}
