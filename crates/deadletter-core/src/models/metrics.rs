//! Metric data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fully qualified identity of a metric series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricKey {
    /// Namespace (e.g., "DeadLetterPipeline")
    pub namespace: String,

    /// Metric name (e.g., "errorsLogged")
    pub name: String,

    /// Component the series is scoped to
    pub component: String,
}

impl MetricKey {
    /// Create a new metric key
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        component: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            component: component.into(),
        }
    }
}

impl std::fmt::Display for MetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}[{}]", self.namespace, self.name, self.component)
    }
}

/// Selects one or more series by namespace and name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricSelector {
    /// Namespace
    pub namespace: String,

    /// Metric name
    pub name: String,

    /// Component to monitor (None = aggregate across all components)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
}

impl MetricSelector {
    /// Select a metric across all components
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            component: None,
        }
    }

    /// Narrow the selection to a single component
    pub fn for_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    /// Check if a key is covered by this selector
    pub fn matches(&self, key: &MetricKey) -> bool {
        self.namespace == key.namespace
            && self.name == key.name
            && self
                .component
                .as_ref()
                .map_or(true, |component| component == &key.component)
    }
}

impl std::fmt::Display for MetricSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.component {
            Some(component) => write!(f, "{}/{}[{}]", self.namespace, self.name, component),
            None => write!(f, "{}/{}", self.namespace, self.name),
        }
    }
}

/// A single point of a metric series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Series the sample belongs to
    pub key: MetricKey,

    /// Sample value
    pub value: f64,

    /// Timestamp of the underlying observation
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    /// Create a new sample
    pub fn new(key: MetricKey, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            key,
            value,
            timestamp,
        }
    }

    /// Whether the value can take part in a statistic
    pub fn is_well_formed(&self) -> bool {
        self.value.is_finite()
    }
}
