//! In-memory metric series

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::models::{MetricKey, MetricSample, MetricSelector};

/// Append-only metric series, keyed by [`MetricKey`]
///
/// Samples may arrive out of timestamp order; range queries filter by timestamp
/// rather than relying on insertion order.
#[derive(Default)]
pub struct MetricStore {
    series: DashMap<MetricKey, Vec<MetricSample>>,
}

impl MetricStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample to its series
    pub fn append(&self, sample: MetricSample) {
        self.series
            .entry(sample.key.clone())
            .or_default()
            .push(sample);
    }

    /// All samples selected by `selector` with `start <= timestamp < end`
    pub fn samples(
        &self,
        selector: &MetricSelector,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<MetricSample> {
        let mut samples: Vec<MetricSample> = self
            .series
            .iter()
            .filter(|entry| selector.matches(entry.key()))
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|s| s.timestamp >= start && s.timestamp < end)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();

        samples.sort_by_key(|s| s.timestamp);
        samples
    }

    /// Values of [`MetricStore::samples`]
    pub fn values(
        &self,
        selector: &MetricSelector,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<f64> {
        self.samples(selector, start, end)
            .into_iter()
            .map(|s| s.value)
            .collect()
    }

    /// Drop samples older than `before`; returns how many were removed
    pub fn prune(&self, before: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for mut entry in self.series.iter_mut() {
            let series = entry.value_mut();
            let len = series.len();
            series.retain(|s| s.timestamp >= before);
            removed += len - series.len();
        }
        self.series.retain(|_, series| !series.is_empty());
        removed
    }

    /// Total number of samples held
    pub fn len(&self) -> usize {
        self.series.iter().map(|entry| entry.value().len()).sum()
    }

    /// Whether the store holds no samples
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
