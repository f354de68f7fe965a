// Metrics module - data model and the source adapter contract
//
// This module defines the fixed set of tracked metrics, the MetricSet that
// carries one optional value per metric, and the trait every metric source
// (CloudWatch, local OS counters) implements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod cloudwatch;
pub mod diskstats;
pub mod local;

/// Names of every metric the idle check knows about.
///
/// The set is closed: a MetricSet always has a slot for each of these,
/// whether or not a value was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    Cpu,
    Memory,
    DiskUsage,
    DiskReadRate,
    DiskWriteRate,
    NetworkInRate,
    NetworkOutRate,
}

impl MetricName {
    /// All metric names, in report order
    pub const ALL: [MetricName; 7] = [
        MetricName::Cpu,
        MetricName::Memory,
        MetricName::DiskUsage,
        MetricName::DiskReadRate,
        MetricName::DiskWriteRate,
        MetricName::NetworkInRate,
        MetricName::NetworkOutRate,
    ];

    /// Stable identifier used in config files and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::Cpu => "cpu",
            MetricName::Memory => "memory",
            MetricName::DiskUsage => "disk_usage",
            MetricName::DiskReadRate => "disk_read_rate",
            MetricName::DiskWriteRate => "disk_write_rate",
            MetricName::NetworkInRate => "network_in_rate",
            MetricName::NetworkOutRate => "network_out_rate",
        }
    }

    /// Human-readable label for the text report
    pub fn label(&self) -> &'static str {
        match self {
            MetricName::Cpu => "CPU",
            MetricName::Memory => "Memory",
            MetricName::DiskUsage => "Disk % used",
            MetricName::DiskReadRate => "Disk Read",
            MetricName::DiskWriteRate => "Disk Write",
            MetricName::NetworkInRate => "Network In",
            MetricName::NetworkOutRate => "Network Out",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit a metric value is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Percent,
    Bytes,
    BytesPerSecond,
    Count,
}

impl Unit {
    pub fn suffix(&self) -> &'static str {
        match self {
            Unit::Percent => "%",
            Unit::Bytes => "B",
            Unit::BytesPerSecond => "B/s",
            Unit::Count => "ops",
        }
    }
}

/// A single measurement of one metric
///
/// `value` is `None` when the source could not produce a reading
/// (no datapoints, unsupported on this host, counter reset).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub name: MetricName,
    pub value: Option<f64>,
    pub unit: Unit,
    pub collected_at: DateTime<Utc>,
}

/// One aggregated value per tracked metric.
///
/// Every metric name always has an entry. `None` means unavailable and is
/// never the same thing as a present zero.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSet {
    values: BTreeMap<MetricName, Option<f64>>,
}

impl MetricSet {
    /// Creates a set where every metric is unavailable
    pub fn unavailable() -> Self {
        MetricSet {
            values: MetricName::ALL.iter().map(|name| (*name, None)).collect(),
        }
    }

    /// Builds a set from `(name, value)` pairs; unnamed metrics stay unavailable
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = (MetricName, Option<f64>)>,
    {
        let mut set = Self::unavailable();
        for (name, value) in values {
            set.set(name, value);
        }
        set
    }

    pub fn get(&self, name: MetricName) -> Option<f64> {
        self.values.get(&name).copied().flatten()
    }

    /// Stores a value; non-finite numbers are recorded as unavailable
    pub fn set(&mut self, name: MetricName, value: Option<f64>) {
        self.values.insert(name, value.filter(|v| v.is_finite()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (MetricName, Option<f64>)> + '_ {
        self.values.iter().map(|(name, value)| (*name, *value))
    }

    /// Number of metrics that carry a value
    pub fn available_count(&self) -> usize {
        self.values.values().filter(|v| v.is_some()).count()
    }

    pub fn has_any_data(&self) -> bool {
        self.available_count() > 0
    }
}

impl Default for MetricSet {
    fn default() -> Self {
        Self::unavailable()
    }
}

/// Core trait that all metric sources must implement.
///
/// A source reads the current value of one named metric from its backend.
/// Failures are not errors at this level: the source logs what went wrong
/// and returns `None`, and callers treat that as an unavailable metric.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Returns the name of this source, used for logging and the report
    fn name(&self) -> &str;

    /// Unit the given metric is reported in by this source
    fn unit(&self, metric: MetricName) -> Unit;

    /// Fetches the current value of `metric`, or `None` if unavailable
    async fn fetch(&self, metric: MetricName) -> Option<f64>;

    /// Fetches several metrics in one go.
    ///
    /// The default reads them one after another. Sources that can share work
    /// between metrics (a common delay window, one backend round trip)
    /// override this.
    async fn fetch_many(&self, metrics: &[MetricName]) -> Vec<(MetricName, Option<f64>)> {
        let mut values = Vec::with_capacity(metrics.len());
        for &metric in metrics {
            values.push((metric, self.fetch(metric).await));
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_set_has_every_metric() {
        let set = MetricSet::unavailable();
        assert_eq!(set.iter().count(), MetricName::ALL.len());
        assert_eq!(set.available_count(), 0);
        assert!(!set.has_any_data());
    }

    #[test]
    fn test_zero_is_not_absence() {
        let set = MetricSet::from_values([(MetricName::Cpu, Some(0.0))]);
        assert_eq!(set.get(MetricName::Cpu), Some(0.0));
        assert_eq!(set.get(MetricName::Memory), None);
        assert_eq!(set.available_count(), 1);
    }

    #[test]
    fn test_non_finite_values_are_unavailable() {
        let mut set = MetricSet::unavailable();
        set.set(MetricName::Memory, Some(f64::NAN));
        set.set(MetricName::Cpu, Some(f64::INFINITY));
        assert_eq!(set.get(MetricName::Memory), None);
        assert_eq!(set.get(MetricName::Cpu), None);
    }

    #[test]
    fn test_metric_name_serde_form() {
        let json = serde_json::to_string(&MetricName::NetworkInRate).unwrap();
        assert_eq!(json, "\"network_in_rate\"");
        for name in MetricName::ALL {
            let json = serde_json::to_string(&name).unwrap();
            assert_eq!(json, format!("\"{}\"", name.as_str()));
        }
    }
}
