// Idle classifier - decides whether a host is IDLE or ACTIVE
//
// The decision is a pure function of a MetricSet and a ThresholdPolicy.
// The policy is a list of dimensions (cpu, memory, network, ...), each made
// of one or more metrics with a cutoff. A host is idle only when every
// metric of every dimension has a value strictly below its cutoff.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ConfigError;
use crate::metrics::{MetricName, MetricSet};

/// Binary outcome of a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Idle,
    Active,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Idle => f.write_str("IDLE"),
            Verdict::Active => f.write_str("ACTIVE"),
        }
    }
}

/// How a value is compared against its cutoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// Idle-contributing only when `value < cutoff`
    StrictlyBelow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub cutoff: f64,
    pub comparison: Comparison,
}

impl Threshold {
    pub fn below(cutoff: f64) -> Self {
        Threshold {
            cutoff,
            comparison: Comparison::StrictlyBelow,
        }
    }

    /// Whether `value` counts towards idleness. Absence never does.
    pub fn admits(&self, value: Option<f64>) -> bool {
        match (value, self.comparison) {
            (Some(v), Comparison::StrictlyBelow) => v < self.cutoff,
            (None, _) => false,
        }
    }
}

/// A named group of metrics that must all be idle together.
///
/// Compound dimensions such as network list both directions, so a single
/// busy direction vetoes the whole dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    pub name: &'static str,
    pub metrics: Vec<(MetricName, Threshold)>,
}

impl Dimension {
    pub fn single(name: &'static str, metric: MetricName, cutoff: f64) -> Self {
        Dimension {
            name,
            metrics: vec![(metric, Threshold::below(cutoff))],
        }
    }

    pub fn compound(name: &'static str, metrics: [MetricName; 2], cutoff: f64) -> Self {
        Dimension {
            name,
            metrics: metrics
                .iter()
                .map(|metric| (*metric, Threshold::below(cutoff)))
                .collect(),
        }
    }
}

/// The five standard dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    Cpu,
    Memory,
    DiskUsage,
    Network,
    DiskIo,
}

impl DimensionKind {
    pub const ALL: [DimensionKind; 5] = [
        DimensionKind::Cpu,
        DimensionKind::Memory,
        DimensionKind::DiskUsage,
        DimensionKind::Network,
        DimensionKind::DiskIo,
    ];

    /// Dimensions a local observation is judged on. Disk usage and network
    /// are still collected and reported, but do not decide the verdict.
    pub const LOCAL_DEFAULT: [DimensionKind; 3] = [
        DimensionKind::Cpu,
        DimensionKind::Memory,
        DimensionKind::DiskIo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DimensionKind::Cpu => "cpu",
            DimensionKind::Memory => "memory",
            DimensionKind::DiskUsage => "disk_usage",
            DimensionKind::Network => "network",
            DimensionKind::DiskIo => "disk_io",
        }
    }
}

/// Cutoffs of the five standard dimensions
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StandardCutoffs {
    pub cpu: f64,
    pub memory: f64,
    pub disk_usage: f64,
    /// Applies to both directions
    pub network: f64,
    /// Applies to both read and write
    pub disk_io: f64,
}

impl StandardCutoffs {
    /// Cutoffs for CloudWatch datapoints.
    ///
    /// Network is summed bytes per period; disk I/O is summed EBS
    /// operations per period, hence its much smaller cutoff.
    pub const CLOUD: StandardCutoffs = StandardCutoffs {
        cpu: 10.0,
        memory: 30.0,
        disk_usage: 30.0,
        network: 1024.0,
        disk_io: 10.0,
    };

    /// Cutoffs for locally observed values, in percent and bytes per second
    pub const LOCAL: StandardCutoffs = StandardCutoffs {
        cpu: 5.0,
        memory: 20.0,
        disk_usage: 20.0,
        network: 1024.0,
        disk_io: 1024.0,
    };

    /// Policy tracking all five dimensions
    pub fn policy(&self) -> ThresholdPolicy {
        self.policy_for(&DimensionKind::ALL)
    }

    /// Policy tracking only the `tracked` dimensions, in standard order
    pub fn policy_for(&self, tracked: &[DimensionKind]) -> ThresholdPolicy {
        ThresholdPolicy::new(
            DimensionKind::ALL
                .iter()
                .filter(|kind| tracked.contains(kind))
                .map(|&kind| self.dimension(kind))
                .collect(),
        )
    }

    fn dimension(&self, kind: DimensionKind) -> Dimension {
        let name = kind.as_str();
        match kind {
            DimensionKind::Cpu => Dimension::single(name, MetricName::Cpu, self.cpu),
            DimensionKind::Memory => Dimension::single(name, MetricName::Memory, self.memory),
            DimensionKind::DiskUsage => {
                Dimension::single(name, MetricName::DiskUsage, self.disk_usage)
            }
            DimensionKind::Network => Dimension::compound(
                name,
                [MetricName::NetworkInRate, MetricName::NetworkOutRate],
                self.network,
            ),
            DimensionKind::DiskIo => Dimension::compound(
                name,
                [MetricName::DiskReadRate, MetricName::DiskWriteRate],
                self.disk_io,
            ),
        }
    }
}

/// Immutable set of tracked dimensions and their cutoffs
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdPolicy {
    dimensions: Vec<Dimension>,
}

impl ThresholdPolicy {
    pub fn new(dimensions: Vec<Dimension>) -> Self {
        ThresholdPolicy { dimensions }
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    /// Every metric the policy tracks, in dimension order
    pub fn tracked_metrics(&self) -> impl Iterator<Item = (MetricName, Threshold)> + '_ {
        self.dimensions
            .iter()
            .flat_map(|dimension| dimension.metrics.iter().copied())
    }

    /// Rejects empty policies and negative or non-finite cutoffs
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tracked_metrics().next().is_none() {
            return Err(ConfigError::InvalidSettings(
                "threshold policy tracks no metrics".to_string(),
            ));
        }

        for (metric, threshold) in self.tracked_metrics() {
            if !threshold.cutoff.is_finite() || threshold.cutoff < 0.0 {
                return Err(ConfigError::InvalidThreshold {
                    metric: metric.to_string(),
                    value: threshold.cutoff,
                });
            }
        }

        Ok(())
    }
}

/// Outcome of one dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionState {
    /// Every metric present and below its cutoff
    Idle,
    /// Every metric present, at least one at or above its cutoff
    Busy,
    /// At least one metric had no value
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DimensionOutcome {
    pub name: &'static str,
    pub state: DimensionState,
}

/// Per-dimension breakdown plus the overall verdict
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub verdict: Verdict,
    pub dimensions: Vec<DimensionOutcome>,
}

/// Evaluates every dimension of `policy` against `metrics`.
pub fn evaluate(metrics: &MetricSet, policy: &ThresholdPolicy) -> Evaluation {
    let dimensions: Vec<DimensionOutcome> = policy
        .dimensions()
        .iter()
        .map(|dimension| {
            let values: Vec<(Option<f64>, &Threshold)> = dimension
                .metrics
                .iter()
                .map(|(metric, threshold)| (metrics.get(*metric), threshold))
                .collect();

            let state = if values.iter().any(|(value, _)| value.is_none()) {
                DimensionState::Unavailable
            } else if values.iter().all(|(value, threshold)| threshold.admits(*value)) {
                DimensionState::Idle
            } else {
                DimensionState::Busy
            };

            DimensionOutcome {
                name: dimension.name,
                state,
            }
        })
        .collect();

    let all_idle = !dimensions.is_empty()
        && dimensions
            .iter()
            .all(|outcome| outcome.state == DimensionState::Idle);

    Evaluation {
        verdict: if all_idle { Verdict::Idle } else { Verdict::Active },
        dimensions,
    }
}

/// IDLE iff every tracked metric is present and strictly below its cutoff.
pub fn classify(metrics: &MetricSet, policy: &ThresholdPolicy) -> Verdict {
    evaluate(metrics, policy).verdict
}
