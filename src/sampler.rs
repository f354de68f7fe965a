// Sampler module - timed collection of metric samples
//
// Invokes a fetcher at fixed points of an observation window and hands the
// collected samples to the aggregator. Everything runs sequentially on the
// calling task; the only waits are the interval ticks and whatever delays
// the metric source itself needs.
//
// # Architecture
// - `sample` is the generic timed loop driven by Tokio's interval timer
// - `Observer` runs one complete observation against a MetricSource:
//   averaged metrics are sampled together on every tick, point metrics are
//   read once after the window closes

use chrono::Utc;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::aggregator::{reduce, Aggregation};
use crate::config::ConfigError;
use crate::metrics::{MetricName, MetricSample, MetricSet, MetricSource};

/// Upper bound on the samples of one observation window
pub const MAX_SAMPLES: usize = 100_000;

/// Number of samples taken in a window of `duration` at `interval`
///
/// # Errors
/// `ConfigError::InvalidSampling` when the interval is zero, the window is
/// shorter than one interval (it would produce no samples at all) or the
/// window holds more than `MAX_SAMPLES` samples.
pub fn sample_count(interval: Duration, duration: Duration) -> Result<usize, ConfigError> {
    if interval.is_zero() {
        return Err(ConfigError::InvalidSampling(
            "sample interval must be greater than zero".to_string(),
        ));
    }
    if duration < interval {
        return Err(ConfigError::InvalidSampling(format!(
            "observation duration ({:?}) is shorter than the sample interval ({:?})",
            duration, interval
        )));
    }

    let count = duration.as_nanos() / interval.as_nanos();
    match usize::try_from(count) {
        Ok(count) if count <= MAX_SAMPLES => Ok(count),
        _ => Err(ConfigError::InvalidSampling(format!(
            "{} samples of {:?} requested, at most {} allowed",
            count, interval, MAX_SAMPLES
        ))),
    }
}

/// Calls `fetch` `duration / interval` times, one call per interval tick.
///
/// The first call happens immediately. If a call overruns its slot the
/// next tick is delayed rather than fired in a burst.
pub async fn sample<T, F, Fut>(
    mut fetch: F,
    interval_period: Duration,
    duration: Duration,
) -> Result<Vec<T>, ConfigError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
{
    let count = sample_count(interval_period, duration)?;

    let mut ticker = interval(interval_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut samples = Vec::with_capacity(count);
    for _ in 0..count {
        ticker.tick().await;
        samples.push(fetch().await);
    }

    Ok(samples)
}

/// What to collect during one run and how to reduce it
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationPlan {
    /// Metrics sampled on every tick and averaged
    pub sampled: Vec<MetricName>,

    /// Metrics read once, after the sampling window
    pub point: Vec<MetricName>,

    pub interval: Duration,
    pub duration: Duration,
}

impl ObservationPlan {
    /// Every metric is a single point query (CloudWatch already aggregates)
    pub fn point_in_time() -> Self {
        ObservationPlan {
            sampled: Vec::new(),
            point: MetricName::ALL.to_vec(),
            interval: Duration::ZERO,
            duration: Duration::ZERO,
        }
    }

    /// Load metrics are averaged over the window; disk usage and network
    /// rates are read once at the end.
    pub fn sampled_window(interval: Duration, duration: Duration) -> Self {
        ObservationPlan {
            sampled: vec![
                MetricName::Cpu,
                MetricName::Memory,
                MetricName::DiskReadRate,
                MetricName::DiskWriteRate,
            ],
            point: vec![
                MetricName::DiskUsage,
                MetricName::NetworkInRate,
                MetricName::NetworkOutRate,
            ],
            interval,
            duration,
        }
    }
}

/// Runs an ObservationPlan against a metric source
pub struct Observer {
    plan: ObservationPlan,
}

impl Observer {
    /// Creates an Observer, rejecting plans that would produce no samples
    pub fn new(plan: ObservationPlan) -> Result<Self, ConfigError> {
        if !plan.sampled.is_empty() {
            sample_count(plan.interval, plan.duration)?;
        }
        Ok(Observer { plan })
    }

    /// Collects every metric of the plan into a MetricSet
    ///
    /// Unavailable readings are dropped before aggregation; a metric with no
    /// usable sample at all stays unavailable in the result.
    pub async fn run(&self, source: &dyn MetricSource) -> Result<MetricSet, ConfigError> {
        let mut metrics = MetricSet::unavailable();

        if !self.plan.sampled.is_empty() {
            info!(
                "Observing {} for {:?} (every {:?})",
                source.name(),
                self.plan.duration,
                self.plan.interval
            );

            let ticks = sample(
                || async move {
                    let collected_at = Utc::now();
                    (collected_at, source.fetch_many(&self.plan.sampled).await)
                },
                self.plan.interval,
                self.plan.duration,
            )
            .await?;

            let mut series: BTreeMap<MetricName, Vec<f64>> = BTreeMap::new();
            for (collected_at, tick) in ticks {
                let samples: Vec<MetricSample> = tick
                    .into_iter()
                    .map(|(name, value)| MetricSample {
                        name,
                        value,
                        unit: source.unit(name),
                        collected_at,
                    })
                    .collect();

                debug!("[Sample] {}", describe(&samples));

                for sample in samples {
                    if let Some(value) = sample.value {
                        series.entry(sample.name).or_default().push(value);
                    }
                }
            }

            for &name in &self.plan.sampled {
                let samples = series.get(&name).map(Vec::as_slice).unwrap_or(&[]);
                match reduce(Aggregation::Mean, samples) {
                    Ok(mean) => metrics.set(name, Some(mean)),
                    Err(e) => warn!("{} unavailable: {}", name, e),
                }
            }
        }

        if !self.plan.point.is_empty() {
            for (name, value) in source.fetch_many(&self.plan.point).await {
                let samples: Vec<f64> = value.into_iter().collect();
                metrics.set(name, reduce(Aggregation::Last, &samples).ok());
            }
        }

        info!(
            "Collected {}/{} metric(s) from {}",
            metrics.available_count(),
            MetricName::ALL.len(),
            source.name()
        );

        Ok(metrics)
    }
}

fn describe(samples: &[MetricSample]) -> String {
    samples
        .iter()
        .map(|sample| match sample.value {
            Some(value) => format!("{}: {:.2} {}", sample.name, value, sample.unit.suffix()),
            None => format!("{}: unavailable", sample.name),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Unit;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Returns 1.0, 2.0, 3.0, ... for CPU and nothing for disk write
    struct CountingSource {
        calls: AtomicUsize,
    }

    impl CountingSource {
        fn new() -> Self {
            CountingSource {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MetricSource for CountingSource {
        fn name(&self) -> &str {
            "counting"
        }

        fn unit(&self, _metric: MetricName) -> Unit {
            Unit::Percent
        }

        async fn fetch(&self, metric: MetricName) -> Option<f64> {
            match metric {
                MetricName::Cpu => Some((self.calls.fetch_add(1, Ordering::SeqCst) + 1) as f64),
                MetricName::DiskWriteRate => None,
                _ => Some(0.5),
            }
        }
    }

    #[test]
    fn test_sample_count() {
        let count = sample_count(Duration::from_secs(3), Duration::from_secs(30)).unwrap();
        assert_eq!(count, 10);

        let count = sample_count(Duration::from_secs(4), Duration::from_secs(30)).unwrap();
        assert_eq!(count, 7);
    }

    #[test]
    fn test_invalid_sampling_is_a_config_error() {
        assert!(matches!(
            sample_count(Duration::from_secs(5), Duration::from_secs(3)),
            Err(ConfigError::InvalidSampling(_))
        ));
        assert!(matches!(
            sample_count(Duration::ZERO, Duration::from_secs(3)),
            Err(ConfigError::InvalidSampling(_))
        ));
    }

    #[test]
    fn test_oversized_window_is_rejected() {
        assert!(matches!(
            sample_count(Duration::from_nanos(1), Duration::from_secs(u64::MAX)),
            Err(ConfigError::InvalidSampling(_))
        ));
        assert!(matches!(
            sample_count(Duration::from_millis(1), Duration::from_secs(3600)),
            Err(ConfigError::InvalidSampling(_))
        ));
        assert_eq!(
            sample_count(Duration::from_secs(1), Duration::from_secs(MAX_SAMPLES as u64)).unwrap(),
            MAX_SAMPLES
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_window_fetches_nothing() {
        let mut calls = 0;
        let result = sample(
            || {
                calls += 1;
                async {}
            },
            Duration::from_nanos(1),
            Duration::from_secs(u64::MAX),
        )
        .await;

        assert!(matches!(result, Err(ConfigError::InvalidSampling(_))));
        assert_eq!(calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_takes_one_sample_per_interval() {
        let started = Instant::now();
        let times = Mutex::new(Vec::new());
        let mut next = 0;

        let samples = sample(
            || {
                times.lock().unwrap().push(Instant::now());
                next += 1;
                let value = next;
                async move { value }
            },
            Duration::from_secs(3),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        assert_eq!(samples, (1..=10).collect::<Vec<_>>());

        let times = times.into_inner().unwrap();
        assert_eq!(times.len(), 10);
        assert_eq!(times[0], started);
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(3));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_window_fetches_nothing() {
        let mut calls = 0;
        let result = sample(
            || {
                calls += 1;
                async {}
            },
            Duration::from_secs(10),
            Duration::from_secs(5),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_averages_sampled_metrics() {
        let source = CountingSource::new();
        let plan = ObservationPlan::sampled_window(Duration::from_secs(3), Duration::from_secs(30));
        let observer = Observer::new(plan).unwrap();

        let metrics = observer.run(&source).await.unwrap();

        // mean of 1..=10
        assert_eq!(metrics.get(MetricName::Cpu), Some(5.5));
        assert_eq!(metrics.get(MetricName::Memory), Some(0.5));
        assert_eq!(metrics.get(MetricName::DiskWriteRate), None);
        assert_eq!(metrics.get(MetricName::DiskUsage), Some(0.5));
        assert_eq!(metrics.get(MetricName::NetworkOutRate), Some(0.5));
    }

    #[tokio::test]
    async fn test_point_plan_reads_every_metric_once() {
        let source = CountingSource::new();
        let observer = Observer::new(ObservationPlan::point_in_time()).unwrap();

        let metrics = observer.run(&source).await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.get(MetricName::Cpu), Some(1.0));
        assert_eq!(metrics.available_count(), MetricName::ALL.len() - 1);
    }

    #[test]
    fn test_observer_rejects_empty_window() {
        let plan = ObservationPlan::sampled_window(Duration::from_secs(3), Duration::from_secs(1));
        assert!(Observer::new(plan).is_err());
    }
}
