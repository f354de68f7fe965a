// Local OS counter source
//
// Reads CPU, memory and disk usage from the host via sysinfo, and derives
// network and disk I/O rates from two cumulative counter readings taken a
// short delay apart.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sysinfo::{Disks, Networks, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tracing::{debug, warn};

use super::diskstats::{read_disk_counters, DiskCounters};
use super::{MetricName, MetricSource, Unit};

/// Cumulative bytes received and transmitted across all interfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct NetworkCounters {
    received: u64,
    transmitted: u64,
}

/// Metric source backed by the local operating system
///
/// # Rate Metrics
/// Network and disk I/O rates need two readings of a cumulative counter.
/// When several metrics are fetched together they share a single delay
/// window, so one sampling tick costs one delay rather than one per metric.
///
/// # Platform Support
/// - CPU, memory, disk usage, network: everywhere sysinfo works
/// - Disk I/O: Linux only (`/proc/diskstats`); unavailable elsewhere
pub struct LocalSource {
    /// Delay between the two readings of a rate or CPU measurement
    rate_delay: Duration,

    /// Filesystem whose usage is reported as disk_usage
    mount_point: PathBuf,
}

impl LocalSource {
    /// Creates a new LocalSource
    ///
    /// The delay is raised to sysinfo's minimum CPU refresh interval when
    /// shorter, otherwise CPU usage would always read as zero.
    pub fn new(rate_delay: Duration, mount_point: impl Into<PathBuf>) -> Self {
        LocalSource {
            rate_delay: rate_delay.max(MINIMUM_CPU_UPDATE_INTERVAL),
            mount_point: mount_point.into(),
        }
    }

    fn read_memory_percent() -> Option<f64> {
        let mut sys = System::new();
        sys.refresh_memory();
        percentage(sys.used_memory(), sys.total_memory())
    }

    fn read_disk_usage_percent(mount_point: &Path) -> Option<f64> {
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == mount_point)?;

        let total = disk.total_space();
        let used = total.saturating_sub(disk.available_space());
        percentage(used, total)
    }

    fn read_network_counters() -> NetworkCounters {
        let networks = Networks::new_with_refreshed_list();
        networks
            .list()
            .values()
            .fold(NetworkCounters::default(), |acc, data| NetworkCounters {
                received: acc.received.saturating_add(data.total_received()),
                transmitted: acc.transmitted.saturating_add(data.total_transmitted()),
            })
    }

    fn read_disk_counters() -> Option<DiskCounters> {
        match read_disk_counters() {
            Ok(counters) => Some(counters),
            Err(e) => {
                warn!("Disk I/O counters unavailable: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl MetricSource for LocalSource {
    fn name(&self) -> &str {
        "local"
    }

    fn unit(&self, metric: MetricName) -> Unit {
        match metric {
            MetricName::Cpu | MetricName::Memory | MetricName::DiskUsage => Unit::Percent,
            _ => Unit::BytesPerSecond,
        }
    }

    async fn fetch(&self, metric: MetricName) -> Option<f64> {
        self.fetch_many(&[metric]).await.into_iter().next()?.1
    }

    /// Measures all requested metrics inside one delay window
    async fn fetch_many(&self, metrics: &[MetricName]) -> Vec<(MetricName, Option<f64>)> {
        let wants = |name: MetricName| metrics.contains(&name);
        let wants_cpu = wants(MetricName::Cpu);
        let wants_network = wants(MetricName::NetworkInRate) || wants(MetricName::NetworkOutRate);
        let wants_disk_io = wants(MetricName::DiskReadRate) || wants(MetricName::DiskWriteRate);

        let mut sys = System::new();
        let mut first_network = None;
        let mut first_disk = None;

        if wants_cpu {
            sys.refresh_cpu();
        }
        if wants_network {
            first_network = Some(Self::read_network_counters());
        }
        if wants_disk_io {
            first_disk = Self::read_disk_counters();
        }

        let started = Instant::now();
        if wants_cpu || wants_network || wants_disk_io {
            tokio::time::sleep(self.rate_delay).await;
        }

        let mut cpu = None;
        if wants_cpu {
            sys.refresh_cpu();
            cpu = Some(f64::from(sys.global_cpu_info().cpu_usage()));
        }
        let second_network = first_network.map(|_| Self::read_network_counters());
        let second_disk = first_disk.and_then(|_| Self::read_disk_counters());
        let elapsed = started.elapsed();

        let network_rate = |pick: fn(&NetworkCounters) -> u64| -> Option<f64> {
            let (first, second) = (first_network.as_ref()?, second_network.as_ref()?);
            counter_rate(pick(first), pick(second), elapsed)
        };
        let disk_rate = |pick: fn(&DiskCounters) -> u64| -> Option<f64> {
            let (first, second) = (first_disk.as_ref()?, second_disk.as_ref()?);
            counter_rate(pick(first), pick(second), elapsed)
        };

        metrics
            .iter()
            .map(|&metric| {
                let value = match metric {
                    MetricName::Cpu => cpu,
                    MetricName::Memory => Self::read_memory_percent(),
                    MetricName::DiskUsage => Self::read_disk_usage_percent(&self.mount_point),
                    MetricName::NetworkInRate => network_rate(|c| c.received),
                    MetricName::NetworkOutRate => network_rate(|c| c.transmitted),
                    MetricName::DiskReadRate => disk_rate(|c| c.read_bytes),
                    MetricName::DiskWriteRate => disk_rate(|c| c.written_bytes),
                };

                match value {
                    Some(v) => debug!("{} = {:.2} {}", metric, v, self.unit(metric).suffix()),
                    None => debug!("{} unavailable", metric),
                }

                (metric, value)
            })
            .collect()
    }
}

/// Converts two readings of a cumulative counter into a per-second rate.
///
/// Returns `None` when the counter went backwards (reset or wrap) or no
/// time elapsed; a negative rate is never produced.
pub fn counter_rate(first: u64, second: u64, elapsed: Duration) -> Option<f64> {
    if second < first {
        warn!(
            "Counter went backwards ({} -> {}), discarding this reading",
            first, second
        );
        return None;
    }

    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return None;
    }

    Some((second - first) as f64 / secs)
}

/// Percentage of `used` over `total`, unavailable when total is zero
fn percentage(used: u64, total: u64) -> Option<f64> {
    if total == 0 {
        None
    } else {
        Some((used as f64 / total as f64) * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_rate() {
        let rate = counter_rate(1_000, 3_048, Duration::from_secs(2)).unwrap();
        assert!((rate - 1_024.0).abs() < f64::EPSILON);

        assert_eq!(counter_rate(500, 500, Duration::from_secs(1)), Some(0.0));
    }

    #[test]
    fn test_counter_reset_is_unavailable() {
        assert_eq!(counter_rate(10_000, 42, Duration::from_secs(1)), None);
    }

    #[test]
    fn test_counter_rate_needs_elapsed_time() {
        assert_eq!(counter_rate(1, 2, Duration::ZERO), None);
    }

    #[test]
    fn test_percentage() {
        assert_eq!(percentage(25, 100), Some(25.0));
        assert_eq!(percentage(0, 0), None);
    }

    #[test]
    fn test_rate_delay_is_clamped_to_cpu_minimum() {
        let source = LocalSource::new(Duration::ZERO, "/");
        assert!(source.rate_delay >= MINIMUM_CPU_UPDATE_INTERVAL);
    }

    #[test]
    fn test_units() {
        let source = LocalSource::new(Duration::from_secs(1), "/");
        assert_eq!(source.unit(MetricName::Cpu), Unit::Percent);
        assert_eq!(source.unit(MetricName::DiskUsage), Unit::Percent);
        assert_eq!(source.unit(MetricName::NetworkOutRate), Unit::BytesPerSecond);
        assert_eq!(source.unit(MetricName::DiskReadRate), Unit::BytesPerSecond);
    }

    #[tokio::test]
    async fn test_memory_is_read_without_delay() {
        let source = LocalSource::new(Duration::from_secs(1), "/");
        let values = source.fetch_many(&[MetricName::Memory]).await;
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].0, MetricName::Memory);
        if let Some(percent) = values[0].1 {
            assert!((0.0..=100.0).contains(&percent));
        }
    }
}
