// CloudWatch metric source
//
// Queries AWS CloudWatch for the most recent datapoint of each metric over a
// short lookback window, scoped to one EC2 instance by its InstanceId
// dimension. Memory and disk usage come from the CloudWatch agent namespace
// and are unavailable when the agent is not installed.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_cloudwatch::config::Region;
use aws_sdk_cloudwatch::error::DisplayErrorContext;
use aws_sdk_cloudwatch::primitives::DateTime as AwsDateTime;
use aws_sdk_cloudwatch::types::{Datapoint, Dimension, Statistic};
use aws_sdk_cloudwatch::Client;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{MetricName, MetricSource, Unit};
use crate::config::{CloudWatchSettings, ConfigError};

/// Dimension every query is scoped by
const INSTANCE_DIMENSION: &str = "InstanceId";

/// Errors raised while talking to CloudWatch
///
/// These never leave this module: `fetch` logs them and reports the metric
/// as unavailable.
#[derive(Error, Debug)]
pub enum CloudWatchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Request(String),

    #[error("lookback of {0:?} does not fit before the current time")]
    InvalidWindow(Duration),
}

/// Statistic requested for a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticKind {
    Average,
    Sum,
}

impl StatisticKind {
    fn to_sdk(self) -> Statistic {
        match self {
            StatisticKind::Average => Statistic::Average,
            StatisticKind::Sum => Statistic::Sum,
        }
    }

    fn read(self, datapoint: &Datapoint) -> Option<f64> {
        match self {
            StatisticKind::Average => datapoint.average(),
            StatisticKind::Sum => datapoint.sum(),
        }
    }
}

/// Where a metric lives in CloudWatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricQuery {
    pub namespace: &'static str,
    pub metric_name: &'static str,
    pub statistic: StatisticKind,
}

impl MetricQuery {
    /// CloudWatch coordinates of each tracked metric
    pub fn for_metric(metric: MetricName) -> Self {
        let (namespace, metric_name, statistic) = match metric {
            MetricName::Cpu => ("AWS/EC2", "CPUUtilization", StatisticKind::Average),
            MetricName::Memory => ("CWAgent", "mem_used_percent", StatisticKind::Average),
            MetricName::DiskUsage => ("CWAgent", "disk_used_percent", StatisticKind::Average),
            MetricName::NetworkInRate => ("AWS/EC2", "NetworkIn", StatisticKind::Sum),
            MetricName::NetworkOutRate => ("AWS/EC2", "NetworkOut", StatisticKind::Sum),
            MetricName::DiskReadRate => ("AWS/EC2", "EBSReadOps", StatisticKind::Sum),
            MetricName::DiskWriteRate => ("AWS/EC2", "EBSWriteOps", StatisticKind::Sum),
        };

        MetricQuery {
            namespace,
            metric_name,
            statistic,
        }
    }
}

/// One datapoint reduced to the requested statistic
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteDatapoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Metric source backed by the CloudWatch GetMetricStatistics API
pub struct CloudWatchSource {
    client: Client,

    /// EC2 instance the metrics are scoped to
    instance_id: String,

    /// How far back to look for datapoints
    lookback: Duration,

    /// Datapoint bucket size in seconds
    period_secs: i32,

    /// Upper bound on a single request
    request_timeout: Duration,
}

impl CloudWatchSource {
    /// Builds the AWS client from the default credential chain
    ///
    /// Profile and region from the settings override the environment.
    pub async fn connect(settings: &CloudWatchSettings) -> Result<Self, ConfigError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(profile) = &settings.profile {
            loader = loader.profile_name(profile);
        }
        if let Some(region) = &settings.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        info!(
            "CloudWatch source for instance {} (region: {})",
            settings.instance_id,
            sdk_config
                .region()
                .map(|r| r.as_ref().to_string())
                .unwrap_or_else(|| "default".to_string())
        );

        Self::with_client(Client::new(&sdk_config), settings)
    }

    pub fn with_client(
        client: Client,
        settings: &CloudWatchSettings,
    ) -> Result<Self, ConfigError> {
        let lookback = settings.lookback().ok_or_else(|| {
            ConfigError::InvalidSettings(format!(
                "cloudwatch.lookback_minutes is too large: {}",
                settings.lookback_minutes
            ))
        })?;

        Ok(CloudWatchSource {
            client,
            instance_id: settings.instance_id.clone(),
            lookback,
            period_secs: settings.period_secs,
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
        })
    }

    /// Runs one GetMetricStatistics request for `query`
    async fn query_datapoints(
        &self,
        query: MetricQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<RemoteDatapoint>, CloudWatchError> {
        let (start, end) =
            query_window(now, self.lookback).ok_or(CloudWatchError::InvalidWindow(self.lookback))?;

        let request = self
            .client
            .get_metric_statistics()
            .namespace(query.namespace)
            .metric_name(query.metric_name)
            .dimensions(
                Dimension::builder()
                    .name(INSTANCE_DIMENSION)
                    .value(&self.instance_id)
                    .build(),
            )
            .start_time(to_aws_time(start))
            .end_time(to_aws_time(end))
            .period(self.period_secs)
            .statistics(query.statistic.to_sdk())
            .send();

        let output = tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| CloudWatchError::Timeout(self.request_timeout))?
            .map_err(|e| CloudWatchError::Request(DisplayErrorContext(&e).to_string()))?;

        Ok(output
            .datapoints()
            .iter()
            .filter_map(|datapoint| {
                let timestamp = datapoint.timestamp().and_then(from_aws_time)?;
                let value = query.statistic.read(datapoint)?;
                Some(RemoteDatapoint { timestamp, value })
            })
            .collect())
    }
}

#[async_trait]
impl MetricSource for CloudWatchSource {
    fn name(&self) -> &str {
        "cloudwatch"
    }

    fn unit(&self, metric: MetricName) -> Unit {
        match metric {
            MetricName::Cpu | MetricName::Memory | MetricName::DiskUsage => Unit::Percent,
            MetricName::NetworkInRate | MetricName::NetworkOutRate => Unit::Bytes,
            MetricName::DiskReadRate | MetricName::DiskWriteRate => Unit::Count,
        }
    }

    async fn fetch(&self, metric: MetricName) -> Option<f64> {
        let query = MetricQuery::for_metric(metric);
        debug!(
            "Querying {}/{} ({:?}) for {}",
            query.namespace, query.metric_name, query.statistic, self.instance_id
        );

        match self.query_datapoints(query, Utc::now()).await {
            Ok(datapoints) => {
                let value = latest_value(&datapoints);
                if value.is_none() {
                    warn!(
                        "No datapoints for {}/{} in the last {} minute(s)",
                        query.namespace,
                        query.metric_name,
                        self.lookback.as_secs() / 60
                    );
                }
                value
            }
            Err(e) => {
                warn!("CloudWatch query for {} failed: {}", metric, e);
                None
            }
        }
    }
}

/// `[now - lookback, now]`, `None` when the lookback is out of range
pub fn query_window(
    now: DateTime<Utc>,
    lookback: Duration,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let lookback = ChronoDuration::from_std(lookback).ok()?;
    Some((now.checked_sub_signed(lookback)?, now))
}

/// Value of the newest datapoint, `None` when there are none.
///
/// CloudWatch does not return datapoints in time order, so the newest is
/// picked by timestamp rather than position.
pub fn latest_value(datapoints: &[RemoteDatapoint]) -> Option<f64> {
    datapoints
        .iter()
        .max_by_key(|datapoint| datapoint.timestamp)
        .map(|datapoint| datapoint.value)
}

fn to_aws_time(time: DateTime<Utc>) -> AwsDateTime {
    AwsDateTime::from_secs(time.timestamp())
}

fn from_aws_time(time: &AwsDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(time.secs(), time.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_cloudwatch::config::retry::RetryConfig;
    use aws_sdk_cloudwatch::config::Credentials;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, minute, 0).unwrap()
    }

    #[test]
    fn test_latest_value_picks_newest_timestamp() {
        let datapoints = vec![
            RemoteDatapoint { timestamp: at(5), value: 4.0 },
            RemoteDatapoint { timestamp: at(10), value: 7.5 },
            RemoteDatapoint { timestamp: at(0), value: 1.0 },
        ];
        assert_eq!(latest_value(&datapoints), Some(7.5));
    }

    #[test]
    fn test_no_datapoints_is_unavailable() {
        assert_eq!(latest_value(&[]), None);
    }

    #[test]
    fn test_query_window() {
        let (start, end) = query_window(at(30), Duration::from_secs(15 * 60)).unwrap();
        assert_eq!(start, at(15));
        assert_eq!(end, at(30));
    }

    #[test]
    fn test_query_window_out_of_range() {
        assert_eq!(query_window(at(30), Duration::from_secs(u64::MAX)), None);
    }

    fn unreachable_settings() -> CloudWatchSettings {
        CloudWatchSettings {
            instance_id: "i-0123456789abcdef0".to_string(),
            region: Some("us-east-1".to_string()),
            request_timeout_secs: 5,
            ..Default::default()
        }
    }

    /// Client pointed at a closed local port, no retries
    fn unreachable_client() -> Client {
        let config = aws_sdk_cloudwatch::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("AKIDTEST", "secret", None, None, "test"))
            .endpoint_url("http://127.0.0.1:1")
            .retry_config(RetryConfig::disabled())
            .build();
        Client::from_conf(config)
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unavailable() {
        let source = CloudWatchSource::with_client(unreachable_client(), &unreachable_settings())
            .unwrap();

        let query = MetricQuery::for_metric(MetricName::Cpu);
        assert!(source.query_datapoints(query, Utc::now()).await.is_err());
        assert_eq!(source.fetch(MetricName::Cpu).await, None);

        let values = source
            .fetch_many(&[MetricName::Memory, MetricName::NetworkInRate])
            .await;
        assert!(values.iter().all(|(_, value)| value.is_none()));
    }

    #[tokio::test]
    async fn test_oversized_lookback_is_rejected() {
        let settings = CloudWatchSettings {
            lookback_minutes: u64::MAX,
            ..unreachable_settings()
        };
        assert!(matches!(
            CloudWatchSource::with_client(unreachable_client(), &settings),
            Err(ConfigError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_metric_queries() {
        let cpu = MetricQuery::for_metric(MetricName::Cpu);
        assert_eq!(cpu.namespace, "AWS/EC2");
        assert_eq!(cpu.metric_name, "CPUUtilization");
        assert_eq!(cpu.statistic, StatisticKind::Average);

        let memory = MetricQuery::for_metric(MetricName::Memory);
        assert_eq!(memory.namespace, "CWAgent");
        assert_eq!(memory.metric_name, "mem_used_percent");

        let net_out = MetricQuery::for_metric(MetricName::NetworkOutRate);
        assert_eq!(net_out.metric_name, "NetworkOut");
        assert_eq!(net_out.statistic, StatisticKind::Sum);

        let ebs_write = MetricQuery::for_metric(MetricName::DiskWriteRate);
        assert_eq!(ebs_write.metric_name, "EBSWriteOps");
        assert_eq!(ebs_write.statistic, StatisticKind::Sum);
    }

    #[test]
    fn test_statistic_read() {
        let datapoint = Datapoint::builder().average(12.5).sum(300.0).build();
        assert_eq!(StatisticKind::Average.read(&datapoint), Some(12.5));
        assert_eq!(StatisticKind::Sum.read(&datapoint), Some(300.0));
        assert_eq!(StatisticKind::Sum.read(&Datapoint::builder().build()), None);
    }

    #[test]
    fn test_time_conversion() {
        let time = at(42);
        assert_eq!(from_aws_time(&to_aws_time(time)), Some(time));
    }
}
