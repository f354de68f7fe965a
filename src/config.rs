// Configuration module - settings for one idle-check run
//
// This module is responsible for:
// 1. Loading settings from an optional JSON file
// 2. Filling in defaults for everything the file leaves out
// 3. Validating the settings before any metric is collected
// 4. Building the threshold policy the classifier runs with

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::classifier::{DimensionKind, StandardCutoffs, ThresholdPolicy};

/// CloudWatch keeps datapoints for at most 455 days
pub const MAX_LOOKBACK_MINUTES: u64 = 455 * 24 * 60;

/// Errors that can occur while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file format: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Invalid sampling parameters: {0}")]
    InvalidSampling(String),

    #[error("Invalid threshold for {metric}: {value}")]
    InvalidThreshold { metric: String, value: f64 },

    #[error("Missing required setting: {0}")]
    MissingRequiredSetting(String),
}

/// Where metrics are read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Local OS counters, sampled over an observation window
    #[default]
    Local,
    /// AWS CloudWatch datapoints for one EC2 instance
    Cloudwatch,
}

impl SourceKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "local" => Some(SourceKind::Local),
            "cloudwatch" | "cw" => Some(SourceKind::Cloudwatch),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Local => "local",
            SourceKind::Cloudwatch => "cloudwatch",
        }
    }
}

/// Settings for one run, as loaded from the config file.
///
/// # Example Config File
/// ```json
/// {
///   "source": "cloudwatch",
///   "cloudwatch": {
///     "instance_id": "i-0ad79521e121179ca",
///     "region": "eu-west-1",
///     "lookback_minutes": 15
///   },
///   "thresholds": {
///     "cpu_percent": 10,
///     "network_bytes": 1024,
///     "tracked": ["cpu", "memory", "network", "disk_io"]
///   }
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleCheckSettings {
    pub source: SourceKind,
    pub cloudwatch: CloudWatchSettings,
    pub local: LocalSettings,

    /// Overrides of the source's default cutoffs
    pub thresholds: ThresholdSettings,
}

/// Settings for the CloudWatch source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudWatchSettings {
    /// EC2 instance to inspect (InstanceId dimension)
    pub instance_id: String,

    /// AWS region; falls back to the SDK's environment resolution
    pub region: Option<String>,

    /// Named profile from the shared AWS config
    pub profile: Option<String>,

    /// How far back to look for datapoints
    pub lookback_minutes: u64,

    /// Datapoint bucket size in seconds
    pub period_secs: i32,

    /// Upper bound on a single CloudWatch request
    pub request_timeout_secs: u64,
}

impl Default for CloudWatchSettings {
    fn default() -> Self {
        CloudWatchSettings {
            instance_id: String::new(),
            region: None,
            profile: None,
            lookback_minutes: 15,
            period_secs: 300,
            request_timeout_secs: 30,
        }
    }
}

/// Settings for the local source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    /// Length of the sampling window in seconds
    pub observation_duration_secs: u64,

    /// Time between two samples in seconds
    pub sample_interval_secs: u64,

    /// Delay between the two counter readings of a rate measurement
    pub rate_delay_ms: u64,

    /// Filesystem reported as disk usage
    pub mount_point: PathBuf,
}

impl Default for LocalSettings {
    fn default() -> Self {
        LocalSettings {
            observation_duration_secs: 30,
            sample_interval_secs: 3,
            rate_delay_ms: 1000,
            mount_point: PathBuf::from("/"),
        }
    }
}

impl CloudWatchSettings {
    /// Lookback as a Duration, `None` if it does not fit
    pub fn lookback(&self) -> Option<Duration> {
        self.lookback_minutes.checked_mul(60).map(Duration::from_secs)
    }
}

impl LocalSettings {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn observation_duration(&self) -> Duration {
        Duration::from_secs(self.observation_duration_secs)
    }

    pub fn rate_delay(&self) -> Duration {
        Duration::from_millis(self.rate_delay_ms)
    }
}

/// Optional cutoff overrides; unset fields keep the source's default
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdSettings {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_usage_percent: Option<f64>,

    /// Applies to both network directions
    pub network_bytes: Option<f64>,

    /// Applies to both disk read and write
    pub disk_io: Option<f64>,

    /// Dimensions that decide the verdict. Defaults to all five for
    /// CloudWatch and to cpu, memory and disk_io for the local source.
    pub tracked: Option<Vec<DimensionKind>>,
}

impl IdleCheckSettings {
    /// Loads settings from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading settings from {}", path.display());

        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(serde_json::from_str(&content)?)
    }

    /// Threshold policy for the configured source, with overrides applied
    pub fn policy(&self) -> ThresholdPolicy {
        let (base, default_tracked): (StandardCutoffs, &[DimensionKind]) = match self.source {
            SourceKind::Cloudwatch => (StandardCutoffs::CLOUD, &DimensionKind::ALL[..]),
            SourceKind::Local => (StandardCutoffs::LOCAL, &DimensionKind::LOCAL_DEFAULT[..]),
        };
        let t = &self.thresholds;
        let tracked = t.tracked.as_deref().unwrap_or(default_tracked);

        StandardCutoffs {
            cpu: t.cpu_percent.unwrap_or(base.cpu),
            memory: t.memory_percent.unwrap_or(base.memory),
            disk_usage: t.disk_usage_percent.unwrap_or(base.disk_usage),
            network: t.network_bytes.unwrap_or(base.network),
            disk_io: t.disk_io.unwrap_or(base.disk_io),
        }
        .policy_for(tracked)
    }

    /// Checks everything the selected source needs
    ///
    /// Runs before any metric is collected; every error here is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.source {
            SourceKind::Cloudwatch => {
                let cw = &self.cloudwatch;
                if cw.instance_id.trim().is_empty() {
                    return Err(ConfigError::MissingRequiredSetting(
                        "cloudwatch.instance_id (--instance-id)".to_string(),
                    ));
                }
                if cw.lookback_minutes == 0 || cw.lookback_minutes > MAX_LOOKBACK_MINUTES {
                    return Err(ConfigError::InvalidSettings(format!(
                        "cloudwatch.lookback_minutes must be between 1 and {}",
                        MAX_LOOKBACK_MINUTES
                    )));
                }
                if cw.period_secs <= 0 {
                    return Err(ConfigError::InvalidSettings(
                        "cloudwatch.period_secs must be greater than zero".to_string(),
                    ));
                }
                if cw.request_timeout_secs == 0 {
                    return Err(ConfigError::InvalidSettings(
                        "cloudwatch.request_timeout_secs must be greater than zero".to_string(),
                    ));
                }
            }
            SourceKind::Local => {
                crate::sampler::sample_count(
                    self.local.sample_interval(),
                    self.local.observation_duration(),
                )?;
            }
        }

        self.policy().validate()
    }
}
