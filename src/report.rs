// Report module - renders the collected metrics and the verdict
//
// This module is responsible for:
// 1. Building the structured record of one run
// 2. Rendering it as text or JSON on stdout
// 3. Optionally persisting the JSON record to a file
//
// No classification happens here: the verdict arrives already decided.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::classifier::{DimensionOutcome, Evaluation, Verdict};
use crate::metrics::{MetricName, MetricSet, Unit};

/// Errors that can occur while emitting a report
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report: {0}")]
    WriteError(#[from] std::io::Error),

    #[error("Failed to serialize report: {0}")]
    SerializeError(#[from] serde_json::Error),
}

/// Final status shown to the user
///
/// Wraps the binary verdict with a separate state for runs where no metric
/// produced any data: silence is not evidence of load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Idle,
    Active,
    InsufficientData,
}

impl Status {
    pub fn from_evaluation(metrics: &MetricSet, verdict: Verdict) -> Self {
        if !metrics.has_any_data() {
            return Status::InsufficientData;
        }
        match verdict {
            Verdict::Idle => Status::Idle,
            Verdict::Active => Status::Active,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "IDLE",
            Status::Active => "ACTIVE",
            Status::InsufficientData => "INSUFFICIENT DATA",
        }
    }

    /// Process exit code: 0 idle, 1 active, 3 insufficient data
    ///
    /// 2 is reserved for errors and set by the caller.
    pub fn exit_code(&self) -> u8 {
        match self {
            Status::Idle => 0,
            Status::Active => 1,
            Status::InsufficientData => 3,
        }
    }
}

/// One line of the text report
#[derive(Debug, Clone, PartialEq)]
struct MetricLine {
    name: MetricName,
    value: Option<f64>,
    unit: Unit,
}

/// Structured record of one run
///
/// # JSON Structure
/// ```json
/// {
///   "timestamp": "2024-01-15T10:30:00Z",
///   "source": "local",
///   "average_cpu_percent": 3.2,
///   "average_memory_percent": 14.8,
///   "average_disk_read_Bps": 0.0,
///   "average_disk_write_Bps": 2048.0,
///   "disk_usage_percent": 41.0,
///   "network_in_Bps": 120.0,
///   "network_out_Bps": null,
///   "is_idle": false,
///   "status": "ACTIVE",
///   "dimensions": [{ "name": "cpu", "state": "idle" }]
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct IdleReport {
    pub timestamp: DateTime<Utc>,
    pub source: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    pub average_cpu_percent: Option<f64>,
    pub average_memory_percent: Option<f64>,

    #[serde(rename = "average_disk_read_Bps")]
    pub average_disk_read_bps: Option<f64>,

    #[serde(rename = "average_disk_write_Bps")]
    pub average_disk_write_bps: Option<f64>,

    pub disk_usage_percent: Option<f64>,

    #[serde(rename = "network_in_Bps")]
    pub network_in_bps: Option<f64>,

    #[serde(rename = "network_out_Bps")]
    pub network_out_bps: Option<f64>,

    pub is_idle: bool,
    pub status: Status,
    pub dimensions: Vec<DimensionOutcome>,

    #[serde(skip)]
    lines: Vec<MetricLine>,
}

impl IdleReport {
    /// Builds the record from a finished run
    ///
    /// # Arguments
    /// * `started_at` - When the observation began
    /// * `source` - Name of the metric source
    /// * `target` - Monitored resource (instance id), if any
    /// * `metrics` - Aggregated values
    /// * `units` - Unit of each metric as reported by the source
    /// * `evaluation` - Classifier output
    pub fn new(
        started_at: DateTime<Utc>,
        source: &str,
        target: Option<String>,
        metrics: &MetricSet,
        units: impl Fn(MetricName) -> Unit,
        evaluation: Evaluation,
    ) -> Self {
        let status = Status::from_evaluation(metrics, evaluation.verdict);

        IdleReport {
            timestamp: started_at,
            source: source.to_string(),
            target,
            average_cpu_percent: metrics.get(MetricName::Cpu),
            average_memory_percent: metrics.get(MetricName::Memory),
            average_disk_read_bps: metrics.get(MetricName::DiskReadRate),
            average_disk_write_bps: metrics.get(MetricName::DiskWriteRate),
            disk_usage_percent: metrics.get(MetricName::DiskUsage),
            network_in_bps: metrics.get(MetricName::NetworkInRate),
            network_out_bps: metrics.get(MetricName::NetworkOutRate),
            is_idle: status == Status::Idle,
            status,
            dimensions: evaluation.dimensions,
            lines: MetricName::ALL
                .iter()
                .map(|&name| MetricLine {
                    name,
                    value: metrics.get(name),
                    unit: units(name),
                })
                .collect(),
        }
    }

    /// Human-readable rendering: one line per metric, then the status
    pub fn render_text(&self) -> String {
        let mut out = String::from("----- METRICS -----\n");

        for line in &self.lines {
            match line.value {
                Some(value) => {
                    out.push_str(&format!(
                        "{}: {:.2} {}\n",
                        line.name.label(),
                        value,
                        line.unit.suffix()
                    ));
                }
                None => out.push_str(&format!("{}: unavailable\n", line.name.label())),
            }
        }

        let subject = match &self.target {
            Some(target) => format!("INSTANCE STATUS ({})", target),
            None => "INSTANCE STATUS".to_string(),
        };
        out.push_str(&format!("\n{}: {}\n", subject, self.status.as_str()));
        out
    }

    pub fn render_json(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Output format for stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Writes reports to stdout and, optionally, a record file
pub struct Reporter {
    format: OutputFormat,
    record_path: Option<PathBuf>,
}

impl Reporter {
    pub fn new(format: OutputFormat, record_path: Option<PathBuf>) -> Self {
        Reporter {
            format,
            record_path,
        }
    }

    /// Emits `report` to `out` in the configured format, then writes the
    /// JSON record file if one was requested
    pub fn emit<W: Write>(&self, report: &IdleReport, out: &mut W) -> Result<(), ReportError> {
        let rendered = match self.format {
            OutputFormat::Text => report.render_text(),
            OutputFormat::Json => report.render_json()? + "\n",
        };
        out.write_all(rendered.as_bytes())?;
        out.flush()?;

        if let Some(path) = &self.record_path {
            Self::write_record(report, path)?;
        }

        Ok(())
    }

    fn write_record(report: &IdleReport, path: &Path) -> Result<(), ReportError> {
        let json = report.render_json()?;
        debug!("Writing {} bytes to {}", json.len(), path.display());
        fs::write(path, json)?;
        info!("Report written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{evaluate, StandardCutoffs};
    use chrono::TimeZone;

    fn started_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap()
    }

    fn report_for(metrics: &MetricSet) -> IdleReport {
        let evaluation = evaluate(metrics, &StandardCutoffs::CLOUD.policy());
        IdleReport::new(
            started_at(),
            "cloudwatch",
            Some("i-0123".to_string()),
            metrics,
            |_| Unit::Percent,
            evaluation,
        )
    }

    fn idle_metrics() -> MetricSet {
        MetricSet::from_values([
            (MetricName::Cpu, Some(3.0)),
            (MetricName::Memory, Some(15.0)),
            (MetricName::DiskUsage, Some(10.0)),
            (MetricName::NetworkInRate, Some(50.0)),
            (MetricName::NetworkOutRate, Some(50.0)),
            (MetricName::DiskReadRate, Some(2.0)),
            (MetricName::DiskWriteRate, Some(2.0)),
        ])
    }

    #[test]
    fn test_status_from_evaluation() {
        assert_eq!(
            Status::from_evaluation(&idle_metrics(), Verdict::Idle),
            Status::Idle
        );
        assert_eq!(
            Status::from_evaluation(&idle_metrics(), Verdict::Active),
            Status::Active
        );
        assert_eq!(
            Status::from_evaluation(&MetricSet::unavailable(), Verdict::Active),
            Status::InsufficientData
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Status::Idle.exit_code(), 0);
        assert_eq!(Status::Active.exit_code(), 1);
        assert_eq!(Status::InsufficientData.exit_code(), 3);
    }

    #[test]
    fn test_text_lists_every_metric_and_status() {
        let mut metrics = idle_metrics();
        metrics.set(MetricName::Memory, None);
        let text = report_for(&metrics).render_text();

        assert!(text.starts_with("----- METRICS -----\n"));
        assert!(text.contains("CPU: 3.00 %\n"));
        assert!(text.contains("Memory: unavailable\n"));
        assert_eq!(text.lines().filter(|line| line.contains(": ")).count(), 8);
        assert!(text.ends_with("INSTANCE STATUS (i-0123): ACTIVE\n"));
    }

    #[test]
    fn test_json_record_fields() {
        let report = report_for(&idle_metrics());
        let value: serde_json::Value = serde_json::from_str(&report.render_json().unwrap()).unwrap();

        assert_eq!(value["timestamp"], "2024-01-15T10:30:00Z");
        assert_eq!(value["average_cpu_percent"], 3.0);
        assert_eq!(value["average_disk_read_Bps"], 2.0);
        assert_eq!(value["network_out_Bps"], 50.0);
        assert_eq!(value["is_idle"], true);
        assert_eq!(value["status"], "IDLE");
        assert_eq!(value["dimensions"][3]["name"], "network");
        assert_eq!(value["dimensions"][3]["state"], "idle");
    }

    #[test]
    fn test_unavailable_is_null_in_json() {
        let report = report_for(&MetricSet::unavailable());
        let value: serde_json::Value = serde_json::from_str(&report.render_json().unwrap()).unwrap();

        assert!(value["average_cpu_percent"].is_null());
        assert_eq!(value["is_idle"], false);
        assert_eq!(value["status"], "INSUFFICIENT_DATA");
    }

    #[test]
    fn test_reporter_writes_record_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let reporter = Reporter::new(OutputFormat::Text, Some(path.clone()));
        let mut out = Vec::new();

        reporter.emit(&report_for(&idle_metrics()), &mut out).unwrap();

        let stdout = String::from_utf8(out).unwrap();
        assert!(stdout.contains("INSTANCE STATUS (i-0123): IDLE"));

        let record: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(record["source"], "cloudwatch");
        assert_eq!(record["target"], "i-0123");
    }
}
