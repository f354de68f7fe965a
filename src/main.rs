// Idle Check - is this machine doing anything?
//
// Observes a host for a short window, or asks CloudWatch about an EC2
// instance, and prints each metric followed by an IDLE / ACTIVE verdict.
//
// # Usage
// idle-check [--source local|cloudwatch] [--instance-id <id>] [--config <file>] [--json]
//
// Example:
// idle-check --source cloudwatch --instance-id i-0ad79521e121179ca --region eu-west-1
//
// # Exit Codes
// 0 idle, 1 active, 2 error, 3 insufficient data

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use idle_check::classifier::evaluate;
use idle_check::config::{IdleCheckSettings, SourceKind};
use idle_check::metrics::cloudwatch::CloudWatchSource;
use idle_check::metrics::local::LocalSource;
use idle_check::metrics::MetricSource;
use idle_check::report::{IdleReport, OutputFormat, Reporter, Status};
use idle_check::sampler::{ObservationPlan, Observer};

/// Exit code for any failure before a verdict was reached
const EXIT_ERROR: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr; stdout carries the report only
    init_logging();

    let args: Vec<String> = env::args().collect();

    match run(&args).await {
        Ok(status) => ExitCode::from(status.exit_code()),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_ERROR)
        }
    }
}

/// One complete run: configure, observe, classify, report
async fn run(args: &[String]) -> Result<Status> {
    info!("=== Idle Check Starting ===");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let cli = parse_arguments(args)?;

    let mut settings = match &cli.config_path {
        Some(path) => IdleCheckSettings::load(path).context("Failed to load settings")?,
        None => IdleCheckSettings::default(),
    };
    cli.apply(&mut settings);

    // Fatal configuration problems surface before anything is measured
    settings.validate().context("Invalid configuration")?;
    let policy = settings.policy();

    let (source, plan, target): (Box<dyn MetricSource>, ObservationPlan, Option<String>) =
        match settings.source {
            SourceKind::Local => (
                Box::new(LocalSource::new(
                    settings.local.rate_delay(),
                    settings.local.mount_point.clone(),
                )),
                ObservationPlan::sampled_window(
                    settings.local.sample_interval(),
                    settings.local.observation_duration(),
                ),
                None,
            ),
            SourceKind::Cloudwatch => (
                Box::new(
                    CloudWatchSource::connect(&settings.cloudwatch)
                        .await
                        .context("Failed to set up CloudWatch source")?,
                ),
                ObservationPlan::point_in_time(),
                Some(settings.cloudwatch.instance_id.clone()),
            ),
        };

    let observer = Observer::new(plan)?;

    let started_at = Utc::now();
    let metrics = observer.run(source.as_ref()).await?;

    let evaluation = evaluate(&metrics, &policy);
    info!("Verdict: {}", evaluation.verdict);

    let report = IdleReport::new(
        started_at,
        source.name(),
        target,
        &metrics,
        |metric| source.unit(metric),
        evaluation,
    );

    if report.status == Status::InsufficientData {
        warn!("No metric produced any data; refusing to call the host active or idle");
    }

    let reporter = Reporter::new(cli.format, cli.output_path.clone());
    reporter
        .emit(&report, &mut std::io::stdout().lock())
        .context("Failed to emit report")?;

    Ok(report.status)
}

/// Command-line overrides
///
/// Everything is optional; unset values keep what the config file (or the
/// built-in defaults) say.
#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    config_path: Option<PathBuf>,
    source: Option<SourceKind>,
    instance_id: Option<String>,
    region: Option<String>,
    profile: Option<String>,
    lookback_minutes: Option<u64>,
    duration_secs: Option<u64>,
    interval_secs: Option<u64>,
    format: OutputFormat,
    output_path: Option<PathBuf>,
}

impl CliArgs {
    /// Applies the overrides on top of loaded settings
    fn apply(&self, settings: &mut IdleCheckSettings) {
        if let Some(source) = self.source {
            settings.source = source;
        }
        if let Some(instance_id) = &self.instance_id {
            settings.cloudwatch.instance_id = instance_id.clone();
            // An instance id alone implies the CloudWatch source
            if self.source.is_none() {
                settings.source = SourceKind::Cloudwatch;
            }
        }
        if let Some(region) = &self.region {
            settings.cloudwatch.region = Some(region.clone());
        }
        if let Some(profile) = &self.profile {
            settings.cloudwatch.profile = Some(profile.clone());
        }
        if let Some(lookback) = self.lookback_minutes {
            settings.cloudwatch.lookback_minutes = lookback;
        }
        if let Some(duration) = self.duration_secs {
            settings.local.observation_duration_secs = duration;
        }
        if let Some(interval) = self.interval_secs {
            settings.local.sample_interval_secs = interval;
        }
    }
}

/// Parses command-line arguments
///
/// # Arguments
/// * `--source <local|cloudwatch>` - Metric source (default: local)
/// * `--instance-id <id>` - EC2 instance for the CloudWatch source
/// * `--region <region>` / `--profile <name>` - AWS overrides
/// * `--config <file>` - JSON settings file
/// * `--lookback <minutes>` - CloudWatch lookback window
/// * `--duration <secs>` / `--interval <secs>` - Local observation window
/// * `--json` - Print the report as JSON
/// * `--output <file>` - Also write the JSON record to a file
///
/// # Examples
/// ```bash
/// idle-check
/// idle-check --duration 60 --interval 5 --json
/// idle-check --source cloudwatch --instance-id i-0ad79521e121179ca --profile prod
/// ```
fn parse_arguments(args: &[String]) -> Result<CliArgs> {
    // Helper function to find argument value
    let find_arg = |flag: &str| -> Option<String> {
        args.iter()
            .position(|arg| arg == flag)
            .and_then(|pos| args.get(pos + 1))
            .map(|s| s.to_string())
    };

    let parse_secs = |flag: &str| -> Result<Option<u64>> {
        find_arg(flag)
            .map(|value| {
                value
                    .parse::<u64>()
                    .with_context(|| format!("{} expects a whole number, got '{}'", flag, value))
            })
            .transpose()
    };

    let source = match find_arg("--source") {
        Some(value) => match SourceKind::parse(&value) {
            Some(kind) => Some(kind),
            None => bail!("Unknown source '{}': expected 'local' or 'cloudwatch'", value),
        },
        None => None,
    };

    let format = if args.iter().any(|arg| arg == "--json") {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    Ok(CliArgs {
        config_path: find_arg("--config").map(PathBuf::from),
        source,
        instance_id: find_arg("--instance-id"),
        region: find_arg("--region"),
        profile: find_arg("--profile"),
        lookback_minutes: parse_secs("--lookback")?,
        duration_secs: parse_secs("--duration")?,
        interval_secs: parse_secs("--interval")?,
        format,
        output_path: find_arg("--output").map(PathBuf::from),
    })
}

/// Initializes the logging subsystem
///
/// Sets up structured logging on stderr with:
/// - Log level and target module
/// - Colored output when running in a terminal
/// - JSON output when running as a systemd service
///
/// # Log Levels
/// Default: INFO
/// Can be overridden with RUST_LOG environment variable
///
/// # Examples
/// ```bash
/// RUST_LOG=debug idle-check ...  # Show every sample
/// RUST_LOG=warn idle-check ...   # Only warnings and errors
/// ```
fn init_logging() {
    // Systemd sets INVOCATION_ID environment variable
    let is_systemd = env::var("INVOCATION_ID").is_ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if is_systemd {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(true),
            )
            .init();
    }
}
