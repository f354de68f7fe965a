// Idle Check - point-in-time idle classification for a host
//
// Collects CPU, memory, disk and network metrics from either AWS CloudWatch
// or the local operating system, reduces them to one value per metric and
// classifies the host as IDLE or ACTIVE against fixed thresholds.
//
// Control flow: MetricSource -> Observer/sampler -> aggregator -> classifier -> report

pub mod aggregator;
pub mod classifier;
pub mod config;
pub mod metrics;
pub mod report;
pub mod sampler;
