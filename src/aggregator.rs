// Aggregator - reduces a sequence of samples to one value per metric

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AggregateError {
    #[error("cannot aggregate an empty sample sequence")]
    Empty,
}

/// How the samples of one metric are reduced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// Arithmetic mean over the observation window
    Mean,
    /// Most recent observation (point queries)
    Last,
}

/// Arithmetic mean of `samples`
///
/// # Errors
/// `AggregateError::Empty` when there is nothing to average.
pub fn aggregate(samples: &[f64]) -> Result<f64, AggregateError> {
    if samples.is_empty() {
        return Err(AggregateError::Empty);
    }
    Ok(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Reduces `samples` according to `aggregation`
pub fn reduce(aggregation: Aggregation, samples: &[f64]) -> Result<f64, AggregateError> {
    match aggregation {
        Aggregation::Mean => aggregate(samples),
        Aggregation::Last => samples.last().copied().ok_or(AggregateError::Empty),
    }
}
