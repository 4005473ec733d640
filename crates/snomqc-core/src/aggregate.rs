//! Combine per-metric results into one verdict for a record.
//!
//! Status rules, in order:
//! - `fail` if any metric failed, or a mandatory metric errored, or every
//!   metric errored;
//! - `warn` if any metric warned;
//! - `pass` otherwise.
//!
//! The score is the weighted mean of the non-error scores and is `None` when
//! nothing produced one. Aggregation reads no clock, so the same inputs always
//! give the same [`QcResult`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metric::{MetricResult, MetricStatus};
use crate::record::MeasurementRecord;

/// Pipeline configuration rejected at construction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregationError {
    #[error("no metrics to run")]
    NoMetrics,
    #[error("{field} references unknown metric '{name}'")]
    UnknownMetric { field: &'static str, name: String },
    #[error("metric '{0}' is registered more than once")]
    DuplicateMetric(String),
    #[error("weight {weight} for metric '{name}' must be finite and non-negative")]
    InvalidWeight { name: String, weight: f64 },
    #[error("invalid thresholds for '{metric}': {reason}")]
    InvalidThresholds { metric: String, reason: String },
}

/// Overall verdict for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Warn => write!(f, "warn"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// Identifies the record a result belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRef {
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl From<&MeasurementRecord> for RecordRef {
    fn from(record: &MeasurementRecord) -> Self {
        Self {
            fingerprint: record.fingerprint().to_string(),
            source: record.source().map(str::to_string),
        }
    }
}

/// Outcome of a QC run on one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcResult {
    pub record_ref: RecordRef,
    /// Weighted mean of non-error scores; `None` if every metric errored.
    pub score: Option<f64>,
    pub status: OverallStatus,
    /// One entry per evaluated metric, in registration order.
    pub metrics: Vec<MetricResult>,
    pub errored_metrics: Vec<String>,
}

impl QcResult {
    pub fn metric(&self, name: &str) -> Option<&MetricResult> {
        self.metrics.iter().find(|m| m.name == name)
    }

    /// Count of metric results with `status`.
    pub fn count(&self, status: MetricStatus) -> usize {
        self.metrics.iter().filter(|m| m.status == status).count()
    }
}

/// Weights and mandatory flags applied to a set of metric results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregator {
    weights: BTreeMap<String, f64>,
    mandatory: BTreeSet<String>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Weights must be finite and non-negative.
    pub fn with_weights(mut self, weights: BTreeMap<String, f64>) -> Result<Self, AggregationError> {
        for (name, &weight) in &weights {
            if !weight.is_finite() || weight < 0.0 {
                return Err(AggregationError::InvalidWeight {
                    name: name.clone(),
                    weight,
                });
            }
        }
        self.weights = weights;
        Ok(self)
    }

    pub fn with_mandatory<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mandatory = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn weight(&self, metric: &str) -> f64 {
        self.weights.get(metric).copied().unwrap_or(1.0)
    }

    pub fn is_mandatory(&self, metric: &str) -> bool {
        self.mandatory.contains(metric)
    }

    /// Fold `results` into a [`QcResult`]. Result order is kept.
    pub fn aggregate(&self, record_ref: RecordRef, results: Vec<MetricResult>) -> QcResult {
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        let mut scored = 0usize;
        let mut any_fail = false;
        let mut any_warn = false;
        let mut errored_metrics = Vec::new();

        for result in &results {
            match result.status {
                MetricStatus::Error => {
                    if self.is_mandatory(&result.name) {
                        any_fail = true;
                    }
                    errored_metrics.push(result.name.clone());
                    continue;
                }
                MetricStatus::Fail => any_fail = true,
                MetricStatus::Warn => any_warn = true,
                MetricStatus::Pass => {}
            }
            if let Some(score) = result.score {
                let w = self.weight(&result.name);
                weighted += w * score;
                total_weight += w;
                scored += 1;
            }
        }

        let score = if scored == 0 {
            None
        } else if total_weight > 0.0 {
            Some(weighted / total_weight)
        } else {
            // Every scored metric carries weight 0: fall back to the plain mean.
            let sum: f64 = results
                .iter()
                .filter(|r| !r.is_error())
                .filter_map(|r| r.score)
                .sum();
            Some(sum / scored as f64)
        };

        let all_errored = errored_metrics.len() == results.len();
        let status = if any_fail || all_errored {
            OverallStatus::Fail
        } else if any_warn {
            OverallStatus::Warn
        } else {
            OverallStatus::Pass
        };

        QcResult {
            record_ref,
            score,
            status,
            metrics: results,
            errored_metrics,
        }
    }
}

/// [`Aggregator::aggregate`] with default weights and no mandatory metrics.
pub fn aggregate(record_ref: RecordRef, results: Vec<MetricResult>) -> QcResult {
    Aggregator::new().aggregate(record_ref, results)
}
