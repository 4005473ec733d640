//! Quality metric trait, thresholds and per-metric results.
//!
//! Every metric implements the [`Metric`] trait, which provides metadata via
//! [`MetricInfo`] and a pure evaluation over a [`MeasurementRecord`]. The
//! evaluation returns a raw value on the metric's own scale; [`Thresholds`]
//! turn that value into a pass/warn/fail status and a normalized score.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::MetricSettings;
use crate::record::MeasurementRecord;

/// Free-form diagnostic mapping attached to a metric result.
pub type Detail = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Metric description
// ---------------------------------------------------------------------------

/// Record capability a metric depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    /// At least one image channel.
    Channels,
    /// A spectrum.
    Spectrum,
    /// Non-empty acquisition metadata.
    Metadata,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channels => write!(f, "image channels"),
            Self::Spectrum => write!(f, "a spectrum"),
            Self::Metadata => write!(f, "acquisition metadata"),
        }
    }
}

/// Metadata about a metric.
#[derive(Debug, Clone)]
pub struct MetricInfo {
    /// Unique identifier (e.g. `"noise"`).
    pub name: &'static str,
    /// One-line human-readable description.
    pub description: &'static str,
    /// How the measured value relates to the physical defect.
    pub principle: &'static str,
    /// Record capabilities checked before evaluation.
    pub requirements: &'static [Requirement],
    /// Which way the raw value improves. Fixed per metric; thresholds only
    /// move the boundaries.
    pub direction: ScoreDirection,
}

/// Trait that every quality metric must implement.
///
/// Evaluation must be a pure function of the record and the metric's own
/// settings. A metric that cannot compute returns a [`MetricError`]; it never
/// substitutes a default score.
pub trait Metric: Send + Sync {
    /// Metric metadata.
    fn info(&self) -> &MetricInfo;

    /// Compute the metric for one record.
    fn evaluate(&self, record: &MeasurementRecord) -> Result<Evaluation, MetricError>;

    /// Convenience: name from info.
    fn name(&self) -> &'static str {
        self.info().name
    }

    /// A copy of this metric carrying the settings `settings` holds for it,
    /// or `None` when `settings` has no entry for this metric and it keeps
    /// its own.
    fn configured(&self, _settings: &MetricSettings) -> Option<Arc<dyn Metric>> {
        None
    }

    /// Check the settings this metric evaluates with.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a metric could not produce a value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricError {
    #[error("record lacks {0}")]
    Unsupported(Requirement),
    #[error("missing channel: {0}")]
    MissingChannel(String),
    #[error("record has no spectrum")]
    MissingSpectrum,
    #[error("missing spectral order: {0}")]
    MissingOrder(String),
    #[error("missing metadata: {0}")]
    MissingMetadata(&'static str),
    #[error("degenerate data: {0}")]
    Degenerate(String),
    #[error("evaluation panicked: {0}")]
    Panicked(String),
    #[error("evaluation did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Status and thresholds
// ---------------------------------------------------------------------------

/// Outcome of one metric. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricStatus {
    Pass,
    Warn,
    Fail,
    Error,
}

impl fmt::Display for MetricStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Warn => write!(f, "warn"),
            Self::Fail => write!(f, "fail"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Which way a metric's raw value improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreDirection {
    LowerIsBetter,
    HigherIsBetter,
}

impl fmt::Display for ScoreDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LowerIsBetter => write!(f, "lower is better"),
            Self::HigherIsBetter => write!(f, "higher is better"),
        }
    }
}

/// Warn and fail boundaries on a metric's raw value. The direction comes from
/// the metric ([`MetricInfo::direction`]), never from configuration.
///
/// Lower-is-better: `value <= warn` passes, `value <= fail` warns, above fails.
/// Higher-is-better: `value >= warn` passes, `value >= fail` warns, below fails.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Thresholds {
    pub warn: f64,
    pub fail: f64,
}

/// Status and normalized score for a raw value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grade {
    pub status: MetricStatus,
    /// Quality in `[0, 1]`: pass maps to `[2/3, 1]`, warn to `[1/3, 2/3)`,
    /// fail to `[0, 1/3)`.
    pub score: f64,
}

const THIRD: f64 = 1.0 / 3.0;

impl Thresholds {
    pub const fn new(warn: f64, fail: f64) -> Self {
        Self { warn, fail }
    }

    /// Check that both boundaries are finite, non-negative and ordered for
    /// `direction`.
    pub fn validate(&self, direction: ScoreDirection) -> Result<(), String> {
        if !self.warn.is_finite() || !self.fail.is_finite() {
            return Err(format!(
                "thresholds must be finite (warn {}, fail {})",
                self.warn, self.fail
            ));
        }
        if self.warn < 0.0 || self.fail < 0.0 {
            return Err(format!(
                "thresholds must be non-negative (warn {}, fail {})",
                self.warn, self.fail
            ));
        }
        let ordered = match direction {
            ScoreDirection::LowerIsBetter => self.warn <= self.fail,
            ScoreDirection::HigherIsBetter => self.warn >= self.fail,
        };
        if !ordered {
            return Err(format!(
                "warn {} and fail {} are out of order ({direction})",
                self.warn, self.fail
            ));
        }
        Ok(())
    }

    /// Grade a raw value. The score is continuous and monotonic in the value,
    /// so a worse value never earns a better score.
    pub fn grade(&self, value: f64, direction: ScoreDirection) -> Grade {
        if value.is_nan() {
            return Grade {
                status: MetricStatus::Fail,
                score: 0.0,
            };
        }
        match direction {
            ScoreDirection::LowerIsBetter => self.grade_lower(value.max(0.0)),
            ScoreDirection::HigherIsBetter => self.grade_higher(value.max(0.0)),
        }
    }

    fn grade_lower(&self, v: f64) -> Grade {
        let (warn, fail) = (self.warn, self.fail);
        if v <= warn {
            let frac = if warn > 0.0 { v / warn } else { 0.0 };
            Grade {
                status: MetricStatus::Pass,
                score: 1.0 - THIRD * frac,
            }
        } else if v <= fail {
            let frac = (v - warn) / (fail - warn);
            Grade {
                status: MetricStatus::Warn,
                score: 2.0 * THIRD - THIRD * frac,
            }
        } else {
            let score = if v.is_finite() && fail > 0.0 {
                THIRD * fail / v
            } else {
                0.0
            };
            Grade {
                status: MetricStatus::Fail,
                score,
            }
        }
    }

    fn grade_higher(&self, v: f64) -> Grade {
        let (warn, fail) = (self.warn, self.fail);
        if v >= warn {
            let score = if v.is_finite() && v > 0.0 {
                2.0 * THIRD + THIRD * (1.0 - warn / v)
            } else {
                1.0
            };
            Grade {
                status: MetricStatus::Pass,
                score,
            }
        } else if v >= fail {
            let frac = (v - fail) / (warn - fail);
            Grade {
                status: MetricStatus::Warn,
                score: THIRD + THIRD * frac,
            }
        } else {
            Grade {
                status: MetricStatus::Fail,
                score: THIRD * v / fail,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation and result
// ---------------------------------------------------------------------------

/// Successful output of [`Metric::evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub value: f64,
    pub grade: Grade,
    pub detail: Detail,
}

impl Evaluation {
    /// Grade `value` against `thresholds` in the metric's `direction`.
    pub fn graded(
        value: f64,
        thresholds: &Thresholds,
        direction: ScoreDirection,
        detail: Detail,
    ) -> Self {
        Self {
            value,
            grade: thresholds.grade(value, direction),
            detail,
        }
    }
}

/// Output of one metric evaluation within a QC run.
///
/// `status == Error` exactly when evaluation failed; `value` and `score` are
/// absent then and `error` carries the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    pub name: String,
    pub value: Option<f64>,
    pub score: Option<f64>,
    pub status: MetricStatus,
    pub detail: Detail,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MetricResult {
    pub fn from_evaluation(name: &str, evaluation: Evaluation) -> Self {
        Self {
            name: name.to_string(),
            value: Some(evaluation.value),
            score: Some(evaluation.grade.score),
            status: evaluation.grade.status,
            detail: evaluation.detail,
            error: None,
        }
    }

    pub fn from_error(name: &str, error: &MetricError) -> Self {
        let reason = error.to_string();
        let mut detail = Detail::new();
        detail.insert("reason".into(), Value::from(reason.clone()));
        Self {
            name: name.to_string(),
            value: None,
            score: None,
            status: MetricStatus::Error,
            detail,
            error: Some(reason),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == MetricStatus::Error
    }
}

/// Build a `Detail` from `key => value` pairs.
macro_rules! detail {
    ($($key:expr => $value:expr),* $(,)?) => {{
        let mut map = $crate::metric::Detail::new();
        $( map.insert($key.to_string(), ::serde_json::json!($value)); )*
        map
    }};
}
pub(crate) use detail;

#[cfg(test)]
mod tests {
    use super::*;

    const LOWER: ScoreDirection = ScoreDirection::LowerIsBetter;
    const HIGHER: ScoreDirection = ScoreDirection::HigherIsBetter;

    #[test]
    fn test_lower_is_better_bands() {
        let t = Thresholds::new(0.1, 0.5);
        let pass = t.grade(0.0, LOWER);
        assert_eq!(pass.status, MetricStatus::Pass);
        assert!((pass.score - 1.0).abs() < 1e-12);

        let edge = t.grade(0.1, LOWER);
        assert_eq!(edge.status, MetricStatus::Pass);
        assert!((edge.score - 2.0 / 3.0).abs() < 1e-12);

        let warn = t.grade(0.3, LOWER);
        assert_eq!(warn.status, MetricStatus::Warn);
        assert!(warn.score < 2.0 / 3.0 && warn.score >= 1.0 / 3.0);

        let fail = t.grade(1.0, LOWER);
        assert_eq!(fail.status, MetricStatus::Fail);
        assert!(fail.score < 1.0 / 3.0);
    }

    #[test]
    fn test_higher_is_better_bands() {
        let t = Thresholds::new(50.0, 20.0);
        assert_eq!(t.grade(100.0, HIGHER).status, MetricStatus::Pass);
        assert!(t.grade(100.0, HIGHER).score >= 2.0 / 3.0);
        assert_eq!(t.grade(30.0, HIGHER).status, MetricStatus::Warn);
        assert_eq!(t.grade(5.0, HIGHER).status, MetricStatus::Fail);
        assert_eq!(t.grade(f64::INFINITY, HIGHER).score, 1.0);
    }

    #[test]
    fn test_score_is_monotonic() {
        let lower = Thresholds::new(0.02, 0.05);
        let mut prev = f64::INFINITY;
        for i in 0..200 {
            let score = lower.grade(i as f64 * 0.001, LOWER).score;
            assert!(score <= prev + 1e-12, "score rose at step {i}");
            prev = score;
        }

        let higher = Thresholds::new(50.0, 20.0);
        let mut prev = -1.0;
        for i in 0..200 {
            let score = higher.grade(i as f64, HIGHER).score;
            assert!(score >= prev - 1e-12, "score fell at step {i}");
            prev = score;
        }
    }

    #[test]
    fn test_zero_warn_threshold() {
        let t = Thresholds::new(0.0, 0.01);
        assert_eq!(t.grade(0.0, LOWER).status, MetricStatus::Pass);
        assert_eq!(t.grade(0.005, LOWER).status, MetricStatus::Warn);
        let t = Thresholds::new(0.0, 0.0);
        assert_eq!(t.grade(0.1, LOWER).status, MetricStatus::Fail);
        assert_eq!(t.grade(0.1, LOWER).score, 0.0);
    }

    #[test]
    fn test_nan_value_fails() {
        let g = Thresholds::new(1.0, 2.0).grade(f64::NAN, LOWER);
        assert_eq!(g.status, MetricStatus::Fail);
        assert_eq!(g.score, 0.0);
    }

    #[test]
    fn test_validate_thresholds() {
        assert!(Thresholds::new(0.1, 0.5).validate(LOWER).is_ok());
        assert!(Thresholds::new(0.5, 0.1).validate(LOWER).is_err());
        assert!(Thresholds::new(50.0, 20.0).validate(HIGHER).is_ok());
        assert!(Thresholds::new(20.0, 50.0).validate(HIGHER).is_err());
        assert!(Thresholds::new(f64::NAN, 0.5).validate(LOWER).is_err());
        assert!(Thresholds::new(-1.0, 0.5).validate(LOWER).is_err());
    }

    #[test]
    fn test_thresholds_reject_direction_key() {
        let parsed: Thresholds = serde_json::from_str(r#"{"warn": 30, "fail": 60}"#).unwrap();
        assert_eq!(parsed, Thresholds::new(30.0, 60.0));
        assert!(parsed.validate(HIGHER).is_err());
        let err = serde_json::from_str::<Thresholds>(
            r#"{"warn": 30, "fail": 60, "direction": "lower_is_better"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("direction"), "{err}");
    }

    #[test]
    fn test_error_result_shape() {
        let r = MetricResult::from_error("drift", &MetricError::MissingChannel("height".into()));
        assert_eq!(r.status, MetricStatus::Error);
        assert!(r.value.is_none() && r.score.is_none());
        assert_eq!(r.error.as_deref(), Some("missing channel: height"));
        assert_eq!(r.detail["reason"], "missing channel: height");
    }

    #[test]
    fn test_status_order() {
        assert!(MetricStatus::Pass < MetricStatus::Warn);
        assert!(MetricStatus::Warn < MetricStatus::Fail);
        assert_eq!(serde_json::to_string(&MetricStatus::Warn).unwrap(), "\"warn\"");
    }
}
