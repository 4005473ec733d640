//! Cross-order consistency of the optical amplitude channels.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snomqc_signal::median;

use crate::config::MetricSettings;
use crate::metric::{
    Evaluation, Metric, MetricError, MetricInfo, Requirement, ScoreDirection, Thresholds, detail,
};
use crate::record::MeasurementRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    /// On the largest relative excess of a higher order over the order below.
    pub thresholds: Thresholds,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::new(0.05, 0.25),
        }
    }
}

impl CalibrationSettings {
    pub fn validate(&self) -> Result<(), String> {
        self.thresholds.validate(CALIBRATION_INFO.direction)
    }
}

pub struct CalibrationMetric {
    settings: CalibrationSettings,
}

static CALIBRATION_INFO: MetricInfo = MetricInfo {
    name: "calibration",
    description: "Demodulation order amplitude ordering",
    principle: "Higher harmonics of the tip tapping frequency carry less near-field signal, so \
                the median amplitude must not grow with demodulation order. A higher order \
                outgrowing the one below points at a detuned interferometer, wrong \
                demodulation settings or a mislabeled channel.",
    requirements: &[Requirement::Channels],
    direction: ScoreDirection::LowerIsBetter,
};

impl CalibrationMetric {
    pub fn new(settings: CalibrationSettings) -> Self {
        Self { settings }
    }
}

impl Default for CalibrationMetric {
    fn default() -> Self {
        Self::new(CalibrationSettings::default())
    }
}

impl Metric for CalibrationMetric {
    fn info(&self) -> &MetricInfo {
        &CALIBRATION_INFO
    }

    fn configured(&self, settings: &MetricSettings) -> Option<Arc<dyn Metric>> {
        let settings = settings.calibration.clone()?;
        Some(Arc::new(Self::new(settings)))
    }

    fn validate(&self) -> Result<(), String> {
        self.settings.validate()
    }

    fn evaluate(&self, record: &MeasurementRecord) -> Result<Evaluation, MetricError> {
        let orders = record.amplitude_orders();
        if orders.len() < 2 {
            return Err(MetricError::Degenerate(format!(
                "need at least two amplitude orders, found {}",
                orders.len()
            )));
        }

        let mut pairs = Vec::with_capacity(orders.len() - 1);
        let mut worst_excess = 0.0f64;
        for pair in orders.windows(2) {
            let (lo_n, lo_name, lo) = pair[0];
            let (hi_n, hi_name, hi) = pair[1];
            let lo_median = median(lo.values())
                .ok_or_else(|| MetricError::Degenerate(format!("{lo_name} has no finite pixel")))?;
            let hi_median = median(hi.values())
                .ok_or_else(|| MetricError::Degenerate(format!("{hi_name} has no finite pixel")))?;
            if !(lo_median > 0.0) {
                return Err(MetricError::Degenerate(format!(
                    "{lo_name} median amplitude {lo_median} is not positive"
                )));
            }

            let ratio = hi_median / lo_median;
            let excess = (ratio - 1.0).max(0.0);
            worst_excess = worst_excess.max(excess);

            let (mut violating, mut compared) = (0usize, 0usize);
            for (a, b) in lo.values().iter().zip(hi.values()) {
                if a.is_finite() && b.is_finite() {
                    compared += 1;
                    if b > a {
                        violating += 1;
                    }
                }
            }
            let violation_fraction = if compared > 0 {
                violating as f64 / compared as f64
            } else {
                0.0
            };
            pairs.push(serde_json::json!({
                "orders": [lo_n, hi_n],
                "channels": [lo_name, hi_name],
                "median_ratio": ratio,
                "excess": excess,
                "pixel_violation_fraction": violation_fraction,
            }));
        }

        Ok(Evaluation::graded(
            worst_excess,
            &self.settings.thresholds,
            CALIBRATION_INFO.direction,
            detail! { "pairs" => pairs },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricStatus;
    use crate::record::Grid;

    fn order_record(levels: &[(&str, f64)]) -> MeasurementRecord {
        let mut builder = MeasurementRecord::builder();
        for (name, level) in levels {
            let grid = Grid::from_fn(4, 4, |r, c| level * (1.0 + 0.01 * (r + c) as f64)).unwrap();
            builder = builder.channel(*name, grid);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_decaying_orders_pass() {
        let record = order_record(&[("O2A", 1.0), ("O3A", 0.4), ("O4A", 0.15)]);
        let eval = CalibrationMetric::default().evaluate(&record).unwrap();
        assert_eq!(eval.value, 0.0);
        assert_eq!(eval.grade.status, MetricStatus::Pass);
        assert_eq!(eval.detail["pairs"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_inverted_orders_fail() {
        let record = order_record(&[("O3A", 2.0), ("O2A", 1.0)]);
        let eval = CalibrationMetric::default().evaluate(&record).unwrap();
        assert!((eval.value - 1.0).abs() < 1e-9);
        assert_eq!(eval.grade.status, MetricStatus::Fail);
        assert_eq!(eval.detail["pairs"][0]["pixel_violation_fraction"], 1.0);
    }

    #[test]
    fn test_small_excess_warns() {
        let record = order_record(&[("O2A", 1.0), ("O3A", 1.1)]);
        let eval = CalibrationMetric::default().evaluate(&record).unwrap();
        assert_eq!(eval.grade.status, MetricStatus::Warn);
    }

    #[test]
    fn test_single_order_is_error() {
        let record = order_record(&[("O2A", 1.0), ("Z C", 5.0)]);
        let err = CalibrationMetric::default().evaluate(&record).unwrap_err();
        assert!(matches!(err, MetricError::Degenerate(_)));
    }

    #[test]
    fn test_zero_lower_order_is_error() {
        let record = order_record(&[("O2A", 0.0), ("O3A", 1.0)]);
        assert!(CalibrationMetric::default().evaluate(&record).is_err());
    }
}
