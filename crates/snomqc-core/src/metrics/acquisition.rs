//! Acquisition parameters against the recommended measurement protocol.
//!
//! Spectra are only comparable when they were taken with similar settings.
//! The defaults are the protocol suggested for nanoFTIR repeatability checks:
//! 70 nm tapping amplitude, 16 averaged acquisitions, 20 ms integration time
//! and 6 cm⁻¹ spectral resolution.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::config::MetricSettings;
use crate::metric::{
    Evaluation, Metric, MetricError, MetricInfo, Requirement, ScoreDirection, Thresholds, detail,
};
use crate::record::{MeasurementRecord, Metadata, MetadataValue};

/// Neaspec key holding `(center, distance)` of the interferometer mirror, µm.
const INTERFEROMETER_KEY: &str = "InterferometerCenterDistance";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// On the largest relative deviation from a recommended value.
    pub thresholds: Thresholds,
    /// Recommended values; `None` skips the parameter.
    pub tip_amplitude_nm: Option<f64>,
    pub averaging: Option<u32>,
    pub integration_time_ms: Option<f64>,
    pub spectral_resolution_cm1: Option<f64>,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::new(0.25, 0.5),
            tip_amplitude_nm: Some(70.0),
            averaging: Some(16),
            integration_time_ms: Some(20.0),
            spectral_resolution_cm1: Some(6.0),
        }
    }
}

impl AcquisitionSettings {
    pub fn validate(&self) -> Result<(), String> {
        self.thresholds.validate(ACQUISITION_INFO.direction)?;
        let recommended = self.recommended();
        if recommended.iter().all(|(_, v)| v.is_none()) {
            return Err("at least one recommended parameter must be set".into());
        }
        for (name, value) in recommended {
            if let Some(v) = value {
                if !(v > 0.0) || !v.is_finite() {
                    return Err(format!("recommended {name} must be positive, got {v}"));
                }
            }
        }
        Ok(())
    }

    fn recommended(&self) -> [(&'static str, Option<f64>); 4] {
        [
            ("tip_amplitude_nm", self.tip_amplitude_nm),
            ("averaging", self.averaging.map(f64::from)),
            ("integration_time_ms", self.integration_time_ms),
            ("spectral_resolution_cm1", self.spectral_resolution_cm1),
        ]
    }
}

pub struct AcquisitionMetric {
    settings: AcquisitionSettings,
}

static ACQUISITION_INFO: MetricInfo = MetricInfo {
    name: "acquisition",
    description: "Acquisition settings against the recommended protocol",
    principle: "Tapping amplitude, averaging, integration time and interferometer travel set \
                the near-field contrast, the noise level and the spectral resolution. Each \
                recorded parameter is compared with its recommended value; the largest \
                relative deviation decides.",
    requirements: &[Requirement::Metadata],
    direction: ScoreDirection::LowerIsBetter,
};

impl AcquisitionMetric {
    pub fn new(settings: AcquisitionSettings) -> Self {
        Self { settings }
    }
}

impl Default for AcquisitionMetric {
    fn default() -> Self {
        Self::new(AcquisitionSettings::default())
    }
}

/// Nominal resolution of an asymmetric scan: 1 / OPD, with the optical path
/// difference twice the mirror travel.
fn spectral_resolution_cm1(metadata: &Metadata) -> Option<f64> {
    let distance_um = match metadata.extra.get(INTERFEROMETER_KEY)? {
        MetadataValue::List(values) if values.len() >= 2 => values[1],
        _ => return None,
    };
    (distance_um > 0.0 && distance_um.is_finite()).then(|| 1e4 / (2.0 * distance_um))
}

fn recorded(metadata: &Metadata, name: &str) -> Option<f64> {
    match name {
        "tip_amplitude_nm" => metadata.tip_amplitude_nm,
        "averaging" => metadata.averaging.map(f64::from),
        "integration_time_ms" => metadata.pixel_dwell_ms,
        "spectral_resolution_cm1" => spectral_resolution_cm1(metadata),
        _ => None,
    }
}

impl Metric for AcquisitionMetric {
    fn info(&self) -> &MetricInfo {
        &ACQUISITION_INFO
    }

    fn configured(&self, settings: &MetricSettings) -> Option<Arc<dyn Metric>> {
        let settings = settings.acquisition.clone()?;
        Some(Arc::new(Self::new(settings)))
    }

    fn validate(&self) -> Result<(), String> {
        self.settings.validate()
    }

    fn evaluate(&self, record: &MeasurementRecord) -> Result<Evaluation, MetricError> {
        let metadata = record.metadata();
        let mut parameters = Map::new();
        let mut missing = Vec::new();
        let mut worst: Option<(&str, f64)> = None;

        for (name, recommended) in self.settings.recommended() {
            let Some(recommended) = recommended else {
                continue;
            };
            let Some(actual) = recorded(metadata, name) else {
                missing.push(name);
                continue;
            };
            let deviation = (actual - recommended).abs() / recommended;
            parameters.insert(
                name.to_string(),
                serde_json::json!({
                    "recommended": recommended,
                    "actual": actual,
                    "deviation": deviation,
                }),
            );
            if worst.is_none_or(|(_, w)| deviation > w) {
                worst = Some((name, deviation));
            }
        }

        let (worst_parameter, value) = worst.ok_or_else(|| {
            MetricError::Degenerate(format!(
                "no recommended acquisition parameter is recorded (missing {})",
                missing.join(", ")
            ))
        })?;
        Ok(Evaluation::graded(
            value,
            &self.settings.thresholds,
            ACQUISITION_INFO.direction,
            detail! {
                "worst_parameter" => worst_parameter,
                "parameters" => parameters,
                "missing" => missing,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricStatus;
    use crate::record::Grid;

    fn record(metadata: Metadata) -> MeasurementRecord {
        MeasurementRecord::builder()
            .channel("O2A", Grid::new(2, 2, vec![1.0; 4]).unwrap())
            .metadata(metadata)
            .build()
            .unwrap()
    }

    fn protocol() -> Metadata {
        Metadata {
            tip_amplitude_nm: Some(70.0),
            averaging: Some(16),
            pixel_dwell_ms: Some(20.0),
            extra: [(
                INTERFEROMETER_KEY.to_string(),
                MetadataValue::List(vec![300.0, 800.0]),
            )]
            .into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_recommended_protocol_passes() {
        let eval = AcquisitionMetric::default().evaluate(&record(protocol())).unwrap();
        assert_eq!(eval.grade.status, MetricStatus::Pass);
        // 800 µm travel: 1 / 0.16 cm = 6.25 cm⁻¹.
        let resolution = &eval.detail["parameters"]["spectral_resolution_cm1"];
        assert!((resolution["actual"].as_f64().unwrap() - 6.25).abs() < 1e-9);
        assert_eq!(eval.detail["worst_parameter"], "spectral_resolution_cm1");
        assert!(eval.detail["missing"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_halved_averaging_warns() {
        let metadata = Metadata {
            averaging: Some(8),
            ..protocol()
        };
        let eval = AcquisitionMetric::default().evaluate(&record(metadata)).unwrap();
        assert_eq!(eval.value, 0.5);
        assert_eq!(eval.detail["worst_parameter"], "averaging");
        assert_eq!(eval.grade.status, MetricStatus::Warn);
    }

    #[test]
    fn test_far_off_tip_amplitude_fails() {
        let metadata = Metadata {
            tip_amplitude_nm: Some(20.0),
            ..protocol()
        };
        let eval = AcquisitionMetric::default().evaluate(&record(metadata)).unwrap();
        assert_eq!(eval.detail["worst_parameter"], "tip_amplitude_nm");
        assert_eq!(eval.grade.status, MetricStatus::Fail);
    }

    #[test]
    fn test_partial_metadata_reports_missing() {
        let metadata = Metadata {
            tip_amplitude_nm: Some(65.0),
            project: Some("partial".into()),
            ..Default::default()
        };
        let eval = AcquisitionMetric::default().evaluate(&record(metadata)).unwrap();
        assert_eq!(eval.grade.status, MetricStatus::Pass);
        assert_eq!(eval.detail["missing"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_no_recorded_parameter_is_degenerate() {
        let metadata = Metadata {
            project: Some("bare".into()),
            ..Default::default()
        };
        let err = AcquisitionMetric::default().evaluate(&record(metadata)).unwrap_err();
        assert!(matches!(err, MetricError::Degenerate(ref r) if r.contains("averaging")));
    }

    #[test]
    fn test_unset_recommendation_is_skipped() {
        let metric = AcquisitionMetric::new(AcquisitionSettings {
            averaging: None,
            ..Default::default()
        });
        let metadata = Metadata {
            averaging: Some(1),
            ..protocol()
        };
        let eval = metric.evaluate(&record(metadata)).unwrap();
        assert_eq!(eval.grade.status, MetricStatus::Pass);
        assert!(eval.detail["parameters"].get("averaging").is_none());
    }

    #[test]
    fn test_settings_validation() {
        assert!(AcquisitionSettings::default().validate().is_ok());
        let none = AcquisitionSettings {
            tip_amplitude_nm: None,
            averaging: None,
            integration_time_ms: None,
            spectral_resolution_cm1: None,
            ..Default::default()
        };
        assert!(none.validate().is_err());
        let zero = AcquisitionSettings {
            integration_time_ms: Some(0.0),
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }
}
