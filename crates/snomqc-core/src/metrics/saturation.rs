//! Fraction of clipped or invalid pixels.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::config::MetricSettings;
use crate::metric::{
    Evaluation, Metric, MetricError, MetricInfo, Requirement, ScoreDirection, Thresholds, detail,
};
use crate::record::{ChannelKind, MeasurementRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaturationSettings {
    /// On the clipped fraction of the worst channel.
    pub thresholds: Thresholds,
    /// Optical amplitude pixels with `|v| >= clip_value` count as clipped. A
    /// `clip_value` in the record metadata takes precedence. Height, phase and
    /// other channels are never clipped; non-finite pixels count in every
    /// channel.
    pub clip_value: Option<f64>,
}

impl Default for SaturationSettings {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::new(0.001, 0.01),
            clip_value: None,
        }
    }
}

impl SaturationSettings {
    pub fn validate(&self) -> Result<(), String> {
        self.thresholds.validate(SATURATION_INFO.direction)?;
        check_clip(self.clip_value)
    }
}

fn check_clip(clip: Option<f64>) -> Result<(), String> {
    match clip {
        Some(c) if !(c > 0.0) || !c.is_finite() => {
            Err(format!("clip value {c} must be positive and finite"))
        }
        _ => Ok(()),
    }
}

pub struct SaturationMetric {
    settings: SaturationSettings,
}

static SATURATION_INFO: MetricInfo = MetricInfo {
    name: "saturation",
    description: "Detector or ADC saturation",
    principle: "A saturated detector pins optical amplitude pixels at the clip level or \
                writes an invalid sentinel. The fraction of such pixels in the worst channel \
                is the value.",
    requirements: &[Requirement::Channels],
    direction: ScoreDirection::LowerIsBetter,
};

impl SaturationMetric {
    pub fn new(settings: SaturationSettings) -> Self {
        Self { settings }
    }
}

impl Default for SaturationMetric {
    fn default() -> Self {
        Self::new(SaturationSettings::default())
    }
}

impl Metric for SaturationMetric {
    fn info(&self) -> &MetricInfo {
        &SATURATION_INFO
    }

    fn configured(&self, settings: &MetricSettings) -> Option<Arc<dyn Metric>> {
        let settings = settings.saturation.clone()?;
        Some(Arc::new(Self::new(settings)))
    }

    fn validate(&self) -> Result<(), String> {
        self.settings.validate()
    }

    fn evaluate(&self, record: &MeasurementRecord) -> Result<Evaluation, MetricError> {
        let clip = record.metadata().clip_value.or(self.settings.clip_value);
        check_clip(clip).map_err(MetricError::Other)?;

        let mut per_channel = Map::new();
        let mut worst: Option<(&str, f64)> = None;
        for (name, grid) in record.channels() {
            let amplitude = matches!(ChannelKind::classify(name), ChannelKind::Amplitude(_));
            let clipped = match clip.filter(|_| amplitude) {
                Some(c) => grid
                    .values()
                    .iter()
                    .filter(|v| v.is_finite() && v.abs() >= c)
                    .count(),
                None => 0,
            };
            let invalid = grid.invalid_count();
            let fraction = (clipped + invalid) as f64 / grid.pixel_count() as f64;
            per_channel.insert(
                name.to_string(),
                serde_json::json!({
                    "clip_checked": amplitude && clip.is_some(),
                    "clipped": clipped,
                    "invalid": invalid,
                    "fraction": fraction,
                }),
            );
            if worst.is_none_or(|(_, w)| fraction > w) {
                worst = Some((name, fraction));
            }
        }

        let (worst_channel, value) =
            worst.ok_or_else(|| MetricError::MissingChannel("any image channel".into()))?;
        Ok(Evaluation::graded(
            value,
            &self.settings.thresholds,
            SATURATION_INFO.direction,
            detail! {
                "worst_channel" => worst_channel,
                "clip_value" => clip,
                "channels" => per_channel,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricStatus;
    use crate::record::{Grid, Metadata};

    fn half_clipped(sentinel: f64) -> Grid {
        Grid::from_fn(8, 8, |r, c| if (r + c) % 2 == 0 { sentinel } else { 0.5 }).unwrap()
    }

    #[test]
    fn test_half_clipped_fails() {
        let metric = SaturationMetric::new(SaturationSettings {
            clip_value: Some(10.0),
            ..Default::default()
        });
        let record = MeasurementRecord::builder()
            .channel("O2A", half_clipped(10.0))
            .build()
            .unwrap();
        let eval = metric.evaluate(&record).unwrap();
        assert_eq!(eval.value, 0.5);
        assert_eq!(eval.grade.status, MetricStatus::Fail);
    }

    #[test]
    fn test_invalid_sentinel_counts_without_clip() {
        let record = MeasurementRecord::builder()
            .channel("O2A", half_clipped(f64::NAN))
            .build()
            .unwrap();
        let eval = SaturationMetric::default().evaluate(&record).unwrap();
        assert_eq!(eval.value, 0.5);
        assert_eq!(eval.grade.status, MetricStatus::Fail);
    }

    #[test]
    fn test_clean_grid_passes() {
        let record = MeasurementRecord::builder()
            .channel("O2A", Grid::new(4, 4, vec![0.5; 16]).unwrap())
            .build()
            .unwrap();
        let eval = SaturationMetric::new(SaturationSettings {
            clip_value: Some(1.0),
            ..Default::default()
        })
        .evaluate(&record)
        .unwrap();
        assert_eq!(eval.value, 0.0);
        assert_eq!(eval.grade.status, MetricStatus::Pass);
        assert!((eval.grade.score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_metadata_clip_value_overrides() {
        let record = MeasurementRecord::builder()
            .channel("O2A", half_clipped(2.0))
            .metadata(Metadata {
                clip_value: Some(2.0),
                ..Default::default()
            })
            .build()
            .unwrap();
        let metric = SaturationMetric::new(SaturationSettings {
            clip_value: Some(100.0),
            ..Default::default()
        });
        let eval = metric.evaluate(&record).unwrap();
        assert_eq!(eval.value, 0.5);
        assert_eq!(eval.detail["clip_value"], 2.0);
    }

    #[test]
    fn test_negative_clipping_counts() {
        let grid = Grid::new(1, 4, vec![-5.0, 0.0, 0.0, 0.0]).unwrap();
        let record = MeasurementRecord::builder().channel("O2A", grid).build().unwrap();
        let eval = SaturationMetric::new(SaturationSettings {
            clip_value: Some(5.0),
            ..Default::default()
        })
        .evaluate(&record)
        .unwrap();
        assert_eq!(eval.value, 0.25);
    }

    #[test]
    fn test_non_positive_clip_rejected() {
        let record = MeasurementRecord::builder()
            .channel("O2A", Grid::new(1, 1, vec![0.0]).unwrap())
            .build()
            .unwrap();
        let metric = SaturationMetric::new(SaturationSettings {
            clip_value: Some(0.0),
            ..Default::default()
        });
        assert!(metric.evaluate(&record).is_err());
    }

    #[test]
    fn test_clip_applies_to_amplitude_channels_only() {
        // Height and phase routinely exceed an amplitude clip level.
        let record = MeasurementRecord::builder()
            .channel("Z C", half_clipped(50.0))
            .channel("O2P", half_clipped(-50.0))
            .channel("O2A", Grid::new(8, 8, vec![0.5; 64]).unwrap())
            .build()
            .unwrap();
        let metric = SaturationMetric::new(SaturationSettings {
            clip_value: Some(10.0),
            ..Default::default()
        });
        let eval = metric.evaluate(&record).unwrap();
        assert_eq!(eval.value, 0.0);
        assert_eq!(eval.grade.status, MetricStatus::Pass);
        assert_eq!(eval.detail["channels"]["Z C"]["clip_checked"], false);
        assert_eq!(eval.detail["channels"]["O2A"]["clip_checked"], true);
    }

    #[test]
    fn test_invalid_pixels_count_in_any_channel() {
        let record = MeasurementRecord::builder()
            .channel("Z C", half_clipped(f64::NAN))
            .build()
            .unwrap();
        let eval = SaturationMetric::default().evaluate(&record).unwrap();
        assert_eq!(eval.value, 0.5);
        assert_eq!(eval.detail["channels"]["Z C"]["invalid"], 32);
    }

    #[test]
    fn test_settings_validation() {
        assert!(SaturationSettings::default().validate().is_ok());
        let bad_clip = SaturationSettings {
            clip_value: Some(f64::INFINITY),
            ..Default::default()
        };
        assert!(bad_clip.validate().is_err());
    }
}
