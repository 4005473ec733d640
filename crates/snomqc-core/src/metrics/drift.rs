//! Slow height variation that a plane cannot explain, plus z drift along the
//! slow scan axis.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snomqc_signal::{box_mean, fit_plane, plane_residuals, rms};

use crate::config::MetricSettings;
use crate::metric::{
    Evaluation, Metric, MetricError, MetricInfo, Requirement, ScoreDirection, Thresholds, detail,
};
use crate::record::{Grid, MeasurementRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftSettings {
    /// On residual RMS after plane subtraction / scan extent.
    pub residual: Thresholds,
    /// On slow-axis height change / scan extent.
    pub ramp: Thresholds,
    /// Box radius of the low-pass filter.
    pub lowpass_radius: usize,
    /// Height channel to use; the first height-like channel when unset.
    pub channel: Option<String>,
}

impl Default for DriftSettings {
    fn default() -> Self {
        Self {
            residual: Thresholds::new(1e-3, 5e-3),
            ramp: Thresholds::new(5e-3, 2e-2),
            lowpass_radius: 2,
            channel: None,
        }
    }
}

impl DriftSettings {
    pub fn validate(&self) -> Result<(), String> {
        self.residual
            .validate(DRIFT_INFO.direction)
            .map_err(|e| format!("residual: {e}"))?;
        self.ramp
            .validate(DRIFT_INFO.direction)
            .map_err(|e| format!("ramp: {e}"))
    }
}

pub struct DriftMetric {
    settings: DriftSettings,
}

static DRIFT_INFO: MetricInfo = MetricInfo {
    name: "drift",
    description: "Thermal/mechanical drift in the height channel",
    principle: "The low-passed height is fitted by a least-squares plane. Bow and creep leave \
                a residual the plane cannot absorb; z drift during acquisition shows up as a \
                height change along the slow (row) axis. Both are normalized by the scan \
                extent and the worse of the two decides.",
    requirements: &[Requirement::Channels, Requirement::Metadata],
    direction: ScoreDirection::LowerIsBetter,
};

impl DriftMetric {
    pub fn new(settings: DriftSettings) -> Self {
        Self { settings }
    }

    fn height<'a>(&self, record: &'a MeasurementRecord) -> Result<(&'a str, &'a Grid), MetricError> {
        match &self.settings.channel {
            Some(name) => record
                .channels()
                .find(|(n, _)| *n == name.as_str())
                .ok_or_else(|| MetricError::MissingChannel(name.clone())),
            None => record
                .height()
                .ok_or_else(|| MetricError::MissingChannel("height".into())),
        }
    }
}

impl Default for DriftMetric {
    fn default() -> Self {
        Self::new(DriftSettings::default())
    }
}

/// Rows and columns `margin..len-margin` of a row-major grid.
fn interior(values: &[f64], rows: usize, cols: usize, margin: usize) -> (Vec<f64>, usize, usize) {
    if rows <= 2 * margin || cols <= 2 * margin {
        return (values.to_vec(), rows, cols);
    }
    let (r, c) = (rows - 2 * margin, cols - 2 * margin);
    let mut out = Vec::with_capacity(r * c);
    for row in margin..rows - margin {
        out.extend_from_slice(&values[row * cols + margin..row * cols + cols - margin]);
    }
    (out, r, c)
}

impl Metric for DriftMetric {
    fn info(&self) -> &MetricInfo {
        &DRIFT_INFO
    }

    fn configured(&self, settings: &MetricSettings) -> Option<Arc<dyn Metric>> {
        let settings = settings.drift.clone()?;
        Some(Arc::new(Self::new(settings)))
    }

    fn validate(&self) -> Result<(), String> {
        self.settings.validate()
    }

    fn evaluate(&self, record: &MeasurementRecord) -> Result<Evaluation, MetricError> {
        let (name, grid) = self.height(record)?;
        let (scan_x, scan_y) = record
            .metadata()
            .scan_size_m
            .ok_or(MetricError::MissingMetadata("scan_size_m"))?;
        let extent = scan_x.max(scan_y);
        if !(extent > 0.0) || !extent.is_finite() {
            return Err(MetricError::Degenerate(format!(
                "scan extent {extent} m is not positive"
            )));
        }

        let radius = self.settings.lowpass_radius;
        let (rows, cols) = grid.shape();
        let lowpass = box_mean(grid.values(), rows, cols, radius);
        // Clipped border windows bias the filter on sloped data.
        let (core, core_rows, core_cols) = interior(&lowpass, rows, cols, radius);
        let plane = fit_plane(&core, core_rows, core_cols)
            .ok_or_else(|| MetricError::Degenerate(format!("channel '{name}' has no finite pixel")))?;
        let residual = plane_residuals(&core, core_rows, core_cols, &plane);
        let residual_rms = rms(&residual).unwrap_or(0.0);

        let residual_norm = residual_rms / extent;
        // Height change across the full slow axis.
        let ramp_norm = plane.slope_y.abs() * rows.saturating_sub(1) as f64 / extent;

        let direction = DRIFT_INFO.direction;
        let residual_grade = self.settings.residual.grade(residual_norm, direction);
        let ramp_grade = self.settings.ramp.grade(ramp_norm, direction);
        let (component, value, grade) = if ramp_grade.score < residual_grade.score {
            ("ramp", ramp_norm, ramp_grade)
        } else {
            ("residual", residual_norm, residual_grade)
        };

        Ok(Evaluation {
            value,
            grade,
            detail: detail! {
                "channel" => name,
                "component" => component,
                "residual_rms" => residual_rms,
                "residual_normalized" => residual_norm,
                "residual_status" => residual_grade.status,
                "ramp_normalized" => ramp_norm,
                "ramp_status" => ramp_grade.status,
                "slope_x" => plane.slope_x,
                "slope_y" => plane.slope_y,
                "scan_extent_m" => extent,
            },
        })
    }
}
