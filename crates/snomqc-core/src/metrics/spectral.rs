//! Narrow spikes and invalid samples in nanoFTIR amplitude spectra.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Map;
use snomqc_signal::detect_spikes;

use crate::config::MetricSettings;
use crate::metric::{
    Evaluation, Metric, MetricError, MetricInfo, Requirement, ScoreDirection, Thresholds, detail,
};
use crate::record::MeasurementRecord;

/// Spike positions reported per order, at most.
const MAX_REPORTED_SPIKES: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpikeSettings {
    /// On artifact density of the worst order: spikes plus non-finite
    /// samples, per sample.
    pub thresholds: Thresholds,
    /// Running-median window, odd.
    pub window: usize,
    /// Spike threshold in robust sigmas.
    pub k_sigma: f64,
    /// Widest run still counted as a spike, in samples.
    pub max_width: usize,
}

impl Default for SpikeSettings {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::new(0.002, 0.01),
            window: 7,
            k_sigma: 6.0,
            max_width: 3,
        }
    }
}

impl SpikeSettings {
    pub fn validate(&self) -> Result<(), String> {
        self.thresholds.validate(SPECTRAL_ARTIFACTS_INFO.direction)?;
        if self.window < 3 || self.window % 2 == 0 {
            return Err(format!("window must be odd and at least 3, got {}", self.window));
        }
        if !(self.k_sigma > 0.0) || !self.k_sigma.is_finite() {
            return Err(format!("k_sigma must be positive, got {}", self.k_sigma));
        }
        if self.max_width == 0 {
            return Err("max_width must be at least 1".into());
        }
        Ok(())
    }
}

pub struct SpectralArtifactsMetric {
    settings: SpikeSettings,
}

static SPECTRAL_ARTIFACTS_INFO: MetricInfo = MetricInfo {
    name: "spectral_artifacts",
    description: "Spikes in the amplitude spectra",
    principle: "A running median follows genuine absorption bands; cosmic-ray hits, \
                interferometer glitches and phase jumps leave a few samples far from it. \
                Runs of residual beyond k robust sigmas (1.4826 MAD) that are no wider than \
                max_width count as spikes. Non-finite samples are dropouts and count as \
                artifacts too.",
    requirements: &[Requirement::Spectrum],
    direction: ScoreDirection::LowerIsBetter,
};

impl SpectralArtifactsMetric {
    pub fn new(settings: SpikeSettings) -> Self {
        Self { settings }
    }
}

impl Default for SpectralArtifactsMetric {
    fn default() -> Self {
        Self::new(SpikeSettings::default())
    }
}

impl Metric for SpectralArtifactsMetric {
    fn info(&self) -> &MetricInfo {
        &SPECTRAL_ARTIFACTS_INFO
    }

    fn configured(&self, settings: &MetricSettings) -> Option<Arc<dyn Metric>> {
        let settings = settings.spectral_artifacts.clone()?;
        Some(Arc::new(Self::new(settings)))
    }

    fn validate(&self) -> Result<(), String> {
        self.settings.validate()
    }

    fn evaluate(&self, record: &MeasurementRecord) -> Result<Evaluation, MetricError> {
        let spectrum = record.spectrum().ok_or(MetricError::MissingSpectrum)?;
        let s = &self.settings;
        if spectrum.samples() < s.window {
            return Err(MetricError::Degenerate(format!(
                "spectrum has {} samples, median window needs {}",
                spectrum.samples(),
                s.window
            )));
        }

        let axis = spectrum.wavenumber();
        let mut per_order = Map::new();
        let mut worst: Option<(&str, f64)> = None;
        for (order, values) in spectrum.amplitudes() {
            let scan = detect_spikes(values, s.window, s.k_sigma, s.max_width);
            let invalid = spectrum.invalid_count(order);
            let density = (scan.spikes.len() + invalid) as f64 / values.len() as f64;
            let positions: Vec<f64> = scan
                .spikes
                .iter()
                .take(MAX_REPORTED_SPIKES)
                .map(|spike| axis[spike.peak_index])
                .collect();
            per_order.insert(
                order.to_string(),
                serde_json::json!({
                    "spikes": scan.spikes.len(),
                    "invalid": invalid,
                    "density": density,
                    "sigma": scan.sigma,
                    "broad_features": scan.broad_features,
                    "spike_wavenumbers": positions,
                }),
            );
            if worst.is_none_or(|(_, w)| density > w) {
                worst = Some((order, density));
            }
        }

        let (worst_order, value) =
            worst.ok_or_else(|| MetricError::Degenerate("spectrum has no amplitude order".into()))?;
        Ok(Evaluation::graded(
            value,
            &s.thresholds,
            SPECTRAL_ARTIFACTS_INFO.direction,
            detail! {
                "worst_order" => worst_order,
                "orders" => per_order,
            },
        ))
    }
}
