//! Spectral repeatability against a reference acquisition (100% line SNR).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::compare::{DEFAULT_WINDOWS, WavenumberWindow, spectrum_ratio_line};
use crate::config::MetricSettings;
use crate::metric::{
    Evaluation, Metric, MetricError, MetricInfo, Requirement, ScoreDirection, Thresholds, detail,
};
use crate::record::{MeasurementRecord, Spectrum};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnrSettings {
    /// On the lowest window SNR; higher is better, so `warn >= fail`.
    pub thresholds: Thresholds,
    /// Amplitude order to compare.
    pub order: String,
    pub windows: Vec<WavenumberWindow>,
}

impl Default for SnrSettings {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::new(50.0, 20.0),
            order: "O2A".into(),
            windows: DEFAULT_WINDOWS.to_vec(),
        }
    }
}

impl SnrSettings {
    pub fn validate(&self) -> Result<(), String> {
        self.thresholds.validate(SPECTRAL_SNR_INFO.direction)?;
        if self.order.trim().is_empty() {
            return Err("order must be named".into());
        }
        if self.windows.is_empty() {
            return Err("at least one wavenumber window is required".into());
        }
        self.windows.iter().try_for_each(WavenumberWindow::validate)
    }
}

/// Divides the record's spectrum by a reference spectrum taken under the same
/// conditions and grades the flatness of the ratio.
pub struct SpectralSnrMetric {
    settings: SnrSettings,
    reference: Arc<Spectrum>,
}

static SPECTRAL_SNR_INFO: MetricInfo = MetricInfo {
    name: "spectral_snr",
    description: "100% line signal-to-noise against a reference spectrum",
    principle: "Two spectra of the same spot divide to a flat line at 1. The ratio's \
                mean/std inside each wavenumber window measures repeatability; the worst \
                window decides.",
    requirements: &[Requirement::Spectrum],
    direction: ScoreDirection::HigherIsBetter,
};

impl SpectralSnrMetric {
    pub fn new(reference: Arc<Spectrum>, settings: SnrSettings) -> Self {
        Self {
            settings,
            reference,
        }
    }

    pub fn with_reference(reference: Arc<Spectrum>) -> Self {
        Self::new(reference, SnrSettings::default())
    }
}

impl Metric for SpectralSnrMetric {
    fn info(&self) -> &MetricInfo {
        &SPECTRAL_SNR_INFO
    }

    fn configured(&self, settings: &MetricSettings) -> Option<Arc<dyn Metric>> {
        let settings = settings.spectral_snr.clone()?;
        Some(Arc::new(Self::new(Arc::clone(&self.reference), settings)))
    }

    fn validate(&self) -> Result<(), String> {
        self.settings.validate()
    }

    fn evaluate(&self, record: &MeasurementRecord) -> Result<Evaluation, MetricError> {
        let spectrum = record.spectrum().ok_or(MetricError::MissingSpectrum)?;
        let line = spectrum_ratio_line(
            spectrum,
            &self.reference,
            &self.settings.order,
            &self.settings.windows,
        )?;
        let (window, snr) = line
            .limiting()
            .map(|w| (w.window, w.snr))
            .ok_or_else(|| MetricError::Other("no wavenumber window given".into()))?;

        Ok(Evaluation::graded(
            snr,
            &self.settings.thresholds,
            SPECTRAL_SNR_INFO.direction,
            detail! {
                "order" => line.order,
                "limiting_window" => window,
                "windows" => line.windows,
            },
        ))
    }
}
