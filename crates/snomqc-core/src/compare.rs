//! 100% line: the ratio of two nominally identical nanoFTIR spectra.
//!
//! Two back-to-back acquisitions on the same spot should divide to a flat line
//! at 1. The mean/std of that ratio inside a wavenumber window is its
//! signal-to-noise ratio and measures the repeatability of the instrument.

use serde::{Deserialize, Serialize};
use snomqc_signal::{interpolate_linear, summarize};

use crate::metric::MetricError;
use crate::record::{MeasurementRecord, Spectrum};

/// Closed wavenumber interval in cm⁻¹.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WavenumberWindow {
    pub start: f64,
    pub end: f64,
}

impl WavenumberWindow {
    pub const fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, wavenumber: f64) -> bool {
        wavenumber >= self.start && wavenumber <= self.end
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.start.is_finite() || !self.end.is_finite() || self.start >= self.end {
            return Err(format!(
                "window {}-{} cm⁻¹ is empty or not finite",
                self.start, self.end
            ));
        }
        Ok(())
    }
}

/// Fingerprint region and full mid-IR range of a typical nanoFTIR source.
pub const DEFAULT_WINDOWS: [WavenumberWindow; 2] = [
    WavenumberWindow::new(800.0, 1300.0),
    WavenumberWindow::new(650.0, 1800.0),
];

/// Ratio statistics inside one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSnr {
    pub window: WavenumberWindow,
    pub samples: usize,
    pub mean: f64,
    pub std_dev: f64,
    /// `mean / std_dev`.
    pub snr: f64,
    /// Plot limits: min - std and max + std.
    pub y_min: f64,
    pub y_max: f64,
}

/// Ratio of two spectra on the first spectrum's axis plus per-window SNR.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HundredPercentLine {
    pub order: String,
    pub wavenumber: Vec<f64>,
    /// NaN where the reference does not cover the axis or is zero.
    pub ratio: Vec<f64>,
    pub windows: Vec<WindowSnr>,
}

impl HundredPercentLine {
    /// Lowest window SNR and its window.
    pub fn limiting(&self) -> Option<&WindowSnr> {
        self.windows.iter().min_by(|a, b| a.snr.total_cmp(&b.snr))
    }
}

/// Compare two records' spectra. `a` is the numerator.
pub fn hundred_percent_line(
    a: &MeasurementRecord,
    b: &MeasurementRecord,
    order: &str,
    windows: &[WavenumberWindow],
) -> Result<HundredPercentLine, MetricError> {
    let sample = a.spectrum().ok_or(MetricError::MissingSpectrum)?;
    let reference = b.spectrum().ok_or(MetricError::MissingSpectrum)?;
    spectrum_ratio_line(sample, reference, order, windows)
}

/// Same as [`hundred_percent_line`] on bare spectra. The reference is
/// linearly interpolated onto the sample's axis.
pub fn spectrum_ratio_line(
    sample: &Spectrum,
    reference: &Spectrum,
    order: &str,
    windows: &[WavenumberWindow],
) -> Result<HundredPercentLine, MetricError> {
    if windows.is_empty() {
        return Err(MetricError::Other("no wavenumber window given".into()));
    }
    let numerator = sample
        .amplitude(order)
        .ok_or_else(|| MetricError::MissingOrder(order.to_string()))?;
    let denominator = reference
        .amplitude(order)
        .ok_or_else(|| MetricError::MissingOrder(format!("{order} (reference)")))?;

    let axis = sample.wavenumber();
    let resampled = interpolate_linear(reference.wavenumber(), denominator, axis);
    let ratio: Vec<f64> = numerator
        .iter()
        .zip(&resampled)
        .map(|(&a, &b)| if b != 0.0 { a / b } else { f64::NAN })
        .collect();

    let windows = windows
        .iter()
        .map(|w| window_snr(axis, &ratio, *w))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(HundredPercentLine {
        order: order.to_string(),
        wavenumber: axis.to_vec(),
        ratio,
        windows,
    })
}

/// SNR of the finite ratio samples inside `window`.
pub fn window_snr(
    wavenumber: &[f64],
    ratio: &[f64],
    window: WavenumberWindow,
) -> Result<WindowSnr, MetricError> {
    window.validate().map_err(MetricError::Other)?;
    let inside: Vec<f64> = wavenumber
        .iter()
        .zip(ratio)
        .filter(|(w, r)| window.contains(**w) && r.is_finite())
        .map(|(_, r)| *r)
        .collect();
    if inside.len() < 2 {
        return Err(MetricError::Degenerate(format!(
            "{} usable samples in {}-{} cm⁻¹",
            inside.len(),
            window.start,
            window.end
        )));
    }
    let stats = summarize(&inside).ok_or_else(|| {
        MetricError::Degenerate(format!("no finite ratio in {}-{} cm⁻¹", window.start, window.end))
    })?;
    if !(stats.std_dev > 0.0) {
        return Err(MetricError::Degenerate(format!(
            "ratio has zero variance in {}-{} cm⁻¹",
            window.start, window.end
        )));
    }
    Ok(WindowSnr {
        window,
        samples: stats.count,
        mean: stats.mean,
        std_dev: stats.std_dev,
        snr: stats.mean / stats.std_dev,
        y_min: stats.min - stats.std_dev,
        y_max: stats.max + stats.std_dev,
    })
}
