//! Numeric primitives for near-field measurement quality control.
//!
//! Descriptive statistics, NaN-aware 2D box filtering, running medians, plane
//! fitting, narrow-spike detection and the interferogram Fourier transform.
//! Every function works on plain slices and treats non-finite values as
//! missing samples: they are skipped, never propagated into a statistic.

use rustfft::{FftPlanner, num_complex::Complex};
use statrs::statistics::{Data, Median, Statistics};

/// Scale factor turning a median absolute deviation into a Gaussian sigma.
pub const MAD_TO_SIGMA: f64 = 1.4826;

// ═══════════════════════════════════════════════════════════════════════════════
// Core types
// ═══════════════════════════════════════════════════════════════════════════════

/// Descriptive statistics over the finite values of a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    /// Number of finite values used.
    pub count: usize,
    pub mean: f64,
    /// Population standard deviation.
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
}

impl Summary {
    /// Peak-to-peak range (`max - min`).
    pub fn range(&self) -> f64 {
        self.max - self.min
    }
}

/// Least-squares plane `z = offset + slope_x * col + slope_y * row`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub offset: f64,
    /// Change per column (fast-scan axis).
    pub slope_x: f64,
    /// Change per row (slow-scan axis).
    pub slope_y: f64,
}

impl Plane {
    /// Evaluate the plane at a pixel.
    pub fn at(&self, row: usize, col: usize) -> f64 {
        self.offset + self.slope_x * col as f64 + self.slope_y * row as f64
    }
}

/// One narrow excursion found by [`detect_spikes`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Spike {
    /// Index of the first sample above threshold.
    pub start: usize,
    /// Number of consecutive samples above threshold.
    pub width: usize,
    /// Index of the largest excursion inside the run.
    pub peak_index: usize,
    /// Signed residual at `peak_index`.
    pub excursion: f64,
}

/// Result of a spike scan over one signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SpikeScan {
    pub spikes: Vec<Spike>,
    /// Robust noise estimate of the median-filter residual.
    pub sigma: f64,
    /// Absolute residual threshold (`k_sigma * sigma`).
    pub threshold: f64,
    /// Runs above threshold that were too wide to count as spikes.
    pub broad_features: usize,
    /// Number of samples scanned.
    pub samples: usize,
}

impl SpikeScan {
    /// Spikes per sample.
    pub fn density(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.spikes.len() as f64 / self.samples as f64
        }
    }
}

/// Single-sided spectrum computed from an interferogram.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexSpectrum {
    /// Wavenumber axis in cm⁻¹, strictly increasing, DC bin excluded.
    pub wavenumber: Vec<f64>,
    pub amplitude: Vec<f64>,
    /// Phase in radians.
    pub phase: Vec<f64>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// 1. STATISTICS
// ═══════════════════════════════════════════════════════════════════════════════

/// Copy out the finite values of a slice.
pub fn finite(values: &[f64]) -> Vec<f64> {
    values.iter().copied().filter(|v| v.is_finite()).collect()
}

/// Summarize the finite values of `values`. `None` when there are none.
pub fn summarize(values: &[f64]) -> Option<Summary> {
    let kept = finite(values);
    if kept.is_empty() {
        return None;
    }
    let mean = kept.iter().mean();
    let std_dev = kept.iter().population_std_dev();
    let min = kept.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max = kept.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let count = kept.len();
    let median = Data::new(kept).median();
    Some(Summary {
        count,
        mean,
        std_dev,
        min,
        max,
        median,
    })
}

/// Median of the finite values.
pub fn median(values: &[f64]) -> Option<f64> {
    let kept = finite(values);
    if kept.is_empty() {
        return None;
    }
    Some(Data::new(kept).median())
}

/// Median absolute deviation from the median, over finite values.
pub fn median_abs_deviation(values: &[f64]) -> Option<f64> {
    let center = median(values)?;
    let deviations: Vec<f64> = values
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| (v - center).abs())
        .collect();
    median(&deviations)
}

/// Gaussian-equivalent sigma from the MAD. Robust against outliers and spikes.
pub fn robust_sigma(values: &[f64]) -> Option<f64> {
    median_abs_deviation(values).map(|mad| mad * MAD_TO_SIGMA)
}

/// Root mean square of the finite values.
pub fn rms(values: &[f64]) -> Option<f64> {
    let kept = finite(values);
    if kept.is_empty() {
        return None;
    }
    Some((kept.iter().map(|v| v * v).sum::<f64>() / kept.len() as f64).sqrt())
}

// ═══════════════════════════════════════════════════════════════════════════════
// 2. FILTERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Local mean over a `(2r+1) x (2r+1)` window of a row-major grid.
///
/// Windows are clipped at the borders and skip non-finite pixels. A pixel whose
/// window holds no finite value comes out as NaN. Runs in O(rows * cols) via
/// summed-area tables.
pub fn box_mean(values: &[f64], rows: usize, cols: usize, radius: usize) -> Vec<f64> {
    assert_eq!(values.len(), rows * cols, "grid size mismatch");
    let stride = cols + 1;
    let mut sum = vec![0.0f64; (rows + 1) * stride];
    let mut count = vec![0u32; (rows + 1) * stride];

    for r in 0..rows {
        let mut row_sum = 0.0;
        let mut row_count = 0u32;
        for c in 0..cols {
            let v = values[r * cols + c];
            if v.is_finite() {
                row_sum += v;
                row_count += 1;
            }
            let idx = (r + 1) * stride + (c + 1);
            sum[idx] = sum[r * stride + (c + 1)] + row_sum;
            count[idx] = count[r * stride + (c + 1)] + row_count;
        }
    }

    let mut out = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        let r0 = r.saturating_sub(radius);
        let r1 = (r + radius + 1).min(rows);
        for c in 0..cols {
            let c0 = c.saturating_sub(radius);
            let c1 = (c + radius + 1).min(cols);
            let s = sum[r1 * stride + c1] - sum[r0 * stride + c1] - sum[r1 * stride + c0]
                + sum[r0 * stride + c0];
            let n = count[r1 * stride + c1] + count[r0 * stride + c0]
                - count[r0 * stride + c1]
                - count[r1 * stride + c0];
            out.push(if n == 0 { f64::NAN } else { s / n as f64 });
        }
    }
    out
}

/// Running median with an odd window, shrunk symmetrically at the edges.
///
/// Even windows are widened by one. Non-finite samples are ignored inside each
/// window; a window without finite samples yields NaN.
pub fn running_median(values: &[f64], window: usize) -> Vec<f64> {
    let half = window.max(1) / 2;
    let n = values.len();
    let mut out = Vec::with_capacity(n);
    let mut scratch: Vec<f64> = Vec::with_capacity(2 * half + 1);
    for i in 0..n {
        let reach = half.min(i).min(n - 1 - i);
        scratch.clear();
        scratch.extend(
            values[i - reach..=i + reach]
                .iter()
                .copied()
                .filter(|v| v.is_finite()),
        );
        if scratch.is_empty() {
            out.push(f64::NAN);
        } else {
            scratch.sort_by(|a, b| a.total_cmp(b));
            let m = scratch.len();
            out.push(if m % 2 == 1 {
                scratch[m / 2]
            } else {
                0.5 * (scratch[m / 2 - 1] + scratch[m / 2])
            });
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════════
// 3. PLANE FITTING
// ═══════════════════════════════════════════════════════════════════════════════

/// Least-squares plane through the finite pixels of a row-major grid.
///
/// Degenerate geometry (a single row or column) fits only the slope that is
/// defined and leaves the other at zero. `None` when no pixel is finite.
pub fn fit_plane(values: &[f64], rows: usize, cols: usize) -> Option<Plane> {
    assert_eq!(values.len(), rows * cols, "grid size mismatch");
    let mut n = 0.0f64;
    let (mut sx, mut sy, mut sz) = (0.0f64, 0.0f64, 0.0f64);
    for r in 0..rows {
        for c in 0..cols {
            let z = values[r * cols + c];
            if z.is_finite() {
                n += 1.0;
                sx += c as f64;
                sy += r as f64;
                sz += z;
            }
        }
    }
    if n == 0.0 {
        return None;
    }
    let (mx, my, mz) = (sx / n, sy / n, sz / n);

    let (mut sxx, mut syy, mut sxy, mut sxz, mut syz) = (0.0f64, 0.0f64, 0.0f64, 0.0f64, 0.0f64);
    for r in 0..rows {
        for c in 0..cols {
            let z = values[r * cols + c];
            if z.is_finite() {
                let dx = c as f64 - mx;
                let dy = r as f64 - my;
                let dz = z - mz;
                sxx += dx * dx;
                syy += dy * dy;
                sxy += dx * dy;
                sxz += dx * dz;
                syz += dy * dz;
            }
        }
    }

    const EPS: f64 = 1e-12;
    let det = sxx * syy - sxy * sxy;
    let (slope_x, slope_y) = if det.abs() > EPS * (sxx * syy).max(1.0) {
        ((sxz * syy - syz * sxy) / det, (syz * sxx - sxz * sxy) / det)
    } else if sxx > EPS {
        (sxz / sxx, 0.0)
    } else if syy > EPS {
        (0.0, syz / syy)
    } else {
        (0.0, 0.0)
    };

    Some(Plane {
        offset: mz - slope_x * mx - slope_y * my,
        slope_x,
        slope_y,
    })
}

/// Grid minus plane. Non-finite pixels stay non-finite.
pub fn plane_residuals(values: &[f64], rows: usize, cols: usize, plane: &Plane) -> Vec<f64> {
    assert_eq!(values.len(), rows * cols, "grid size mismatch");
    values
        .iter()
        .enumerate()
        .map(|(i, &z)| z - plane.at(i / cols, i % cols))
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// 4. SPIKE DETECTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Find narrow spikes as runs of median-filter residual beyond `k_sigma` robust
/// sigmas. Runs wider than `max_width` samples are counted as broad features.
pub fn detect_spikes(values: &[f64], window: usize, k_sigma: f64, max_width: usize) -> SpikeScan {
    let smooth = running_median(values, window);
    let residual: Vec<f64> = values.iter().zip(&smooth).map(|(v, m)| v - m).collect();

    let mut sigma = robust_sigma(&residual).unwrap_or(0.0);
    if sigma <= f64::EPSILON {
        // More than half the residuals are exactly zero; fall back to the mean
        // absolute residual so isolated spikes on a flat signal still register.
        let kept = finite(&residual);
        sigma = if kept.is_empty() {
            0.0
        } else {
            kept.iter().map(|r| r.abs()).sum::<f64>() / kept.len() as f64
        };
    }
    let threshold = if sigma > f64::EPSILON {
        k_sigma * sigma
    } else {
        f64::INFINITY
    };

    let mut spikes = Vec::new();
    let mut broad_features = 0usize;
    let mut i = 0usize;
    while i < residual.len() {
        if residual[i].is_finite() && residual[i].abs() > threshold {
            let start = i;
            let mut peak_index = i;
            while i < residual.len() && residual[i].is_finite() && residual[i].abs() > threshold {
                if residual[i].abs() > residual[peak_index].abs() {
                    peak_index = i;
                }
                i += 1;
            }
            let width = i - start;
            if width <= max_width {
                spikes.push(Spike {
                    start,
                    width,
                    peak_index,
                    excursion: residual[peak_index],
                });
            } else {
                broad_features += 1;
            }
        } else {
            i += 1;
        }
    }

    SpikeScan {
        spikes,
        sigma,
        threshold,
        broad_features,
        samples: finite(values).len(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// 5. FOURIER TRANSFORM & RESAMPLING
// ═══════════════════════════════════════════════════════════════════════════════

/// Transform a demodulated interferogram (amplitude and phase per mirror step)
/// into a single-sided spectrum.
///
/// `opd_step_cm` is the optical path difference between consecutive samples.
/// The complex mean is removed before the FFT; bin `k` maps to wavenumber
/// `k / (n * opd_step_cm)`. `None` for fewer than 4 samples, mismatched
/// inputs, non-finite samples or a non-positive step.
pub fn interferogram_to_spectrum(
    amplitude: &[f64],
    phase: &[f64],
    opd_step_cm: f64,
) -> Option<ComplexSpectrum> {
    let n = amplitude.len();
    if n < 4 || phase.len() != n || !(opd_step_cm > 0.0) || !opd_step_cm.is_finite() {
        return None;
    }
    if amplitude.iter().chain(phase).any(|v| !v.is_finite()) {
        return None;
    }

    let mut buffer: Vec<Complex<f64>> = amplitude
        .iter()
        .zip(phase)
        .map(|(&a, &p)| Complex::from_polar(a, p))
        .collect();
    let mean = buffer.iter().sum::<Complex<f64>>() / n as f64;
    for c in &mut buffer {
        *c -= mean;
    }

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n);
    fft.process(&mut buffer);

    let half = n / 2;
    let span = n as f64 * opd_step_cm;
    let mut out = ComplexSpectrum {
        wavenumber: Vec::with_capacity(half),
        amplitude: Vec::with_capacity(half),
        phase: Vec::with_capacity(half),
    };
    for (k, c) in buffer.iter().enumerate().take(half + 1).skip(1) {
        out.wavenumber.push(k as f64 / span);
        out.amplitude.push(c.norm() / n as f64);
        out.phase.push(c.arg());
    }
    Some(out)
}

/// Linear interpolation of `(x, y)` at `at`. `x` must be strictly increasing;
/// points outside `[x[0], x[n-1]]` come out as NaN.
pub fn interpolate_linear(x: &[f64], y: &[f64], at: &[f64]) -> Vec<f64> {
    assert_eq!(x.len(), y.len(), "axis/value length mismatch");
    at.iter()
        .map(|&t| {
            if x.is_empty() || !t.is_finite() || t < x[0] || t > x[x.len() - 1] {
                return f64::NAN;
            }
            // partition_point: first index with x > t
            let hi = x.partition_point(|&xv| xv <= t);
            if hi == 0 {
                return y[0];
            }
            if hi >= x.len() {
                return y[x.len() - 1];
            }
            let lo = hi - 1;
            let frac = (t - x[lo]) / (x[hi] - x[lo]);
            y[lo] + frac * (y[hi] - y[lo])
        })
        .collect()
}
