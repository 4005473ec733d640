//! Canonical in-memory representation of one sSNOM/nanoFTIR acquisition.
//!
//! A [`MeasurementRecord`] holds shape-consistent image channels, an optional
//! spectrum and acquisition metadata. Records are validated once, at
//! construction, and are read-only afterwards: every field is private and only
//! exposed through shared references. A SHA-256 fingerprint over the measured
//! data is computed at construction and identifies the record in QC results.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ingest::IngestError;
use crate::metric::Requirement;

// ---------------------------------------------------------------------------
// Channel classification
// ---------------------------------------------------------------------------

/// What a channel measures, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Topography (`height`, `topography`, `Z`, `Z C`, `Z raw`).
    Height,
    /// Optical amplitude at demodulation order n (`O<n>A`, `amplitude-order-<n>`).
    Amplitude(u8),
    /// Optical phase at demodulation order n (`O<n>P`, `phase-order-<n>`).
    Phase(u8),
    /// Anything else (mechanical amplitude `M1A`, error signals, ...).
    Other,
}

impl ChannelKind {
    /// Classify a channel name. Case-insensitive; a trailing ` raw` or ` C`
    /// qualifier is ignored.
    pub fn classify(name: &str) -> Self {
        let lower = name.trim().to_ascii_lowercase();
        let base = lower
            .strip_suffix(" raw")
            .or_else(|| lower.strip_suffix(" c"))
            .unwrap_or(&lower)
            .trim();

        if matches!(base, "height" | "topography" | "z") {
            return Self::Height;
        }
        if let Some(order) = base.strip_prefix("amplitude-order-").and_then(parse_order) {
            return Self::Amplitude(order);
        }
        if let Some(order) = base.strip_prefix("phase-order-").and_then(parse_order) {
            return Self::Phase(order);
        }
        if let Some(rest) = base.strip_prefix('o') {
            if let Some(order) = rest.strip_suffix('a').and_then(parse_order) {
                return Self::Amplitude(order);
            }
            if let Some(order) = rest.strip_suffix('p').and_then(parse_order) {
                return Self::Phase(order);
            }
        }
        Self::Other
    }
}

fn parse_order(digits: &str) -> Option<u8> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Height => write!(f, "height"),
            Self::Amplitude(n) => write!(f, "amplitude order {n}"),
            Self::Phase(n) => write!(f, "phase order {n}"),
            Self::Other => write!(f, "other"),
        }
    }
}

// ---------------------------------------------------------------------------
// Grid
// ---------------------------------------------------------------------------

/// A non-empty row-major 2D grid of measured values.
///
/// Non-finite values mark invalid or saturated pixels. They are kept in place
/// (metrics need to see them) and counted once here.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    rows: usize,
    cols: usize,
    values: Vec<f64>,
    invalid: usize,
}

impl Grid {
    pub fn new(rows: usize, cols: usize, values: Vec<f64>) -> Result<Self, IngestError> {
        if rows == 0 || cols == 0 {
            return Err(IngestError::InvalidGrid(format!(
                "grid must be non-empty, got {rows}x{cols}"
            )));
        }
        let expected = rows.checked_mul(cols).ok_or_else(|| {
            IngestError::InvalidGrid(format!("grid shape {rows}x{cols} overflows"))
        })?;
        if values.len() != expected {
            return Err(IngestError::InvalidGrid(format!(
                "{rows}x{cols} grid needs {expected} values, got {}",
                values.len()
            )));
        }
        let invalid = values.iter().filter(|v| !v.is_finite()).count();
        Ok(Self {
            rows,
            cols,
            values,
            invalid,
        })
    }

    /// Build a grid from a function of `(row, col)`.
    pub fn from_fn(
        rows: usize,
        cols: usize,
        f: impl Fn(usize, usize) -> f64,
    ) -> Result<Self, IngestError> {
        let values = (0..rows * cols).map(|i| f(i / cols.max(1), i % cols.max(1))).collect();
        Self::new(rows, cols, values)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Row-major values, invalid pixels included.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row < self.rows && col < self.cols {
            Some(self.values[row * self.cols + col])
        } else {
            None
        }
    }

    /// Number of non-finite pixels.
    pub fn invalid_count(&self) -> usize {
        self.invalid
    }

    pub fn pixel_count(&self) -> usize {
        self.values.len()
    }
}

// ---------------------------------------------------------------------------
// Spectrum
// ---------------------------------------------------------------------------

/// nanoFTIR spectrum: a strictly increasing wavenumber axis (cm⁻¹) with
/// per-order amplitude arrays and optional phase arrays of the same length.
///
/// Like grid pixels, non-finite samples stay in place and are counted per
/// array at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    wavenumber: Vec<f64>,
    amplitude: BTreeMap<String, Vec<f64>>,
    phase: BTreeMap<String, Vec<f64>>,
    invalid: BTreeMap<String, usize>,
}

impl Spectrum {
    /// Validate and build a spectrum.
    ///
    /// A strictly decreasing axis is reversed together with every array. Any
    /// other non-monotonic axis is rejected.
    pub fn new(
        wavenumber: Vec<f64>,
        amplitude: BTreeMap<String, Vec<f64>>,
        phase: BTreeMap<String, Vec<f64>>,
    ) -> Result<Self, IngestError> {
        if wavenumber.is_empty() {
            return Err(IngestError::InvalidSpectrum("empty wavenumber axis".into()));
        }
        if amplitude.is_empty() {
            return Err(IngestError::InvalidSpectrum(
                "spectrum carries no amplitude order".into(),
            ));
        }
        if let Some(index) = wavenumber.iter().position(|w| !w.is_finite()) {
            return Err(IngestError::InvalidSpectrum(format!(
                "non-finite wavenumber at index {index}"
            )));
        }
        for (name, values) in amplitude.iter().chain(phase.iter()) {
            if values.len() != wavenumber.len() {
                return Err(IngestError::SpectralLength {
                    name: name.clone(),
                    expected: wavenumber.len(),
                    found: values.len(),
                });
            }
        }

        let invalid = amplitude
            .iter()
            .chain(phase.iter())
            .map(|(name, values)| (name.clone(), values.iter().filter(|v| !v.is_finite()).count()))
            .collect();
        let mut spectrum = Self {
            wavenumber,
            amplitude,
            phase,
            invalid,
        };
        match axis_direction(&spectrum.wavenumber) {
            Ok(Direction::Increasing) => {}
            Ok(Direction::Decreasing) => {
                spectrum.wavenumber.reverse();
                spectrum.amplitude.values_mut().for_each(|v| v.reverse());
                spectrum.phase.values_mut().for_each(|v| v.reverse());
            }
            Err(index) => return Err(IngestError::NonMonotonicAxis { index }),
        }
        Ok(spectrum)
    }

    /// Wavenumber axis in cm⁻¹, strictly increasing.
    pub fn wavenumber(&self) -> &[f64] {
        &self.wavenumber
    }

    /// Number of samples along the axis.
    pub fn samples(&self) -> usize {
        self.wavenumber.len()
    }

    pub fn amplitude(&self, order: &str) -> Option<&[f64]> {
        self.amplitude.get(order).map(Vec::as_slice)
    }

    pub fn phase(&self, order: &str) -> Option<&[f64]> {
        self.phase.get(order).map(Vec::as_slice)
    }

    /// Amplitude arrays by name, sorted by name.
    pub fn amplitudes(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.amplitude.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn phases(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.phase.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of non-finite samples in the amplitude or phase array `name`;
    /// zero for an unknown name.
    pub fn invalid_count(&self, name: &str) -> usize {
        self.invalid.get(name).copied().unwrap_or(0)
    }

    /// Non-finite samples across every amplitude and phase array.
    pub fn total_invalid(&self) -> usize {
        self.invalid.values().sum()
    }
}

enum Direction {
    Increasing,
    Decreasing,
}

/// Direction of a strictly monotonic axis, or the first index that breaks it.
fn axis_direction(axis: &[f64]) -> Result<Direction, usize> {
    if axis.len() < 2 || axis[1] > axis[0] {
        match axis.windows(2).position(|w| w[1] <= w[0]) {
            None => Ok(Direction::Increasing),
            Some(i) => Err(i + 1),
        }
    } else {
        match axis.windows(2).position(|w| w[1] >= w[0]) {
            None => Ok(Direction::Decreasing),
            Some(i) => Err(i + 1),
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// A free-form metadata value as carried by instrument exports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<f64>),
    Null,
}

impl MetadataValue {
    /// Numeric view: integers, floats and the first element of a list.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::List(values) => values.first().copied(),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::List(values) => {
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", parts.join(", "))
            }
            Self::Null => write!(f, "null"),
        }
    }
}

/// Acquisition parameters. Informational: metrics read the typed fields they
/// need and fail with a descriptive reason when one is absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub instrument_id: Option<String>,
    pub project: Option<String>,
    /// Acquisition date/time as written by the instrument.
    pub timestamp: Option<String>,
    pub tip_frequency_hz: Option<f64>,
    pub tip_amplitude_nm: Option<f64>,
    /// Scan extent `(x, y)` in metres.
    pub scan_size_m: Option<(f64, f64)>,
    /// Pixel dwell / integration time in milliseconds.
    pub pixel_dwell_ms: Option<f64>,
    /// Number of averaged acquisitions.
    pub averaging: Option<u32>,
    /// Detector clip level; overrides the configured saturation threshold.
    pub clip_value: Option<f64>,
    /// Every other key the export carried.
    pub extra: BTreeMap<String, MetadataValue>,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// ---------------------------------------------------------------------------
// MeasurementRecord
// ---------------------------------------------------------------------------

/// One acquisition: shape-consistent channels, optional spectrum, metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    source: Option<String>,
    channels: Vec<(String, Grid)>,
    spectrum: Option<Spectrum>,
    metadata: Metadata,
    fingerprint: String,
}

impl MeasurementRecord {
    pub fn builder() -> RecordBuilder {
        RecordBuilder::default()
    }

    /// Label of the file or buffer the record was loaded from.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Channels in load order.
    pub fn channels(&self) -> impl Iterator<Item = (&str, &Grid)> {
        self.channels.iter().map(|(name, grid)| (name.as_str(), grid))
    }

    pub fn channel(&self, name: &str) -> Option<&Grid> {
        self.channels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, grid)| grid)
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// First channel classified as height.
    pub fn height(&self) -> Option<(&str, &Grid)> {
        self.channels()
            .find(|(name, _)| ChannelKind::classify(name) == ChannelKind::Height)
    }

    /// Amplitude channels sorted by demodulation order; the first channel
    /// seen for an order wins.
    pub fn amplitude_orders(&self) -> Vec<(u8, &str, &Grid)> {
        let mut orders: BTreeMap<u8, (&str, &Grid)> = BTreeMap::new();
        for (name, grid) in self.channels() {
            if let ChannelKind::Amplitude(n) = ChannelKind::classify(name) {
                orders.entry(n).or_insert((name, grid));
            }
        }
        orders
            .into_iter()
            .map(|(n, (name, grid))| (n, name, grid))
            .collect()
    }

    /// Common `(rows, cols)` of all channels; `None` for spectrum-only records.
    pub fn shape(&self) -> Option<(usize, usize)> {
        self.channels.first().map(|(_, grid)| grid.shape())
    }

    pub fn spectrum(&self) -> Option<&Spectrum> {
        self.spectrum.as_ref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Hex SHA-256 over channel names, shapes, values and spectral arrays.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Recompute the fingerprint and compare it with the one taken at
    /// construction.
    pub fn verify_fingerprint(&self) -> bool {
        compute_fingerprint(&self.channels, self.spectrum.as_ref()) == self.fingerprint
    }

    /// Whether the record provides a capability a metric depends on.
    pub fn provides(&self, requirement: Requirement) -> bool {
        match requirement {
            Requirement::Channels => !self.channels.is_empty(),
            Requirement::Spectrum => self.spectrum.is_some(),
            Requirement::Metadata => !self.metadata.is_empty(),
        }
    }
}

/// Validating builder for [`MeasurementRecord`].
#[derive(Debug, Default)]
pub struct RecordBuilder {
    source: Option<String>,
    channels: Vec<(String, Grid)>,
    spectrum: Option<Spectrum>,
    metadata: Metadata,
}

impl RecordBuilder {
    pub fn source(mut self, label: impl Into<String>) -> Self {
        self.source = Some(label.into());
        self
    }

    pub fn channel(mut self, name: impl Into<String>, grid: Grid) -> Self {
        self.channels.push((name.into(), grid));
        self
    }

    pub fn spectrum(mut self, spectrum: Spectrum) -> Self {
        self.spectrum = Some(spectrum);
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Check shape consistency and channel names, then fingerprint the data.
    pub fn build(self) -> Result<MeasurementRecord, IngestError> {
        if self.channels.is_empty() && self.spectrum.is_none() {
            return Err(IngestError::EmptyRecord);
        }
        if let Some((_, first)) = self.channels.first() {
            let expected = first.shape();
            for (i, (name, grid)) in self.channels.iter().enumerate() {
                if name.trim().is_empty() {
                    return Err(IngestError::InvalidGrid(format!(
                        "channel {i} has an empty name"
                    )));
                }
                if self.channels[..i].iter().any(|(n, _)| n == name) {
                    return Err(IngestError::DuplicateChannel(name.clone()));
                }
                if grid.shape() != expected {
                    return Err(IngestError::ShapeMismatch {
                        channel: name.clone(),
                        expected,
                        found: grid.shape(),
                    });
                }
            }
        }

        let fingerprint = compute_fingerprint(&self.channels, self.spectrum.as_ref());
        Ok(MeasurementRecord {
            source: self.source,
            channels: self.channels,
            spectrum: self.spectrum,
            metadata: self.metadata,
            fingerprint,
        })
    }
}

fn compute_fingerprint(channels: &[(String, Grid)], spectrum: Option<&Spectrum>) -> String {
    let mut h = Sha256::new();
    for (name, grid) in channels {
        h.update(b"channel\0");
        h.update(name.as_bytes());
        h.update([0u8]);
        h.update((grid.rows as u64).to_le_bytes());
        h.update((grid.cols as u64).to_le_bytes());
        hash_series(&mut h, &grid.values);
    }
    if let Some(spectrum) = spectrum {
        h.update(b"spectrum\0");
        hash_series(&mut h, &spectrum.wavenumber);
        for (tag, arrays) in [(b'A', &spectrum.amplitude), (b'P', &spectrum.phase)] {
            for (name, values) in arrays {
                h.update([tag]);
                h.update(name.as_bytes());
                h.update([0u8]);
                hash_series(&mut h, values);
            }
        }
    }
    hex_encode(&h.finalize())
}

fn hash_series(h: &mut Sha256, values: &[f64]) {
    h.update((values.len() as u64).to_le_bytes());
    for v in values {
        // NaN payloads and signs carry no meaning.
        let bits = if v.is_nan() { f64::NAN.to_bits() } else { v.to_bits() };
        h.update(bits.to_le_bytes());
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(rows: usize, cols: usize) -> Grid {
        Grid::from_fn(rows, cols, |r, c| (r * cols + c) as f64).unwrap()
    }

    fn one_order(values: Vec<f64>) -> BTreeMap<String, Vec<f64>> {
        BTreeMap::from([("O2A".to_string(), values)])
    }

    // -----------------------------------------------------------------------
    // Channel classification
    // -----------------------------------------------------------------------

    #[test]
    fn test_classify_height_spellings() {
        for name in ["height", "Topography", "Z", "Z C", "Z raw", " z "] {
            assert_eq!(ChannelKind::classify(name), ChannelKind::Height, "{name}");
        }
    }

    #[test]
    fn test_classify_orders() {
        assert_eq!(ChannelKind::classify("O2A"), ChannelKind::Amplitude(2));
        assert_eq!(ChannelKind::classify("o3p"), ChannelKind::Phase(3));
        assert_eq!(ChannelKind::classify("O4A raw"), ChannelKind::Amplitude(4));
        assert_eq!(
            ChannelKind::classify("amplitude-order-5"),
            ChannelKind::Amplitude(5)
        );
        assert_eq!(ChannelKind::classify("phase-order-1"), ChannelKind::Phase(1));
    }

    #[test]
    fn test_classify_other() {
        for name in ["M1A", "OA", "Oxp", "error", "amplitude-order-", ""] {
            assert_eq!(ChannelKind::classify(name), ChannelKind::Other, "{name}");
        }
    }

    // -----------------------------------------------------------------------
    // Grid
    // -----------------------------------------------------------------------

    #[test]
    fn test_grid_rejects_empty_and_mismatched() {
        assert!(Grid::new(0, 3, vec![]).is_err());
        assert!(Grid::new(2, 2, vec![1.0; 3]).is_err());
    }

    #[test]
    fn test_grid_counts_invalid_pixels() {
        let grid = Grid::new(2, 2, vec![1.0, f64::NAN, f64::INFINITY, 4.0]).unwrap();
        assert_eq!(grid.invalid_count(), 2);
        assert_eq!(grid.get(1, 1), Some(4.0));
        assert_eq!(grid.get(2, 0), None);
    }

    // -----------------------------------------------------------------------
    // Spectrum
    // -----------------------------------------------------------------------

    #[test]
    fn test_spectrum_keeps_increasing_axis() {
        let s = Spectrum::new(vec![1.0, 2.0, 3.0], one_order(vec![4.0, 5.0, 6.0]), BTreeMap::new())
            .unwrap();
        assert_eq!(s.wavenumber(), &[1.0, 2.0, 3.0]);
        assert_eq!(s.samples(), 3);
    }

    #[test]
    fn test_spectrum_reverses_decreasing_axis() {
        let phase = BTreeMap::from([("O2P".to_string(), vec![0.1, 0.2, 0.3])]);
        let s = Spectrum::new(vec![3.0, 2.0, 1.0], one_order(vec![6.0, 5.0, 4.0]), phase).unwrap();
        assert_eq!(s.wavenumber(), &[1.0, 2.0, 3.0]);
        assert_eq!(s.amplitude("O2A").unwrap(), &[4.0, 5.0, 6.0]);
        assert_eq!(s.phase("O2P").unwrap(), &[0.3, 0.2, 0.1]);
    }

    #[test]
    fn test_spectrum_rejects_non_monotonic_axis() {
        let err = Spectrum::new(
            vec![1.0, 3.0, 2.0, 4.0],
            one_order(vec![0.0; 4]),
            BTreeMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::NonMonotonicAxis { index: 2 }));

        let err = Spectrum::new(vec![1.0, 1.0], one_order(vec![0.0; 2]), BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, IngestError::NonMonotonicAxis { index: 1 }));
    }

    #[test]
    fn test_spectrum_counts_invalid_samples() {
        let phase = BTreeMap::from([("O2P".to_string(), vec![0.1, f64::NAN, 0.3, 0.4])]);
        let s = Spectrum::new(
            vec![4.0, 3.0, 2.0, 1.0],
            one_order(vec![1.0, f64::NAN, f64::INFINITY, 2.0]),
            phase,
        )
        .unwrap();
        assert_eq!(s.invalid_count("O2A"), 2);
        assert_eq!(s.invalid_count("O2P"), 1);
        assert_eq!(s.invalid_count("O9A"), 0);
        assert_eq!(s.total_invalid(), 3);
        // Samples stay in place, reversed with the axis.
        assert!(s.amplitude("O2A").unwrap()[1].is_infinite());
    }

    #[test]
    fn test_spectrum_rejects_length_mismatch() {
        let err = Spectrum::new(vec![1.0, 2.0], one_order(vec![0.0; 3]), BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, IngestError::SpectralLength { .. }));
    }

    // -----------------------------------------------------------------------
    // Record
    // -----------------------------------------------------------------------

    #[test]
    fn test_record_requires_content() {
        assert!(matches!(
            MeasurementRecord::builder().build(),
            Err(IngestError::EmptyRecord)
        ));
    }

    #[test]
    fn test_record_rejects_shape_mismatch() {
        let err = MeasurementRecord::builder()
            .channel("height", ramp(4, 4))
            .channel("O2A", ramp(4, 5))
            .build()
            .unwrap_err();
        assert!(matches!(err, IngestError::ShapeMismatch { ref channel, .. } if channel == "O2A"));
    }

    #[test]
    fn test_record_rejects_duplicate_channel() {
        let err = MeasurementRecord::builder()
            .channel("O2A", ramp(2, 2))
            .channel("O2A", ramp(2, 2))
            .build()
            .unwrap_err();
        assert!(matches!(err, IngestError::DuplicateChannel(_)));
    }

    #[test]
    fn test_record_accessors() {
        let record = MeasurementRecord::builder()
            .source("scan.gwy")
            .channel("Z C", ramp(3, 4))
            .channel("O3A", ramp(3, 4))
            .channel("O2A", ramp(3, 4))
            .channel("O2A raw", ramp(3, 4))
            .build()
            .unwrap();
        assert_eq!(record.source(), Some("scan.gwy"));
        assert_eq!(record.shape(), Some((3, 4)));
        assert_eq!(record.height().map(|(n, _)| n), Some("Z C"));
        let orders: Vec<(u8, &str)> = record
            .amplitude_orders()
            .iter()
            .map(|(n, name, _)| (*n, *name))
            .collect();
        assert_eq!(orders, vec![(2, "O2A"), (3, "O3A")]);
        assert!(record.provides(Requirement::Channels));
        assert!(!record.provides(Requirement::Spectrum));
        assert!(!record.provides(Requirement::Metadata));
    }

    #[test]
    fn test_fingerprint_is_stable_and_data_sensitive() {
        let a = MeasurementRecord::builder().channel("height", ramp(3, 3)).build().unwrap();
        let b = MeasurementRecord::builder()
            .source("other label")
            .channel("height", ramp(3, 3))
            .build()
            .unwrap();
        let c = MeasurementRecord::builder()
            .channel("height", Grid::from_fn(3, 3, |r, c| (r * 3 + c) as f64 + 1e-12).unwrap())
            .build()
            .unwrap();
        assert_eq!(a.fingerprint().len(), 64);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert!(a.verify_fingerprint());
    }

    #[test]
    fn test_metadata_value_numeric_view() {
        assert_eq!(MetadataValue::Integer(3).as_f64(), Some(3.0));
        assert_eq!(MetadataValue::List(vec![2.5, 1.0]).as_f64(), Some(2.5));
        assert_eq!(MetadataValue::Text("x".into()).as_f64(), None);
        assert!(Metadata::default().is_empty());
    }

    #[test]
    fn test_metadata_value_untagged_json() {
        let parsed: BTreeMap<String, MetadataValue> =
            serde_json::from_str(r#"{"a": 1, "b": 2.5, "c": "x", "d": [1, 2], "e": null, "f": true}"#)
                .unwrap();
        assert_eq!(parsed["a"], MetadataValue::Integer(1));
        assert_eq!(parsed["b"], MetadataValue::Float(2.5));
        assert_eq!(parsed["c"], MetadataValue::Text("x".into()));
        assert_eq!(parsed["d"], MetadataValue::List(vec![1.0, 2.0]));
        assert_eq!(parsed["e"], MetadataValue::Null);
        assert_eq!(parsed["f"], MetadataValue::Bool(true));
    }
}
