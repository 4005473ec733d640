//! snomqc JSON record format.
//!
//! ```json
//! {
//!   "format": "snomqc-record",
//!   "version": 1,
//!   "source": "scan-0042",
//!   "metadata": { "scan_size_m": [5e-6, 5e-6], "extra": {} },
//!   "channels": [ { "name": "height", "rows": 2, "cols": 2, "values": [0, 1, 2, null] } ],
//!   "spectrum": { "wavenumber": [900, 1000], "amplitude": { "O2A": [1, 2] }, "phase": {} }
//! }
//! ```
//!
//! JSON has no NaN or infinity, so invalid samples are written as `null` and
//! infinities as the strings `"inf"` and `"-inf"`. Every NaN reads back as
//! the same quiet NaN.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Format, IngestError};
use crate::record::{Grid, MeasurementRecord, Metadata, Spectrum};

pub const FORMAT_TAG: &str = "snomqc-record";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordDocument {
    #[serde(default = "default_tag")]
    pub format: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub channels: Vec<ChannelDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spectrum: Option<SpectrumDocument>,
}

/// One grid or spectral sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Sample {
    Number(f64),
    Infinite(Infinity),
    /// NaN.
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Infinity {
    #[serde(rename = "inf")]
    Positive,
    #[serde(rename = "-inf")]
    Negative,
}

impl From<f64> for Sample {
    fn from(v: f64) -> Self {
        if v.is_nan() {
            Self::Missing
        } else if v == f64::INFINITY {
            Self::Infinite(Infinity::Positive)
        } else if v == f64::NEG_INFINITY {
            Self::Infinite(Infinity::Negative)
        } else {
            Self::Number(v)
        }
    }
}

impl From<Sample> for f64 {
    fn from(sample: Sample) -> Self {
        match sample {
            Sample::Number(v) => v,
            Sample::Infinite(Infinity::Positive) => f64::INFINITY,
            Sample::Infinite(Infinity::Negative) => f64::NEG_INFINITY,
            Sample::Missing => f64::NAN,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDocument {
    pub name: String,
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<Sample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrumDocument {
    pub wavenumber: Vec<f64>,
    pub amplitude: BTreeMap<String, Vec<Sample>>,
    #[serde(default)]
    pub phase: BTreeMap<String, Vec<Sample>>,
}

fn default_tag() -> String {
    FORMAT_TAG.to_string()
}

fn default_version() -> u32 {
    FORMAT_VERSION
}

fn from_samples(values: Vec<Sample>) -> Vec<f64> {
    values.into_iter().map(f64::from).collect()
}

fn to_samples(values: &[f64]) -> Vec<Sample> {
    values.iter().copied().map(Sample::from).collect()
}

fn sample_map(map: BTreeMap<String, Vec<Sample>>) -> BTreeMap<String, Vec<f64>> {
    map.into_iter().map(|(k, v)| (k, from_samples(v))).collect()
}

impl RecordDocument {
    /// Snapshot a record.
    pub fn from_record(record: &MeasurementRecord) -> Self {
        Self {
            format: default_tag(),
            version: FORMAT_VERSION,
            source: record.source().map(str::to_string),
            metadata: record.metadata().clone(),
            channels: record
                .channels()
                .map(|(name, grid)| ChannelDocument {
                    name: name.to_string(),
                    rows: grid.rows(),
                    cols: grid.cols(),
                    values: to_samples(grid.values()),
                })
                .collect(),
            spectrum: record.spectrum().map(|s| SpectrumDocument {
                wavenumber: s.wavenumber().to_vec(),
                amplitude: s.amplitudes().map(|(k, v)| (k.to_string(), to_samples(v))).collect(),
                phase: s.phases().map(|(k, v)| (k.to_string(), to_samples(v))).collect(),
            }),
        }
    }

    /// Validate into a record. `label` is used when the document names no
    /// source.
    pub fn into_record(self, label: Option<String>) -> Result<MeasurementRecord, IngestError> {
        if self.format != FORMAT_TAG {
            return Err(IngestError::malformed(
                Format::JsonRecord,
                format!("format tag is '{}', expected '{FORMAT_TAG}'", self.format),
            ));
        }
        if self.version != FORMAT_VERSION {
            return Err(IngestError::malformed(
                Format::JsonRecord,
                format!("unsupported version {}", self.version),
            ));
        }

        let mut builder = MeasurementRecord::builder().metadata(self.metadata);
        if let Some(source) = self.source.or(label) {
            builder = builder.source(source);
        }
        for channel in self.channels {
            let grid = Grid::new(channel.rows, channel.cols, from_samples(channel.values))?;
            builder = builder.channel(channel.name, grid);
        }
        if let Some(s) = self.spectrum {
            builder = builder.spectrum(Spectrum::new(
                s.wavenumber,
                sample_map(s.amplitude),
                sample_map(s.phase),
            )?);
        }
        builder.build()
    }
}

/// Parse a JSON record.
pub fn parse(data: &[u8], label: Option<String>) -> Result<MeasurementRecord, IngestError> {
    let document: RecordDocument = serde_json::from_slice(data)
        .map_err(|e| IngestError::malformed(Format::JsonRecord, e.to_string()))?;
    document.into_record(label)
}

/// Serialize a record in the snomqc JSON format.
pub fn to_string(record: &MeasurementRecord) -> Result<String, serde_json::Error> {
    serde_json::to_string(&RecordDocument::from_record(record))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_document() {
        let text = r#"{
            "format": "snomqc-record",
            "version": 1,
            "metadata": { "scan_size_m": [5e-6, 5e-6], "project": "demo" },
            "channels": [
                { "name": "height", "rows": 2, "cols": 2, "values": [0, 1, 2, null] }
            ]
        }"#;
        let record = parse(text.as_bytes(), Some("doc.json".into())).unwrap();
        assert_eq!(record.source(), Some("doc.json"));
        assert_eq!(record.metadata().scan_size_m, Some((5e-6, 5e-6)));
        let grid = record.channel("height").unwrap();
        assert_eq!(grid.invalid_count(), 1);
        assert!(grid.get(1, 1).unwrap().is_nan());
    }

    #[test]
    fn test_round_trip_preserves_fingerprint() {
        let grid = Grid::new(2, 2, vec![1.0, f64::NAN, 3.0, 4.0]).unwrap();
        let spectrum = Spectrum::new(
            vec![900.0, 1000.0],
            BTreeMap::from([("O2A".to_string(), vec![1.0, 2.0])]),
            BTreeMap::from([("O2P".to_string(), vec![0.1, 0.2])]),
        )
        .unwrap();
        let original = MeasurementRecord::builder()
            .source("synthetic")
            .channel("O2A", grid)
            .spectrum(spectrum)
            .build()
            .unwrap();

        let text = to_string(&original).unwrap();
        let parsed = parse(text.as_bytes(), None).unwrap();
        assert_eq!(parsed.fingerprint(), original.fingerprint());
        assert_eq!(parsed.source(), Some("synthetic"));
    }

    #[test]
    fn test_infinities_survive_round_trip() {
        let grid = Grid::new(1, 4, vec![1.0, f64::INFINITY, f64::NEG_INFINITY, -f64::NAN]).unwrap();
        let original = MeasurementRecord::builder().channel("O2A", grid).build().unwrap();

        let text = to_string(&original).unwrap();
        assert!(text.contains(r#"[1.0,"inf","-inf",null]"#), "{text}");
        let parsed = parse(text.as_bytes(), None).unwrap();
        assert_eq!(parsed.fingerprint(), original.fingerprint());
        let values = parsed.channel("O2A").unwrap().values();
        assert_eq!(values[1], f64::INFINITY);
        assert_eq!(values[2], f64::NEG_INFINITY);
        assert!(values[3].is_nan());
    }

    #[test]
    fn test_unknown_sample_string_rejected() {
        let text = r#"{"channels": [{"name": "O2A", "rows": 1, "cols": 2, "values": [1, "nan"]}]}"#;
        assert!(matches!(
            parse(text.as_bytes(), None),
            Err(IngestError::Malformed { .. })
        ));
    }

    #[test]
    fn test_wrong_tag_rejected() {
        let err = parse(br#"{"format": "other", "channels": []}"#, None).unwrap_err();
        assert!(err.to_string().contains("format tag"), "{err}");
    }

    #[test]
    fn test_empty_document_rejected() {
        assert!(matches!(parse(b"{}", None), Err(IngestError::EmptyRecord)));
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(matches!(
            parse(b"{ not json", None),
            Err(IngestError::Malformed { .. })
        ));
    }
}
