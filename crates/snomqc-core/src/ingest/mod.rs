//! Format detection and parsing of instrument exports into records.
//!
//! Supported inputs:
//! - Gwyddion `.gwy` containers (`GWYP` magic), the native image format of
//!   Neaspec instruments
//! - Neaspec ASCII exports (`#` header, `.txt`/`.csv`): spectra and
//!   interferograms
//! - snomqc JSON records (`{`, `.json`)
//! - any of the above gzip-compressed (`1f 8b`, `.gz`)
//!
//! Detection looks at magic bytes first and falls back to the extension of the
//! path or name hint. Loading never modifies the source.

pub mod gwy;
pub mod json;
pub mod neaspec;

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use log::{debug, warn};
use thiserror::Error;

use crate::record::{ChannelKind, MeasurementRecord};

/// Default upper bound on decompressed gzip input.
pub const MAX_DECOMPRESSED_BYTES: u64 = 1 << 30;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a source could not become a record. No partial record is produced.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unrecognized format for {0}")]
    UnrecognizedFormat(String),
    #[error("gzip decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
    #[error("decompressed input exceeds {limit} bytes")]
    DecompressedTooLarge { limit: u64 },
    #[error("malformed {format} data: {reason}")]
    Malformed { format: Format, reason: String },
    #[error("invalid grid: {0}")]
    InvalidGrid(String),
    #[error("channel '{channel}' has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        channel: String,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("duplicate channel name: {0}")]
    DuplicateChannel(String),
    #[error("invalid spectrum: {0}")]
    InvalidSpectrum(String),
    #[error("spectral array '{name}' has {found} samples, axis has {expected}")]
    SpectralLength {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("wavenumber axis is not monotonic at index {index}")]
    NonMonotonicAxis { index: usize },
    #[error("required channel missing: {0}")]
    MissingChannel(String),
    #[error("record contains neither channels nor a spectrum")]
    EmptyRecord,
}

impl IngestError {
    pub(crate) fn malformed(format: Format, reason: impl Into<String>) -> Self {
        Self::Malformed {
            format,
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sources and formats
// ---------------------------------------------------------------------------

/// Where a record comes from.
#[derive(Debug, Clone)]
pub enum Source {
    Path(PathBuf),
    /// In-memory buffer; `name` is used as label and extension hint.
    Bytes { name: Option<String>, data: Vec<u8> },
}

impl Source {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn bytes(name: Option<&str>, data: impl Into<Vec<u8>>) -> Self {
        Self::Bytes {
            name: name.map(str::to_string),
            data: data.into(),
        }
    }

    fn label(&self) -> Option<String> {
        match self {
            Self::Path(path) => Some(path.display().to_string()),
            Self::Bytes { name, .. } => name.clone(),
        }
    }
}

/// Export formats understood by [`load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Gwyddion,
    NeaspecText,
    JsonRecord,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gwyddion => write!(f, "Gwyddion"),
            Self::NeaspecText => write!(f, "Neaspec text"),
            Self::JsonRecord => write!(f, "JSON record"),
        }
    }
}

/// Options for [`load_with`].
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Channel names that must be present, exact or by kind (`"height"`
    /// matches any height channel, `"O2A"` any order-2 amplitude).
    pub required_channels: Vec<String>,
    /// Skip detection and parse as this format.
    pub format: Option<Format>,
    /// Gzip input that inflates beyond this is rejected.
    pub max_decompressed_bytes: u64,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            required_channels: Vec::new(),
            format: None,
            max_decompressed_bytes: MAX_DECOMPRESSED_BYTES,
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Load a record with default options.
pub fn load(source: &Source) -> Result<MeasurementRecord, IngestError> {
    load_with(source, &IngestOptions::default())
}

/// Convenience: load a file.
pub fn load_path(path: impl AsRef<Path>) -> Result<MeasurementRecord, IngestError> {
    load(&Source::path(path.as_ref()))
}

/// Load a record, then check `options.required_channels`.
pub fn load_with(
    source: &Source,
    options: &IngestOptions,
) -> Result<MeasurementRecord, IngestError> {
    let label = source.label();
    let owned;
    let raw: &[u8] = match source {
        Source::Path(path) => {
            owned = std::fs::read(path).map_err(|e| IngestError::Io {
                path: path.clone(),
                source: e,
            })?;
            &owned
        }
        Source::Bytes { data, .. } => data,
    };

    let (data, hint) = unwrap_gzip(raw, label.as_deref(), options.max_decompressed_bytes)?;
    let format = match options.format {
        Some(format) => format,
        None => detect_format(&data, hint.as_deref()).ok_or_else(|| {
            IngestError::UnrecognizedFormat(label.clone().unwrap_or_else(|| "<bytes>".into()))
        })?,
    };
    debug!(
        "ingesting {} as {format} ({} bytes)",
        label.as_deref().unwrap_or("<bytes>"),
        data.len()
    );

    let record = match format {
        Format::Gwyddion => gwy::parse(&data, label)?,
        Format::NeaspecText => neaspec::parse(&data, label)?,
        Format::JsonRecord => json::parse(&data, label)?,
    };

    for required in &options.required_channels {
        if !has_channel(&record, required) {
            return Err(IngestError::MissingChannel(required.clone()));
        }
    }
    Ok(record)
}

/// Identify a format by magic bytes, then by the extension of `name`.
pub fn detect_format(data: &[u8], name: Option<&str>) -> Option<Format> {
    if data.starts_with(gwy::MAGIC) {
        return Some(Format::Gwyddion);
    }
    let text_start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|i| &data[i..])
        .unwrap_or_default();
    // A UTF-8 BOM may precede exported text.
    let text_start = text_start.strip_prefix(b"\xef\xbb\xbf").unwrap_or(text_start);
    match text_start.first() {
        Some(b'{') => return Some(Format::JsonRecord),
        Some(b'#') => return Some(Format::NeaspecText),
        _ => {}
    }

    let ext = name
        .and_then(|n| Path::new(n).extension())
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)?;
    let format = match ext.as_str() {
        "gwy" => Format::Gwyddion,
        "txt" | "csv" => Format::NeaspecText,
        "json" => Format::JsonRecord,
        _ => return None,
    };
    warn!("no magic bytes recognized, falling back to .{ext} extension");
    Some(format)
}

/// Decompress gzip input (by magic or `.gz` name) and strip `.gz` from the
/// name hint so the inner extension can be used for detection.
fn unwrap_gzip<'a>(
    data: &'a [u8],
    name: Option<&str>,
    limit: u64,
) -> Result<(std::borrow::Cow<'a, [u8]>, Option<String>), IngestError> {
    let gz_name = name.is_some_and(|n| n.to_ascii_lowercase().ends_with(".gz"));
    let hint = name.map(|n| {
        if gz_name {
            n[..n.len() - 3].to_string()
        } else {
            n.to_string()
        }
    });
    if !data.starts_with(&[0x1f, 0x8b]) {
        return Ok((std::borrow::Cow::Borrowed(data), hint));
    }

    // One byte past the limit tells a full-size input from a truncated one.
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(IngestError::Decompress)?;
    if out.len() as u64 > limit {
        return Err(IngestError::DecompressedTooLarge { limit });
    }
    debug!("gunzipped {} -> {} bytes", data.len(), out.len());
    Ok((std::borrow::Cow::Owned(out), hint))
}

fn has_channel(record: &MeasurementRecord, required: &str) -> bool {
    if record.channel(required).is_some() {
        return true;
    }
    let kind = ChannelKind::classify(required);
    if kind != ChannelKind::Other
        && record
            .channel_names()
            .iter()
            .any(|name| ChannelKind::classify(name) == kind)
    {
        return true;
    }
    // Spectral orders count for spectrum-only records.
    record.spectrum().is_some_and(|s| {
        s.amplitude(required).is_some()
            || s.phase(required).is_some()
            || (kind != ChannelKind::Other
                && s.amplitudes()
                    .chain(s.phases())
                    .any(|(name, _)| ChannelKind::classify(name) == kind))
    })
}
