//! Gwyddion `.gwy` container reader.
//!
//! A file is the magic `GWYP` followed by one serialized object. An object is
//! its type name (NUL-terminated), a little-endian `u32` byte size, then
//! components. A component is a NUL-terminated name, a one-byte type code and
//! the payload:
//!
//! | code | payload                                  |
//! |------|------------------------------------------|
//! | `b`  | bool, 1 byte                             |
//! | `c`  | char, 1 byte                             |
//! | `i`  | i32                                      |
//! | `q`  | i64                                      |
//! | `d`  | f64                                      |
//! | `s`  | NUL-terminated string                    |
//! | `o`  | nested object                            |
//! | uppercase | `u32` count, then that many items   |
//!
//! Images live in the top-level `GwyContainer` as `/<n>/data` (`GwyDataField`
//! with `xres`, `yres`, `xreal`, `yreal`, `data`), titled by `/<n>/data/title`.
//! `/<n>/meta` holds string metadata.

use std::collections::HashSet;

use log::debug;

use super::{Format, IngestError, neaspec};
use crate::record::{Grid, MeasurementRecord, Metadata};

/// File magic of Gwyddion 2 containers.
pub const MAGIC: &[u8] = b"GWYP";

const FORMAT: Format = Format::Gwyddion;
const MAX_DEPTH: usize = 16;

// ---------------------------------------------------------------------------
// Object model
// ---------------------------------------------------------------------------

/// One deserialized component value.
#[derive(Debug, Clone, PartialEq)]
pub enum GwyValue {
    Bool(bool),
    Char(u8),
    Int(i32),
    Long(i64),
    Double(f64),
    Str(String),
    Object(GwyObject),
    CharArray(Vec<u8>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    DoubleArray(Vec<f64>),
    StrArray(Vec<String>),
    ObjectArray(Vec<GwyObject>),
}

/// A serialized Gwyddion object: type name plus named components.
#[derive(Debug, Clone, PartialEq)]
pub struct GwyObject {
    pub type_name: String,
    pub components: Vec<(String, GwyValue)>,
}

impl GwyObject {
    pub fn get(&self, name: &str) -> Option<&GwyValue> {
        self.components
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    fn int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            GwyValue::Int(v) => Some(i64::from(*v)),
            GwyValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    fn double(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            GwyValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    fn string(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            GwyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    fn object(&self, name: &str) -> Option<&GwyObject> {
        match self.get(name)? {
            GwyValue::Object(o) => Some(o),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Binary reader
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], IngestError> {
        if n > self.remaining() {
            return Err(IngestError::malformed(
                FORMAT,
                format!("truncated at byte {} (wanted {n} more)", self.pos),
            ));
        }
        let buf = self.buf;
        let out = &buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], IngestError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, IngestError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, IngestError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, IngestError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, IngestError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64, IngestError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    fn cstring(&mut self) -> Result<String, IngestError> {
        let rest = &self.buf[self.pos..];
        let len = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            IngestError::malformed(FORMAT, format!("unterminated string at byte {}", self.pos))
        })?;
        let s = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.pos += len + 1;
        Ok(s)
    }

    /// Array length, checked against the bytes left so a corrupt count cannot
    /// trigger a huge allocation.
    fn count(&mut self, item_size: usize) -> Result<usize, IngestError> {
        let n = self.u32()? as usize;
        if n.saturating_mul(item_size) > self.remaining() {
            return Err(IngestError::malformed(
                FORMAT,
                format!("array of {n} items overruns the buffer at byte {}", self.pos),
            ));
        }
        Ok(n)
    }

    fn object(&mut self, depth: usize) -> Result<GwyObject, IngestError> {
        if depth > MAX_DEPTH {
            return Err(IngestError::malformed(FORMAT, "objects nested too deeply"));
        }
        let type_name = self.cstring()?;
        let size = self.u32()? as usize;
        let body = self.take(size)?;
        let mut inner = Reader::new(body);
        let mut components = Vec::new();
        while inner.remaining() > 0 {
            let name = inner.cstring()?;
            let code = inner.u8()?;
            let value = inner.value(code, depth)?;
            components.push((name, value));
        }
        Ok(GwyObject {
            type_name,
            components,
        })
    }

    fn value(&mut self, code: u8, depth: usize) -> Result<GwyValue, IngestError> {
        Ok(match code {
            b'b' => GwyValue::Bool(self.u8()? != 0),
            b'c' => GwyValue::Char(self.u8()?),
            b'i' => GwyValue::Int(self.i32()?),
            b'q' => GwyValue::Long(self.i64()?),
            b'd' => GwyValue::Double(self.f64()?),
            b's' => GwyValue::Str(self.cstring()?),
            b'o' => GwyValue::Object(self.object(depth + 1)?),
            b'C' => {
                let n = self.count(1)?;
                GwyValue::CharArray(self.take(n)?.to_vec())
            }
            b'I' => {
                let n = self.count(4)?;
                GwyValue::IntArray((0..n).map(|_| self.i32()).collect::<Result<_, _>>()?)
            }
            b'Q' => {
                let n = self.count(8)?;
                GwyValue::LongArray((0..n).map(|_| self.i64()).collect::<Result<_, _>>()?)
            }
            b'D' => {
                let n = self.count(8)?;
                GwyValue::DoubleArray((0..n).map(|_| self.f64()).collect::<Result<_, _>>()?)
            }
            b'S' => {
                let n = self.count(1)?;
                GwyValue::StrArray((0..n).map(|_| self.cstring()).collect::<Result<_, _>>()?)
            }
            b'O' => {
                let n = self.count(1)?;
                GwyValue::ObjectArray(
                    (0..n)
                        .map(|_| self.object(depth + 1))
                        .collect::<Result<_, _>>()?,
                )
            }
            other => {
                return Err(IngestError::malformed(
                    FORMAT,
                    format!("unknown component type '{}' at byte {}", other as char, self.pos),
                ));
            }
        })
    }
}

/// Deserialize the top-level object of a `.gwy` file.
pub fn read_container(data: &[u8]) -> Result<GwyObject, IngestError> {
    let body = data
        .strip_prefix(MAGIC)
        .ok_or_else(|| IngestError::malformed(FORMAT, "missing GWYP magic"))?;
    Reader::new(body).object(0)
}

// ---------------------------------------------------------------------------
// Record extraction
// ---------------------------------------------------------------------------

/// Parse a `.gwy` file into a record.
pub fn parse(data: &[u8], label: Option<String>) -> Result<MeasurementRecord, IngestError> {
    let container = read_container(data)?;
    if container.type_name != "GwyContainer" {
        return Err(IngestError::malformed(
            FORMAT,
            format!("top-level object is {}, expected GwyContainer", container.type_name),
        ));
    }

    let mut ids: Vec<u32> = container
        .components
        .iter()
        .filter_map(|(name, _)| data_field_id(name))
        .collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        return Err(IngestError::malformed(FORMAT, "container holds no data fields"));
    }

    let mut metadata = Metadata::default();
    let mut builder = MeasurementRecord::builder();
    let mut used = HashSet::new();
    for (i, id) in ids.iter().enumerate() {
        let field = container
            .object(&format!("/{id}/data"))
            .filter(|o| o.type_name == "GwyDataField")
            .ok_or_else(|| {
                IngestError::malformed(FORMAT, format!("/{id}/data is not a GwyDataField"))
            })?;
        let grid = grid_from_field(*id, field)?;

        let title = container
            .string(&format!("/{id}/data/title"))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map_or_else(|| format!("channel {id}"), str::to_string);
        let name = if used.contains(&title) {
            format!("{title} ({id})")
        } else {
            title
        };
        used.insert(name.clone());

        if let Some(meta) = container.object(&format!("/{id}/meta")) {
            apply_meta(&mut metadata, meta);
        }
        if i == 0 {
            let (xreal, yreal) = (field.double("xreal"), field.double("yreal"));
            if let (Some(x), Some(y)) = (xreal, yreal) {
                if x > 0.0 && y > 0.0 && x.is_finite() && y.is_finite() {
                    metadata.scan_size_m = Some((x, y));
                }
            }
        }
        debug!("gwy channel /{id}/data '{name}' {}x{}", grid.rows(), grid.cols());
        builder = builder.channel(name, grid);
    }

    if let Some(label) = label {
        builder = builder.source(label);
    }
    builder.metadata(metadata).build()
}

/// `Some(n)` for component names of the form `/<n>/data`.
fn data_field_id(name: &str) -> Option<u32> {
    let digits = name.strip_prefix('/')?.strip_suffix("/data")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn grid_from_field(id: u32, field: &GwyObject) -> Result<Grid, IngestError> {
    let dim = |key: &str| {
        field
            .int(key)
            .filter(|&v| v > 0)
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| IngestError::malformed(FORMAT, format!("/{id}/data: bad {key}")))
    };
    let (cols, rows) = (dim("xres")?, dim("yres")?);
    let values = match field.get("data") {
        Some(GwyValue::DoubleArray(values)) => values.clone(),
        _ => {
            return Err(IngestError::malformed(
                FORMAT,
                format!("/{id}/data has no double array"),
            ));
        }
    };
    Grid::new(rows, cols, values)
}

fn apply_meta(metadata: &mut Metadata, meta: &GwyObject) {
    for (key, value) in &meta.components {
        if let GwyValue::Str(text) = value {
            let (unit, fields) = split_value_unit(text);
            neaspec::apply_parameter(metadata, key, unit, &fields);
        }
    }
}

/// Split `"5.0 4.0 µm"` into the unit and the value tokens. Text that is not
/// a list of numbers followed by a unit is returned whole.
fn split_value_unit(text: &str) -> (Option<&str>, Vec<&str>) {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let numeric = |t: &&str| t.replace(',', "").parse::<f64>().is_ok();
    match tokens.split_last() {
        Some((last, head)) if !head.is_empty() && !numeric(last) && head.iter().all(numeric) => {
            (Some(*last), head.to_vec())
        }
        _ => (None, vec![text.trim()]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Minimal serializer for fixtures
    // -----------------------------------------------------------------------

    fn component(out: &mut Vec<u8>, name: &str, code: u8, payload: &[u8]) {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.push(code);
        out.extend_from_slice(payload);
    }

    fn object(type_name: &str, body: &[u8]) -> Vec<u8> {
        let mut out = type_name.as_bytes().to_vec();
        out.push(0);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(body);
        out
    }

    fn cstr(s: &str) -> Vec<u8> {
        let mut out = s.as_bytes().to_vec();
        out.push(0);
        out
    }

    fn data_field(xres: i32, yres: i32, values: &[f64]) -> Vec<u8> {
        let mut body = Vec::new();
        component(&mut body, "xres", b'i', &xres.to_le_bytes());
        component(&mut body, "yres", b'i', &yres.to_le_bytes());
        component(&mut body, "xreal", b'd', &5e-6f64.to_le_bytes());
        component(&mut body, "yreal", b'd', &4e-6f64.to_le_bytes());
        let mut data = (values.len() as u32).to_le_bytes().to_vec();
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        component(&mut body, "data", b'D', &data);
        object("GwyDataField", &body)
    }

    fn container(fields: &[(u32, &str, Vec<u8>)], meta: Option<Vec<u8>>) -> Vec<u8> {
        let mut body = Vec::new();
        for (id, title, field) in fields {
            component(&mut body, &format!("/{id}/data"), b'o', field);
            component(&mut body, &format!("/{id}/data/title"), b's', &cstr(title));
        }
        if let Some(meta) = meta {
            component(&mut body, "/0/meta", b'o', &meta);
        }
        let mut out = MAGIC.to_vec();
        out.extend_from_slice(&object("GwyContainer", &body));
        out
    }

    fn meta_container(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (k, v) in entries {
            component(&mut body, k, b's', &cstr(v));
        }
        object("GwyContainer", &body)
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_channels_and_scan_size() {
        let values: Vec<f64> = (0..6).map(f64::from).collect();
        let bytes = container(
            &[
                (1, "O2A", data_field(3, 2, &values)),
                (0, "Z C", data_field(3, 2, &values)),
            ],
            None,
        );
        let record = parse(&bytes, Some("scan.gwy".into())).unwrap();
        assert_eq!(record.channel_names(), vec!["Z C", "O2A"]);
        assert_eq!(record.shape(), Some((2, 3)));
        let grid = record.channel("Z C").unwrap();
        assert_eq!(grid.get(1, 0), Some(3.0));
        assert_eq!(record.metadata().scan_size_m, Some((5e-6, 4e-6)));
    }

    #[test]
    fn test_meta_container() {
        let values = vec![0.0; 4];
        let meta = meta_container(&[
            ("Tip Amplitude", "65.5 nm"),
            ("Project", "Calibration run"),
            ("Tip Frequency", "250,123 Hz"),
            ("Scanner", "XY closed loop"),
        ]);
        let bytes = container(&[(0, "Z", data_field(2, 2, &values))], Some(meta));
        let record = parse(&bytes, None).unwrap();
        let m = record.metadata();
        assert!((m.tip_amplitude_nm.unwrap() - 65.5).abs() < 1e-9);
        assert_eq!(m.project.as_deref(), Some("Calibration run"));
        assert_eq!(m.tip_frequency_hz, Some(250_123.0));
        assert!(m.extra.contains_key("Scanner"));
    }

    #[test]
    fn test_duplicate_titles_are_disambiguated() {
        let values = vec![1.0; 4];
        let bytes = container(
            &[
                (0, "O2A", data_field(2, 2, &values)),
                (1, "O2A", data_field(2, 2, &values)),
            ],
            None,
        );
        let record = parse(&bytes, None).unwrap();
        assert_eq!(record.channel_names(), vec!["O2A", "O2A (1)"]);
    }

    #[test]
    fn test_missing_magic() {
        assert!(matches!(
            parse(b"NOPE", None),
            Err(IngestError::Malformed { .. })
        ));
    }

    #[test]
    fn test_truncated_file() {
        let values = vec![1.0; 4];
        let bytes = container(&[(0, "Z", data_field(2, 2, &values))], None);
        let err = parse(&bytes[..bytes.len() - 5], None).unwrap_err();
        assert!(err.to_string().contains("truncated"), "{err}");
    }

    #[test]
    fn test_data_length_mismatch() {
        let bytes = container(&[(0, "Z", data_field(3, 3, &[1.0; 4]))], None);
        assert!(matches!(parse(&bytes, None), Err(IngestError::InvalidGrid(_))));
    }

    #[test]
    fn test_shape_mismatch_between_fields() {
        let bytes = container(
            &[
                (0, "Z", data_field(2, 2, &[1.0; 4])),
                (1, "O2A", data_field(3, 1, &[1.0; 3])),
            ],
            None,
        );
        assert!(matches!(
            parse(&bytes, None),
            Err(IngestError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_container() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&object("GwyContainer", &[]));
        assert!(parse(&bytes, None).is_err());
    }

    #[test]
    fn test_huge_array_count_rejected() {
        let mut body = Vec::new();
        component(&mut body, "data", b'D', &u32::MAX.to_le_bytes());
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&object("GwyDataField", &body));
        let err = read_container(&bytes).unwrap_err();
        assert!(err.to_string().contains("overruns"), "{err}");
    }

    #[test]
    fn test_data_field_id() {
        assert_eq!(data_field_id("/0/data"), Some(0));
        assert_eq!(data_field_id("/12/data"), Some(12));
        assert_eq!(data_field_id("/0/data/title"), None);
        assert_eq!(data_field_id("/x/data"), None);
        assert_eq!(data_field_id("//data"), None);
    }

    #[test]
    fn test_split_value_unit() {
        assert_eq!(split_value_unit("5 4 µm"), (Some("µm"), vec!["5", "4"]));
        assert_eq!(split_value_unit("hello world"), (None, vec!["hello world"]));
        assert_eq!(split_value_unit("42"), (None, vec!["42"]));
    }
}
