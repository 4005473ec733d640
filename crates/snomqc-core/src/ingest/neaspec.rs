//! Neaspec ASCII exports: `#`-prefixed parameter header, then a tab-separated
//! table.
//!
//! Header lines look like `# Tip Amplitude:\t[nm]\t65.3`. Keys are normalized
//! to their alphanumeric characters (`TipAmplitude`), thousands separators are
//! stripped from numbers. A table with a `Wavenumber` column is a spectrum; a
//! table with an `M` column (mirror position in µm) and no `Wavenumber` is an
//! interferogram and is Fourier-transformed per demodulation order. Rows that
//! share a `Depth` index are repeated runs of the same sample and are averaged.

use std::collections::{BTreeMap, HashMap};

use log::debug;

use super::{Format, IngestError};
use crate::record::{ChannelKind, MeasurementRecord, Metadata, MetadataValue, Spectrum};

const FORMAT: Format = Format::NeaspecText;

/// Optical path difference is twice the mirror travel; µm to cm.
const OPD_PER_MIRROR_UM_CM: f64 = 2.0 * 1e-4;

/// Parse a Neaspec text export.
pub fn parse(data: &[u8], label: Option<String>) -> Result<MeasurementRecord, IngestError> {
    let decoded = String::from_utf8_lossy(data);
    let text: &str = &decoded;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut metadata = Metadata::default();
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());

    let mut header_line = None;
    for (_, line) in lines.by_ref() {
        match line.trim_start().strip_prefix('#') {
            Some(param) => parse_header_line(&mut metadata, param),
            None => {
                header_line = Some(line);
                break;
            }
        }
    }
    let header_line =
        header_line.ok_or_else(|| IngestError::malformed(FORMAT, "no data table after header"))?;
    let table = Table::parse(header_line, lines)?;
    debug!(
        "neaspec table: {} columns, {} rows",
        table.columns.len(),
        table.rows.len()
    );

    let spectrum = if let Some(axis) = table.column("Wavenumber") {
        spectrum_from_table(&table, axis)?
    } else if let Some(mirror) = table.column("M") {
        let (spectrum, opd_step_cm) = interferogram_from_table(&table, mirror)?;
        metadata
            .extra
            .insert("acquisition".into(), MetadataValue::Text("interferogram".into()));
        metadata
            .extra
            .insert("opd_step_cm".into(), MetadataValue::Float(opd_step_cm));
        spectrum
    } else {
        return Err(IngestError::malformed(
            FORMAT,
            "table has neither a Wavenumber nor an M column",
        ));
    };

    let mut builder = MeasurementRecord::builder().spectrum(spectrum).metadata(metadata);
    if let Some(label) = label {
        builder = builder.source(label);
    }
    builder.build()
}

// ---------------------------------------------------------------------------
// Parameter header
// ---------------------------------------------------------------------------

fn parse_header_line(metadata: &mut Metadata, param: &str) {
    let Some((key, rest)) = param.split_once(':') else {
        return;
    };
    let mut fields: Vec<&str> = rest
        .split('\t')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .collect();
    let unit = match fields.first() {
        Some(f) if f.starts_with('[') && f.ends_with(']') => {
            let unit = &f[1..f.len() - 1];
            fields.remove(0);
            Some(unit.to_string())
        }
        _ => None,
    };
    apply_parameter(metadata, key, unit.as_deref(), &fields);
}

/// Keep only the alphanumeric characters of a parameter name.
pub fn normalize_key(key: &str) -> String {
    key.chars().filter(|c| c.is_alphanumeric()).collect()
}

/// Store one instrument parameter. Parameters with a typed [`Metadata`] field
/// land there (converted to the field's unit), everything else in `extra`.
///
/// Shared with the Gwyddion reader, whose `/meta` container carries the same
/// parameter names.
pub fn apply_parameter(metadata: &mut Metadata, key: &str, unit: Option<&str>, fields: &[&str]) {
    let name = normalize_key(key);
    if name.is_empty() {
        return;
    }
    let numbers: Option<Vec<f64>> = fields.iter().map(|f| parse_number(f)).collect();
    let numbers = numbers.filter(|n| !n.is_empty());
    let first = numbers.as_ref().and_then(|n| n.first().copied());
    let text = || fields.join(" ");

    let consumed = match name.to_ascii_lowercase().as_str() {
        "project" => set(&mut metadata.project, Some(text())),
        "date" | "datetime" | "timestamp" => set(&mut metadata.timestamp, Some(text())),
        "device" | "instrument" | "instrumentid" => set(&mut metadata.instrument_id, Some(text())),
        "tipfrequency" => set(
            &mut metadata.tip_frequency_hz,
            first.and_then(|v| Some(v * frequency_to_hz(unit)?)),
        ),
        "tipamplitude" | "tappingamplitude" => set(
            &mut metadata.tip_amplitude_nm,
            first.and_then(|v| Some(v * length_to_m(unit.or(Some("nm")))? * 1e9)),
        ),
        "scanarea" | "scanareaxyz" | "scansize" => set(
            &mut metadata.scan_size_m,
            numbers.as_ref().filter(|n| n.len() >= 2).and_then(|n| {
                let scale = length_to_m(unit.or(Some("µm")))?;
                (n[0] > 0.0 && n[1] > 0.0).then(|| (n[0] * scale, n[1] * scale))
            }),
        ),
        "integrationtime" | "pixeltime" | "dwelltime" => set(
            &mut metadata.pixel_dwell_ms,
            first.and_then(|v| Some(v * time_to_ms(unit.or(Some("ms")))?)),
        ),
        "averaging" => set(
            &mut metadata.averaging,
            first
                .filter(|v| v.fract() == 0.0 && *v >= 0.0 && *v <= u32::MAX as f64)
                .map(|v| v as u32),
        ),
        "clipvalue" => set(&mut metadata.clip_value, first),
        _ => false,
    };
    if consumed {
        return;
    }

    let value = match numbers {
        Some(n) if n.len() == 1 => match fields[0].replace(',', "").parse::<i64>() {
            Ok(i) => MetadataValue::Integer(i),
            Err(_) => MetadataValue::Float(n[0]),
        },
        Some(n) => MetadataValue::List(n),
        None if fields.is_empty() => MetadataValue::Null,
        None => MetadataValue::Text(text()),
    };
    metadata.extra.insert(name, value);
}

fn set<T>(slot: &mut Option<T>, value: Option<T>) -> bool {
    match value {
        Some(v) => {
            *slot = Some(v);
            true
        }
        None => false,
    }
}

fn parse_number(field: &str) -> Option<f64> {
    field.replace(',', "").parse::<f64>().ok()
}

fn length_to_m(unit: Option<&str>) -> Option<f64> {
    match unit?.trim() {
        "m" => Some(1.0),
        "mm" => Some(1e-3),
        "µm" | "μm" | "um" => Some(1e-6),
        "nm" => Some(1e-9),
        "pm" => Some(1e-12),
        _ => None,
    }
}

fn frequency_to_hz(unit: Option<&str>) -> Option<f64> {
    match unit.unwrap_or("Hz").trim() {
        "Hz" => Some(1.0),
        "kHz" => Some(1e3),
        "MHz" => Some(1e6),
        _ => None,
    }
}

fn time_to_ms(unit: Option<&str>) -> Option<f64> {
    match unit?.trim() {
        "s" => Some(1e3),
        "ms" => Some(1.0),
        "µs" | "μs" | "us" => Some(1e-3),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Data table
// ---------------------------------------------------------------------------

struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl Table {
    fn parse<'a>(
        header: &str,
        lines: impl Iterator<Item = (usize, &'a str)>,
    ) -> Result<Self, IngestError> {
        let delimiter = if header.contains('\t') { '\t' } else { ',' };
        let mut columns: Vec<String> = header.split(delimiter).map(|c| c.trim().to_string()).collect();
        while columns.last().is_some_and(|c| c.is_empty()) {
            columns.pop();
        }
        if columns.is_empty() {
            return Err(IngestError::malformed(FORMAT, "empty column header"));
        }

        let mut rows = Vec::new();
        for (number, line) in lines {
            if line.trim_start().starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(delimiter).map(str::trim).collect();
            if fields.len() < columns.len() {
                return Err(IngestError::malformed(
                    FORMAT,
                    format!(
                        "line {}: {} fields, expected {}",
                        number + 1,
                        fields.len(),
                        columns.len()
                    ),
                ));
            }
            let row = fields[..columns.len()]
                .iter()
                .map(|f| {
                    if f.is_empty() {
                        Ok(f64::NAN)
                    } else {
                        f.parse::<f64>().map_err(|_| {
                            IngestError::malformed(
                                FORMAT,
                                format!("line {}: '{f}' is not a number", number + 1),
                            )
                        })
                    }
                })
                .collect::<Result<Vec<f64>, _>>()?;
            rows.push(row);
        }
        if rows.is_empty() {
            return Err(IngestError::malformed(FORMAT, "data table has no rows"));
        }
        Ok(Self { columns, rows })
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// `(order, amplitude column, phase column)` sorted by order.
    fn orders(&self) -> Vec<(u8, usize, Option<usize>)> {
        let mut amplitude = BTreeMap::new();
        let mut phase = HashMap::new();
        for (i, name) in self.columns.iter().enumerate() {
            match ChannelKind::classify(name) {
                ChannelKind::Amplitude(n) => {
                    amplitude.entry(n).or_insert(i);
                }
                ChannelKind::Phase(n) => {
                    phase.entry(n).or_insert(i);
                }
                _ => {}
            }
        }
        amplitude
            .into_iter()
            .map(|(n, a)| (n, a, phase.get(&n).copied()))
            .collect()
    }

    /// Row indices grouped by `Depth`, in order of first appearance. Without a
    /// `Depth` column every row is its own group.
    fn groups(&self) -> Vec<Vec<usize>> {
        let Some(depth) = self.column("Depth") else {
            return (0..self.rows.len()).map(|i| vec![i]).collect();
        };
        let mut index: HashMap<u64, usize> = HashMap::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for (i, row) in self.rows.iter().enumerate() {
            let key = row[depth].to_bits();
            let slot = *index.entry(key).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push(i);
        }
        groups
    }
}

fn require_orders(table: &Table) -> Result<Vec<(u8, usize, Option<usize>)>, IngestError> {
    let orders = table.orders();
    if orders.is_empty() {
        return Err(IngestError::MissingChannel("O<n>A".into()));
    }
    Ok(orders)
}

fn spectrum_from_table(table: &Table, axis: usize) -> Result<Spectrum, IngestError> {
    let orders = require_orders(table)?;
    let groups = table.groups();

    let wavenumber: Vec<f64> = groups.iter().map(|g| table.rows[g[0]][axis]).collect();
    let mut amplitude = BTreeMap::new();
    let mut phase = BTreeMap::new();
    for &(_, a_col, p_col) in &orders {
        let mean: Vec<f64> = groups
            .iter()
            .map(|g| {
                let kept: Vec<f64> = g
                    .iter()
                    .map(|&r| table.rows[r][a_col])
                    .filter(|v| v.is_finite())
                    .collect();
                if kept.is_empty() {
                    f64::NAN
                } else {
                    kept.iter().sum::<f64>() / kept.len() as f64
                }
            })
            .collect();
        amplitude.insert(table.columns[a_col].clone(), mean);
        if let Some(p_col) = p_col {
            let first: Vec<f64> = groups.iter().map(|g| table.rows[g[0]][p_col]).collect();
            phase.insert(table.columns[p_col].clone(), first);
        }
    }
    Spectrum::new(wavenumber, amplitude, phase)
}

fn interferogram_from_table(table: &Table, mirror: usize) -> Result<(Spectrum, f64), IngestError> {
    let orders = require_orders(table)?;
    let groups = table.groups();
    if groups.len() < 4 {
        return Err(IngestError::malformed(
            FORMAT,
            format!("interferogram has {} mirror positions, need at least 4", groups.len()),
        ));
    }

    let position: Vec<f64> = groups.iter().map(|g| table.rows[g[0]][mirror]).collect();
    let (first, last) = (position[0], position[position.len() - 1]);
    let step_um = ((last - first) / (position.len() - 1) as f64).abs();
    if !step_um.is_finite() || step_um <= 0.0 {
        return Err(IngestError::malformed(
            FORMAT,
            "mirror position does not advance",
        ));
    }
    let opd_step_cm = step_um * OPD_PER_MIRROR_UM_CM;

    let mut wavenumber = Vec::new();
    let mut amplitude = BTreeMap::new();
    let mut phase = BTreeMap::new();
    for &(n, a_col, p_col) in &orders {
        // Runs are averaged coherently.
        let (mut amp, mut phi) = (Vec::with_capacity(groups.len()), Vec::with_capacity(groups.len()));
        for g in &groups {
            let (mut re, mut im, mut count) = (0.0f64, 0.0f64, 0usize);
            for &r in g {
                let a = table.rows[r][a_col];
                let p = p_col.map_or(0.0, |c| table.rows[r][c]);
                if a.is_finite() && p.is_finite() {
                    re += a * p.cos();
                    im += a * p.sin();
                    count += 1;
                }
            }
            if count == 0 {
                amp.push(f64::NAN);
                phi.push(f64::NAN);
            } else {
                let (re, im) = (re / count as f64, im / count as f64);
                amp.push(re.hypot(im));
                phi.push(im.atan2(re));
            }
        }

        let transformed = snomqc_signal::interferogram_to_spectrum(&amp, &phi, opd_step_cm)
            .ok_or_else(|| {
                IngestError::malformed(
                    FORMAT,
                    format!("cannot transform O{n} interferogram (invalid samples)"),
                )
            })?;
        wavenumber = transformed.wavenumber;
        amplitude.insert(table.columns[a_col].clone(), transformed.amplitude);
        let phase_name = p_col.map_or_else(|| format!("O{n}P"), |c| table.columns[c].clone());
        phase.insert(phase_name, transformed.phase);
    }
    Ok((Spectrum::new(wavenumber, amplitude, phase)?, opd_step_cm))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(text: &str) -> Result<MeasurementRecord, IngestError> {
        parse(text.as_bytes(), Some("test.txt".into()))
    }

    const HEADER: &str = "# Scan:\tFourier Scan\n\
        # Project:\tPolymer blend\n\
        # Date:\t03/14/2024 10:22:05\n\
        # Tip Frequency:\t[Hz]\t245,012.5\n\
        # Tip Amplitude:\t[nm]\t70.2\n\
        # Scan Area (X, Y, Z):\t[µm]\t5\t4\t0\n\
        # Averaging:\t\t16\n\
        # Integration time:\t[ms]\t20\n\
        # Interferometer Center/Distance:\t[µm]\t300\t800\n";

    #[test]
    fn test_header_metadata() {
        let text = format!("{HEADER}Wavenumber\tO2A\n900\t1\n1000\t2\n");
        let record = parse_str(&text).unwrap();
        let m = record.metadata();
        assert_eq!(m.project.as_deref(), Some("Polymer blend"));
        assert_eq!(m.timestamp.as_deref(), Some("03/14/2024 10:22:05"));
        assert!((m.tip_frequency_hz.unwrap() - 245_012.5).abs() < 1e-9);
        assert!((m.tip_amplitude_nm.unwrap() - 70.2).abs() < 1e-9);
        let (x, y) = m.scan_size_m.unwrap();
        assert!((x - 5e-6).abs() < 1e-15 && (y - 4e-6).abs() < 1e-15);
        assert_eq!(m.averaging, Some(16));
        assert_eq!(m.pixel_dwell_ms, Some(20.0));
        assert_eq!(
            m.extra["InterferometerCenterDistance"],
            MetadataValue::List(vec![300.0, 800.0])
        );
        assert_eq!(m.extra["Scan"], MetadataValue::Text("Fourier Scan".into()));
        assert_eq!(record.source(), Some("test.txt"));
    }

    #[test]
    fn test_spectrum_table_with_runs() {
        let text = "# Project:\tx\n\
            Row\tRun\tDepth\tWavenumber\tO2A\tO2P\tO3A\t\n\
            0\t0\t0\t1000\t1.0\t0.5\t0.2\t\n\
            0\t0\t1\t1100\t2.0\t0.6\t0.3\t\n\
            0\t1\t0\t1000\t3.0\t0.9\t0.4\t\n\
            0\t1\t1\t1100\t4.0\t0.9\t0.5\t\n";
        let record = parse_str(text).unwrap();
        let s = record.spectrum().unwrap();
        assert_eq!(s.wavenumber(), &[1000.0, 1100.0]);
        assert_eq!(s.amplitude("O2A").unwrap(), &[2.0, 3.0]);
        assert_eq!(s.phase("O2P").unwrap(), &[0.5, 0.6]);
        let o3: Vec<f64> = s.amplitude("O3A").unwrap().to_vec();
        assert!((o3[0] - 0.3).abs() < 1e-12 && (o3[1] - 0.4).abs() < 1e-12);
        assert!(s.phase("O3P").is_none());
    }

    #[test]
    fn test_decreasing_wavenumber_is_reversed() {
        let text = "Wavenumber\tO2A\n1200\t3\n1100\t2\n1000\t1\n";
        let record = parse(text.as_bytes(), None).unwrap();
        let s = record.spectrum().unwrap();
        assert_eq!(s.wavenumber(), &[1000.0, 1100.0, 1200.0]);
        assert_eq!(s.amplitude("O2A").unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_non_monotonic_wavenumber_rejected() {
        let text = "Wavenumber\tO2A\n1000\t1\n1200\t2\n1100\t3\n";
        assert!(matches!(
            parse(text.as_bytes(), None),
            Err(IngestError::NonMonotonicAxis { .. })
        ));
    }

    #[test]
    fn test_interferogram_is_transformed() {
        // 64 mirror steps of 2.5 µm: OPD step 5 µm = 5e-4 cm, so bin k sits at
        // k / (64 * 5e-4) = 31.25 k cm⁻¹. A cosine with 8 periods peaks at bin 8.
        let n = 64;
        let mut text = String::from("# Project:\tifg\nRun\tDepth\tM\tO2A\tO2P\n");
        for i in 0..n {
            let m = i as f64 * 2.5;
            let a = 1.0 + (2.0 * std::f64::consts::PI * 8.0 * i as f64 / n as f64).cos();
            text.push_str(&format!("0\t{i}\t{m}\t{a}\t0\n"));
        }
        let record = parse_str(&text).unwrap();
        let s = record.spectrum().unwrap();
        assert_eq!(s.samples(), n / 2);
        let amp = s.amplitude("O2A").unwrap();
        let peak = amp
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert!((s.wavenumber()[peak] - 250.0).abs() < 1e-6);
        assert_eq!(
            record.metadata().extra["acquisition"],
            MetadataValue::Text("interferogram".into())
        );
        assert!(s.phase("O2P").is_some());
    }

    #[test]
    fn test_table_without_axis_rejected() {
        let err = parse_str("Row\tO2A\n0\t1\n").unwrap_err();
        assert!(matches!(err, IngestError::Malformed { .. }));
    }

    #[test]
    fn test_table_without_orders_rejected() {
        let err = parse_str("Wavenumber\tZ\n1000\t1\n").unwrap_err();
        assert!(matches!(err, IngestError::MissingChannel(_)));
    }

    #[test]
    fn test_bad_number_reports_line() {
        let err = parse_str("Wavenumber\tO2A\n1000\t1\n1100\tabc\n").unwrap_err();
        assert!(err.to_string().contains("line 3"), "{err}");
    }

    #[test]
    fn test_short_row_rejected() {
        let err = parse_str("Wavenumber\tO2A\tO3A\n1000\t1\n").unwrap_err();
        assert!(matches!(err, IngestError::Malformed { .. }));
    }

    #[test]
    fn test_header_only_rejected() {
        assert!(parse_str("# Project:\tx\n").is_err());
    }

    #[test]
    fn test_comma_separated_table() {
        let record = parse_str("Wavenumber,O2A\n1000,1\n1100,2\n").unwrap();
        assert_eq!(record.spectrum().unwrap().samples(), 2);
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key(" Tip Amplitude "), "TipAmplitude");
        assert_eq!(
            normalize_key("Interferometer Center/Distance"),
            "InterferometerCenterDistance"
        );
    }
}
