//! Handing finished QC results to the outside world.
//!
//! The engine itself never renders or persists anything. A caller passes a
//! [`ResultExporter`] to [`QcPipeline::run_and_export`](crate::QcPipeline::run_and_export)
//! and decides where results go.
//!
//! # JSON lines format
//!
//! [`JsonExporter`] writes one document per result and terminates each with a
//! newline:
//!
//! ```json
//! {"format":"snomqc-result","version":1,"engine_version":"0.1.0","result":{...}}
//! ```

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::QcResult;

/// Value of the `format` field in every exported document.
pub const RESULT_FORMAT: &str = "snomqc-result";
/// Version of the exported document layout.
pub const RESULT_FORMAT_VERSION: u32 = 1;

/// Why an exporter could not accept a result.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("cannot serialize result: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("cannot write result: {0}")]
    Io(#[from] std::io::Error),
    #[error("result sink rejected the result: {0}")]
    Sink(String),
}

/// Destination for finished QC results.
pub trait ResultExporter: Send + Sync {
    fn export(&self, result: &QcResult) -> Result<(), ExportError>;
}

// ---------------------------------------------------------------------------
// In-memory collector
// ---------------------------------------------------------------------------

/// Keeps every exported result in memory.
#[derive(Debug, Default)]
pub struct CollectingExporter {
    results: Mutex<Vec<QcResult>>,
}

impl CollectingExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the collected results.
    pub fn take(&self) -> Vec<QcResult> {
        std::mem::take(&mut *self.results.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultExporter for CollectingExporter {
    fn export(&self, result: &QcResult) -> Result<(), ExportError> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON lines writer
// ---------------------------------------------------------------------------

/// Versioned wrapper around an exported result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDocument {
    pub format: String,
    pub version: u32,
    pub engine_version: String,
    pub result: QcResult,
}

impl ResultDocument {
    pub fn new(result: QcResult) -> Self {
        Self {
            format: RESULT_FORMAT.to_string(),
            version: RESULT_FORMAT_VERSION,
            engine_version: crate::VERSION.to_string(),
            result,
        }
    }
}

/// Writes each result as one JSON line into a caller-supplied writer.
pub struct JsonExporter<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonExporter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the writer, e.g. to inspect a `Vec<u8>` buffer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> ResultExporter for JsonExporter<W> {
    fn export(&self, result: &QcResult) -> Result<(), ExportError> {
        let document = ResultDocument::new(result.clone());
        let mut line = serde_json::to_vec(&document)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{OverallStatus, RecordRef};
    use crate::metric::{MetricError, MetricResult};

    fn result(fingerprint: &str) -> QcResult {
        QcResult {
            record_ref: RecordRef {
                fingerprint: fingerprint.into(),
                source: Some("scan.gwy".into()),
            },
            score: None,
            status: OverallStatus::Fail,
            metrics: vec![MetricResult::from_error("drift", &MetricError::MissingSpectrum)],
            errored_metrics: vec!["drift".into()],
        }
    }

    #[test]
    fn test_collecting_exporter() {
        let exporter = CollectingExporter::new();
        assert!(exporter.is_empty());
        exporter.export(&result("a")).unwrap();
        exporter.export(&result("b")).unwrap();
        assert_eq!(exporter.len(), 2);
        let taken = exporter.take();
        assert_eq!(taken[1].record_ref.fingerprint, "b");
        assert!(exporter.is_empty());
    }

    #[test]
    fn test_json_exporter_writes_lines() {
        let exporter = JsonExporter::new(Vec::new());
        exporter.export(&result("a")).unwrap();
        exporter.export(&result("b")).unwrap();
        let text = String::from_utf8(exporter.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(text.ends_with('\n'));

        let doc: ResultDocument = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(doc.format, RESULT_FORMAT);
        assert_eq!(doc.version, RESULT_FORMAT_VERSION);
        assert_eq!(doc.engine_version, crate::VERSION);
        assert_eq!(doc.result, result("a"));
    }

    #[test]
    fn test_json_exporter_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let exporter = JsonExporter::new(std::fs::File::create(&path).unwrap());
        exporter.export(&result("a")).unwrap();
        drop(exporter);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"fingerprint\":\"a\""));
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_json_exporter_io_error() {
        let err = JsonExporter::new(BrokenWriter).export(&result("a")).unwrap_err();
        assert!(matches!(err, ExportError::Io(_)));
    }
}
