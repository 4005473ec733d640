//! # snomqc-core
//!
//! **Automated quality control for sSNOM and nanoFTIR measurements.**
//!
//! `snomqc-core` loads instrument exports (Gwyddion `.gwy`, Neaspec ASCII,
//! a JSON record format) into an immutable [`MeasurementRecord`], evaluates a
//! set of quality metrics against it and folds their outcomes into one
//! pass/warn/fail verdict with a normalized score.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use snomqc_core::{MetricRegistry, QcConfig, QcPipeline, ingest};
//!
//! let record = Arc::new(ingest::load_path("scan.gwy")?);
//! let config = QcConfig::default();
//! let pipeline = QcPipeline::new(MetricRegistry::standard(), &config)?;
//!
//! let result = pipeline.run(&record);
//! println!("{}: {:?}", result.status, result.score);
//! for metric in &result.metrics {
//!     println!("  {:<20} {}", metric.name, metric.status);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! Source → Ingest → MeasurementRecord → Metrics (isolated) → Aggregator → QcResult → Exporter
//!
//! Every metric implements the [`Metric`] trait and reports on its own scale;
//! [`Thresholds`] map that value to a status and a score in `[0, 1]` in the
//! metric's [`ScoreDirection`]. The pipeline applies each metric's settings
//! from [`QcConfig::metric_thresholds`] before the first run. A metric
//! that cannot compute (missing channel, degenerate data, panic, timeout)
//! becomes a `status = error` entry instead of aborting the run.

pub mod aggregate;
pub mod compare;
pub mod config;
pub mod export;
pub mod ingest;
pub mod metric;
pub mod metrics;
pub mod pipeline;
pub mod record;

pub use aggregate::{AggregationError, Aggregator, OverallStatus, QcResult, RecordRef, aggregate};
pub use compare::{
    DEFAULT_WINDOWS, HundredPercentLine, WavenumberWindow, WindowSnr, hundred_percent_line,
};
pub use config::{ConfigError, ExecutionMode, MetricSettings, QcConfig};
pub use export::{CollectingExporter, ExportError, JsonExporter, ResultExporter};
pub use ingest::{Format, IngestError, IngestOptions, Source, detect_format, load, load_path};
pub use metric::{
    Detail, Evaluation, Grade, Metric, MetricError, MetricInfo, MetricResult, MetricStatus,
    Requirement, ScoreDirection, Thresholds,
};
pub use metrics::MetricRegistry;
pub use pipeline::{CancelToken, QcError, QcPipeline, run};
pub use record::{
    ChannelKind, Grid, MeasurementRecord, Metadata, MetadataValue, RecordBuilder, Spectrum,
};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
