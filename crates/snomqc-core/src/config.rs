//! QC run configuration.
//!
//! Everything a run reads comes from [`QcConfig`]; there is no implicit
//! environment or global state. The structure deserializes from JSON with
//! every field optional:
//!
//! ```json
//! {
//!   "enabled_metrics": ["noise", "saturation"],
//!   "metric_weights": { "noise": 2.0 },
//!   "mandatory_metrics": ["saturation"],
//!   "metric_thresholds": { "saturation": { "clip_value": 10.0 } },
//!   "per_metric_timeout_ms": 5000,
//!   "execution": "sequential"
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::{
    AcquisitionSettings, CalibrationSettings, DriftSettings, NoiseSettings, SaturationSettings,
    SnrSettings, SpikeSettings,
};

/// Reading or parsing a configuration file failed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How the pipeline schedules metric evaluations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One after another on the calling thread.
    Sequential,
    /// One worker thread per metric.
    #[default]
    Parallel,
}

/// Settings for the built-in metrics. A section present here replaces the
/// settings the registered metric was built with; an absent one leaves it
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noise: Option<NoiseSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saturation: Option<SaturationSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calibration: Option<CalibrationSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spectral_artifacts: Option<SpikeSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spectral_snr: Option<SnrSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquisition: Option<AcquisitionSettings>,
}

fn check<T>(settings: &Option<T>, validate: fn(&T) -> Result<(), String>) -> Result<(), String> {
    settings.as_ref().map_or(Ok(()), validate)
}

impl MetricSettings {
    /// First invalid setting as `(metric, reason)`.
    pub fn validate(&self) -> Result<(), (&'static str, String)> {
        let checks: [(&'static str, Result<(), String>); 7] = [
            ("noise", check(&self.noise, NoiseSettings::validate)),
            ("drift", check(&self.drift, DriftSettings::validate)),
            ("saturation", check(&self.saturation, SaturationSettings::validate)),
            ("calibration", check(&self.calibration, CalibrationSettings::validate)),
            ("spectral_artifacts", check(&self.spectral_artifacts, SpikeSettings::validate)),
            ("spectral_snr", check(&self.spectral_snr, SnrSettings::validate)),
            ("acquisition", check(&self.acquisition, AcquisitionSettings::validate)),
        ];
        for (metric, check) in checks {
            check.map_err(|reason| (metric, reason))?;
        }
        Ok(())
    }
}

/// Configuration of one QC pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QcConfig {
    /// Metrics to run, in registry order. `None` runs every registered metric.
    pub enabled_metrics: Option<Vec<String>>,
    /// Aggregation weight per metric name; missing names weigh 1.0.
    pub metric_weights: BTreeMap<String, f64>,
    pub metric_thresholds: MetricSettings,
    /// Metrics whose error fails the whole record.
    pub mandatory_metrics: Vec<String>,
    /// Wall-clock limit per metric evaluation.
    pub per_metric_timeout_ms: Option<u64>,
    pub execution: ExecutionMode,
}

impl QcConfig {
    /// Parse a JSON configuration document.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read and parse a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&text)?;
        log::debug!("loaded QC config from {}", path.display());
        Ok(config)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.per_metric_timeout_ms.map(Duration::from_millis)
    }

    pub fn weight(&self, metric: &str) -> f64 {
        self.metric_weights.get(metric).copied().unwrap_or(1.0)
    }

    pub fn is_mandatory(&self, metric: &str) -> bool {
        self.mandatory_metrics.iter().any(|m| m == metric)
    }
}
