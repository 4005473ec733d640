//! Built-in quality metrics and the ordered registry that holds them.
//!
//! Image metrics ([`noise`], [`drift`], [`saturation`], [`calibration`]) work on
//! the record's channels; [`spectral`] and [`snr`] work on its spectrum and
//! [`acquisition`] on its metadata. Registered metrics carry default settings;
//! the pipeline replaces them with the run's `metric_thresholds`. The registry
//! keeps registration order, which is also the order of results.

pub mod acquisition;
pub mod calibration;
pub mod drift;
pub mod noise;
pub mod saturation;
pub mod snr;
pub mod spectral;

use std::sync::Arc;

pub use acquisition::{AcquisitionMetric, AcquisitionSettings};
pub use calibration::{CalibrationMetric, CalibrationSettings};
pub use drift::{DriftMetric, DriftSettings};
pub use noise::{NoiseMetric, NoiseSettings};
pub use saturation::{SaturationMetric, SaturationSettings};
pub use snr::{SnrSettings, SpectralSnrMetric};
pub use spectral::{SpectralArtifactsMetric, SpikeSettings};

use crate::metric::Metric;
use crate::record::Spectrum;

/// Explicit, ordered set of metrics.
#[derive(Clone, Default)]
pub struct MetricRegistry {
    metrics: Vec<Arc<dyn Metric>>,
}

impl MetricRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The six reference-free metrics: noise, drift, saturation, calibration,
    /// spectral_artifacts, acquisition.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(Box::new(NoiseMetric::default()));
        registry.add(Box::new(DriftMetric::default()));
        registry.add(Box::new(SaturationMetric::default()));
        registry.add(Box::new(CalibrationMetric::default()));
        registry.add(Box::new(SpectralArtifactsMetric::default()));
        registry.add(Box::new(AcquisitionMetric::default()));
        registry
    }

    /// [`standard`](Self::standard) plus `spectral_snr` against `reference`.
    pub fn with_reference(reference: impl Into<Arc<Spectrum>>) -> Self {
        let mut registry = Self::standard();
        registry.add(Box::new(SpectralSnrMetric::new(
            reference.into(),
            SnrSettings::default(),
        )));
        registry
    }

    /// Append a metric. Name uniqueness is checked by the pipeline.
    pub fn add(&mut self, metric: Box<dyn Metric>) -> &mut Self {
        self.metrics.push(Arc::from(metric));
        self
    }

    /// Metric names in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.metrics.iter().map(|m| m.name()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Metric>> {
        self.metrics.iter().find(|m| m.name() == name)
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Metric>> {
        self.metrics.iter()
    }

    pub(crate) fn into_inner(self) -> Vec<Arc<dyn Metric>> {
        self.metrics
    }
}

impl FromIterator<Box<dyn Metric>> for MetricRegistry {
    fn from_iter<I: IntoIterator<Item = Box<dyn Metric>>>(iter: I) -> Self {
        let mut registry = Self::new();
        for metric in iter {
            registry.add(metric);
        }
        registry
    }
}

impl std::fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_standard_registration_order() {
        let registry = MetricRegistry::standard();
        assert_eq!(
            registry.names(),
            vec![
                "noise",
                "drift",
                "saturation",
                "calibration",
                "spectral_artifacts",
                "acquisition"
            ]
        );
        assert_eq!(registry.len(), 6);
    }

    #[test]
    fn test_with_reference_appends_snr() {
        let reference = Spectrum::new(
            vec![800.0, 900.0],
            BTreeMap::from([("O2A".to_string(), vec![1.0, 1.0])]),
            BTreeMap::new(),
        )
        .unwrap();
        let registry = MetricRegistry::with_reference(reference);
        assert_eq!(registry.names().last(), Some(&"spectral_snr"));
        assert!(registry.get("spectral_snr").is_some());
    }

    #[test]
    fn test_empty_registry() {
        let registry = MetricRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get("noise").is_none());
    }

    #[test]
    fn test_collect_from_boxes() {
        let metrics: Vec<Box<dyn Metric>> =
            vec![Box::new(SaturationMetric::default()), Box::new(NoiseMetric::default())];
        let registry: MetricRegistry = metrics.into_iter().collect();
        assert_eq!(registry.names(), vec!["saturation", "noise"]);
    }

    #[test]
    fn test_metric_infos_are_described() {
        let registry = MetricRegistry::standard();
        for metric in registry.iter() {
            let info = metric.info();
            assert!(!info.description.is_empty(), "{}", info.name);
            assert!(!info.principle.is_empty(), "{}", info.name);
            assert!(!info.requirements.is_empty(), "{}", info.name);
        }
    }
}
