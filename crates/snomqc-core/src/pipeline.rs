//! QC pipeline: evaluate a metric set against one record and aggregate.
//!
//! Architecture:
//! 1. Validate the configuration against the registry once, at construction,
//!    and rebuild each metric with its `metric_thresholds` settings
//! 2. Check each metric's requirements against the record
//! 3. Evaluate every metric in isolation (errors, panics and timeouts become
//!    `status = error` results)
//! 4. Collect results in registration order, sequentially or in parallel
//! 5. Aggregate into a [`QcResult`]
//!
//! The record is shared read-only through an `Arc`, so any number of runs may
//! evaluate the same record concurrently.

use std::collections::{BTreeMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::aggregate::{AggregationError, Aggregator, QcResult, RecordRef};
use crate::config::{ExecutionMode, QcConfig};
use crate::export::{ExportError, ResultExporter};
use crate::metric::{Metric, MetricError, MetricResult};
use crate::metrics::MetricRegistry;
use crate::record::MeasurementRecord;

/// Why a run produced no result.
#[derive(Debug, Error)]
pub enum QcError {
    #[error("QC run was cancelled")]
    Cancelled,
    #[error(transparent)]
    Export(#[from] ExportError),
}

/// Cooperative cancellation flag shared between a caller and a running
/// pipeline. Checked after each metric completes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A validated metric set with its aggregation rules.
pub struct QcPipeline {
    metrics: Vec<Arc<dyn Metric>>,
    aggregator: Aggregator,
    timeout: Option<Duration>,
    execution: ExecutionMode,
}

impl QcPipeline {
    /// Select the enabled metrics from `registry`, apply their settings from
    /// `config.metric_thresholds` and check every name and number in `config`.
    pub fn new(registry: MetricRegistry, config: &QcConfig) -> Result<Self, AggregationError> {
        let mut seen = HashSet::new();
        for name in registry.names() {
            if !seen.insert(name) {
                return Err(AggregationError::DuplicateMetric(name.to_string()));
            }
        }

        config
            .metric_thresholds
            .validate()
            .map_err(|(metric, reason)| AggregationError::InvalidThresholds {
                metric: metric.to_string(),
                reason,
            })?;

        check_known(&seen, "metric_weights", config.metric_weights.keys())?;
        check_known(&seen, "mandatory_metrics", &config.mandatory_metrics)?;
        if let Some(enabled) = &config.enabled_metrics {
            check_known(&seen, "enabled_metrics", enabled)?;
        }

        let metrics: Vec<Arc<dyn Metric>> = match &config.enabled_metrics {
            None => registry.into_inner(),
            Some(enabled) => registry
                .into_inner()
                .into_iter()
                .filter(|m| enabled.iter().any(|n| n == m.name()))
                .collect(),
        };
        if metrics.is_empty() {
            return Err(AggregationError::NoMetrics);
        }

        let metrics = metrics
            .into_iter()
            .map(|metric| {
                let metric = metric
                    .configured(&config.metric_thresholds)
                    .unwrap_or(metric);
                metric
                    .validate()
                    .map_err(|reason| AggregationError::InvalidThresholds {
                        metric: metric.name().to_string(),
                        reason,
                    })?;
                Ok(metric)
            })
            .collect::<Result<Vec<_>, AggregationError>>()?;

        let aggregator = Aggregator::new()
            .with_weights(config.metric_weights.clone())?
            .with_mandatory(config.mandatory_metrics.iter().cloned());

        Ok(Self {
            metrics,
            aggregator,
            timeout: config.timeout(),
            execution: config.execution,
        })
    }

    /// Names of the metrics this pipeline runs, in order.
    pub fn metric_names(&self) -> Vec<&'static str> {
        self.metrics.iter().map(|m| m.name()).collect()
    }

    pub fn execution(&self) -> ExecutionMode {
        self.execution
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Evaluate every metric and aggregate. Never fails: metric problems are
    /// reported as `status = error` entries.
    pub fn run(&self, record: &Arc<MeasurementRecord>) -> QcResult {
        match self.execute(record, None) {
            Ok(result) => result,
            // Unreachable without a token.
            Err(_) => self.aggregate(record, Vec::new()),
        }
    }

    /// Like [`run`](Self::run), but stop with [`QcError::Cancelled`] once
    /// `token` is set. Partial results are discarded.
    pub fn run_cancellable(
        &self,
        record: &Arc<MeasurementRecord>,
        token: &CancelToken,
    ) -> Result<QcResult, QcError> {
        self.execute(record, Some(token))
    }

    /// Run and hand the result to `exporter`.
    pub fn run_and_export(
        &self,
        record: &Arc<MeasurementRecord>,
        exporter: &dyn ResultExporter,
    ) -> Result<QcResult, QcError> {
        let result = self.run(record);
        exporter.export(&result)?;
        Ok(result)
    }

    fn execute(
        &self,
        record: &Arc<MeasurementRecord>,
        token: Option<&CancelToken>,
    ) -> Result<QcResult, QcError> {
        let cancelled = || token.is_some_and(CancelToken::is_cancelled);
        if cancelled() {
            return Err(QcError::Cancelled);
        }

        let t0 = Instant::now();
        let results = match self.execution {
            ExecutionMode::Sequential => self.run_sequential(record, &cancelled)?,
            ExecutionMode::Parallel => self.run_parallel(record, &cancelled)?,
        };
        let result = self.aggregate(record, results);
        log::info!(
            "QC {}: {} (score {}, {} metrics, {} errored) in {:?}",
            result.record_ref.source.as_deref().unwrap_or(&result.record_ref.fingerprint),
            result.status,
            result
                .score
                .map_or_else(|| "n/a".to_string(), |s| format!("{s:.3}")),
            result.metrics.len(),
            result.errored_metrics.len(),
            t0.elapsed()
        );
        Ok(result)
    }

    fn aggregate(&self, record: &MeasurementRecord, results: Vec<MetricResult>) -> QcResult {
        self.aggregator.aggregate(RecordRef::from(record), results)
    }

    fn run_sequential(
        &self,
        record: &Arc<MeasurementRecord>,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<Vec<MetricResult>, QcError> {
        let mut results = Vec::with_capacity(self.metrics.len());
        for metric in &self.metrics {
            let result = match self.timeout {
                None => evaluate_isolated(metric.as_ref(), record),
                Some(limit) => evaluate_with_timeout(metric, record, limit),
            };
            log_result(&result);
            results.push(result);
            if cancelled() {
                return Err(QcError::Cancelled);
            }
        }
        Ok(results)
    }

    fn run_parallel(
        &self,
        record: &Arc<MeasurementRecord>,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<Vec<MetricResult>, QcError> {
        let mut slots: Vec<Option<MetricResult>> = vec![None; self.metrics.len()];
        let (tx, rx) = mpsc::channel();
        let mut pending = 0usize;

        // Workers are detached; a worker that outlives the deadline finds the
        // receiver gone and its result is dropped.
        for (index, metric) in self.metrics.iter().enumerate() {
            match spawn_worker(index, metric, record, tx.clone()) {
                Ok(()) => pending += 1,
                Err(e) => {
                    log::warn!("cannot spawn worker for {}: {e}; evaluating inline", metric.name());
                    let result = evaluate_isolated(metric.as_ref(), record);
                    log_result(&result);
                    slots[index] = Some(result);
                    if cancelled() {
                        return Err(QcError::Cancelled);
                    }
                }
            }
        }
        drop(tx);

        let deadline = self.timeout.map(|t| Instant::now() + t);
        while pending > 0 {
            let received = match deadline {
                None => rx.recv().ok(),
                Some(d) => rx
                    .recv_timeout(d.saturating_duration_since(Instant::now()))
                    .ok(),
            };
            let Some((index, result)) = received else {
                break;
            };
            log_result(&result);
            slots[index] = Some(result);
            pending -= 1;
            if cancelled() {
                return Err(QcError::Cancelled);
            }
        }

        Ok(slots
            .into_iter()
            .zip(&self.metrics)
            .map(|(slot, metric)| {
                slot.unwrap_or_else(|| {
                    let error = match self.timeout {
                        Some(limit) => MetricError::TimedOut(limit),
                        None => MetricError::Other("worker exited without a result".into()),
                    };
                    let result = MetricResult::from_error(metric.name(), &error);
                    log_result(&result);
                    result
                })
            })
            .collect())
    }
}

fn check_known<'a>(
    registered: &HashSet<&str>,
    field: &'static str,
    names: impl IntoIterator<Item = &'a String>,
) -> Result<(), AggregationError> {
    match names.into_iter().find(|n| !registered.contains(n.as_str())) {
        Some(name) => Err(AggregationError::UnknownMetric {
            field,
            name: name.clone(),
        }),
        None => Ok(()),
    }
}

/// Evaluate `metrics` against `record` in parallel with per-metric `weights`
/// and aggregate.
pub fn run(
    record: &Arc<MeasurementRecord>,
    metrics: Vec<Box<dyn Metric>>,
    weights: BTreeMap<String, f64>,
) -> Result<QcResult, AggregationError> {
    let config = QcConfig {
        metric_weights: weights,
        ..Default::default()
    };
    let pipeline = QcPipeline::new(metrics.into_iter().collect(), &config)?;
    Ok(pipeline.run(record))
}

// ---------------------------------------------------------------------------
// Isolated evaluation
// ---------------------------------------------------------------------------

/// Evaluate one metric, turning every failure mode into an error result.
pub(crate) fn evaluate_isolated(metric: &dyn Metric, record: &MeasurementRecord) -> MetricResult {
    let info = metric.info();
    if let Some(missing) = info.requirements.iter().find(|r| !record.provides(**r)) {
        return MetricResult::from_error(info.name, &MetricError::Unsupported(*missing));
    }

    let t0 = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| metric.evaluate(record)));
    log::debug!("{} evaluated in {:?}", info.name, t0.elapsed());
    match outcome {
        Ok(Ok(evaluation)) => MetricResult::from_evaluation(info.name, evaluation),
        Ok(Err(error)) => MetricResult::from_error(info.name, &error),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            MetricResult::from_error(info.name, &MetricError::Panicked(message))
        }
    }
}

fn spawn_worker(
    index: usize,
    metric: &Arc<dyn Metric>,
    record: &Arc<MeasurementRecord>,
    tx: mpsc::Sender<(usize, MetricResult)>,
) -> std::io::Result<()> {
    let metric = Arc::clone(metric);
    let record = Arc::clone(record);
    thread::Builder::new()
        .name(format!("qc-{}", metric.name()))
        .spawn(move || {
            let result = evaluate_isolated(metric.as_ref(), &record);
            let _ = tx.send((index, result));
        })
        .map(|_| ())
}

fn evaluate_with_timeout(
    metric: &Arc<dyn Metric>,
    record: &Arc<MeasurementRecord>,
    limit: Duration,
) -> MetricResult {
    let (tx, rx) = mpsc::channel();
    if let Err(e) = spawn_worker(0, metric, record, tx) {
        log::warn!("cannot spawn worker for {}: {e}; evaluating inline", metric.name());
        return evaluate_isolated(metric.as_ref(), record);
    }
    match rx.recv_timeout(limit) {
        Ok((_, result)) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            MetricResult::from_error(metric.name(), &MetricError::TimedOut(limit))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => MetricResult::from_error(
            metric.name(),
            &MetricError::Other("worker exited without a result".into()),
        ),
    }
}

fn log_result(result: &MetricResult) {
    match &result.error {
        Some(reason) => log::warn!("{}: error: {reason}", result.name),
        None => log::debug!(
            "{}: {} (value {:?}, score {:?})",
            result.name,
            result.status,
            result.value,
            result.score
        ),
    }
}
