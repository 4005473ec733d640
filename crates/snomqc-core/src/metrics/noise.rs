//! Pixel noise floor relative to each channel's dynamic range.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snomqc_signal::{box_mean, summarize};

use crate::config::MetricSettings;
use crate::metric::{
    Evaluation, Metric, MetricError, MetricInfo, Requirement, ScoreDirection, Thresholds, detail,
};
use crate::record::{Grid, MeasurementRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseSettings {
    /// On noise floor / dynamic range.
    pub thresholds: Thresholds,
    /// Box radius of the local-mean reference (1 = 3x3).
    pub radius: usize,
    /// Channels to assess; all channels when empty.
    pub channels: Vec<String>,
}

impl Default for NoiseSettings {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::new(0.02, 0.05),
            radius: 1,
            channels: Vec::new(),
        }
    }
}

impl NoiseSettings {
    pub fn validate(&self) -> Result<(), String> {
        self.thresholds.validate(NOISE_INFO.direction)?;
        if self.radius == 0 {
            return Err("radius must be at least 1".into());
        }
        Ok(())
    }
}

pub struct NoiseMetric {
    settings: NoiseSettings,
}

static NOISE_INFO: MetricInfo = MetricInfo {
    name: "noise",
    description: "Pixel noise floor relative to channel dynamic range",
    principle: "Subtracting a local box mean leaves pixel-to-pixel fluctuation; its standard \
                deviation is the noise floor. Dividing by max - min makes channels with \
                different units comparable. The noisiest channel decides.",
    requirements: &[Requirement::Channels],
    direction: ScoreDirection::LowerIsBetter,
};

impl NoiseMetric {
    pub fn new(settings: NoiseSettings) -> Self {
        Self { settings }
    }
}

impl Default for NoiseMetric {
    fn default() -> Self {
        Self::new(NoiseSettings::default())
    }
}

struct ChannelNoise {
    floor: f64,
    range: f64,
}

/// Noise floor and dynamic range of one grid, `None` for a flat or empty grid.
///
/// Border pixels are skipped when the grid is large enough, since their
/// clipped windows bias the local mean on sloped data.
fn channel_noise(grid: &Grid, radius: usize) -> Option<ChannelNoise> {
    let (rows, cols) = grid.shape();
    let values = grid.values();
    let range = summarize(values)?.range();
    if !(range > 0.0) {
        return None;
    }

    let smooth = box_mean(values, rows, cols, radius);
    let margin = if rows > 2 * radius && cols > 2 * radius { radius } else { 0 };
    let mut residual = Vec::with_capacity(values.len());
    for r in margin..rows - margin {
        for c in margin..cols - margin {
            let i = r * cols + c;
            residual.push(values[i] - smooth[i]);
        }
    }
    let floor = summarize(&residual)?.std_dev;
    Some(ChannelNoise { floor, range })
}

impl Metric for NoiseMetric {
    fn info(&self) -> &MetricInfo {
        &NOISE_INFO
    }

    fn configured(&self, settings: &MetricSettings) -> Option<Arc<dyn Metric>> {
        let settings = settings.noise.clone()?;
        Some(Arc::new(Self::new(settings)))
    }

    fn validate(&self) -> Result<(), String> {
        self.settings.validate()
    }

    fn evaluate(&self, record: &MeasurementRecord) -> Result<Evaluation, MetricError> {
        let selected: Vec<(&str, &Grid)> = if self.settings.channels.is_empty() {
            record.channels().collect()
        } else {
            self.settings
                .channels
                .iter()
                .map(|name| {
                    record
                        .channel(name)
                        .map(|grid| (name.as_str(), grid))
                        .ok_or_else(|| MetricError::MissingChannel(name.clone()))
                })
                .collect::<Result<_, _>>()?
        };

        let mut per_channel = Map::new();
        let mut worst: Option<(&str, f64)> = None;
        for (name, grid) in selected {
            match channel_noise(grid, self.settings.radius) {
                Some(noise) => {
                    let ratio = noise.floor / noise.range;
                    per_channel.insert(
                        name.to_string(),
                        serde_json::json!({
                            "noise_floor": noise.floor,
                            "dynamic_range": noise.range,
                            "ratio": ratio,
                        }),
                    );
                    if worst.is_none_or(|(_, w)| ratio > w) {
                        worst = Some((name, ratio));
                    }
                }
                None => {
                    per_channel.insert(name.to_string(), Value::from("zero dynamic range"));
                }
            }
        }

        let (worst_channel, value) = worst.ok_or_else(|| {
            MetricError::Degenerate("every channel has zero dynamic range".into())
        })?;
        Ok(Evaluation::graded(
            value,
            &self.settings.thresholds,
            NOISE_INFO.direction,
            detail! {
                "worst_channel" => worst_channel,
                "radius" => self.settings.radius,
                "channels" => Value::Object(per_channel),
            },
        ))
    }
}
