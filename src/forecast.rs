//! Behavior Index forecasting
//!
//! The forecaster is a strategy behind the [`Forecaster`] trait. The
//! default is Holt's linear exponential smoothing with a residual-based
//! prediction band.

use crate::index::{clip_unit, NEUTRAL_VALUE};
use crate::types::{BehaviorIndexRow, ForecastPoint};
use chrono::Days;
use serde::{Deserialize, Serialize};

pub const DEFAULT_ALPHA: f64 = 0.3;
pub const DEFAULT_BETA: f64 = 0.1;
/// Two-sided 95% normal quantile
pub const BAND_Z: f64 = 1.96;
/// Residual std assumed when history is too short to estimate one
const FALLBACK_SIGMA: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// Level smoothing factor
    pub alpha: f64,
    /// Trend smoothing factor
    pub beta: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            beta: DEFAULT_BETA,
        }
    }
}

/// One undated forecast step; `step` starts at 1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastValue {
    pub step: usize,
    pub prediction: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

impl ForecastValue {
    fn banded(step: usize, prediction: f64, half_width: f64) -> Self {
        let prediction = clip_unit(prediction);
        Self {
            step,
            prediction,
            lower_bound: clip_unit(prediction - half_width),
            upper_bound: clip_unit(prediction + half_width),
        }
    }
}

/// Forecasting strategy.
///
/// Implementations must return exactly `horizon` values, clipped to
/// [0, 1], with `lower_bound <= prediction <= upper_bound`.
pub trait Forecaster: Send + Sync {
    fn name(&self) -> &'static str;

    fn forecast(&self, history: &[f64], horizon: usize) -> Vec<ForecastValue>;
}

/// Holt's linear (double exponential) smoothing
#[derive(Debug, Clone, Copy, Default)]
pub struct HoltForecaster {
    config: ForecastConfig,
}

impl HoltForecaster {
    pub fn new(config: ForecastConfig) -> Self {
        Self { config }
    }
}

impl Forecaster for HoltForecaster {
    fn name(&self) -> &'static str {
        "holt"
    }

    fn forecast(&self, history: &[f64], horizon: usize) -> Vec<ForecastValue> {
        let values: Vec<f64> = history.iter().copied().filter(|v| v.is_finite()).collect();

        if values.is_empty() {
            // Nothing known: neutral prediction spanning the whole range
            return (1..=horizon)
                .map(|step| ForecastValue {
                    step,
                    prediction: NEUTRAL_VALUE,
                    lower_bound: 0.0,
                    upper_bound: 1.0,
                })
                .collect();
        }

        let ForecastConfig { alpha, beta } = self.config;
        let mut level = values[0];
        let mut trend = if values.len() > 1 {
            values[1] - values[0]
        } else {
            0.0
        };
        let mut squared_residuals = 0.0;
        let mut residual_count = 0usize;

        for x in values.iter().skip(1) {
            let predicted = level + trend;
            squared_residuals += (x - predicted).powi(2);
            residual_count += 1;

            let previous_level = level;
            level = alpha * x + (1.0 - alpha) * (level + trend);
            trend = beta * (level - previous_level) + (1.0 - beta) * trend;
        }

        let sigma = if residual_count >= 2 {
            (squared_residuals / residual_count as f64).sqrt()
        } else {
            FALLBACK_SIGMA
        };

        (1..=horizon)
            .map(|step| {
                let h = step as f64;
                ForecastValue::banded(step, level + h * trend, BAND_Z * sigma * h.sqrt())
            })
            .collect()
    }
}

/// Forecast the Behavior Index and date each step on the days following
/// the last history row. Empty history yields no points.
pub fn forecast_history(
    forecaster: &dyn Forecaster,
    history: &[BehaviorIndexRow],
    horizon: usize,
) -> Vec<ForecastPoint> {
    let Some(last) = history.last() else {
        return Vec::new();
    };
    let values: Vec<f64> = history.iter().map(|row| row.behavior_index).collect();

    forecaster
        .forecast(&values, horizon)
        .into_iter()
        .map_while(|v| {
            Some(ForecastPoint {
                timestamp: last.timestamp.checked_add_days(Days::new(v.step as u64))?,
                prediction: v.prediction,
                lower_bound: v.lower_bound,
                upper_bound: v.upper_bound,
            })
        })
        .collect()
}
