//! Pipeline configuration
//!
//! Every stage keeps its own config struct next to its implementation;
//! `PipelineConfig` bundles them with the boundary settings (trace
//! tolerance, cache, lookback and horizon). All fields default, so a
//! partial JSON document is a valid config.

use crate::cache::DEFAULT_CAPACITY;
use crate::convergence::ConvergenceConfig;
use crate::error::ComputeError;
use crate::forecast::ForecastConfig;
use crate::harmonizer::HarmonizerConfig;
use crate::index::IndexWeights;
use crate::shock::ShockConfig;
use crate::trace::DEFAULT_TOLERANCE;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LOOKBACK_DAYS: usize = 90;
pub const DEFAULT_HORIZON_DAYS: usize = 7;
/// Upper bound for every day-count and window setting (about a century)
pub const MAX_WINDOW_DAYS: usize = 36_500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub weights: IndexWeights,
    pub harmonizer: HarmonizerConfig,
    pub shock: ShockConfig,
    pub convergence: ConvergenceConfig,
    pub forecast: ForecastConfig,
    /// Allowed |Σ contributions − output| before a trace is invalid
    pub trace_tolerance: f64,
    pub cache_capacity: usize,
    /// Harmonized days kept before index computation
    pub lookback_days: usize,
    /// Forecast steps
    pub horizon_days: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            weights: IndexWeights::default(),
            harmonizer: HarmonizerConfig::default(),
            shock: ShockConfig::default(),
            convergence: ConvergenceConfig::default(),
            forecast: ForecastConfig::default(),
            trace_tolerance: DEFAULT_TOLERANCE,
            cache_capacity: DEFAULT_CAPACITY,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            horizon_days: DEFAULT_HORIZON_DAYS,
        }
    }
}

impl PipelineConfig {
    pub fn with_weights(mut self, weights: IndexWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_lookback_days(mut self, days: usize) -> Self {
        self.lookback_days = days;
        self
    }

    pub fn with_horizon_days(mut self, days: usize) -> Self {
        self.horizon_days = days;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_shock(mut self, shock: ShockConfig) -> Self {
        self.shock = shock;
        self
    }

    pub fn with_convergence(mut self, convergence: ConvergenceConfig) -> Self {
        self.convergence = convergence;
        self
    }

    /// Load and validate a JSON config
    pub fn from_json(json: &str) -> Result<Self, ComputeError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ComputeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject values no stage can run with.
    ///
    /// Weights are not checked here; they are renormalized when used.
    pub fn validate(&self) -> Result<(), ComputeError> {
        let invalid = |msg: String| Err(ComputeError::InvalidConfig(msg));

        if self.shock.window == 0 {
            return invalid("shock.window must be at least 1".into());
        }
        for (name, value) in [
            ("shock.z_threshold", self.shock.z_threshold),
            ("shock.delta_threshold", self.shock.delta_threshold),
            ("convergence.threshold", self.convergence.threshold),
            ("trace_tolerance", self.trace_tolerance),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return invalid(format!("{name} must be a positive number, got {value}"));
            }
        }
        if self.convergence.threshold > 1.0 {
            return invalid(format!(
                "convergence.threshold must be at most 1, got {}",
                self.convergence.threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.convergence.pattern_threshold) {
            return invalid(format!(
                "convergence.pattern_threshold must be in [0, 1], got {}",
                self.convergence.pattern_threshold
            ));
        }
        for (name, value) in [
            ("shock.ewma_alpha", self.shock.ewma_alpha),
            ("forecast.alpha", self.forecast.alpha),
            ("forecast.beta", self.forecast.beta),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return invalid(format!("{name} must be in (0, 1], got {value}"));
            }
        }
        if self.cache_capacity == 0 {
            return invalid("cache_capacity must be at least 1".into());
        }
        if self.lookback_days == 0 {
            return invalid("lookback_days must be at least 1".into());
        }
        if self.harmonizer.max_span_days == 0 {
            return invalid("harmonizer.max_span_days must be at least 1".into());
        }
        for (name, value) in [
            ("shock.window", self.shock.window),
            ("convergence.trend_window", self.convergence.trend_window),
            ("lookback_days", self.lookback_days),
            ("horizon_days", self.horizon_days),
            ("harmonizer.trading_fill_days", self.harmonizer.trading_fill_days),
            ("harmonizer.weekly_fill_days", self.harmonizer.weekly_fill_days),
            ("harmonizer.monthly_fill_days", self.harmonizer.monthly_fill_days),
            ("harmonizer.max_span_days", self.harmonizer.max_span_days),
        ] {
            if value > MAX_WINDOW_DAYS {
                return invalid(format!("{name} must be at most {MAX_WINDOW_DAYS}, got {value}"));
            }
        }
        Ok(())
    }
}
