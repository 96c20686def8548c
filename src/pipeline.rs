//! Pipeline orchestration
//!
//! This module provides the public API for Pulse Index. It runs the full
//! chain from fetched source series to a region analysis:
//! harmonize → composite index → shocks / convergence → risk → traces,
//! plus the Behavior Index forecast.

use crate::cache::{CacheKey, ResultCache};
use crate::config::PipelineConfig;
use crate::convergence::ConvergenceEngine;
use crate::error::ComputeError;
use crate::forecast::{forecast_history, Forecaster, HoltForecaster};
use crate::harmonizer::{source_issues, Harmonizer, SourceIssue};
use crate::index::{CompositeIndexEngine, NEUTRAL_VALUE};
use crate::risk::{classify_risk, RiskClassifier};
use crate::schema::SourcesDocument;
use crate::shock::{ShockDetector, ShockReport};
use crate::trace::{DecisionTrace, TraceContext};
use crate::types::{
    BehaviorIndexRow, ConvergenceResult, ForecastPoint, Region, RiskClassification, ShockEvent,
    SourceFetch, TrendDirection,
};
use chrono::Days;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Minimum Behavior Index change over the trend window that counts as a trend
pub const TREND_DEADBAND: f64 = 0.02;

/// Traces for the decisions of one analysis
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisTraces {
    /// Behavior Index of the latest row
    pub index: Option<DecisionTrace>,
    pub shocks: Option<DecisionTrace>,
    pub convergence: Option<DecisionTrace>,
    pub risk: Option<DecisionTrace>,
}

impl AnalysisTraces {
    pub fn iter(&self) -> impl Iterator<Item = &DecisionTrace> {
        [&self.index, &self.shocks, &self.convergence, &self.risk]
            .into_iter()
            .flatten()
    }

    /// True when every present trace reconciles
    pub fn all_valid(&self) -> bool {
        self.iter().all(DecisionTrace::is_valid)
    }
}

/// Everything computed for one region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionAnalysis {
    pub region: Region,
    pub history: Vec<BehaviorIndexRow>,
    pub forecast: Vec<ForecastPoint>,
    pub shocks: ShockReport,
    pub convergence: ConvergenceResult,
    pub trend: Option<TrendDirection>,
    pub risk: RiskClassification,
    pub traces: AnalysisTraces,
    pub unavailable: Vec<SourceIssue>,
    pub warnings: Vec<String>,
}

impl RegionAnalysis {
    /// Well-formed result for a region with nothing to analyze
    pub fn empty(region: Region, warning: impl Into<String>) -> Self {
        Self {
            region,
            history: Vec::new(),
            forecast: Vec::new(),
            shocks: ShockReport::default(),
            convergence: ConvergenceResult::default(),
            trend: None,
            risk: classify_risk(NEUTRAL_VALUE, &[], None, None),
            traces: AnalysisTraces::default(),
            unavailable: Vec::new(),
            warnings: vec![warning.into()],
        }
    }

    pub fn latest(&self) -> Option<&BehaviorIndexRow> {
        self.history.last()
    }

    pub fn behavior_index(&self) -> Option<f64> {
        self.latest().map(|row| row.behavior_index)
    }
}

/// Direction of the Behavior Index: latest row versus `window` rows earlier
/// (or the first row). `None` with fewer than two rows.
pub fn trend_direction(history: &[BehaviorIndexRow], window: usize) -> Option<TrendDirection> {
    if history.len() < 2 {
        return None;
    }
    let latest = history.last()?.behavior_index;
    let earlier = history[(history.len() - 1).saturating_sub(window)].behavior_index;
    let change = latest - earlier;
    Some(if change > TREND_DEADBAND {
        TrendDirection::Increasing
    } else if change < -TREND_DEADBAND {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    })
}

fn issue_warning(issue: &SourceIssue) -> String {
    format!("source '{}' unavailable: {}", issue.source, issue.reason)
}

/// Shocks on the latest `window` days, the ones that describe the current state
fn recent_shocks(history: &[BehaviorIndexRow], shocks: &[ShockEvent], window: usize) -> Vec<ShockEvent> {
    let Some(latest) = history.last() else {
        return Vec::new();
    };
    match latest.timestamp.checked_sub_days(Days::new(window as u64)) {
        Some(cutoff) => shocks
            .iter()
            .filter(|s| s.timestamp > cutoff)
            .cloned()
            .collect(),
        None => shocks.to_vec(),
    }
}

fn run(
    config: &PipelineConfig,
    forecaster: &dyn Forecaster,
    context: &TraceContext,
    region: Region,
    sources: &[SourceFetch],
) -> RegionAnalysis {
    // Stage 1: Harmonize onto a daily grid
    let table = match Harmonizer::new(config.harmonizer).harmonize(sources) {
        Ok(table) => table.trailing(config.lookback_days),
        Err(e) => {
            warn!(region = %region.id, error = %e, "no usable data for region");
            let mut analysis = RegionAnalysis::empty(region, e.to_string());
            analysis.unavailable = source_issues(sources);
            analysis
                .warnings
                .extend(analysis.unavailable.iter().map(issue_warning));
            return analysis;
        }
    };

    let mut warnings: Vec<String> = table.unavailable.iter().map(issue_warning).collect();
    if let Some(day) = table.truncated_before {
        warnings.push(format!(
            "observations before {day} dropped: source dates span more than {} days",
            config.harmonizer.max_span_days
        ));
    }

    // Stage 2: Composite index
    let engine = CompositeIndexEngine::new(&config.weights);
    let history = engine.compute(&table);

    // Stage 3: Shocks and convergence
    let detector = ShockDetector::new(config.shock);
    let shocks = detector.detect(&history);
    if !shocks.skipped.is_empty() {
        warnings.push(format!(
            "{} sub-index series too short for shock detection",
            shocks.skipped.len()
        ));
    }

    let convergence_engine = ConvergenceEngine::new(config.convergence.clone());
    let convergence = convergence_engine.analyze(&history);
    let convergence_score = if convergence.indices.len() >= 2 {
        Some(convergence.score)
    } else {
        warnings.push("not enough sub-indices for convergence analysis".to_string());
        None
    };

    // Stage 4: Risk
    let window = config.convergence.trend_window;
    let trend = trend_direction(&history, window);
    let current_shocks = recent_shocks(&history, &shocks.events, window);
    let behavior_index = history
        .last()
        .map(|row| row.behavior_index)
        .unwrap_or(NEUTRAL_VALUE);
    let risk = classify_risk(behavior_index, &current_shocks, convergence_score, trend);

    // Stage 5: Forecast
    let forecast = forecast_history(forecaster, &history, config.horizon_days);

    // Stage 6: Traces
    let traces = AnalysisTraces {
        index: history.last().map(|row| engine.trace_row(row, context)),
        shocks: Some(detector.trace(&shocks, context)),
        convergence: Some(convergence_engine.trace(&convergence, context)),
        risk: Some(RiskClassifier::new().trace(&risk, context)),
    };
    if !traces.all_valid() {
        warnings.push("one or more decision traces failed reconciliation".to_string());
    }

    info!(
        region = %region.id,
        days = history.len(),
        behavior_index,
        risk_score = risk.risk_score,
        tier = risk.tier.as_str(),
        shocks = shocks.events.len(),
        convergence = convergence.score,
        "region analyzed"
    );

    RegionAnalysis {
        region,
        history,
        forecast,
        shocks,
        convergence,
        trend,
        risk,
        traces,
        unavailable: table.unavailable,
        warnings,
    }
}

/// Analyze one region from its fetched sources.
///
/// Never fails: a region without usable data yields an empty analysis with
/// a warning.
///
/// # Example
/// ```ignore
/// let analysis = analyze_region(region, &fetches, &PipelineConfig::default());
/// println!("{}", analysis.risk.tier);
/// ```
pub fn analyze_region(
    region: Region,
    sources: &[SourceFetch],
    config: &PipelineConfig,
) -> RegionAnalysis {
    let context = TraceContext::new(config.trace_tolerance);
    run(config, &HoltForecaster::new(config.forecast), &context, region, sources)
}

/// Long-lived pipeline holding the trace counters and the result cache.
///
/// Safe to share across threads.
pub struct BehaviorPipeline {
    config: PipelineConfig,
    context: TraceContext,
    cache: ResultCache<RegionAnalysis>,
    forecaster: Box<dyn Forecaster>,
}

impl BehaviorPipeline {
    /// Create a pipeline from a validated config
    pub fn new(config: PipelineConfig) -> Result<Self, ComputeError> {
        config.validate()?;
        Ok(Self {
            context: TraceContext::new(config.trace_tolerance),
            cache: ResultCache::with_capacity(config.cache_capacity)?,
            forecaster: Box::new(HoltForecaster::new(config.forecast)),
            config,
        })
    }

    /// Load the config from JSON
    pub fn from_json(json: &str) -> Result<Self, ComputeError> {
        Self::new(PipelineConfig::from_json(json)?)
    }

    /// Replace the forecasting strategy
    pub fn with_forecaster(mut self, forecaster: Box<dyn Forecaster>) -> Self {
        self.forecaster = forecaster;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn trace_context(&self) -> &TraceContext {
        &self.context
    }

    pub fn cache(&self) -> &ResultCache<RegionAnalysis> {
        &self.cache
    }

    /// Analyze without consulting the cache
    pub fn analyze(&self, region: Region, sources: &[SourceFetch]) -> RegionAnalysis {
        run(&self.config, self.forecaster.as_ref(), &self.context, region, sources)
    }

    /// Analyze a validated source document
    pub fn analyze_document(&self, document: &SourcesDocument) -> Result<RegionAnalysis, ComputeError> {
        document.validate()?;
        Ok(self.analyze(document.region.clone(), &document.fetches()))
    }

    /// Cached analysis keyed by (region, lookback, horizon).
    ///
    /// `fetch` runs only on a cache miss; a fetch error is returned and
    /// nothing is cached.
    pub fn analyze_cached<F>(&self, region: &Region, fetch: F) -> Result<Arc<RegionAnalysis>, ComputeError>
    where
        F: FnOnce() -> Result<Vec<SourceFetch>, ComputeError>,
    {
        let key = CacheKey::new(
            region.id.clone(),
            self.config.lookback_days,
            self.config.horizon_days,
        );
        self.cache.get_or_try_insert(key, || {
            let sources = fetch()?;
            Ok(self.analyze(region.clone(), &sources))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Cadence, RiskTier, SeriesPoint, SourceSeries, SubIndexKind};
    use chrono::{Duration, NaiveDate};
    use std::cell::Cell;
    use std::collections::BTreeMap;

    fn day(offset: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, 1).unwrap() + Duration::days(offset)
    }

    fn series(name: &str, days: i64, f: impl Fn(i64) -> f64) -> SourceFetch {
        let points = (0..days).map(|d| SeriesPoint::new(day(d), f(d))).collect();
        SourceSeries::new(name, Cadence::Daily, points).into()
    }

    fn sample_sources() -> Vec<SourceFetch> {
        vec![
            series("market_volatility", 40, |d| 0.3 + d as f64 * 0.01),
            series("economic_uncertainty", 40, |d| 0.4 + d as f64 * 0.005),
            series("health_risk", 40, |d| 0.2 + d as f64 * 0.012),
            series("mobility", 40, |d| 0.8 - d as f64 * 0.01),
            series("search_interest", 40, |d| 0.5 + 0.1 * ((d as f64) * 0.7).sin()),
            series("political_tension", 40, |_| 0.4),
            SourceFetch::unavailable("crime_signal", "upstream timeout"),
        ]
    }

    fn region() -> Region {
        Region::new("us-ca", "California")
    }

    #[test]
    fn test_analyze_region() {
        let analysis = analyze_region(region(), &sample_sources(), &PipelineConfig::default());

        assert_eq!(analysis.history.len(), 40);
        assert_eq!(analysis.forecast.len(), 7);
        assert_eq!(analysis.forecast[0].timestamp, day(40));
        assert_eq!(analysis.trend, Some(TrendDirection::Increasing));
        assert!(analysis.convergence.score > 0.0);
        assert!(analysis.traces.all_valid());
        assert!(analysis
            .warnings
            .iter()
            .any(|w| w.contains("crime_signal")));
        for row in &analysis.history {
            assert!((0.0..=1.0).contains(&row.behavior_index));
        }
    }

    #[test]
    fn test_no_data_yields_empty_analysis() {
        let analysis = analyze_region(
            region(),
            &[
                SourceFetch::unavailable("mobility", "down"),
                SourceSeries::new("crime_signal", Cadence::Daily, vec![SeriesPoint::new(day(0), f64::NAN)]).into(),
            ],
            &PipelineConfig::default(),
        );
        assert!(analysis.history.is_empty());
        assert!(analysis.forecast.is_empty());
        assert_eq!(analysis.risk.base_risk, 0.5);
        assert_eq!(analysis.risk.tier, RiskTier::Watchlist);

        // Per-source reasons survive the no-data path
        assert_eq!(
            analysis.unavailable,
            vec![
                SourceIssue {
                    source: "crime_signal".to_string(),
                    reason: "no finite observations".to_string(),
                },
                SourceIssue {
                    source: "mobility".to_string(),
                    reason: "down".to_string(),
                },
            ]
        );
        assert_eq!(analysis.warnings.len(), 3);
        assert!(analysis.warnings[0].starts_with("No data"));
        assert!(analysis.warnings.iter().any(|w| w == "source 'mobility' unavailable: down"));
    }

    #[test]
    fn test_stray_timestamp_does_not_anchor_a_huge_grid() {
        let mut points: Vec<SeriesPoint> = (0..30).map(|d| SeriesPoint::new(day(d), 0.5)).collect();
        points.push(SeriesPoint::new(NaiveDate::from_ymd_opt(1, 1, 1).unwrap(), 0.9));
        let sources = vec![SourceSeries::new("mobility", Cadence::Daily, points).into()];

        let analysis = analyze_region(region(), &sources, &PipelineConfig::default());

        assert_eq!(analysis.history.len(), 30);
        assert_eq!(analysis.history[0].timestamp, day(0));
        assert!(analysis.warnings.iter().any(|w| w.contains("dropped")));
    }

    #[test]
    fn test_lookback_trims_history() {
        let config = PipelineConfig::default().with_lookback_days(10);
        let analysis = analyze_region(region(), &sample_sources(), &config);
        assert_eq!(analysis.history.len(), 10);
        assert_eq!(analysis.history[0].timestamp, day(30));
    }

    #[test]
    fn test_trend_direction() {
        let rows = |values: &[f64]| -> Vec<BehaviorIndexRow> {
            values
                .iter()
                .enumerate()
                .map(|(i, v)| BehaviorIndexRow {
                    timestamp: day(i as i64),
                    signals: BTreeMap::new(),
                    sub_indices: BTreeMap::new(),
                    behavior_index: *v,
                })
                .collect()
        };
        assert_eq!(trend_direction(&rows(&[0.5]), 7), None);
        assert_eq!(trend_direction(&rows(&[0.5, 0.6]), 7), Some(TrendDirection::Increasing));
        assert_eq!(trend_direction(&rows(&[0.5, 0.49]), 7), Some(TrendDirection::Stable));
        assert_eq!(
            trend_direction(&rows(&[0.9, 0.5, 0.5, 0.5]), 2),
            Some(TrendDirection::Stable)
        );
        assert_eq!(
            trend_direction(&rows(&[0.9, 0.5, 0.5, 0.5]), 3),
            Some(TrendDirection::Decreasing)
        );
    }

    #[test]
    fn test_pipeline_rejects_invalid_config() {
        let config = PipelineConfig::default().with_cache_capacity(0);
        assert!(matches!(
            BehaviorPipeline::new(config),
            Err(ComputeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_analyze_cached_fetches_once() {
        let pipeline = BehaviorPipeline::new(PipelineConfig::default()).unwrap();
        let fetches = Cell::new(0);
        let fetch = || {
            fetches.set(fetches.get() + 1);
            Ok(sample_sources())
        };

        let first = pipeline.analyze_cached(&region(), fetch).unwrap();
        let second = pipeline.analyze_cached(&region(), fetch).unwrap();
        assert_eq!(fetches.get(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pipeline.cache().len(), 1);
    }

    #[test]
    fn test_analyze_cached_does_not_cache_fetch_errors() {
        let pipeline = BehaviorPipeline::new(PipelineConfig::default()).unwrap();
        let result = pipeline.analyze_cached(&region(), || {
            Err(ComputeError::ParseError("upstream".to_string()))
        });
        assert!(result.is_err());
        assert!(pipeline.cache().is_empty());
    }

    #[test]
    fn test_trace_counters_accumulate() {
        let pipeline = BehaviorPipeline::new(PipelineConfig::default()).unwrap();
        pipeline.analyze(region(), &sample_sources());
        let stats = pipeline.trace_context().stats();
        assert_eq!(stats.built, 4);
        assert_eq!(stats.invalid, 0);

        pipeline.trace_context().reset();
        assert_eq!(pipeline.trace_context().stats().built, 0);
    }

    #[test]
    fn test_sub_indices_present_for_supplied_signals() {
        let analysis = analyze_region(region(), &sample_sources(), &PipelineConfig::default());
        let latest = analysis.latest().unwrap();
        assert!(latest.sub_index(SubIndexKind::EconomicStress).is_some());
        assert!(latest.sub_index(SubIndexKind::MobilityActivity).is_some());
    }
}
