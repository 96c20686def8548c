//! Core types for the Pulse Index pipeline
//!
//! This module defines the value objects that flow through each stage of the
//! pipeline: source series, harmonized rows, sub-index values, behavior index
//! rows, shock events, convergence results, and risk classifications.
//!
//! Every type here is built once per pipeline run and never mutated after
//! construction.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Native sampling cadence of a source series.
///
/// Cadence decides how the harmonizer fills gaps on the daily grid.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// Continuous daily signal, linearly interpolated across gaps
    #[default]
    Daily,
    /// Weekday-only series (markets), short forward-fill
    Trading,
    /// Weekly releases, long forward-fill
    Weekly,
    /// Monthly releases, longest forward-fill
    Monthly,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Daily => "daily",
            Cadence::Trading => "trading",
            Cadence::Weekly => "weekly",
            Cadence::Monthly => "monthly",
        }
    }
}

/// One observation of a source signal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Calendar day of the observation (time-of-day is discarded)
    #[serde(deserialize_with = "deserialize_day")]
    pub timestamp: NaiveDate,
    /// Value, already normalized by the ingestion layer
    pub value: f64,
}

impl SeriesPoint {
    pub fn new(timestamp: NaiveDate, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Accept `YYYY-MM-DD`, naive `YYYY-MM-DDTHH:MM:SS`, or RFC 3339 timestamps.
///
/// Offsets are dropped after taking the local calendar day, which puts every
/// source on the same timezone-naive daily grid.
fn deserialize_day<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_day(&raw).map_err(serde::de::Error::custom)
}

/// Parse a calendar day from the accepted timestamp formats
pub fn parse_day(raw: &str) -> Result<NaiveDate, String> {
    let trimmed = raw.trim();
    if let Ok(day) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(day);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S") {
        return Ok(dt.date());
    }
    Err(format!("unrecognized timestamp '{trimmed}'"))
}

/// A named, externally supplied time series for one signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSeries {
    /// Signal name (column name in the harmonized table)
    pub name: String,
    /// Native sampling cadence
    #[serde(default)]
    pub cadence: Cadence,
    /// Observations, in any order
    pub points: Vec<SeriesPoint>,
}

impl SourceSeries {
    pub fn new(name: impl Into<String>, cadence: Cadence, points: Vec<SeriesPoint>) -> Self {
        Self {
            name: name.into(),
            cadence,
            points,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Result of fetching one source, as handed to the harmonizer.
///
/// An unavailable source still contributes an all-missing column so that
/// downstream stages see it as "no signal" rather than as absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceFetch {
    Ok(SourceSeries),
    Unavailable {
        source: String,
        #[serde(default)]
        cadence: Cadence,
        reason: String,
    },
}

impl SourceFetch {
    pub fn unavailable(source: impl Into<String>, reason: impl Into<String>) -> Self {
        SourceFetch::Unavailable {
            source: source.into(),
            cadence: Cadence::Daily,
            reason: reason.into(),
        }
    }

    /// Name of the signal this fetch was for
    pub fn name(&self) -> &str {
        match self {
            SourceFetch::Ok(series) => &series.name,
            SourceFetch::Unavailable { source, .. } => source,
        }
    }
}

impl From<SourceSeries> for SourceFetch {
    fn from(series: SourceSeries) -> Self {
        SourceFetch::Ok(series)
    }
}

/// Geographic region the analysis is for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl Region {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// One calendar day on the harmonized grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarmonizedRow {
    pub timestamp: NaiveDate,
    /// One field per known signal; `None` when still missing after fill
    pub values: BTreeMap<String, Option<f64>>,
}

impl HarmonizedRow {
    /// Finite value of a signal on this day, if any
    pub fn value(&self, signal: &str) -> Option<f64> {
        self.values
            .get(signal)
            .copied()
            .flatten()
            .filter(|v| v.is_finite())
    }
}

/// Named sub-indices feeding the Behavior Index
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SubIndexKind {
    EconomicStress,
    EnvironmentalStress,
    MobilityActivity,
    DigitalAttention,
    PublicHealthStress,
    PoliticalStress,
    CrimeStress,
    MisinformationStress,
    SocialCohesionStress,
}

impl SubIndexKind {
    pub const ALL: [SubIndexKind; 9] = [
        SubIndexKind::EconomicStress,
        SubIndexKind::EnvironmentalStress,
        SubIndexKind::MobilityActivity,
        SubIndexKind::DigitalAttention,
        SubIndexKind::PublicHealthStress,
        SubIndexKind::PoliticalStress,
        SubIndexKind::CrimeStress,
        SubIndexKind::MisinformationStress,
        SubIndexKind::SocialCohesionStress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubIndexKind::EconomicStress => "economic_stress",
            SubIndexKind::EnvironmentalStress => "environmental_stress",
            SubIndexKind::MobilityActivity => "mobility_activity",
            SubIndexKind::DigitalAttention => "digital_attention",
            SubIndexKind::PublicHealthStress => "public_health_stress",
            SubIndexKind::PoliticalStress => "political_stress",
            SubIndexKind::CrimeStress => "crime_stress",
            SubIndexKind::MisinformationStress => "misinformation_stress",
            SubIndexKind::SocialCohesionStress => "social_cohesion_stress",
        }
    }

    /// Higher activity means lower disruption for this sub-index
    pub fn is_inverted(&self) -> bool {
        matches!(self, SubIndexKind::MobilityActivity)
    }

    /// Map a sub-index value onto the stress scale (higher = more disruption)
    pub fn stress_value(&self, value: f64) -> f64 {
        if self.is_inverted() {
            1.0 - value
        } else {
            value
        }
    }
}

impl fmt::Display for SubIndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raw component that fed a sub-index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexComponent {
    /// Component identifier (the harmonized signal name)
    pub id: String,
    /// Value used in the blend, in [0, 1], after inversion if any
    pub value: f64,
    /// Weight inside the sub-index
    pub weight: f64,
    /// Source family description
    pub source: String,
    /// True when the raw value was missing or non-finite and 0.5 was used
    pub imputed: bool,
}

/// A sub-index score attached to a harmonized row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubIndexValue {
    pub name: SubIndexKind,
    /// Score in [0, 1]
    pub value: f64,
    /// Effective (renormalized) weight in the Behavior Index
    pub weight: f64,
    /// Contribution to the Behavior Index (after inversion, before clip)
    pub contribution: f64,
    pub components: Vec<IndexComponent>,
}

/// A harmonized row augmented with sub-indices and the Behavior Index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorIndexRow {
    pub timestamp: NaiveDate,
    /// Harmonized signal values this row was computed from
    pub signals: BTreeMap<String, Option<f64>>,
    pub sub_indices: BTreeMap<SubIndexKind, SubIndexValue>,
    /// Weighted Behavior Index in [0, 1]
    pub behavior_index: f64,
}

impl BehaviorIndexRow {
    /// Value of a sub-index on this row, if computed
    pub fn sub_index(&self, kind: SubIndexKind) -> Option<f64> {
        self.sub_indices.get(&kind).map(|s| s.value)
    }
}

/// Anomaly severity, ordered from least to most severe
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Mild,
    Moderate,
    High,
    Severe,
}

impl Severity {
    /// Map a threshold multiple (statistic / threshold, so >= 1.0 when
    /// flagged) onto a severity. Shared by every detection method.
    pub fn from_magnitude(ratio: f64) -> Self {
        if !ratio.is_finite() || ratio >= 2.5 {
            Severity::Severe
        } else if ratio >= 1.75 {
            Severity::High
        } else if ratio >= 1.25 {
            Severity::Moderate
        } else {
            Severity::Mild
        }
    }

    /// Contribution of one event of this severity to the risk score
    pub fn risk_weight(&self) -> f64 {
        match self {
            Severity::Mild => 0.05,
            Severity::Moderate => 0.10,
            Severity::High => 0.15,
            Severity::Severe => 0.25,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Mild => "mild",
            Severity::Moderate => "moderate",
            Severity::High => "high",
            Severity::Severe => "severe",
        }
    }
}

/// Statistical method that flagged a shock
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    ZScore,
    Delta,
    Ewma,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::ZScore => "z_score",
            DetectionMethod::Delta => "delta",
            DetectionMethod::Ewma => "ewma",
        }
    }
}

/// A point anomaly in one sub-index series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShockEvent {
    pub timestamp: NaiveDate,
    pub index_name: SubIndexKind,
    pub method: DetectionMethod,
    pub severity: Severity,
    /// Signed deviation from the method's reference (rolling mean,
    /// previous value, or EWMA)
    pub delta: f64,
    /// Sub-index value at the flagged point
    pub value: f64,
    /// Statistic expressed as a multiple of its threshold
    pub magnitude: f64,
}

/// A correlated pair of sub-indices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPair {
    pub index_a: SubIndexKind,
    pub index_b: SubIndexKind,
    pub correlation: f64,
}

/// A named multi-signal pattern that is currently active
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergencePattern {
    pub name: String,
    pub indices: Vec<SubIndexKind>,
    pub description: String,
    /// Pattern strength in [0, 1]; reported only above the threshold
    pub strength: f64,
    /// Mean current stress level of the group
    pub stress_level: f64,
    /// Mean change of the group's stress over the trend window
    pub trend: f64,
}

/// Cross-signal convergence analysis
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceResult {
    /// Mean absolute off-diagonal correlation scaled to [0, 100]
    pub score: f64,
    pub reinforcing_signals: Vec<SignalPair>,
    pub conflicting_signals: Vec<SignalPair>,
    pub patterns: Vec<ConvergencePattern>,
    /// Row/column labels of `correlation_matrix`
    pub indices: Vec<SubIndexKind>,
    /// Symmetric matrix with unit diagonal
    pub correlation_matrix: Vec<Vec<f64>>,
}

impl ConvergenceResult {
    /// Correlation between two sub-indices, if both were analyzed
    pub fn correlation(&self, a: SubIndexKind, b: SubIndexKind) -> Option<f64> {
        let i = self.indices.iter().position(|k| *k == a)?;
        let j = self.indices.iter().position(|k| *k == b)?;
        Some(self.correlation_matrix[i][j])
    }
}

/// Discrete risk tiers, ordered from calmest to most severe
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Stable,
    Watchlist,
    Elevated,
    High,
    Critical,
}

impl RiskTier {
    /// Lower risk-score bound of each tier, in ascending tier order
    pub const THRESHOLDS: [(RiskTier, f64); 5] = [
        (RiskTier::Stable, 0.0),
        (RiskTier::Watchlist, 0.3),
        (RiskTier::Elevated, 0.5),
        (RiskTier::High, 0.7),
        (RiskTier::Critical, 0.85),
    ];

    /// Highest tier whose lower bound is at or below `score`
    pub fn from_score(score: f64) -> Self {
        RiskTier::THRESHOLDS
            .iter()
            .rev()
            .find(|(_, bound)| score >= *bound)
            .map(|(tier, _)| *tier)
            .unwrap_or(RiskTier::Stable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Stable => "stable",
            RiskTier::Watchlist => "watchlist",
            RiskTier::Elevated => "elevated",
            RiskTier::High => "high",
            RiskTier::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recent direction of the Behavior Index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

impl TrendDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Increasing => "increasing",
            TrendDirection::Decreasing => "decreasing",
            TrendDirection::Stable => "stable",
        }
    }

    /// Lenient parse used at the CLI/FFI boundary; unknown text is `None`
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "increasing" | "up" => Some(TrendDirection::Increasing),
            "decreasing" | "down" => Some(TrendDirection::Decreasing),
            "stable" | "flat" => Some(TrendDirection::Stable),
            _ => None,
        }
    }
}

/// Risk classification for the latest state of a region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskClassification {
    pub tier: RiskTier,
    /// Clamped risk score in [0, 1]
    pub risk_score: f64,
    pub base_risk: f64,
    pub shock_adjustment: f64,
    pub convergence_adjustment: f64,
    pub trend_adjustment: f64,
    pub contributing_factors: Vec<String>,
}

/// One forecast step for the Behavior Index
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: NaiveDate,
    pub prediction: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_day_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(parse_day("2024-03-01").unwrap(), expected);
        assert_eq!(parse_day("2024-03-01T23:15:00").unwrap(), expected);
        assert_eq!(parse_day("2024-03-01T23:15:00-05:00").unwrap(), expected);
        assert!(parse_day("03/01/2024").is_err());
    }

    #[test]
    fn test_severity_is_totally_ordered() {
        assert!(Severity::Mild < Severity::Moderate);
        assert!(Severity::Moderate < Severity::High);
        assert!(Severity::High < Severity::Severe);
        assert_eq!(Severity::from_magnitude(1.0), Severity::Mild);
        assert_eq!(Severity::from_magnitude(1.5), Severity::Moderate);
        assert_eq!(Severity::from_magnitude(2.0), Severity::High);
        assert_eq!(Severity::from_magnitude(3.0), Severity::Severe);
        assert_eq!(Severity::from_magnitude(f64::INFINITY), Severity::Severe);
    }

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(RiskTier::from_score(0.0), RiskTier::Stable);
        assert_eq!(RiskTier::from_score(0.29), RiskTier::Stable);
        assert_eq!(RiskTier::from_score(0.3), RiskTier::Watchlist);
        assert_eq!(RiskTier::from_score(0.5), RiskTier::Elevated);
        assert_eq!(RiskTier::from_score(0.7), RiskTier::High);
        assert_eq!(RiskTier::from_score(0.85), RiskTier::Critical);
        assert_eq!(RiskTier::from_score(1.0), RiskTier::Critical);
    }

    #[test]
    fn test_source_fetch_deserialize() {
        let json = r#"{"status": "unavailable", "source": "search_interest", "reason": "timeout"}"#;
        let fetch: SourceFetch = serde_json::from_str(json).unwrap();
        assert_eq!(fetch.name(), "search_interest");

        let json = r#"{"status": "ok", "name": "mobility", "cadence": "daily",
            "points": [{"timestamp": "2024-01-02T10:00:00Z", "value": 0.4}]}"#;
        let fetch: SourceFetch = serde_json::from_str(json).unwrap();
        match fetch {
            SourceFetch::Ok(series) => {
                assert_eq!(series.points.len(), 1);
                assert_eq!(
                    series.points[0].timestamp,
                    NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
                );
            }
            other => panic!("unexpected fetch {other:?}"),
        }
    }

    #[test]
    fn test_mobility_is_the_only_inverted_index() {
        let inverted: Vec<_> = SubIndexKind::ALL
            .iter()
            .filter(|k| k.is_inverted())
            .collect();
        assert_eq!(inverted, vec![&SubIndexKind::MobilityActivity]);
        assert!((SubIndexKind::MobilityActivity.stress_value(0.8) - 0.2).abs() < 1e-12);
    }
}
