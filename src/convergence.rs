//! Cross-signal convergence analysis
//!
//! Measures how strongly sub-indices move together over the analyzed
//! history, lists strongly reinforcing and conflicting pairs, and evaluates
//! a small catalogue of named multi-signal patterns.

use crate::trace::{DecisionTrace, TraceComponent, TraceContext};
use crate::types::{BehaviorIndexRow, ConvergencePattern, ConvergenceResult, SignalPair, SubIndexKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

pub const DEFAULT_THRESHOLD: f64 = 0.6;
pub const DEFAULT_PATTERN_THRESHOLD: f64 = 0.5;
pub const DEFAULT_TREND_WINDOW: usize = 7;

/// Weight of the current stress level in pattern strength
const PATTERN_LEVEL_WEIGHT: f64 = 0.7;
/// Trend is scaled by this factor and capped at `PATTERN_TREND_CAP`
const PATTERN_TREND_SCALE: f64 = 2.0;
const PATTERN_TREND_CAP: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// |correlation| at or above which a pair is reinforcing/conflicting
    pub threshold: f64,
    /// Minimum strength for a pattern to be reported
    pub pattern_threshold: f64,
    /// Rows between the "now" and "before" values of a pattern trend
    pub trend_window: usize,
    /// Explicit sub-index subset; `None` analyzes every sub-index present
    pub indices: Option<Vec<SubIndexKind>>,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            pattern_threshold: DEFAULT_PATTERN_THRESHOLD,
            trend_window: DEFAULT_TREND_WINDOW,
            indices: None,
        }
    }
}

/// A named group of sub-indices whose joint stress is worth surfacing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternDefinition {
    pub name: &'static str,
    pub indices: &'static [SubIndexKind],
    pub description: &'static str,
}

pub const PATTERN_CATALOGUE: [PatternDefinition; 5] = [
    PatternDefinition {
        name: "economic_health_spiral",
        indices: &[SubIndexKind::EconomicStress, SubIndexKind::PublicHealthStress],
        description: "Economic strain and public health stress rising together",
    },
    PatternDefinition {
        name: "environmental_displacement",
        indices: &[SubIndexKind::EnvironmentalStress, SubIndexKind::MobilityActivity],
        description: "Environmental stress coinciding with disrupted mobility",
    },
    PatternDefinition {
        name: "attention_crisis",
        indices: &[SubIndexKind::DigitalAttention, SubIndexKind::PublicHealthStress],
        description: "Elevated search attention around a public health concern",
    },
    PatternDefinition {
        name: "civil_unrest_risk",
        indices: &[
            SubIndexKind::PoliticalStress,
            SubIndexKind::SocialCohesionStress,
            SubIndexKind::CrimeStress,
        ],
        description: "Political tension, weakening cohesion and crime moving together",
    },
    PatternDefinition {
        name: "information_disorder",
        indices: &[
            SubIndexKind::MisinformationStress,
            SubIndexKind::DigitalAttention,
            SubIndexKind::PoliticalStress,
        ],
        description: "Misinformation amplified by attention during political stress",
    },
];

/// Convergence engine
#[derive(Debug, Clone, Default)]
pub struct ConvergenceEngine {
    config: ConvergenceConfig,
}

impl ConvergenceEngine {
    pub fn new(config: ConvergenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConvergenceConfig {
        &self.config
    }

    /// Analyze the configured subset (or every sub-index present)
    pub fn analyze(&self, history: &[BehaviorIndexRow]) -> ConvergenceResult {
        self.analyze_subset(history, self.config.indices.as_deref())
    }

    /// Analyze an explicit subset of sub-indices
    pub fn analyze_subset(
        &self,
        history: &[BehaviorIndexRow],
        subset: Option<&[SubIndexKind]>,
    ) -> ConvergenceResult {
        let candidates: BTreeSet<SubIndexKind> = match subset {
            Some(kinds) => kinds.iter().copied().collect(),
            None => history
                .iter()
                .flat_map(|row| row.sub_indices.keys().copied())
                .collect(),
        };

        // Rows where every selected sub-index is missing carry no information
        let rows: Vec<&BehaviorIndexRow> = history
            .iter()
            .filter(|row| candidates.iter().any(|k| finite(row, *k).is_some()))
            .collect();

        let (indices, columns): (Vec<SubIndexKind>, Vec<Vec<Option<f64>>>) = candidates
            .into_iter()
            .map(|kind| (kind, rows.iter().map(|row| finite(row, kind)).collect::<Vec<_>>()))
            .filter(|(_, column)| column.iter().flatten().count() >= 2)
            .unzip();

        if indices.len() < 2 || rows.len() < 2 {
            debug!(
                columns = indices.len(),
                rows = rows.len(),
                "not enough data for convergence analysis"
            );
            return ConvergenceResult::default();
        }

        let mut matrix = correlation_matrix(&columns);
        let repaired = symmetrize(&mut matrix);
        if repaired > 0 {
            warn!(repaired, "correlation matrix was asymmetric; averaged off-diagonal pairs");
        }

        let score = clip(mean_abs_off_diagonal(&matrix) * 100.0, 0.0, 100.0);

        let mut reinforcing = Vec::new();
        let mut conflicting = Vec::new();
        for i in 0..indices.len() {
            for j in (i + 1)..indices.len() {
                let correlation = matrix[i][j];
                let pair = SignalPair {
                    index_a: indices[i],
                    index_b: indices[j],
                    correlation,
                };
                if correlation >= self.config.threshold {
                    reinforcing.push(pair);
                } else if correlation <= -self.config.threshold {
                    conflicting.push(pair);
                }
            }
        }
        sort_pairs(&mut reinforcing);
        sort_pairs(&mut conflicting);

        let patterns = self.detect_patterns(history, &indices);

        debug!(
            score,
            columns = indices.len(),
            rows = rows.len(),
            reinforcing = reinforcing.len(),
            conflicting = conflicting.len(),
            patterns = patterns.len(),
            "convergence analysis complete"
        );

        ConvergenceResult {
            score,
            reinforcing_signals: reinforcing,
            conflicting_signals: conflicting,
            patterns,
            indices,
            correlation_matrix: matrix,
        }
    }

    /// Evaluate catalogue patterns whose sub-indices were all analyzed
    pub fn detect_patterns(
        &self,
        history: &[BehaviorIndexRow],
        available: &[SubIndexKind],
    ) -> Vec<ConvergencePattern> {
        let mut patterns: Vec<ConvergencePattern> = PATTERN_CATALOGUE
            .iter()
            .filter(|def| def.indices.iter().all(|k| available.contains(k)))
            .filter_map(|def| self.evaluate_pattern(def, history))
            .filter(|p| p.strength > self.config.pattern_threshold)
            .collect();

        patterns.sort_by(|a, b| {
            b.strength
                .total_cmp(&a.strength)
                .then_with(|| a.name.cmp(&b.name))
        });
        patterns
    }

    fn evaluate_pattern(
        &self,
        def: &PatternDefinition,
        history: &[BehaviorIndexRow],
    ) -> Option<ConvergencePattern> {
        let mut levels = Vec::with_capacity(def.indices.len());
        let mut trends = Vec::with_capacity(def.indices.len());

        for kind in def.indices {
            let stress: Vec<f64> = history
                .iter()
                .filter_map(|row| finite(row, *kind))
                .map(|v| kind.stress_value(v))
                .collect();
            let latest = *stress.last()?;
            let earlier_at = (stress.len() - 1).saturating_sub(self.config.trend_window);
            levels.push(latest);
            trends.push(latest - stress[earlier_at]);
        }

        let stress_level = mean(&levels);
        let trend = mean(&trends);
        let trend_boost = (trend.max(0.0) * PATTERN_TREND_SCALE).min(PATTERN_TREND_CAP);
        let strength = clip(PATTERN_LEVEL_WEIGHT * stress_level + trend_boost, 0.0, 1.0);

        Some(ConvergencePattern {
            name: def.name.to_string(),
            indices: def.indices.to_vec(),
            description: def.description.to_string(),
            strength,
            stress_level,
            trend,
        })
    }

    /// Trace of the score: one component per unique pair, each its share of
    /// the mean absolute correlation
    pub fn trace(&self, result: &ConvergenceResult, context: &TraceContext) -> DecisionTrace {
        let n = result.indices.len();
        let pair_count = n * n.saturating_sub(1) / 2;
        let mut builder = DecisionTrace::builder("convergence_score", result.score);
        let mut raw = 0.0;

        for i in 0..n {
            for j in (i + 1)..n {
                let share = result.correlation_matrix[i][j].abs() * 100.0 / pair_count as f64;
                raw += share;
                let key = format!("{}|{}", result.indices[i], result.indices[j]);
                builder = builder.component(
                    key,
                    TraceComponent::new(share).with_note(format!(
                        "correlation {:.4}",
                        result.correlation_matrix[i][j]
                    )),
                );
            }
        }

        let clip_adjustment = result.score - raw;
        if pair_count > 0 && clip_adjustment.abs() > 1e-9 {
            builder = builder.component("clip_adjustment", TraceComponent::new(clip_adjustment));
        }

        let indices: Vec<&str> = result.indices.iter().map(|k| k.as_str()).collect();
        let patterns: Vec<&str> = result.patterns.iter().map(|p| p.name.as_str()).collect();
        builder
            .metadata("threshold", self.config.threshold)
            .metadata("indices", serde_json::json!(indices))
            .metadata("reinforcing", result.reinforcing_signals.len())
            .metadata("conflicting", result.conflicting_signals.len())
            .metadata("patterns", serde_json::json!(patterns))
            .build(context)
    }
}

fn finite(row: &BehaviorIndexRow, kind: SubIndexKind) -> Option<f64> {
    row.sub_index(kind).filter(|v| v.is_finite())
}

fn clip(value: f64, lo: f64, hi: f64) -> f64 {
    if value.is_finite() {
        value.clamp(lo, hi)
    } else {
        lo
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Pearson correlation over rows where both columns are present.
///
/// Returns NaN with fewer than two shared rows or zero variance.
pub fn pearson(a: &[Option<f64>], b: &[Option<f64>]) -> f64 {
    let pairs: Vec<(f64, f64)> = a
        .iter()
        .zip(b)
        .filter_map(|(x, y)| Some(((*x)?, (*y)?)))
        .collect();
    if pairs.len() < 2 {
        return f64::NAN;
    }

    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|(_, y)| y).sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in &pairs {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    let denom = (var_x * var_y).sqrt();
    if denom == 0.0 {
        return f64::NAN;
    }
    (cov / denom).clamp(-1.0, 1.0)
}

/// Full pairwise correlation matrix; undefined entries become 0
pub fn correlation_matrix(columns: &[Vec<Option<f64>>]) -> Vec<Vec<f64>> {
    let n = columns.len();
    let mut matrix = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            let r = pearson(&columns[i], &columns[j]);
            matrix[i][j] = if r.is_finite() { r } else { 0.0 };
        }
    }
    matrix
}

/// Force exact symmetry and a unit diagonal. Mismatched off-diagonal pairs
/// are replaced by their average; returns the number of repaired pairs.
pub fn symmetrize(matrix: &mut [Vec<f64>]) -> usize {
    let n = matrix.len();
    let mut repaired = 0;
    for i in 0..n {
        matrix[i][i] = 1.0;
        for j in (i + 1)..n {
            let (upper, lower) = (matrix[i][j], matrix[j][i]);
            if upper != lower {
                let avg = (upper + lower) / 2.0;
                let avg = if avg.is_finite() { avg } else { 0.0 };
                matrix[i][j] = avg;
                matrix[j][i] = avg;
                repaired += 1;
            }
        }
    }
    repaired
}

fn mean_abs_off_diagonal(matrix: &[Vec<f64>]) -> f64 {
    let n = matrix.len();
    let values: Vec<f64> = (0..n)
        .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
        .map(|(i, j)| matrix[i][j].abs())
        .collect();
    mean(&values)
}

/// |correlation| descending, then lexical sub-index names
fn sort_pairs(pairs: &mut [SignalPair]) {
    pairs.sort_by(|a, b| {
        b.correlation
            .abs()
            .total_cmp(&a.correlation.abs())
            .then_with(|| a.index_a.as_str().cmp(b.index_a.as_str()))
            .then_with(|| a.index_b.as_str().cmp(b.index_b.as_str()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubIndexValue;
    use chrono::{Duration, NaiveDate};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn rows(columns: &[(SubIndexKind, Vec<f64>)]) -> Vec<BehaviorIndexRow> {
        let len = columns.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        (0..len)
            .map(|i| {
                let sub_indices: BTreeMap<SubIndexKind, SubIndexValue> = columns
                    .iter()
                    .filter_map(|(kind, values)| {
                        values.get(i).map(|v| {
                            (
                                *kind,
                                SubIndexValue {
                                    name: *kind,
                                    value: *v,
                                    weight: 0.1,
                                    contribution: v * 0.1,
                                    components: vec![],
                                },
                            )
                        })
                    })
                    .collect();
                BehaviorIndexRow {
                    timestamp: start + Duration::days(i as i64),
                    signals: BTreeMap::new(),
                    sub_indices,
                    behavior_index: 0.5,
                }
            })
            .collect()
    }

    fn noise(i: usize) -> f64 {
        ((i * 7919) % 13) as f64 / 13.0 * 0.02 - 0.01
    }

    fn base(i: usize) -> f64 {
        0.5 + 0.3 * (i as f64 * 0.3).sin()
    }

    #[test]
    fn test_opposite_series_score_high() {
        let a: Vec<f64> = (0..40).map(|i| base(i) + noise(i)).collect();
        let b: Vec<f64> = (0..40).map(|i| 1.0 - base(i) + noise(i + 5)).collect();
        let history = rows(&[
            (SubIndexKind::EconomicStress, a),
            (SubIndexKind::DigitalAttention, b),
        ]);

        let result = ConvergenceEngine::default().analyze(&history);
        assert!(result.score > 50.0, "score {}", result.score);
        assert!(result.reinforcing_signals.is_empty());
        assert_eq!(result.conflicting_signals.len(), 1);
        assert!(result.conflicting_signals[0].correlation < -0.9);
    }

    #[test]
    fn test_matrix_symmetric_with_unit_diagonal() {
        let history = rows(&[
            (SubIndexKind::EconomicStress, (0..30).map(|i| base(i) + noise(i)).collect()),
            (SubIndexKind::CrimeStress, (0..30).map(|i| base(i + 3)).collect()),
            (SubIndexKind::PoliticalStress, (0..30).map(|i| noise(i * 3) + 0.4).collect()),
        ]);
        let result = ConvergenceEngine::default().analyze(&history);

        let m = &result.correlation_matrix;
        assert_eq!(m.len(), 3);
        for i in 0..3 {
            assert_eq!(m[i][i], 1.0);
            for j in 0..3 {
                assert_eq!(m[i][j], m[j][i]);
            }
        }
    }

    #[test]
    fn test_symmetrize_averages_mismatch() {
        let mut m = vec![vec![0.9, 0.4], vec![0.6, 1.2]];
        assert_eq!(symmetrize(&mut m), 1);
        assert_eq!(m, vec![vec![1.0, 0.5], vec![0.5, 1.0]]);
    }

    #[test]
    fn test_single_column_is_empty_result() {
        let history = rows(&[(SubIndexKind::EconomicStress, vec![0.1, 0.2, 0.3])]);
        assert_eq!(ConvergenceEngine::default().analyze(&history), ConvergenceResult::default());
        assert_eq!(ConvergenceEngine::default().analyze(&[]), ConvergenceResult::default());
    }

    #[test]
    fn test_constant_column_correlates_as_zero() {
        let history = rows(&[
            (SubIndexKind::EconomicStress, vec![0.5; 10]),
            (SubIndexKind::CrimeStress, (0..10).map(|i| i as f64 / 10.0).collect()),
        ]);
        let result = ConvergenceEngine::default().analyze(&history);
        assert_eq!(result.correlation(SubIndexKind::EconomicStress, SubIndexKind::CrimeStress), Some(0.0));
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_subset_restricts_columns() {
        let history = rows(&[
            (SubIndexKind::EconomicStress, (0..20).map(base).collect()),
            (SubIndexKind::CrimeStress, (0..20).map(|i| base(i + 1)).collect()),
            (SubIndexKind::PoliticalStress, (0..20).map(|i| base(i + 2)).collect()),
        ]);
        let subset = [SubIndexKind::EconomicStress, SubIndexKind::PoliticalStress];
        let result = ConvergenceEngine::default().analyze_subset(&history, Some(&subset));
        assert_eq!(result.indices, subset.to_vec());
    }

    #[test]
    fn test_pair_ordering_is_deterministic() {
        let mut pairs = vec![
            SignalPair { index_a: SubIndexKind::PoliticalStress, index_b: SubIndexKind::CrimeStress, correlation: 0.8 },
            SignalPair { index_a: SubIndexKind::CrimeStress, index_b: SubIndexKind::DigitalAttention, correlation: -0.8 },
            SignalPair { index_a: SubIndexKind::EconomicStress, index_b: SubIndexKind::CrimeStress, correlation: 0.95 },
        ];
        sort_pairs(&mut pairs);
        let names: Vec<&str> = pairs.iter().map(|p| p.index_a.as_str()).collect();
        assert_eq!(names, vec!["economic_stress", "crime_stress", "political_stress"]);
    }

    #[test]
    fn test_pattern_reported_when_group_stressed() {
        let rising: Vec<f64> = (0..14).map(|i| 0.6 + i as f64 * 0.02).collect();
        let history = rows(&[
            (SubIndexKind::EconomicStress, rising.clone()),
            (SubIndexKind::PublicHealthStress, rising),
            (SubIndexKind::CrimeStress, vec![0.1; 14]),
        ]);
        let result = ConvergenceEngine::default().analyze(&history);

        let names: Vec<&str> = result.patterns.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["economic_health_spiral"]);
        let pattern = &result.patterns[0];
        assert!((pattern.stress_level - 0.86).abs() < 1e-9);
        assert!((pattern.trend - 0.14).abs() < 1e-9);
        assert!((pattern.strength - 0.882).abs() < 1e-9);
    }

    #[test]
    fn test_pattern_uses_inverted_mobility() {
        let engine = ConvergenceEngine::default();
        let busy = rows(&[
            (SubIndexKind::EnvironmentalStress, vec![0.8; 10]),
            (SubIndexKind::MobilityActivity, vec![0.9; 10]),
        ]);
        let idle = rows(&[
            (SubIndexKind::EnvironmentalStress, vec![0.8; 10]),
            (SubIndexKind::MobilityActivity, vec![0.1; 10]),
        ]);
        let available = [SubIndexKind::EnvironmentalStress, SubIndexKind::MobilityActivity];

        assert!(engine.detect_patterns(&busy, &available).is_empty());
        let patterns = engine.detect_patterns(&idle, &available);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].name, "environmental_displacement");
    }

    #[test]
    fn test_trace_reconciles_to_score() {
        let history = rows(&[
            (SubIndexKind::EconomicStress, (0..30).map(|i| base(i) + noise(i)).collect()),
            (SubIndexKind::CrimeStress, (0..30).map(|i| base(i + 3)).collect()),
            (SubIndexKind::PoliticalStress, (0..30).map(|i| 1.0 - base(i)).collect()),
        ]);
        let engine = ConvergenceEngine::default();
        let result = engine.analyze(&history);
        let ctx = TraceContext::default();
        let trace = engine.trace(&result, &ctx);

        assert!(trace.is_valid());
        assert_eq!(trace.components.len(), 3);
        assert!(trace.components.contains_key("economic_stress|crime_stress"));
    }
}
