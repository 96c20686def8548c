//! Composite Behavior Index
//!
//! Computes bounded sub-indices from harmonized signals, then blends them into
//! the Behavior Index with renormalized weights.
//!
//! Formula:
//! ```text
//! sub_index(k)   = Σ component_value × component_weight      (clipped to [0, 1])
//! behavior_index = Σ stress(k) × effective_weight(k)         (clipped to [0, 1])
//! stress(k)      = 1 − sub_index(k) for mobility_activity, sub_index(k) otherwise
//! ```
//!
//! Missing or non-finite raw components default to a neutral 0.5.

use crate::harmonizer::HarmonizedTable;
use crate::trace::{DecisionTrace, TraceComponent, TraceContext};
use crate::types::{
    BehaviorIndexRow, HarmonizedRow, IndexComponent, SubIndexKind, SubIndexValue,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Value substituted for a missing raw component
pub const NEUTRAL_VALUE: f64 = 0.5;

/// Allowed drift of the configured weight total before rescaling
pub const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

/// Sub-indices expected in a complete configuration
pub const MIN_EXPECTED_SUB_INDICES: usize = 5;

/// One raw signal feeding a sub-index
#[derive(Debug, Clone, Copy)]
pub struct ComponentSpec {
    pub signal: &'static str,
    pub weight: f64,
    /// Map a "higher is better" signal onto the stress scale
    pub invert: bool,
    pub source: &'static str,
}

/// Definition of one sub-index as a blend of raw signals
#[derive(Debug, Clone, Copy)]
pub struct SubIndexDefinition {
    pub kind: SubIndexKind,
    pub components: &'static [ComponentSpec],
}

const fn spec(signal: &'static str, weight: f64, source: &'static str) -> ComponentSpec {
    ComponentSpec {
        signal,
        weight,
        invert: false,
        source,
    }
}

/// Sub-index catalogue; component weights in each entry sum to 1.0
pub const SUB_INDEX_CATALOGUE: [SubIndexDefinition; 9] = [
    SubIndexDefinition {
        kind: SubIndexKind::EconomicStress,
        components: &[
            spec("market_volatility", 0.6, "financial"),
            spec("economic_uncertainty", 0.4, "economic"),
        ],
    },
    SubIndexDefinition {
        kind: SubIndexKind::EnvironmentalStress,
        components: &[
            spec("weather_discomfort", 0.7, "weather"),
            spec("seismic_activity", 0.3, "seismic"),
        ],
    },
    SubIndexDefinition {
        kind: SubIndexKind::MobilityActivity,
        components: &[spec("mobility", 1.0, "mobility")],
    },
    SubIndexDefinition {
        kind: SubIndexKind::DigitalAttention,
        components: &[spec("search_interest", 1.0, "search")],
    },
    SubIndexDefinition {
        kind: SubIndexKind::PublicHealthStress,
        components: &[
            spec("health_risk", 0.7, "health"),
            spec("illness_reports", 0.3, "health"),
        ],
    },
    SubIndexDefinition {
        kind: SubIndexKind::PoliticalStress,
        components: &[spec("political_tension", 1.0, "synthetic")],
    },
    SubIndexDefinition {
        kind: SubIndexKind::CrimeStress,
        components: &[spec("crime_signal", 1.0, "synthetic")],
    },
    SubIndexDefinition {
        kind: SubIndexKind::MisinformationStress,
        components: &[spec("misinformation_signal", 1.0, "synthetic")],
    },
    SubIndexDefinition {
        kind: SubIndexKind::SocialCohesionStress,
        components: &[
            spec("event_tone_negativity", 0.6, "events"),
            ComponentSpec {
                signal: "social_trust",
                weight: 0.4,
                invert: true,
                source: "synthetic",
            },
        ],
    },
];

/// Catalogue entry for a sub-index
pub fn definition(kind: SubIndexKind) -> &'static SubIndexDefinition {
    // The catalogue holds every variant in declaration order
    &SUB_INDEX_CATALOGUE[SubIndexKind::ALL
        .iter()
        .position(|k| *k == kind)
        .unwrap_or_default()]
}

/// Sub-index weights for the Behavior Index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexWeights(BTreeMap<SubIndexKind, f64>);

impl Default for IndexWeights {
    fn default() -> Self {
        Self(BTreeMap::from([
            (SubIndexKind::EconomicStress, 0.20),
            (SubIndexKind::EnvironmentalStress, 0.15),
            (SubIndexKind::MobilityActivity, 0.15),
            (SubIndexKind::DigitalAttention, 0.10),
            (SubIndexKind::PublicHealthStress, 0.10),
            (SubIndexKind::PoliticalStress, 0.10),
            (SubIndexKind::CrimeStress, 0.08),
            (SubIndexKind::MisinformationStress, 0.06),
            (SubIndexKind::SocialCohesionStress, 0.06),
        ]))
    }
}

impl IndexWeights {
    pub fn new(weights: BTreeMap<SubIndexKind, f64>) -> Self {
        Self(weights)
    }

    pub fn get(&self, kind: SubIndexKind) -> Option<f64> {
        self.0.get(&kind).copied()
    }

    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SubIndexKind, f64)> + '_ {
        self.0.iter().map(|(k, w)| (*k, *w))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Weights actually used for blending.
    ///
    /// Negative or non-finite weights count as zero. A total outside
    /// 1.0 ± 0.01 is rescaled by dividing each weight by the total; a zero,
    /// subnormal or infinite total falls back to the default vector.
    pub fn effective(&self) -> IndexWeights {
        let sanitized: BTreeMap<SubIndexKind, f64> = self
            .0
            .iter()
            .map(|(kind, w)| {
                if w.is_finite() && *w >= 0.0 {
                    (*kind, *w)
                } else {
                    warn!(sub_index = %kind, weight = *w, "invalid weight treated as zero");
                    (*kind, 0.0)
                }
            })
            .collect();

        let total: f64 = sanitized.values().sum();
        // Zero, subnormal or overflowing totals cannot be rescaled reliably
        if !total.is_normal() {
            warn!(total, "configured weights cannot be normalized, using default weights");
            return IndexWeights::default();
        }

        if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            info!(total, "renormalizing sub-index weights");
            let rescaled: BTreeMap<SubIndexKind, f64> =
                sanitized.into_iter().map(|(k, w)| (k, w / total)).collect();
            let rescaled_total: f64 = rescaled.values().sum();
            if !rescaled_total.is_finite() || (rescaled_total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
                warn!(total, "renormalized weights are unusable, using default weights");
                return IndexWeights::default();
            }
            return IndexWeights(rescaled);
        }

        IndexWeights(sanitized)
    }
}

/// Composite index engine with a fixed effective weight vector
#[derive(Debug, Clone)]
pub struct CompositeIndexEngine {
    weights: IndexWeights,
}

impl Default for CompositeIndexEngine {
    fn default() -> Self {
        Self::new(&IndexWeights::default())
    }
}

impl CompositeIndexEngine {
    /// Create an engine, renormalizing `weights` once up front
    pub fn new(weights: &IndexWeights) -> Self {
        let weights = weights.effective();
        if weights.len() < MIN_EXPECTED_SUB_INDICES {
            warn!(
                sub_indices = weights.len(),
                expected = MIN_EXPECTED_SUB_INDICES,
                "fewer sub-indices configured than expected"
            );
        }
        Self { weights }
    }

    /// Effective weights used by this engine
    pub fn weights(&self) -> &IndexWeights {
        &self.weights
    }

    /// Compute all sub-indices and the Behavior Index for one row
    pub fn compute_row(&self, row: &HarmonizedRow) -> BehaviorIndexRow {
        let mut sub_indices = BTreeMap::new();
        let mut raw_index = 0.0;

        for (kind, weight) in self.weights.iter() {
            let (value, components) = compute_sub_index(definition(kind), row);
            // Inversion happens before weighting
            let contribution = kind.stress_value(value) * weight;
            raw_index += contribution;

            sub_indices.insert(
                kind,
                SubIndexValue {
                    name: kind,
                    value,
                    weight,
                    contribution,
                    components,
                },
            );
        }

        BehaviorIndexRow {
            timestamp: row.timestamp,
            signals: row.values.clone(),
            sub_indices,
            behavior_index: clip_unit(raw_index),
        }
    }

    /// Compute every row of a harmonized table
    pub fn compute(&self, table: &HarmonizedTable) -> Vec<BehaviorIndexRow> {
        table.rows.iter().map(|row| self.compute_row(row)).collect()
    }

    /// Trace of one row's Behavior Index decision
    pub fn trace_row(&self, row: &BehaviorIndexRow, context: &TraceContext) -> DecisionTrace {
        let mut builder = DecisionTrace::builder("behavior_index", row.behavior_index);
        let mut raw_sum = 0.0;
        let mut imputed = 0usize;

        for (kind, sub) in &row.sub_indices {
            let mut component = TraceComponent::weighted(kind.stress_value(sub.value), sub.weight);
            if kind.is_inverted() {
                component = component.with_note("inverted: 1 - activity");
            }
            raw_sum += component.contribution;
            imputed += sub.components.iter().filter(|c| c.imputed).count();
            builder = builder.component(kind.as_str(), component);
        }

        let clip = row.behavior_index - raw_sum;
        if clip != 0.0 {
            builder = builder.component(
                "clip_adjustment",
                TraceComponent::new(clip).with_note("clipped to [0, 1]"),
            );
        }

        builder
            .metadata("timestamp", row.timestamp.to_string())
            .metadata("behavior_index", row.behavior_index)
            .metadata("imputed_components", imputed)
            .metadata("weight_total", self.weights.total())
            .build(context)
    }

    /// Trace of one sub-index value on a row
    pub fn trace_sub_index(
        &self,
        row: &BehaviorIndexRow,
        kind: SubIndexKind,
        context: &TraceContext,
    ) -> Option<DecisionTrace> {
        let sub = row.sub_indices.get(&kind)?;
        let mut builder = DecisionTrace::builder(format!("sub_index.{kind}"), sub.value);
        let mut raw_sum = 0.0;
        for component in &sub.components {
            let entry = TraceComponent::weighted(component.value, component.weight);
            raw_sum += entry.contribution;
            let entry = if component.imputed {
                entry.with_note("imputed neutral value")
            } else {
                entry
            };
            builder = builder.component(component.id.clone(), entry);
        }
        let clip = sub.value - raw_sum;
        if clip != 0.0 {
            builder = builder.component("clip_adjustment", TraceComponent::new(clip));
        }
        Some(
            builder
                .metadata("timestamp", row.timestamp.to_string())
                .build(context),
        )
    }
}

/// Blend one sub-index from its catalogue components
fn compute_sub_index(
    definition: &SubIndexDefinition,
    row: &HarmonizedRow,
) -> (f64, Vec<IndexComponent>) {
    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    let mut components = Vec::with_capacity(definition.components.len());

    for spec in definition.components {
        let raw = row.value(spec.signal);
        let base = raw.map(clip_unit).unwrap_or(NEUTRAL_VALUE);
        let value = if spec.invert { 1.0 - base } else { base };

        weighted += value * spec.weight;
        total_weight += spec.weight;
        components.push(IndexComponent {
            id: spec.signal.to_string(),
            value,
            weight: spec.weight,
            source: spec.source.to_string(),
            imputed: raw.is_none(),
        });
    }

    let value = if total_weight > 0.0 {
        clip_unit(weighted / total_weight)
    } else {
        NEUTRAL_VALUE
    };
    (value, components)
}

/// Clamp into [0, 1]; monotone, so row order inside the range is preserved.
/// NaN becomes the neutral value.
pub(crate) fn clip_unit(value: f64) -> f64 {
    if value.is_nan() {
        NEUTRAL_VALUE
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn row(values: &[(&str, f64)]) -> HarmonizedRow {
        HarmonizedRow {
            timestamp: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), Some(*v)))
                .collect(),
        }
    }

    #[test]
    fn test_catalogue_covers_every_kind_with_unit_weights() {
        for kind in SubIndexKind::ALL {
            let def = definition(kind);
            assert_eq!(def.kind, kind);
            let total: f64 = def.components.iter().map(|c| c.weight).sum();
            assert!((total - 1.0).abs() < 1e-9, "{kind}");
        }
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        assert!((IndexWeights::default().total() - 1.0).abs() < 1e-9);
        assert_eq!(IndexWeights::default().len(), 9);
    }

    #[test]
    fn test_weights_renormalized_when_drifting() {
        let weights = IndexWeights::new(BTreeMap::from([
            (SubIndexKind::EconomicStress, 2.0),
            (SubIndexKind::EnvironmentalStress, 1.0),
            (SubIndexKind::MobilityActivity, 1.0),
            (SubIndexKind::DigitalAttention, 0.5),
            (SubIndexKind::PublicHealthStress, 0.5),
        ]));
        let effective = weights.effective();
        assert!((effective.total() - 1.0).abs() <= WEIGHT_SUM_TOLERANCE);
        assert!((effective.get(SubIndexKind::EconomicStress).unwrap() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_small_drift_left_alone() {
        let mut map = BTreeMap::new();
        for kind in &SubIndexKind::ALL[..5] {
            map.insert(*kind, 0.201);
        }
        let weights = IndexWeights::new(map);
        assert_eq!(weights.effective(), weights);
    }

    #[test]
    fn test_zero_weights_use_defaults() {
        let weights = IndexWeights::new(BTreeMap::from([
            (SubIndexKind::EconomicStress, 0.0),
            (SubIndexKind::CrimeStress, f64::NAN),
            (SubIndexKind::DigitalAttention, -1.0),
        ]));
        assert_eq!(weights.effective(), IndexWeights::default());
    }

    #[test]
    fn test_missing_components_are_neutral() {
        let engine = CompositeIndexEngine::default();
        let result = engine.compute_row(&row(&[]));
        for sub in result.sub_indices.values() {
            assert!((sub.value - NEUTRAL_VALUE).abs() < 1e-12);
            assert!(sub.components.iter().all(|c| c.imputed));
        }
        assert!((result.behavior_index - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_non_finite_inputs_are_neutral() {
        let engine = CompositeIndexEngine::default();
        let result = engine.compute_row(&row(&[
            ("market_volatility", f64::NAN),
            ("economic_uncertainty", f64::INFINITY),
        ]));
        let economic = &result.sub_indices[&SubIndexKind::EconomicStress];
        assert!((economic.value - 0.5).abs() < 1e-12);
        assert!(result.behavior_index.is_finite());
    }

    #[test]
    fn test_mobility_inverted_before_weighting() {
        let weights = IndexWeights::new(BTreeMap::from([
            (SubIndexKind::EconomicStress, 0.5),
            (SubIndexKind::MobilityActivity, 0.5),
        ]));
        let engine = CompositeIndexEngine::new(&weights);

        let busy = engine.compute_row(&row(&[("market_volatility", 0.5), ("economic_uncertainty", 0.5), ("mobility", 1.0)]));
        assert_eq!(busy.sub_index(SubIndexKind::MobilityActivity), Some(1.0));
        assert!((busy.behavior_index - 0.25).abs() < 1e-12);

        let idle = engine.compute_row(&row(&[("market_volatility", 0.5), ("economic_uncertainty", 0.5), ("mobility", 0.0)]));
        assert!((idle.behavior_index - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_inverted_component_within_sub_index() {
        let engine = CompositeIndexEngine::default();
        let result = engine.compute_row(&row(&[("event_tone_negativity", 1.0), ("social_trust", 1.0)]));
        // 0.6 × 1.0 + 0.4 × (1 − 1.0)
        assert!((result.sub_index(SubIndexKind::SocialCohesionStress).unwrap() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_subnormal_or_overflowing_total_uses_defaults() {
        let tiny = IndexWeights::new(BTreeMap::from([(SubIndexKind::EconomicStress, 1e-310)]));
        assert_eq!(tiny.effective(), IndexWeights::default());

        let huge = IndexWeights::new(BTreeMap::from([
            (SubIndexKind::EconomicStress, f64::MAX),
            (SubIndexKind::CrimeStress, f64::MAX),
        ]));
        assert_eq!(huge.effective(), IndexWeights::default());

        let small = IndexWeights::new(BTreeMap::from([
            (SubIndexKind::EconomicStress, 1e-300),
            (SubIndexKind::CrimeStress, 3e-300),
        ]));
        let effective = small.effective();
        assert!((effective.total() - 1.0).abs() <= WEIGHT_SUM_TOLERANCE);
        assert!((effective.get(SubIndexKind::CrimeStress).unwrap() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_neutral_row_stays_neutral_with_degenerate_weights() {
        let engine = CompositeIndexEngine::new(&IndexWeights::new(BTreeMap::from([(
            SubIndexKind::EconomicStress,
            1e-310,
        )])));
        let result = engine.compute_row(&row(&[]));
        assert!((result.behavior_index - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_clip_unit_sanitizes_nan() {
        assert_eq!(clip_unit(f64::NAN), NEUTRAL_VALUE);
        assert_eq!(clip_unit(f64::INFINITY), 1.0);
        assert_eq!(clip_unit(f64::NEG_INFINITY), 0.0);
        assert_eq!(clip_unit(0.25), 0.25);
    }

    #[test]
    fn test_outputs_bounded_for_extreme_inputs() {
        let engine = CompositeIndexEngine::default();
        let signals = [
            "market_volatility",
            "economic_uncertainty",
            "weather_discomfort",
            "seismic_activity",
            "mobility",
            "search_interest",
            "health_risk",
            "political_tension",
        ];
        for extreme in [-5.0, 0.0, 1.0, 7.5] {
            let values: Vec<(&str, f64)> = signals.iter().map(|s| (*s, extreme)).collect();
            let result = engine.compute_row(&row(&values));
            assert!((0.0..=1.0).contains(&result.behavior_index));
            for sub in result.sub_indices.values() {
                assert!((0.0..=1.0).contains(&sub.value));
            }
        }
    }

    #[test]
    fn test_index_monotone_in_stress_signal() {
        let engine = CompositeIndexEngine::default();
        let mut previous = -1.0;
        for step in 0..=10 {
            let v = step as f64 / 10.0;
            let result = engine.compute_row(&row(&[("market_volatility", v)]));
            assert!(result.behavior_index >= previous);
            previous = result.behavior_index;
        }
    }

    #[test]
    fn test_row_trace_reconciles() {
        let engine = CompositeIndexEngine::default();
        let ctx = TraceContext::default();
        let result = engine.compute_row(&row(&[("market_volatility", 0.9), ("mobility", 0.2), ("search_interest", 0.7)]));

        let trace = engine.trace_row(&result, &ctx);
        assert!(trace.is_valid(), "{:?}", trace.reconciliation);
        assert!(trace.components.contains_key("mobility_activity"));
        assert!(!trace.components.contains_key("clip_adjustment"));

        let sub = engine
            .trace_sub_index(&result, SubIndexKind::EconomicStress, &ctx)
            .unwrap();
        assert!(sub.is_valid());
        assert_eq!(ctx.stats().invalid, 0);
    }
}
