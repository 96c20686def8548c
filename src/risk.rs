//! Risk scoring and tier classification
//!
//! `risk_score = clip(base + shock + convergence + trend, 0, 1)`, then the
//! tier is read off [`RiskTier::THRESHOLDS`]. Inputs are sanitized first so
//! classification cannot fail.

use crate::index::{clip_unit, NEUTRAL_VALUE};
use crate::trace::{DecisionTrace, TraceComponent, TraceContext};
use crate::types::{RiskClassification, RiskTier, Severity, ShockEvent, TrendDirection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Cap on the summed severity weights of all shocks
pub const MAX_SHOCK_ADJUSTMENT: f64 = 0.3;
/// Convergence adjustment is `(score/100 - 0.5) * CONVERGENCE_SCALE`, clipped
pub const CONVERGENCE_SCALE: f64 = 0.4;
pub const MIN_CONVERGENCE_ADJUSTMENT: f64 = -0.1;
pub const MAX_CONVERGENCE_ADJUSTMENT: f64 = 0.2;
pub const INCREASING_TREND_ADJUSTMENT: f64 = 0.1;
pub const DECREASING_TREND_ADJUSTMENT: f64 = -0.05;

/// Inputs to one classification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskInput {
    pub behavior_index: f64,
    #[serde(default)]
    pub shocks: Vec<ShockEvent>,
    #[serde(default)]
    pub convergence_score: Option<f64>,
    #[serde(default)]
    pub trend: Option<TrendDirection>,
}

/// Classify the latest state of a region.
///
/// Non-finite or out-of-range numbers are replaced before use: the
/// Behavior Index falls back to 0.5 and is clamped to [0, 1], the
/// convergence score falls back to 0 and is clamped to [0, 100].
pub fn classify_risk(
    behavior_index: f64,
    shocks: &[ShockEvent],
    convergence_score: Option<f64>,
    trend: Option<TrendDirection>,
) -> RiskClassification {
    let mut factors = Vec::new();

    let base_risk = if behavior_index.is_finite() {
        behavior_index.clamp(0.0, 1.0)
    } else {
        factors.push(format!(
            "Behavior Index input was not a number; using neutral {NEUTRAL_VALUE:.2}"
        ));
        NEUTRAL_VALUE
    };
    let convergence = convergence_score
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 100.0))
        .unwrap_or(0.0);

    let shock_adjustment = shock_adjustment(shocks);
    let convergence_adjustment = ((convergence / 100.0 - 0.5) * CONVERGENCE_SCALE)
        .clamp(MIN_CONVERGENCE_ADJUSTMENT, MAX_CONVERGENCE_ADJUSTMENT);
    let trend_adjustment = match trend {
        Some(TrendDirection::Increasing) => INCREASING_TREND_ADJUSTMENT,
        Some(TrendDirection::Decreasing) => DECREASING_TREND_ADJUSTMENT,
        Some(TrendDirection::Stable) | None => 0.0,
    };

    let raw = base_risk + shock_adjustment + convergence_adjustment + trend_adjustment;
    let risk_score = clip_unit(raw);
    let tier = RiskTier::from_score(risk_score);

    factors.push(format!("Behavior Index at {base_risk:.2}"));
    if !shocks.is_empty() {
        factors.push(describe_shocks(shocks, shock_adjustment));
    }
    if convergence_adjustment > 0.0 {
        factors.push(format!("Strong signal convergence ({convergence:.1}/100)"));
    } else if convergence_adjustment < 0.0 {
        factors.push(format!("Weak signal convergence ({convergence:.1}/100)"));
    }
    match trend {
        Some(TrendDirection::Increasing) => factors.push("Behavior Index trending upward".into()),
        Some(TrendDirection::Decreasing) => factors.push("Behavior Index trending downward".into()),
        _ => {}
    }

    debug!(
        risk_score,
        tier = tier.as_str(),
        shocks = shocks.len(),
        convergence,
        "risk classified"
    );

    RiskClassification {
        tier,
        risk_score,
        base_risk,
        shock_adjustment,
        convergence_adjustment,
        trend_adjustment,
        contributing_factors: factors,
    }
}

fn shock_adjustment(shocks: &[ShockEvent]) -> f64 {
    shocks
        .iter()
        .map(|s| s.severity.risk_weight())
        .sum::<f64>()
        .min(MAX_SHOCK_ADJUSTMENT)
}

fn describe_shocks(shocks: &[ShockEvent], adjustment: f64) -> String {
    let mut counts: BTreeMap<Severity, usize> = BTreeMap::new();
    for shock in shocks {
        *counts.entry(shock.severity).or_insert(0) += 1;
    }
    let breakdown: Vec<String> = counts
        .iter()
        .rev()
        .map(|(severity, n)| format!("{n} {}", severity.as_str()))
        .collect();
    let capped = if adjustment >= MAX_SHOCK_ADJUSTMENT {
        " (capped)"
    } else {
        ""
    };
    format!(
        "{} shock event(s): {}{capped}",
        shocks.len(),
        breakdown.join(", ")
    )
}

/// Stateless classifier with trace support
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskClassifier;

impl RiskClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, input: &RiskInput) -> RiskClassification {
        classify_risk(
            input.behavior_index,
            &input.shocks,
            input.convergence_score,
            input.trend,
        )
    }

    /// Trace whose components are the four adjustments, plus the clamp when
    /// the raw sum left [0, 1]
    pub fn trace(&self, classification: &RiskClassification, context: &TraceContext) -> DecisionTrace {
        let raw = classification.base_risk
            + classification.shock_adjustment
            + classification.convergence_adjustment
            + classification.trend_adjustment;

        let mut builder = DecisionTrace::builder("risk_score", classification.risk_score)
            .component("base_risk", TraceComponent::new(classification.base_risk))
            .component(
                "shock_adjustment",
                TraceComponent::new(classification.shock_adjustment),
            )
            .component(
                "convergence_adjustment",
                TraceComponent::new(classification.convergence_adjustment),
            )
            .component(
                "trend_adjustment",
                TraceComponent::new(classification.trend_adjustment),
            );

        let clamp = classification.risk_score - raw;
        if clamp != 0.0 {
            builder = builder.component(
                "clamp_adjustment",
                TraceComponent::new(clamp).with_note("risk score clamped to [0, 1]"),
            );
        }

        builder
            .metadata("tier", classification.tier.as_str())
            .metadata(
                "contributing_factors",
                serde_json::json!(classification.contributing_factors),
            )
            .build(context)
    }
}
