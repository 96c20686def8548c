//! Decision traces and reconciliation
//!
//! Every decision the pipeline makes (a Behavior Index row, a shock list, a
//! convergence score, a risk classification) is wrapped in a
//! [`DecisionTrace`]: a map of named component contributions plus the
//! declared output, and a [`Reconciliation`] checking that the contributions
//! sum to the output within tolerance.
//!
//! Traces are advisory. A failed reconciliation is logged and recorded on the
//! trace and on the [`TraceContext`] counters, but never changes or blocks the
//! decision it describes.
//!
//! Components and metadata live in `BTreeMap`s, so two logically identical
//! traces serialize to identical bytes whatever order they were built in.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Default reconciliation tolerance
pub const DEFAULT_TOLERANCE: f64 = 0.01;

/// Metadata keys starting with this prefix are stripped on sanitization
pub const INTERNAL_PREFIX: &str = "_";

/// One named contribution to a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceComponent {
    /// Amount this component adds to the output
    pub contribution: f64,
    /// Input value the contribution was derived from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Weight applied to `value`, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl TraceComponent {
    /// A bare contribution
    pub fn new(contribution: f64) -> Self {
        Self {
            contribution,
            value: None,
            weight: None,
            note: None,
        }
    }

    /// A `value × weight` contribution
    pub fn weighted(value: f64, weight: f64) -> Self {
        Self {
            contribution: value * weight,
            value: Some(value),
            weight: Some(weight),
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Outcome of checking Σ contributions against the declared output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub sum: f64,
    pub output: f64,
    pub difference: f64,
    pub tolerance: f64,
    pub valid: bool,
    /// Names of the values (`sum`, `output`) that were not finite
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_finite: Vec<String>,
}

impl Reconciliation {
    /// Check that `components` sum to `output` within `tolerance`.
    ///
    /// Non-finite sums or outputs make the reconciliation invalid and are
    /// reported by name; they are never coerced to zero here.
    pub fn check(
        components: &BTreeMap<String, TraceComponent>,
        output: f64,
        tolerance: f64,
    ) -> Self {
        let sum: f64 = components.values().map(|c| c.contribution).sum();

        let mut non_finite = Vec::new();
        if !sum.is_finite() {
            non_finite.push("sum".to_string());
        }
        if !output.is_finite() {
            non_finite.push("output".to_string());
        }

        let difference = (sum - output).abs();
        let valid = non_finite.is_empty() && difference <= tolerance;

        Self {
            sum,
            output,
            difference,
            tolerance,
            valid,
            non_finite,
        }
    }
}

/// Structured, explainable record of one decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrace {
    /// Decision kind, e.g. `behavior_index` or `risk_classification`
    pub decision: String,
    pub output: f64,
    pub components: BTreeMap<String, TraceComponent>,
    pub reconciliation: Reconciliation,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl DecisionTrace {
    pub fn builder(decision: impl Into<String>, output: f64) -> TraceBuilder {
        TraceBuilder {
            decision: decision.into(),
            output,
            components: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.reconciliation.valid
    }

    /// Copy of this trace safe to hand to external consumers.
    ///
    /// Internal metadata (keys starting with `_`) is removed, bounded-score
    /// fields are clipped to their range, and non-finite numbers are replaced
    /// with a safe default. The reconciliation block is carried over from the
    /// raw trace unchanged, so a failure stays visible.
    pub fn sanitized(&self) -> DecisionTrace {
        let components = self
            .components
            .iter()
            .map(|(key, component)| {
                let clean = TraceComponent {
                    contribution: finite_or(component.contribution, 0.0),
                    value: component
                        .value
                        .map(|v| sanitize_number(key, finite_or(v, 0.0))),
                    weight: component.weight.map(|w| finite_or(w, 0.0)),
                    note: component.note.clone(),
                };
                (key.clone(), clean)
            })
            .collect();

        let metadata = self
            .metadata
            .iter()
            .filter(|(key, _)| !is_internal(key))
            .map(|(key, value)| (key.clone(), sanitize_value(key, value)))
            .collect();

        DecisionTrace {
            decision: self.decision.clone(),
            output: finite_or(self.output, 0.0),
            components,
            reconciliation: self.reconciliation.clone(),
            metadata,
        }
    }
}

/// Incremental trace construction
#[derive(Debug, Clone)]
pub struct TraceBuilder {
    decision: String,
    output: f64,
    components: BTreeMap<String, TraceComponent>,
    metadata: BTreeMap<String, Value>,
}

impl TraceBuilder {
    pub fn component(mut self, key: impl Into<String>, component: TraceComponent) -> Self {
        self.components.insert(key.into(), component);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Reconcile and record the trace on `context`
    pub fn build(self, context: &TraceContext) -> DecisionTrace {
        let reconciliation =
            Reconciliation::check(&self.components, self.output, context.tolerance());
        context.record(&self.decision, &reconciliation);

        DecisionTrace {
            decision: self.decision,
            output: self.output,
            components: self.components,
            reconciliation,
            metadata: self.metadata,
        }
    }
}

/// Point-in-time snapshot of trace counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceStats {
    pub built: u64,
    pub invalid: u64,
    pub non_finite: u64,
}

/// Explicitly passed observability context for trace construction.
///
/// Created once per pipeline (or process) and shared by reference. Counters
/// are atomic so one context can serve concurrent callers.
#[derive(Debug)]
pub struct TraceContext {
    tolerance: f64,
    built: AtomicU64,
    invalid: AtomicU64,
    non_finite: AtomicU64,
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE)
    }
}

impl TraceContext {
    pub fn new(tolerance: f64) -> Self {
        let tolerance = if tolerance.is_finite() && tolerance >= 0.0 {
            tolerance
        } else {
            DEFAULT_TOLERANCE
        };
        Self {
            tolerance,
            built: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
            non_finite: AtomicU64::new(0),
        }
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    fn record(&self, decision: &str, reconciliation: &Reconciliation) {
        self.built.fetch_add(1, Ordering::Relaxed);
        if !reconciliation.non_finite.is_empty() {
            self.non_finite.fetch_add(1, Ordering::Relaxed);
        }
        if reconciliation.valid {
            debug!(decision, difference = reconciliation.difference, "trace reconciled");
        } else {
            self.invalid.fetch_add(1, Ordering::Relaxed);
            warn!(
                decision,
                sum = reconciliation.sum,
                output = reconciliation.output,
                difference = reconciliation.difference,
                non_finite = ?reconciliation.non_finite,
                "trace reconciliation failed"
            );
        }
    }

    pub fn stats(&self) -> TraceStats {
        TraceStats {
            built: self.built.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            non_finite: self.non_finite.load(Ordering::Relaxed),
        }
    }

    /// Zero all counters
    pub fn reset(&self) {
        self.built.store(0, Ordering::Relaxed);
        self.invalid.store(0, Ordering::Relaxed);
        self.non_finite.store(0, Ordering::Relaxed);
    }
}

fn is_internal(key: &str) -> bool {
    key.starts_with(INTERNAL_PREFIX)
}

fn finite_or(value: f64, default: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        default
    }
}

/// Range a field name implies, if it names a bounded score
fn bounds_for(name: &str) -> Option<(f64, f64)> {
    if name.ends_with("convergence_score") || name.ends_with("_pct") {
        Some((0.0, 100.0))
    } else if name == "behavior_index"
        || name.ends_with("_score")
        || name.ends_with("_stress")
        || name.ends_with("_activity")
        || name.ends_with("_attention")
        || name.ends_with("confidence")
        || name.ends_with("strength")
    {
        Some((0.0, 1.0))
    } else {
        None
    }
}

fn sanitize_number(name: &str, value: f64) -> f64 {
    match bounds_for(name) {
        Some((lo, hi)) => value.clamp(lo, hi),
        None => value,
    }
}

fn sanitize_value(name: &str, value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !is_internal(key))
                .map(|(key, v)| (key.clone(), sanitize_value(key, v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| sanitize_value(name, v)).collect()),
        Value::Number(n) => match n.as_f64() {
            Some(f) if bounds_for(name).is_some() => Value::from(sanitize_number(name, f)),
            _ => value.clone(),
        },
        // serde_json stores non-finite floats as null
        Value::Null => match bounds_for(name) {
            Some((lo, _)) => Value::from(lo),
            None => Value::Null,
        },
        _ => value.clone(),
    }
}
