//! Shock (point anomaly) detection
//!
//! Three independent detectors run over each sub-index series:
//! - **Z-score**: deviation from the trailing window mean in units of trailing std
//! - **Delta**: absolute day-over-day change
//! - **EWMA**: one-step deviation from an exponentially weighted average, in
//!   units of the trailing std of past deviations
//!
//! Each flag is scored as a multiple of its threshold and mapped through the
//! shared [`Severity::from_magnitude`] table. Flags on the same
//! (day, sub-index) merge into one event, keeping the most severe.

use crate::trace::{DecisionTrace, TraceComponent, TraceContext};
use crate::types::{BehaviorIndexRow, DetectionMethod, Severity, ShockEvent, SubIndexKind};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

pub const DEFAULT_WINDOW: usize = 7;
pub const DEFAULT_Z_THRESHOLD: f64 = 2.5;
pub const DEFAULT_DELTA_THRESHOLD: f64 = 0.15;
pub const DEFAULT_EWMA_ALPHA: f64 = 0.3;

/// Added to std in the z-score denominator
const EPSILON: f64 = 1e-9;

/// Detector thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShockConfig {
    pub window: usize,
    pub z_threshold: f64,
    pub delta_threshold: f64,
    pub ewma_alpha: f64,
}

impl Default for ShockConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            z_threshold: DEFAULT_Z_THRESHOLD,
            delta_threshold: DEFAULT_DELTA_THRESHOLD,
            ewma_alpha: DEFAULT_EWMA_ALPHA,
        }
    }
}

/// Merged shock events plus per-method counts before merging
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShockReport {
    /// Deduplicated events ordered by (timestamp, sub-index)
    pub events: Vec<ShockEvent>,
    pub z_score_count: usize,
    pub delta_count: usize,
    pub ewma_count: usize,
    /// Sub-indices whose series was too short to analyze
    pub skipped: Vec<SubIndexKind>,
}

impl ShockReport {
    /// Flags raised across all methods before merging
    pub fn method_total(&self) -> usize {
        self.z_score_count + self.delta_count + self.ewma_count
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Event count per severity
    pub fn severity_counts(&self) -> BTreeMap<Severity, usize> {
        let mut counts = BTreeMap::new();
        for event in &self.events {
            *counts.entry(event.severity).or_insert(0) += 1;
        }
        counts
    }
}

/// Shock detector over Behavior Index history
#[derive(Debug, Clone, Default)]
pub struct ShockDetector {
    config: ShockConfig,
}

impl ShockDetector {
    pub fn new(config: ShockConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ShockConfig {
        &self.config
    }

    /// Run all detectors over every sub-index and merge the results
    pub fn detect(&self, history: &[BehaviorIndexRow]) -> ShockReport {
        let kinds: BTreeSet<SubIndexKind> = history
            .iter()
            .flat_map(|row| row.sub_indices.keys().copied())
            .collect();

        let mut report = ShockReport::default();
        let mut flagged = Vec::new();

        for kind in kinds {
            let series: Vec<(NaiveDate, f64)> = history
                .iter()
                .filter_map(|row| {
                    row.sub_index(kind)
                        .filter(|v| v.is_finite())
                        .map(|v| (row.timestamp, v))
                })
                .collect();

            if series.len() <= self.config.window {
                debug!(sub_index = %kind, points = series.len(), "series too short for shock detection");
                report.skipped.push(kind);
                continue;
            }

            let z = self.z_score_events(kind, &series);
            let delta = self.delta_events(kind, &series);
            let ewma = self.ewma_events(kind, &series);
            report.z_score_count += z.len();
            report.delta_count += delta.len();
            report.ewma_count += ewma.len();
            flagged.extend(z);
            flagged.extend(delta);
            flagged.extend(ewma);
        }

        report.events = merge_events(flagged);
        debug!(
            events = report.events.len(),
            z_score = report.z_score_count,
            delta = report.delta_count,
            ewma = report.ewma_count,
            "shock detection complete"
        );
        report
    }

    /// Points far from the trailing window mean
    pub fn z_score_events(&self, kind: SubIndexKind, series: &[(NaiveDate, f64)]) -> Vec<ShockEvent> {
        let window = self.config.window;
        let threshold = self.config.z_threshold;
        let mut events = Vec::new();
        if window < 2 {
            return events;
        }

        for t in window..series.len() {
            let trailing: Vec<f64> = series[t - window..t].iter().map(|(_, v)| *v).collect();
            let (mean, std) = mean_std(&trailing);
            // A flat window has no spread to measure against
            if std < EPSILON {
                continue;
            }
            let (day, x) = series[t];
            let z = (x - mean).abs() / (std + EPSILON);
            if z > threshold {
                events.push(event(kind, DetectionMethod::ZScore, day, x, x - mean, z / threshold));
            }
        }
        events
    }

    /// Day-over-day jumps above the absolute delta threshold
    pub fn delta_events(&self, kind: SubIndexKind, series: &[(NaiveDate, f64)]) -> Vec<ShockEvent> {
        let threshold = self.config.delta_threshold;
        series
            .windows(2)
            .filter_map(|pair| {
                let (_, prev) = pair[0];
                let (day, x) = pair[1];
                let change = x - prev;
                (change.abs() > threshold).then(|| {
                    event(
                        kind,
                        DetectionMethod::Delta,
                        day,
                        x,
                        change,
                        change.abs() / threshold,
                    )
                })
            })
            .collect()
    }

    /// One-step EWMA prediction errors that are large relative to recent errors
    pub fn ewma_events(&self, kind: SubIndexKind, series: &[(NaiveDate, f64)]) -> Vec<ShockEvent> {
        let window = self.config.window;
        let threshold = self.config.z_threshold;
        let alpha = self.config.ewma_alpha;
        let mut events = Vec::new();
        if series.is_empty() || window < 2 {
            return events;
        }

        let mut ewma = series[0].1;
        let mut deviations = Vec::with_capacity(series.len());
        for (day, x) in series.iter().skip(1) {
            let deviation = x - ewma;
            if deviations.len() >= window {
                let (_, std) = mean_std(&deviations[deviations.len() - window..]);
                if std >= EPSILON && deviation.abs() > threshold * std {
                    let magnitude = deviation.abs() / (threshold * std);
                    events.push(event(kind, DetectionMethod::Ewma, *day, *x, deviation, magnitude));
                }
            }
            deviations.push(deviation);
            ewma = alpha * x + (1.0 - alpha) * ewma;
        }
        events
    }

    /// Trace of the merge: per-method counts less duplicates equal the output
    pub fn trace(&self, report: &ShockReport, context: &TraceContext) -> DecisionTrace {
        let merged = report.events.len();
        let duplicates = report.method_total() - merged;
        let severities: BTreeMap<&str, usize> = report
            .severity_counts()
            .into_iter()
            .map(|(s, n)| (s.as_str(), n))
            .collect();
        let skipped: Vec<&str> = report.skipped.iter().map(|k| k.as_str()).collect();

        DecisionTrace::builder("shock_events", merged as f64)
            .component("z_score", TraceComponent::new(report.z_score_count as f64))
            .component("delta", TraceComponent::new(report.delta_count as f64))
            .component("ewma", TraceComponent::new(report.ewma_count as f64))
            .component(
                "merged_duplicates",
                TraceComponent::new(-(duplicates as f64))
                    .with_note("same (timestamp, index) flagged by several methods"),
            )
            .metadata("window", self.config.window)
            .metadata("z_threshold", self.config.z_threshold)
            .metadata("delta_threshold", self.config.delta_threshold)
            .metadata("ewma_alpha", self.config.ewma_alpha)
            .metadata("severity_counts", serde_json::json!(severities))
            .metadata("skipped_indices", serde_json::json!(skipped))
            .build(context)
    }
}

fn event(
    kind: SubIndexKind,
    method: DetectionMethod,
    timestamp: NaiveDate,
    value: f64,
    delta: f64,
    magnitude: f64,
) -> ShockEvent {
    ShockEvent {
        timestamp,
        index_name: kind,
        method,
        severity: Severity::from_magnitude(magnitude),
        delta,
        value,
        magnitude,
    }
}

/// Sample mean and standard deviation (n − 1 denominator)
fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    if n < 2 {
        return (mean, 0.0);
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    (mean, variance.sqrt())
}

/// Total order used when two methods flag the same point: severity, then
/// magnitude, then the earlier method in declaration order
fn outranks(candidate: &ShockEvent, current: &ShockEvent) -> bool {
    let order = candidate
        .severity
        .cmp(&current.severity)
        .then_with(|| candidate.magnitude.total_cmp(&current.magnitude))
        .then_with(|| current.method.cmp(&candidate.method));
    order == Ordering::Greater
}

/// Collapse events to one per (timestamp, sub-index), most severe first.
///
/// The result is independent of input order.
pub fn merge_events(events: impl IntoIterator<Item = ShockEvent>) -> Vec<ShockEvent> {
    let mut merged: BTreeMap<(NaiveDate, SubIndexKind), ShockEvent> = BTreeMap::new();
    for event in events {
        let key = (event.timestamp, event.index_name);
        match merged.get(&key) {
            Some(existing) if !outranks(&event, existing) => {}
            _ => {
                merged.insert(key, event);
            }
        }
    }
    merged.into_values().collect()
}
