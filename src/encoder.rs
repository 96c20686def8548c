//! Analysis encoding
//!
//! This module turns a [`RegionAnalysis`] into the two outbound shapes:
//! the API payload (with sanitized traces) and the persistence record.
//! Dates are ISO-8601 calendar days.

use crate::error::ComputeError;
use crate::pipeline::{AnalysisTraces, RegionAnalysis};
use crate::types::{
    BehaviorIndexRow, ConvergenceResult, ForecastPoint, Region, RiskClassification, ShockEvent,
    SubIndexKind, TrendDirection,
};
use crate::{PRODUCER_NAME, PULSE_VERSION};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Current API payload version
pub const PAYLOAD_VERSION: &str = "pulse.analysis.v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Producer {
    pub name: String,
    pub version: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub region: Region,
    pub data_start: Option<NaiveDate>,
    pub data_end: Option<NaiveDate>,
    pub computed_at_utc: String,
}

/// One history row as exposed to API consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorIndexRecord {
    pub timestamp: NaiveDate,
    pub behavior_index: f64,
    pub sub_indices: BTreeMap<SubIndexKind, f64>,
}

impl From<&BehaviorIndexRow> for BehaviorIndexRecord {
    fn from(row: &BehaviorIndexRow) -> Self {
        Self {
            timestamp: row.timestamp,
            behavior_index: row.behavior_index,
            sub_indices: sub_index_values(row),
        }
    }
}

/// Shock section: merged events plus the per-method counts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShockSummary {
    pub events: Vec<ShockEvent>,
    pub z_score_count: usize,
    pub delta_count: usize,
    pub ewma_count: usize,
}

/// Payload returned to the web/API layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisPayload {
    pub payload_version: String,
    pub producer: Producer,
    pub provenance: Provenance,
    pub behavior_index: Option<f64>,
    pub trend: Option<TrendDirection>,
    pub risk: RiskClassification,
    pub history: Vec<BehaviorIndexRecord>,
    pub forecast: Vec<ForecastPoint>,
    pub shocks: ShockSummary,
    pub convergence: ConvergenceResult,
    /// Advisory only; consumers must not depend on it for correctness
    pub trace: AnalysisTraces,
    pub warnings: Vec<String>,
}

/// Record handed to the persistence layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceRecord {
    pub region: Region,
    pub behavior_index: Option<f64>,
    pub sub_indices: BTreeMap<SubIndexKind, f64>,
    pub metadata: BTreeMap<String, Value>,
}

/// Encoder for analysis payloads
pub struct AnalysisEncoder {
    instance_id: String,
}

impl Default for AnalysisEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisEncoder {
    /// Create a new encoder with a unique instance ID
    pub fn new() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    /// Create an encoder with a specific instance ID
    pub fn with_instance_id(instance_id: String) -> Self {
        Self { instance_id }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn producer(&self) -> Producer {
        Producer {
            name: PRODUCER_NAME.to_string(),
            version: PULSE_VERSION.to_string(),
            instance_id: self.instance_id.clone(),
        }
    }

    /// Encode an analysis into the API payload
    pub fn encode(&self, analysis: &RegionAnalysis) -> AnalysisPayload {
        self.encode_at(analysis, Utc::now())
    }

    /// Encode with an explicit computation time
    pub fn encode_at(&self, analysis: &RegionAnalysis, computed_at: DateTime<Utc>) -> AnalysisPayload {
        let traces = &analysis.traces;
        AnalysisPayload {
            payload_version: PAYLOAD_VERSION.to_string(),
            producer: self.producer(),
            provenance: Provenance {
                region: analysis.region.clone(),
                data_start: analysis.history.first().map(|r| r.timestamp),
                data_end: analysis.history.last().map(|r| r.timestamp),
                computed_at_utc: computed_at.to_rfc3339(),
            },
            behavior_index: analysis.behavior_index(),
            trend: analysis.trend,
            risk: analysis.risk.clone(),
            history: analysis.history.iter().map(BehaviorIndexRecord::from).collect(),
            forecast: analysis.forecast.clone(),
            shocks: ShockSummary {
                events: analysis.shocks.events.clone(),
                z_score_count: analysis.shocks.z_score_count,
                delta_count: analysis.shocks.delta_count,
                ewma_count: analysis.shocks.ewma_count,
            },
            convergence: analysis.convergence.clone(),
            trace: AnalysisTraces {
                index: traces.index.as_ref().map(|t| t.sanitized()),
                shocks: traces.shocks.as_ref().map(|t| t.sanitized()),
                convergence: traces.convergence.as_ref().map(|t| t.sanitized()),
                risk: traces.risk.as_ref().map(|t| t.sanitized()),
            },
            warnings: analysis.warnings.clone(),
        }
    }

    /// Encode to a JSON string
    pub fn encode_to_json(&self, analysis: &RegionAnalysis) -> Result<String, ComputeError> {
        serde_json::to_string(&self.encode(analysis))
            .map_err(|e| ComputeError::EncodingError(e.to_string()))
    }

    /// Encode to a pretty-printed JSON string
    pub fn encode_to_json_pretty(&self, analysis: &RegionAnalysis) -> Result<String, ComputeError> {
        serde_json::to_string_pretty(&self.encode(analysis))
            .map_err(|e| ComputeError::EncodingError(e.to_string()))
    }

    /// Build the persistence record for the latest row
    pub fn persistence_record(&self, analysis: &RegionAnalysis) -> PersistenceRecord {
        let latest = analysis.latest();
        let mut metadata = BTreeMap::new();
        metadata.insert("producer".to_string(), Value::from(PRODUCER_NAME));
        metadata.insert("version".to_string(), Value::from(PULSE_VERSION));
        metadata.insert("instance_id".to_string(), Value::from(self.instance_id.clone()));
        metadata.insert(
            "as_of".to_string(),
            latest.map_or(Value::Null, |r| Value::from(r.timestamp.to_string())),
        );
        metadata.insert("risk_tier".to_string(), Value::from(analysis.risk.tier.as_str()));
        metadata.insert("risk_score".to_string(), Value::from(analysis.risk.risk_score));
        metadata.insert(
            "convergence_score".to_string(),
            Value::from(analysis.convergence.score),
        );
        metadata.insert(
            "shock_count".to_string(),
            Value::from(analysis.shocks.events.len()),
        );
        metadata.insert(
            "trend".to_string(),
            analysis
                .trend
                .map_or(Value::Null, |t| Value::from(t.as_str())),
        );

        PersistenceRecord {
            region: analysis.region.clone(),
            behavior_index: latest.map(|r| r.behavior_index),
            sub_indices: latest.map(sub_index_values).unwrap_or_default(),
            metadata,
        }
    }

    pub fn persistence_record_json(&self, analysis: &RegionAnalysis) -> Result<String, ComputeError> {
        serde_json::to_string(&self.persistence_record(analysis))
            .map_err(|e| ComputeError::EncodingError(e.to_string()))
    }
}

fn sub_index_values(row: &BehaviorIndexRow) -> BTreeMap<SubIndexKind, f64> {
    row.sub_indices
        .iter()
        .map(|(kind, sub)| (*kind, sub.value))
        .collect()
}
