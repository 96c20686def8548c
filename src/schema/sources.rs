//! pulse.sources.v1 schema definition

use crate::types::{Cadence, Region, SeriesPoint, SourceFetch, SourceSeries};
use serde::{Deserialize, Serialize};

/// Current schema version
pub const SCHEMA_VERSION: &str = "pulse.sources.v1";

/// One source entry: either observed points or the reason it is missing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Signal name; matches a component signal of the sub-index catalogue
    pub name: String,
    #[serde(default)]
    pub cadence: Cadence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<Vec<SeriesPoint>>,
    /// Upstream failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unavailable: Option<String>,
}

impl SourceRecord {
    pub fn series(name: impl Into<String>, cadence: Cadence, points: Vec<SeriesPoint>) -> Self {
        Self {
            name: name.into(),
            cadence,
            points: Some(points),
            unavailable: None,
        }
    }

    pub fn unavailable(name: impl Into<String>, cadence: Cadence, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cadence,
            points: None,
            unavailable: Some(reason.into()),
        }
    }

    /// Check that exactly one of `points` / `unavailable` is present
    pub fn validate(&self, position: usize) -> Result<(), SchemaError> {
        if self.name.trim().is_empty() {
            return Err(SchemaError::EmptySourceName { position });
        }
        match (&self.points, &self.unavailable) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (None, None) => Err(SchemaError::MissingPayload {
                name: self.name.clone(),
            }),
            (Some(_), Some(_)) => Err(SchemaError::ConflictingPayload {
                name: self.name.clone(),
            }),
        }
    }

    /// Convert to the harmonizer's input
    pub fn to_fetch(&self) -> SourceFetch {
        match (&self.points, &self.unavailable) {
            (Some(points), None) => {
                SourceFetch::Ok(SourceSeries::new(self.name.clone(), self.cadence, points.clone()))
            }
            (_, reason) => SourceFetch::Unavailable {
                source: self.name.clone(),
                cadence: self.cadence,
                reason: reason.clone().unwrap_or_else(|| "no points supplied".to_string()),
            },
        }
    }
}

/// A region plus all of its fetched sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcesDocument {
    pub schema_version: String,
    pub region: Region,
    pub sources: Vec<SourceRecord>,
}

impl SourcesDocument {
    pub fn new(region: Region) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            region,
            sources: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: SourceRecord) -> Self {
        self.sources.push(source);
        self
    }

    /// Validate the document
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(SchemaError::InvalidSchemaVersion {
                expected: SCHEMA_VERSION.to_string(),
                actual: self.schema_version.clone(),
            });
        }
        if self.region.id.trim().is_empty() {
            return Err(SchemaError::EmptyRegionId);
        }
        for (position, source) in self.sources.iter().enumerate() {
            source.validate(position)?;
        }
        Ok(())
    }

    pub fn fetches(&self) -> Vec<SourceFetch> {
        self.sources.iter().map(SourceRecord::to_fetch).collect()
    }
}

/// Validation errors for source documents
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("Invalid schema version: expected {expected}, got {actual}")]
    InvalidSchemaVersion { expected: String, actual: String },

    #[error("Region id must not be empty")]
    EmptyRegionId,

    #[error("Source at position {position} has an empty name")]
    EmptySourceName { position: usize },

    #[error("Source '{name}' has neither points nor an unavailable reason")]
    MissingPayload { name: String },

    #[error("Source '{name}' has both points and an unavailable reason")]
    ConflictingPayload { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn document() -> SourcesDocument {
        SourcesDocument::new(Region::new("us-ca", "California"))
            .with_source(SourceRecord::series(
                "market_volatility",
                Cadence::Trading,
                vec![SeriesPoint::new(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), 0.41)],
            ))
            .with_source(SourceRecord::unavailable(
                "search_interest",
                Cadence::Daily,
                "upstream timeout",
            ))
    }

    #[test]
    fn test_serialize_document() {
        let json = serde_json::to_string_pretty(&document()).unwrap();
        assert!(json.contains("pulse.sources.v1"));
        assert!(json.contains("\"trading\""));
        assert!(json.contains("upstream timeout"));
        assert!(!json.contains("\"points\": null"));
    }

    #[test]
    fn test_deserialize_document() {
        let json = r#"{
            "schema_version": "pulse.sources.v1",
            "region": { "id": "us-ca", "name": "California" },
            "sources": [
                { "name": "market_volatility", "cadence": "trading",
                  "points": [ { "timestamp": "2024-01-02", "value": 0.41 } ] },
                { "name": "search_interest", "unavailable": "upstream timeout" }
            ]
        }"#;
        let doc: SourcesDocument = serde_json::from_str(json).unwrap();
        assert!(doc.validate().is_ok());
        assert_eq!(doc, document());
    }

    #[test]
    fn test_fetches_map_variants() {
        let fetches = document().fetches();
        assert!(matches!(&fetches[0], SourceFetch::Ok(s) if s.points.len() == 1));
        assert!(matches!(
            &fetches[1],
            SourceFetch::Unavailable { reason, .. } if reason == "upstream timeout"
        ));
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut doc = document();
        doc.schema_version = "pulse.sources.v0".to_string();
        assert_eq!(
            doc.validate(),
            Err(SchemaError::InvalidSchemaVersion {
                expected: SCHEMA_VERSION.to_string(),
                actual: "pulse.sources.v0".to_string(),
            })
        );
    }

    #[test]
    fn test_rejects_bad_sources() {
        let mut doc = document();
        doc.region.id = "  ".to_string();
        assert_eq!(doc.validate(), Err(SchemaError::EmptyRegionId));

        let doc = SourcesDocument::new(Region::new("r", "R")).with_source(SourceRecord {
            name: "mobility".to_string(),
            cadence: Cadence::Daily,
            points: None,
            unavailable: None,
        });
        assert!(matches!(doc.validate(), Err(SchemaError::MissingPayload { .. })));

        let mut both = SourceRecord::series("mobility", Cadence::Daily, vec![]);
        both.unavailable = Some("down".to_string());
        assert!(matches!(both.validate(0), Err(SchemaError::ConflictingPayload { .. })));
    }
}
