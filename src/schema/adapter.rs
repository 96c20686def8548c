//! Parsing and checking of pulse.sources.v1 documents
//!
//! Documents arrive either as a single JSON object or as NDJSON with one
//! region per line.

use crate::error::ComputeError;
use crate::schema::sources::*;
use chrono::NaiveDate;
use serde::Serialize;

/// Parser for source documents
pub struct SourcesAdapter;

impl SourcesAdapter {
    /// Parse and validate one JSON document
    pub fn parse_document(json: &str) -> Result<SourcesDocument, ComputeError> {
        let document: SourcesDocument = serde_json::from_str(json)?;
        document.validate()?;
        Ok(document)
    }

    /// Parse a JSON array of documents without validating them
    pub fn parse_array(json: &str) -> Result<Vec<SourcesDocument>, ComputeError> {
        let documents: Vec<SourcesDocument> = serde_json::from_str(json)?;
        Ok(documents)
    }

    /// Parse NDJSON (one document per line) without validating
    pub fn parse_ndjson(ndjson: &str) -> Result<Vec<SourcesDocument>, ComputeError> {
        let mut documents = Vec::new();
        for (line_num, line) in ndjson.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<SourcesDocument>(trimmed) {
                Ok(document) => documents.push(document),
                Err(e) => {
                    return Err(ComputeError::ParseError(format!(
                        "Failed to parse line {}: {}",
                        line_num + 1,
                        e
                    )));
                }
            }
        }
        Ok(documents)
    }

    /// Accept a single object, an array, or NDJSON
    pub fn parse_any(input: &str) -> Result<Vec<SourcesDocument>, ComputeError> {
        let trimmed = input.trim_start();
        if trimmed.starts_with('[') {
            return Self::parse_array(trimmed);
        }
        match serde_json::from_str::<SourcesDocument>(trimmed) {
            Ok(document) => Ok(vec![document]),
            Err(_) => Self::parse_ndjson(trimmed),
        }
    }

    /// Validation failures, one per offending document
    pub fn validate_documents(documents: &[SourcesDocument]) -> Vec<ValidationResult> {
        documents
            .iter()
            .enumerate()
            .filter_map(|(index, document)| {
                document.validate().err().map(|error| ValidationResult {
                    index,
                    region_id: document.region.id.clone(),
                    error,
                })
            })
            .collect()
    }

    pub fn summarize(document: &SourcesDocument) -> DocumentSummary {
        let mut points = 0;
        let mut unavailable = Vec::new();
        let mut first: Option<NaiveDate> = None;
        let mut last: Option<NaiveDate> = None;

        for source in &document.sources {
            match &source.points {
                Some(series) => {
                    points += series.len();
                    for point in series {
                        first = Some(first.map_or(point.timestamp, |d| d.min(point.timestamp)));
                        last = Some(last.map_or(point.timestamp, |d| d.max(point.timestamp)));
                    }
                }
                None => unavailable.push(source.name.clone()),
            }
        }

        DocumentSummary {
            region_id: document.region.id.clone(),
            sources: document.sources.len(),
            points,
            unavailable,
            first_day: first,
            last_day: last,
        }
    }
}

/// A document that failed validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub index: usize,
    pub region_id: String,
    pub error: SchemaError,
}

/// Shape of a valid document, for reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentSummary {
    pub region_id: String,
    pub sources: usize,
    pub points: usize,
    pub unavailable: Vec<String>,
    pub first_day: Option<NaiveDate>,
    pub last_day: Option<NaiveDate>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DOC: &str = r#"{"schema_version":"pulse.sources.v1","region":{"id":"us-ca","name":"California"},"sources":[{"name":"mobility","points":[{"timestamp":"2024-01-03","value":0.6},{"timestamp":"2024-01-01T18:30:00Z","value":0.5}]},{"name":"crime_signal","unavailable":"rate limited"}]}"#;

    #[test]
    fn test_parse_document() {
        let doc = SourcesAdapter::parse_document(DOC).unwrap();
        assert_eq!(doc.region.id, "us-ca");
        assert_eq!(doc.sources.len(), 2);
    }

    #[test]
    fn test_parse_document_reports_schema_errors() {
        let bad = DOC.replace("pulse.sources.v1", "pulse.sources.v9");
        assert!(matches!(
            SourcesAdapter::parse_document(&bad),
            Err(ComputeError::ValidationError(SchemaError::InvalidSchemaVersion { .. }))
        ));
    }

    #[test]
    fn test_parse_ndjson_reports_line() {
        let ndjson = format!("{DOC}\n\n{{ broken\n");
        match SourcesAdapter::parse_ndjson(&ndjson) {
            Err(ComputeError::ParseError(msg)) => assert!(msg.contains("line 3")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_any_accepts_all_shapes() {
        assert_eq!(SourcesAdapter::parse_any(DOC).unwrap().len(), 1);
        assert_eq!(SourcesAdapter::parse_any(&format!("[{DOC},{DOC}]")).unwrap().len(), 2);
        assert_eq!(SourcesAdapter::parse_any(&format!("{DOC}\n{DOC}\n")).unwrap().len(), 2);
    }

    #[test]
    fn test_validate_documents_collects_failures() {
        let mut docs = SourcesAdapter::parse_any(&format!("{DOC}\n{DOC}")).unwrap();
        docs[1].region.id.clear();
        let failures = SourcesAdapter::validate_documents(&docs);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].index, 1);
        assert_eq!(failures[0].error, SchemaError::EmptyRegionId);
    }

    #[test]
    fn test_summarize() {
        let doc = SourcesAdapter::parse_document(DOC).unwrap();
        let summary = SourcesAdapter::summarize(&doc);
        assert_eq!(summary.points, 2);
        assert_eq!(summary.unavailable, vec!["crime_signal".to_string()]);
        assert_eq!(summary.first_day.map(|d| d.to_string()).as_deref(), Some("2024-01-01"));
        assert_eq!(summary.last_day.map(|d| d.to_string()).as_deref(), Some("2024-01-03"));
    }
}
