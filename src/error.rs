//! Error types for Pulse Index

use thiserror::Error;

/// Errors that can occur at the pipeline boundary.
///
/// The numeric stages themselves never fail; they sanitize and degrade.
/// These variants cover parsing, configuration, encoding, and the
/// harmonizer's explicit "no data" outcome.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("Failed to parse input: {0}")]
    ParseError(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Date parse error: {0}")]
    DateParseError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No data: {0}")]
    NoData(String),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Invalid input: {0}")]
    ValidationError(#[from] crate::schema::SchemaError),
}
