//! Pulse Index - Explainable regional Behavior Index from public time-series signals
//!
//! Pulse turns heterogeneous daily/weekly/trading-day source series into a
//! composite Behavior Index through a deterministic pipeline: harmonization →
//! sub-index computation → shock detection → convergence analysis → risk
//! classification, with a reconciled decision trace for every number produced.
//!
//! ## Modules
//!
//! - **Harmonizer**: Align sources on a daily calendar with bounded forward fill
//! - **Index**: Nine weighted sub-indices combined into the Behavior Index
//! - **Shock / Convergence / Risk**: Anomalies, co-movement, and the final tier
//! - **Trace**: Additive explanations checked against each output
//! - **Cache**: Bounded LRU of per-region analyses

pub mod cache;
pub mod config;
pub mod convergence;
pub mod encoder;
pub mod error;
pub mod forecast;
pub mod harmonizer;
pub mod index;
pub mod pipeline;
pub mod risk;
pub mod schema;
pub mod shock;
pub mod trace;
pub mod types;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use config::PipelineConfig;
pub use error::ComputeError;
pub use pipeline::{analyze_region, BehaviorPipeline, RegionAnalysis};
pub use risk::classify_risk;
pub use trace::{DecisionTrace, TraceContext};

// Schema exports
pub use schema::{SourcesAdapter, SourcesDocument, SCHEMA_VERSION};

/// Pulse version embedded in all payloads
pub const PULSE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for payloads
pub const PRODUCER_NAME: &str = "pulse-index";
