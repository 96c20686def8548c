//! Pulse CLI - Command-line interface for Pulse Index
//!
//! Commands:
//! - analyze: Run the full pipeline over one or more source documents
//! - classify: Classify risk from a Behavior Index and optional context
//! - validate: Validate source documents against pulse.sources.v1
//! - doctor: Diagnose configuration and environment
//! - schema: Print input/output schema information

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use pulse_index::config::PipelineConfig;
use pulse_index::encoder::{AnalysisEncoder, PAYLOAD_VERSION};
use pulse_index::pipeline::BehaviorPipeline;
use pulse_index::risk::{classify_risk, RiskClassifier};
use pulse_index::schema::{DocumentSummary, SourcesAdapter, SCHEMA_VERSION};
use pulse_index::trace::TraceContext;
use pulse_index::types::TrendDirection;
use pulse_index::{ComputeError, PRODUCER_NAME, PULSE_VERSION};

/// Pulse - explainable regional Behavior Index
#[derive(Parser)]
#[command(name = "pulse")]
#[command(version = PULSE_VERSION)]
#[command(about = "Compute Behavior Index, shocks, convergence and risk from source series", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze source documents (single JSON, JSON array or NDJSON)
    Analyze {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Pipeline config JSON
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output format
        #[arg(long, default_value = "json")]
        format: OutputFormat,

        /// Emit persistence records instead of API payloads
        #[arg(long)]
        persistence: bool,
    },

    /// Classify risk for a single Behavior Index value
    Classify {
        /// Latest Behavior Index in [0, 1]
        #[arg(long)]
        behavior_index: f64,

        /// Convergence score in [0, 100]
        #[arg(long)]
        convergence: Option<f64>,

        /// Trend direction (increasing, decreasing, stable)
        #[arg(long)]
        trend: Option<String>,
    },

    /// Validate source documents
    Validate {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Diagnose configuration and environment
    Doctor {
        /// Check a pipeline config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print schema information
    Schema {
        /// Schema to print (input or output)
        #[arg(value_enum)]
        schema_type: SchemaType,

        /// Output as JSON schema
        #[arg(long)]
        json_schema: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Newline-delimited JSON (one record per region)
    Ndjson,
    /// JSON array of records
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

#[derive(Clone, ValueEnum)]
enum SchemaType {
    /// Input schema (pulse.sources.v1)
    Input,
    /// Output schema (pulse.analysis.v1)
    Output,
}

fn main() -> ExitCode {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string()));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), PulseCliError> {
    match cli.command {
        Commands::Analyze {
            input,
            output,
            config,
            format,
            persistence,
        } => cmd_analyze(&input, &output, config.as_deref(), format, persistence),

        Commands::Classify {
            behavior_index,
            convergence,
            trend,
        } => cmd_classify(behavior_index, convergence, trend.as_deref()),

        Commands::Validate { input, json } => cmd_validate(&input, json),

        Commands::Doctor { config, json } => cmd_doctor(config.as_deref(), json),

        Commands::Schema { schema_type, json_schema } => cmd_schema(schema_type, json_schema),
    }
}

fn read_input(input: &Path) -> Result<String, PulseCliError> {
    if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(input)?)
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig, PulseCliError> {
    match path {
        Some(path) => Ok(PipelineConfig::from_json(&fs::read_to_string(path)?)?),
        None => Ok(PipelineConfig::default()),
    }
}

fn cmd_analyze(
    input: &Path,
    output: &Path,
    config: Option<&Path>,
    format: OutputFormat,
    persistence: bool,
) -> Result<(), PulseCliError> {
    let input_data = read_input(input)?;
    let documents = SourcesAdapter::parse_any(&input_data)?;

    if documents.is_empty() {
        return Err(PulseCliError::NoDocuments);
    }

    let pipeline = BehaviorPipeline::new(load_config(config)?)?;
    let encoder = AnalysisEncoder::new();

    let mut records: Vec<serde_json::Value> = Vec::with_capacity(documents.len());
    for document in &documents {
        let analysis = pipeline.analyze_document(document)?;
        let record = if persistence {
            serde_json::to_value(encoder.persistence_record(&analysis))?
        } else {
            serde_json::to_value(encoder.encode(&analysis))?
        };
        records.push(record);
    }

    let stats = pipeline.trace_context().stats();
    if stats.invalid > 0 {
        tracing::warn!(invalid = stats.invalid, built = stats.built, "some traces failed reconciliation");
    }

    let output_data = format_output(&records, &format)?;
    if output.to_string_lossy() == "-" {
        print!("{}", output_data);
    } else {
        fs::write(output, output_data)?;
    }

    Ok(())
}

fn cmd_classify(
    behavior_index: f64,
    convergence: Option<f64>,
    trend: Option<&str>,
) -> Result<(), PulseCliError> {
    let trend = match trend {
        Some(raw) => Some(
            TrendDirection::parse(raw).ok_or_else(|| PulseCliError::InvalidTrend(raw.to_string()))?,
        ),
        None => None,
    };

    let classification = classify_risk(behavior_index, &[], convergence, trend);
    let trace = RiskClassifier::new().trace(&classification, &TraceContext::default());

    let output = serde_json::json!({
        "classification": classification,
        "trace": trace.sanitized(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn cmd_validate(input: &Path, json: bool) -> Result<(), PulseCliError> {
    let input_data = read_input(input)?;
    let documents = SourcesAdapter::parse_any(&input_data)?;
    let failures = SourcesAdapter::validate_documents(&documents);

    let report = ValidationReport {
        total_documents: documents.len(),
        valid_documents: documents.len() - failures.len(),
        invalid_documents: failures.len(),
        errors: failures
            .iter()
            .map(|f| ValidationErrorDetail {
                index: f.index,
                region_id: f.region_id.clone(),
                error: f.error.to_string(),
            })
            .collect(),
        documents: documents
            .iter()
            .filter(|d| d.validate().is_ok())
            .map(SourcesAdapter::summarize)
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Total documents:   {}", report.total_documents);
        println!("Valid documents:   {}", report.valid_documents);
        println!("Invalid documents: {}", report.invalid_documents);

        for summary in &report.documents {
            println!(
                "  - {}: {} sources, {} points, {} unavailable",
                summary.region_id,
                summary.sources,
                summary.points,
                summary.unavailable.len()
            );
        }

        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!("  - Region {} (index {}): {}", err.region_id, err.index, err.error);
            }
        }
    }

    if report.invalid_documents > 0 {
        Err(PulseCliError::ValidationFailed(report.invalid_documents))
    } else {
        Ok(())
    }
}

fn cmd_doctor(config: Option<&Path>, json: bool) -> Result<(), PulseCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "pulse_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Pulse version {}", PULSE_VERSION),
    });

    checks.push(DoctorCheck {
        name: "schema_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Input schema: {}, output: {}", SCHEMA_VERSION, PAYLOAD_VERSION),
    });

    // Check config file if provided
    if let Some(config_path) = config {
        if config_path.exists() {
            match fs::read_to_string(config_path) {
                Ok(content) => match PipelineConfig::from_json(&content) {
                    Ok(parsed) => {
                        let effective = parsed.weights.effective();
                        let status = if effective.len() < pulse_index::index::MIN_EXPECTED_SUB_INDICES {
                            CheckStatus::Warning
                        } else {
                            CheckStatus::Ok
                        };
                        checks.push(DoctorCheck {
                            name: "config".to_string(),
                            status,
                            message: format!(
                                "Config valid ({} weighted sub-indices, configured total {:.3}, lookback {} days)",
                                effective.len(),
                                parsed.weights.total(),
                                parsed.lookback_days
                            ),
                        });
                    }
                    Err(e) => checks.push(DoctorCheck {
                        name: "config".to_string(),
                        status: CheckStatus::Error,
                        message: format!("Invalid config: {}", e),
                    }),
                },
                Err(e) => checks.push(DoctorCheck {
                    name: "config".to_string(),
                    status: CheckStatus::Error,
                    message: format!("Cannot read config file: {}", e),
                }),
            }
        } else {
            checks.push(DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Warning,
                message: "Config file does not exist; defaults will be used".to_string(),
            });
        }
    }

    // Check stdin is available (for `-i -`)
    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (interactive mode)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (ready for -i -)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: PULSE_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Pulse Doctor Report");
        println!("===================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(PulseCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn cmd_schema(schema_type: SchemaType, json_schema: bool) -> Result<(), PulseCliError> {
    match schema_type {
        SchemaType::Input => {
            if json_schema {
                println!("{}", get_input_json_schema());
            } else {
                println!("Input Schema: {}", SCHEMA_VERSION);
                println!();
                println!("A document describes one region and its fetched sources:");
                println!();
                println!("- schema_version: \"{}\"", SCHEMA_VERSION);
                println!("- region: {{ id, name }}");
                println!("- sources: array of");
                println!("  - name: signal name (e.g. market_volatility, mobility, search_interest)");
                println!("  - cadence: daily | trading | weekly | monthly (default daily)");
                println!("  - points: [{{ timestamp: YYYY-MM-DD or RFC 3339, value }}]");
                println!("  - unavailable: reason, instead of points, when the fetch failed");
                println!();
                println!("Files may hold one document, a JSON array, or NDJSON (one per line).");
            }
        }
        SchemaType::Output => {
            if json_schema {
                println!("{}", get_output_json_schema());
            } else {
                println!("Output Schema: {}", PAYLOAD_VERSION);
                println!();
                println!("- payload_version, producer {{ name, version, instance_id }}");
                println!("- provenance: {{ region, data_start, data_end, computed_at_utc }}");
                println!("- behavior_index, trend");
                println!("- risk: {{ tier, risk_score, adjustments, contributing_factors }}");
                println!("- history: [{{ timestamp, behavior_index, sub_indices }}]");
                println!("- forecast: [{{ timestamp, prediction, lower_bound, upper_bound }}]");
                println!("- shocks: {{ events, z_score_count, delta_count, ewma_count }}");
                println!("- convergence: {{ score, reinforcing_signals, conflicting_signals, patterns, correlation_matrix }}");
                println!("- trace: sanitized decision traces (advisory)");
                println!("- warnings");
            }
        }
    }

    Ok(())
}

// Helper functions

fn format_output(records: &[serde_json::Value], format: &OutputFormat) -> Result<String, PulseCliError> {
    match format {
        OutputFormat::Ndjson => {
            let mut lines: Vec<String> = Vec::new();
            for record in records {
                lines.push(serde_json::to_string(record)?);
            }
            Ok(lines.join("\n") + "\n")
        }
        OutputFormat::Json => Ok(serde_json::to_string(records)?),
        OutputFormat::JsonPretty => Ok(serde_json::to_string_pretty(records)?),
    }
}

fn get_input_json_schema() -> String {
    serde_json::json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": SCHEMA_VERSION,
        "description": "Region source series for the Pulse Index pipeline",
        "type": "object",
        "required": ["schema_version", "region", "sources"],
        "properties": {
            "schema_version": { "type": "string", "const": SCHEMA_VERSION },
            "region": {
                "type": "object",
                "required": ["id", "name"],
                "properties": {
                    "id": { "type": "string", "minLength": 1 },
                    "name": { "type": "string" }
                }
            },
            "sources": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["name"],
                    "properties": {
                        "name": { "type": "string" },
                        "cadence": { "type": "string", "enum": ["daily", "trading", "weekly", "monthly"] },
                        "points": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "required": ["timestamp", "value"],
                                "properties": {
                                    "timestamp": { "type": "string" },
                                    "value": { "type": "number" }
                                }
                            }
                        },
                        "unavailable": { "type": "string" }
                    },
                    "oneOf": [
                        { "required": ["points"] },
                        { "required": ["unavailable"] }
                    ]
                }
            }
        }
    })
    .to_string()
}

fn get_output_json_schema() -> String {
    serde_json::json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": PAYLOAD_VERSION,
        "description": "Pulse Index region analysis",
        "type": "object",
        "required": ["payload_version", "producer", "provenance", "risk", "history", "forecast", "shocks", "convergence"],
        "properties": {
            "payload_version": { "type": "string" },
            "producer": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "version": { "type": "string" },
                    "instance_id": { "type": "string" }
                }
            },
            "provenance": { "type": "object" },
            "behavior_index": { "type": ["number", "null"], "minimum": 0, "maximum": 1 },
            "trend": { "type": ["string", "null"], "enum": ["increasing", "decreasing", "stable", null] },
            "risk": {
                "type": "object",
                "properties": {
                    "tier": { "type": "string", "enum": ["stable", "watchlist", "elevated", "high", "critical"] },
                    "risk_score": { "type": "number", "minimum": 0, "maximum": 1 }
                }
            },
            "history": { "type": "array", "items": { "type": "object" } },
            "forecast": { "type": "array", "items": { "type": "object" } },
            "shocks": { "type": "object" },
            "convergence": { "type": "object" },
            "trace": { "type": "object" },
            "warnings": { "type": "array", "items": { "type": "string" } }
        }
    })
    .to_string()
}

// Error types

#[derive(Debug)]
enum PulseCliError {
    Io(io::Error),
    Compute(ComputeError),
    Json(serde_json::Error),
    InvalidTrend(String),
    NoDocuments,
    ValidationFailed(usize),
    DoctorFailed,
}

impl From<io::Error> for PulseCliError {
    fn from(e: io::Error) -> Self {
        PulseCliError::Io(e)
    }
}

impl From<ComputeError> for PulseCliError {
    fn from(e: ComputeError) -> Self {
        PulseCliError::Compute(e)
    }
}

impl From<serde_json::Error> for PulseCliError {
    fn from(e: serde_json::Error) -> Self {
        PulseCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<PulseCliError> for CliError {
    fn from(e: PulseCliError) -> Self {
        match e {
            PulseCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            PulseCliError::Compute(ComputeError::InvalidConfig(msg)) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: msg,
                hint: Some("Run 'pulse doctor --config <file>' for details".to_string()),
            },
            PulseCliError::Compute(ComputeError::ValidationError(e)) => CliError {
                code: "VALIDATION_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'pulse validate' for details".to_string()),
            },
            PulseCliError::Compute(e) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: e.to_string(),
                hint: Some(format!("Ensure input matches the {} schema", SCHEMA_VERSION)),
            },
            PulseCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            PulseCliError::InvalidTrend(raw) => CliError {
                code: "INVALID_ARGUMENT".to_string(),
                message: format!("Unknown trend direction '{}'", raw),
                hint: Some("Use increasing, decreasing or stable".to_string()),
            },
            PulseCliError::NoDocuments => CliError {
                code: "NO_DOCUMENTS".to_string(),
                message: "No source documents found in input".to_string(),
                hint: Some("Ensure input file is not empty".to_string()),
            },
            PulseCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} documents failed validation", count),
                hint: Some("Fix validation errors and retry".to_string()),
            },
            PulseCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct ValidationReport {
    total_documents: usize,
    valid_documents: usize,
    invalid_documents: usize,
    errors: Vec<ValidationErrorDetail>,
    documents: Vec<DocumentSummary>,
}

#[derive(serde::Serialize)]
struct ValidationErrorDetail {
    index: usize,
    region_id: String,
    error: String,
}

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
