//! FFI bindings for Pulse Index
//!
//! This module provides C-compatible functions for calling the pipeline from other languages.
//! All functions use C strings (null-terminated) and return allocated memory that
//! must be freed by the caller using `pulse_free_string`.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

use crate::config::PipelineConfig;
use crate::encoder::AnalysisEncoder;
use crate::error::ComputeError;
use crate::pipeline::{analyze_region, BehaviorPipeline};
use crate::risk::{classify_risk, RiskClassifier};
use crate::schema::SourcesAdapter;
use crate::trace::{DecisionTrace, TraceContext};
use crate::types::{RiskClassification, TrendDirection};

// Thread-local storage for the last error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Set the last error message
fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

/// Clear the last error message
fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Helper to convert C string to Rust string
unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Helper to convert Rust string to C string (caller must free)
fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Return the string result, or record the error and return NULL
fn finish(result: Result<String, ComputeError>) -> *mut c_char {
    match result {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Optional config: NULL means defaults
unsafe fn load_config(config_json: *const c_char) -> Result<PipelineConfig, ComputeError> {
    if config_json.is_null() {
        return Ok(PipelineConfig::default());
    }
    let json = cstr_to_string(config_json)
        .ok_or_else(|| ComputeError::ParseError("Config is not valid UTF-8".to_string()))?;
    PipelineConfig::from_json(&json)
}

#[derive(serde::Serialize)]
struct ClassificationOutput {
    classification: RiskClassification,
    trace: DecisionTrace,
}

// ============================================================================
// Stateless API
// ============================================================================

/// Analyze a pulse.sources.v1 document and return the analysis payload JSON.
///
/// # Safety
/// - `input` must be a valid null-terminated C string.
/// - `config_json` must be a valid null-terminated C string or NULL for defaults.
/// - Returns a newly allocated string that must be freed with `pulse_free_string`.
/// - Returns NULL on error; call `pulse_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn pulse_analyze_json(
    input: *const c_char,
    config_json: *const c_char,
) -> *mut c_char {
    clear_last_error();

    let input_str = match cstr_to_string(input) {
        Some(s) => s,
        None => {
            set_last_error("Invalid input string pointer");
            return ptr::null_mut();
        }
    };

    let config = match load_config(config_json) {
        Ok(config) => config,
        Err(e) => {
            set_last_error(&e.to_string());
            return ptr::null_mut();
        }
    };

    finish(SourcesAdapter::parse_document(&input_str).and_then(|document| {
        let analysis = analyze_region(document.region.clone(), &document.fetches(), &config);
        AnalysisEncoder::new().encode_to_json(&analysis)
    }))
}

/// Classify risk and return `{classification, trace}` JSON.
///
/// Pass NaN as `convergence_score` when it is unknown, and NULL (or an
/// unrecognized string) as `trend` for no trend.
///
/// # Safety
/// - `trend` must be a valid null-terminated C string or NULL.
/// - Returns a newly allocated string that must be freed with `pulse_free_string`.
#[no_mangle]
pub unsafe extern "C" fn pulse_classify_risk(
    behavior_index: f64,
    convergence_score: f64,
    trend: *const c_char,
) -> *mut c_char {
    clear_last_error();

    let trend = cstr_to_string(trend).and_then(|t| TrendDirection::parse(&t));
    let convergence = (!convergence_score.is_nan()).then_some(convergence_score);

    let classification = classify_risk(behavior_index, &[], convergence, trend);
    let trace = RiskClassifier::new().trace(&classification, &TraceContext::default());
    let output = ClassificationOutput {
        classification,
        trace: trace.sanitized(),
    };
    finish(serde_json::to_string(&output).map_err(|e| ComputeError::EncodingError(e.to_string())))
}

// ============================================================================
// Pipeline API (with result cache)
// ============================================================================

/// Opaque handle to a BehaviorPipeline
pub struct PulsePipelineHandle {
    pipeline: BehaviorPipeline,
    encoder: AnalysisEncoder,
}

/// Create a pipeline. `config_json` may be NULL for defaults.
///
/// # Safety
/// - Returns a pointer to a newly allocated pipeline.
/// - Must be freed with `pulse_pipeline_free`.
/// - Returns NULL on error; call `pulse_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn pulse_pipeline_new(config_json: *const c_char) -> *mut PulsePipelineHandle {
    clear_last_error();

    match load_config(config_json).and_then(BehaviorPipeline::new) {
        Ok(pipeline) => Box::into_raw(Box::new(PulsePipelineHandle {
            pipeline,
            encoder: AnalysisEncoder::new(),
        })),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Free a pipeline.
///
/// # Safety
/// - `pipeline` must be a valid pointer returned by `pulse_pipeline_new`.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn pulse_pipeline_free(pipeline: *mut PulsePipelineHandle) {
    if !pipeline.is_null() {
        drop(Box::from_raw(pipeline));
    }
}

/// Analyze a document through the pipeline's result cache.
///
/// # Safety
/// - `pipeline` must be a valid pointer returned by `pulse_pipeline_new`.
/// - `input` must be a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `pulse_free_string`.
/// - Returns NULL on error; call `pulse_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn pulse_pipeline_analyze(
    pipeline: *mut PulsePipelineHandle,
    input: *const c_char,
) -> *mut c_char {
    clear_last_error();

    if pipeline.is_null() {
        set_last_error("Null pipeline pointer");
        return ptr::null_mut();
    }
    let handle = &*pipeline;

    let input_str = match cstr_to_string(input) {
        Some(s) => s,
        None => {
            set_last_error("Invalid input string pointer");
            return ptr::null_mut();
        }
    };

    finish(SourcesAdapter::parse_document(&input_str).and_then(|document| {
        let analysis = handle
            .pipeline
            .analyze_cached(&document.region, || Ok(document.fetches()))?;
        handle.encoder.encode_to_json(&analysis)
    }))
}

/// Free a string returned by Pulse functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by a Pulse function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn pulse_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error message.
///
/// # Safety
/// - Returns a pointer to a thread-local error string.
/// - The returned pointer is valid until the next Pulse function call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn pulse_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

/// Get the library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn pulse_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
