//! # Error Handling
//!
//! This module defines the error taxonomy for the voice chat backend and how
//! each error is converted into an HTTP response.
//!
//! ## Error Categories:
//! - **MissingCapability**: a required external tool (ffmpeg, whisper, ...) is
//!   not installed. The session is told, the pipeline stays usable once the
//!   tool is available.
//! - **Timeout**: a bounded wait on a background task expired. The underlying
//!   work is *not* cancelled and may still complete later.
//! - **NotReady**: text generation was requested before the shared model
//!   finished loading.
//! - **EngineFailure**: a transcription/generation/speech engine raised. The
//!   session state (queue, history) is left consistent.
//! - **BadRequest**: the client sent invalid data.
//! - **Internal**: everything else (I/O failures, poisoned state, ...).
//!
//! ## Propagation policy:
//! Flow-critical errors (merge/transcribe failure, generation failure) are
//! surfaced to the caller as a structured status + message pair. Component
//! local errors (fragment eviction, per-sentence speech synthesis) are logged
//! and swallowed, since they are non-critical to the primary flow.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error type covering every failure the core components can report.
#[derive(Debug)]
pub enum AppError {
    /// A required external tool is absent from the system
    MissingCapability(String),

    /// A bounded wait expired; the background work keeps running
    Timeout(String),

    /// The shared generation model has not reached the ready state yet
    NotReady(String),

    /// An external engine (transcription, generation, speech) failed
    EngineFailure(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Server-side problems (file I/O, task join failures, ...)
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::MissingCapability(msg) => write!(f, "Missing capability: {}", msg),
            AppError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            AppError::NotReady(msg) => write!(f, "Not ready: {}", msg),
            AppError::EngineFailure(msg) => write!(f, "Engine failure: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl AppError {
    /// Machine-readable error tag used on the wire and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::MissingCapability(_) => "missing_capability",
            AppError::Timeout(_) => "timeout",
            AppError::NotReady(_) => "not_ready",
            AppError::EngineFailure(_) => "engine_failure",
            AppError::BadRequest(_) => "bad_request",
            AppError::Internal(_) => "internal_error",
        }
    }
}

/// Conversion of errors into HTTP responses for the REST surface.
///
/// ## HTTP Status Code Mapping:
/// - MissingCapability → 503 (Service Unavailable)
/// - Timeout → 504 (Gateway Timeout)
/// - NotReady/BadRequest → 400 (Bad Request)
/// - EngineFailure → 502 (Bad Gateway)
/// - Internal → 500 (Internal Server Error)
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, message) = match self {
            AppError::MissingCapability(msg) => {
                (actix_web::http::StatusCode::SERVICE_UNAVAILABLE, msg.clone())
            }
            AppError::Timeout(msg) => {
                (actix_web::http::StatusCode::GATEWAY_TIMEOUT, msg.clone())
            }
            AppError::NotReady(msg) | AppError::BadRequest(msg) => {
                (actix_web::http::StatusCode::BAD_REQUEST, msg.clone())
            }
            AppError::EngineFailure(msg) => {
                (actix_web::http::StatusCode::BAD_GATEWAY, msg.clone())
            }
            AppError::Internal(msg) => {
                (actix_web::http::StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": self.kind(),
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(format!("I/O error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Internal(format!("Configuration error: {}", err))
    }
}

/// Shorthand for `Result<T, AppError>` used throughout the crate.
pub type AppResult<T> = Result<T, AppError>;
