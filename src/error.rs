//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **TurnError**: the conversation core's taxonomy. The presentation layer never
//!   sees these as exceptions; they only show up as a `Connecting` state cause or as
//!   a notice alongside a state change.
//! - **AppError**: HTTP-facing errors, converted to JSON responses for API clients.
//!
//! ## Recoverable vs. fatal:
//! - **PermissionDenied / MicrophoneBusy**: setup failures, the user must retry `start`
//! - **DeviceLost / ReplyTimedOut / WatcherUnavailable**: session drops to `Connecting`
//! - **Transcription / Dispatch / Playback**: absorbed, the controller goes back to listening
//!
//! Duplicate replies and stale continuations are not errors at all; they are counted
//! in the controller statistics and otherwise ignored.

use crate::arbitrator::OwnerTag;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use serde_json::json;
use std::fmt;

/// Failures the turn controller can run into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TurnError {
    /// Microphone access was refused by the user or the platform
    PermissionDenied(String),

    /// Another feature holds the microphone lease
    MicrophoneBusy { holder: OwnerTag },

    /// The capture stream dropped or could not be restarted
    DeviceLost(String),

    /// The transcription call failed
    Transcription(String),

    /// The dispatch call failed
    Dispatch(String),

    /// Speech synthesis or playback failed
    Playback(String),

    /// The completion watcher could not subscribe or its channel closed
    WatcherUnavailable(String),

    /// No reply arrived within the configured bound
    ReplyTimedOut { after_ms: u64 },

    /// The conversation session was closed by the user
    Closed,
}

impl TurnError {
    /// Whether the session can carry on (possibly after a user-initiated retry)
    /// instead of requiring the user to fix something first.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            TurnError::PermissionDenied(_) | TurnError::MicrophoneBusy { .. } | TurnError::Closed
        )
    }

    /// Short machine-readable name, used in logs and notices.
    pub fn kind(&self) -> &'static str {
        match self {
            TurnError::PermissionDenied(_) => "permission_denied",
            TurnError::MicrophoneBusy { .. } => "microphone_busy",
            TurnError::DeviceLost(_) => "device_lost",
            TurnError::Transcription(_) => "transcription",
            TurnError::Dispatch(_) => "dispatch",
            TurnError::Playback(_) => "playback",
            TurnError::WatcherUnavailable(_) => "watcher_unavailable",
            TurnError::ReplyTimedOut { .. } => "reply_timed_out",
            TurnError::Closed => "closed",
        }
    }
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnError::PermissionDenied(msg) => write!(f, "Microphone permission denied: {}", msg),
            TurnError::MicrophoneBusy { holder } => {
                write!(f, "Microphone is busy with another feature ({})", holder)
            }
            TurnError::DeviceLost(msg) => write!(f, "Capture device error: {}", msg),
            TurnError::Transcription(msg) => write!(f, "Transcription failed: {}", msg),
            TurnError::Dispatch(msg) => write!(f, "Dispatch failed: {}", msg),
            TurnError::Playback(msg) => write!(f, "Playback failed: {}", msg),
            TurnError::WatcherUnavailable(msg) => write!(f, "Reply channel unavailable: {}", msg),
            TurnError::ReplyTimedOut { after_ms } => {
                write!(f, "No reply received after {}ms", after_ms)
            }
            TurnError::Closed => write!(f, "Conversation is closed"),
        }
    }
}

impl std::error::Error for TurnError {}

/// Custom error types for the HTTP surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested conversation doesn't exist (404 errors)
/// - **Conflict**: Resource already in use, e.g. too many conversations (409 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    ConfigError(String),
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// Converts errors into HTTP responses with a consistent JSON body:
///
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Conversation abc is not active",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
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

/// Malformed JSON is always the client's fault, so it maps to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
