//! # Error Handling
//!
//! This module defines the error taxonomy of the call-session engine.
//! Every failure in capture, transport, polling or enrollment ends up as one
//! of these variants, so each state machine can move to an explicit state
//! instead of crashing the process.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Result<T, E> Type
//! - **T**: The success type (what you get when everything works)
//! - **E**: The error type (what you get when something goes wrong)
//!
//! ### Traits for Error Conversion
//! - **From trait**: Automatically converts library errors with `?`
//! - **Display trait**: Defines how errors are formatted as strings
//!
//! ## Error Categories:
//! - **DeviceUnavailable**: Microphone permission or hardware problem (retry is the only recovery)
//! - **Transport**: WebSocket failed or closed unexpectedly (treated as session end)
//! - **SessionNotFound**: The risk service does not know the session (terminal)
//! - **RiskFetchFailed**: A risk poll failed (terminal for the poll loop)
//! - **EnrollmentFailed**: The enrollment upload was rejected (shown to the user)

use std::fmt;

/// Custom error types for the call-session engine.
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::DeviceUnavailable("no default input device".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Microphone could not be opened (permission denied, unplugged, unsupported format)
    DeviceUnavailable(String),

    /// Duplex socket failed to connect, errored, or was closed by the peer
    Transport(String),

    /// The risk service answered 404 for this session id
    SessionNotFound(String),

    /// Fetching a risk snapshot failed
    RiskFetchFailed(String),

    /// Enrollment upload was rejected; holds the server's detail message
    EnrollmentFailed(String),

    /// Any other non-success HTTP exchange with the risk service
    Api(String),

    /// Agent audio could not be decoded or played
    Playback(String),

    /// Recording container could not be written or read
    Encoding(String),

    /// Configuration file or environment variable problems
    Config(String),

    /// Unexpected internal failure (closed channel, task panic)
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::DeviceUnavailable(msg) => write!(f, "Audio device unavailable: {}", msg),
            AppError::Transport(msg) => write!(f, "Transport error: {}", msg),
            AppError::SessionNotFound(id) => write!(f, "Session not found: {}", id),
            AppError::RiskFetchFailed(msg) => write!(f, "Risk fetch failed: {}", msg),
            AppError::EnrollmentFailed(msg) => write!(f, "Enrollment failed: {}", msg),
            AppError::Api(msg) => write!(f, "API error: {}", msg),
            AppError::Playback(msg) => write!(f, "Playback error: {}", msg),
            AppError::Encoding(msg) => write!(f, "Encoding error: {}", msg),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Text suitable for showing to a person.
    ///
    /// Enrollment errors are surfaced verbatim, minus any transport prefix
    /// such as `"Enrollment failed: 422: "` that an HTTP layer may have
    /// glued on in front of the server's own message.
    pub fn user_message(&self) -> String {
        match self {
            AppError::EnrollmentFailed(msg) => strip_transport_prefix(msg).to_string(),
            other => other.to_string(),
        }
    }

    /// Whether this error ends the current session rather than a single operation.
    pub fn is_session_terminal(&self) -> bool {
        matches!(
            self,
            AppError::Transport(_) | AppError::SessionNotFound(_)
        )
    }
}

/// Remove a leading `"Enrollment failed: <status>: "` from a message.
fn strip_transport_prefix(msg: &str) -> &str {
    let Some(rest) = msg.strip_prefix("Enrollment failed: ") else {
        return msg;
    };
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return rest;
    }
    rest[digits..].strip_prefix(": ").unwrap_or(rest)
}

/// HTTP client failures. A 404 is handled by the caller before this
/// conversion, so everything landing here is a generic API error.
impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Api(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Api(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;
