//! Error types for peercoms
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Exit codes for the CLI
//!
//! Handler failures use their own [`HandlerError`] type, since they are
//! produced by application code and never cross the coordinator boundary.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for peercoms operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Transport errors (3xx)
    TransportFailed = 300,
    PeerExited = 301,

    // Protocol errors (4xx)
    ValidationFailed = 400,
    DecodeFailed = 401,

    // Dispatch errors (5xx)
    QueueFull = 500,
    RequestTimeout = 501,
    RemoteHandler = 502,
    Shutdown = 503,

    // Internal errors (9xx)
    InvalidState = 900,
    InternalError = 901,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Transport errors
            400..=499 => 40, // Protocol errors
            500..=599 => 50, // Dispatch errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Malformed message construction
    #[error("Invalid message: {message}")]
    Validation { message: String, field: Option<String> },

    /// Inbound payload did not parse into a well-formed message
    #[error("Failed to decode message: {message}")]
    Decode { message: String },

    // ─────────────────────────────────────────────────────────────
    // Transport Errors
    // ─────────────────────────────────────────────────────────────

    /// Underlying send/start/stop failure
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The addressed peer left before answering
    #[error("Peer {peer_id} exited")]
    PeerExited { peer_id: String },

    // ─────────────────────────────────────────────────────────────
    // Dispatch Errors
    // ─────────────────────────────────────────────────────────────

    /// Bounded inbound queue at capacity
    #[error("Inbound queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// No reply arrived for a correlated request
    #[error("Request {req_id} timed out after {timeout_ms}ms")]
    RequestTimeout { req_id: String, timeout_ms: u64 },

    /// The remote handler failed and sent a failure reply
    #[error("Remote handler for '{key}' failed: {message}")]
    RemoteHandler { key: String, message: String },

    /// The coordinator shut down while the operation was pending
    #[error("Coordinator shut down")]
    Shutdown,

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Coordinator already started
    #[error("Coordinator is already running")]
    AlreadyRunning,

    /// Operation requires a running coordinator
    #[error("Coordinator is not running")]
    NotRunning,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,

            Error::Validation { .. } => ErrorCode::ValidationFailed,
            Error::Decode { .. } => ErrorCode::DecodeFailed,

            Error::Transport { .. } => ErrorCode::TransportFailed,
            Error::PeerExited { .. } => ErrorCode::PeerExited,

            Error::QueueFull { .. } => ErrorCode::QueueFull,
            Error::RequestTimeout { .. } => ErrorCode::RequestTimeout,
            Error::RemoteHandler { .. } => ErrorCode::RemoteHandler,
            Error::Shutdown => ErrorCode::Shutdown,

            Error::AlreadyRunning | Error::NotRunning => ErrorCode::InvalidState,
            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. }
                | Error::RequestTimeout { .. }
                | Error::Io(_)
        )
    }

    /// Check if the error is fatal (node should exit)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'peercoms config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'peercoms config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),
            Error::Validation { .. } => Some(
                "Set a type and a routing key on the builder; whispers also need a destination."
            ),
            Error::Transport { .. } => Some(
                "Check that the node joined a group and that the target peer is still connected."
            ),
            Error::QueueFull { .. } => Some(
                "Increase 'queue_capacity' or 'workers' in the [coordinator] section."
            ),
            Error::RequestTimeout { .. } => Some(
                "The peer may not handle this routing key. Check its announced capabilities."
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();
        let suggestion = self.suggestion();

        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            code.as_str(),
            self
        );

        if let Some(hint) = suggestion {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors (for ergonomic error creation)
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound { path: path.into() }
    }

    /// Create a config parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Error::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config validation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a message validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a message validation error for a specific field
    pub fn field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Error::Decode {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Handler Errors
// ─────────────────────────────────────────────────────────────────

/// Error returned by an application handler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler could not complete its work
    #[error("{0}")]
    Failed(String),

    /// The inbound payload did not have the shape the handler expects
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The handler panicked
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Create a generic handler failure
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }

    /// Short machine-readable kind, carried in failure replies
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::Failed(_) => "failed",
            HandlerError::InvalidPayload(_) => "invalid_payload",
            HandlerError::Panicked(_) => "panicked",
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::InvalidPayload(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
