//! Error types for the MQTT engine core
//!
//! Construction errors are returned synchronously from `ClientBuilder::build()`.
//! Everything that happens after a client exists is delivered through the
//! client's callback, so every error here is cheap to clone and carries a
//! human-readable description.

use crate::client::state::ConnectionState;
use crate::transport::ConnAckCode;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// Main error type for engine operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("Invalid configuration for `{field}`: {reason}")]
    Configuration { field: &'static str, reason: String },

    #[error("Connection failed: {0}")]
    Connection(#[from] ConnectionFailure),

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Persistence error: {message}")]
    Persistence { message: String },

    #[error("Operation rejected: {message}")]
    Operation { message: String },

    #[error("Client already destroyed")]
    AlreadyDestroyed,

    #[error("Operation not allowed while {state}")]
    InvalidState { state: ConnectionState },

    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },
}

/// Why a connection attempt did not produce a usable session
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectionFailure {
    #[error("server refused connection ({0})")]
    Refused(ConnAckCode),

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("no ConnAck within {0:?}")]
    Timeout(Duration),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("connection lost: {0}")]
    Lost(String),
}

impl EngineError {
    /// Create configuration error for the named field
    pub fn configuration<S: Into<String>>(field: &'static str, reason: S) -> Self {
        Self::Configuration {
            field,
            reason: reason.into(),
        }
    }

    /// Create protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create persistence error
    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Create operation error
    pub fn operation<S: Into<String>>(message: S) -> Self {
        Self::Operation {
            message: message.into(),
        }
    }

    /// Create invalid topic error
    pub fn invalid_topic<T: Into<String>, R: Into<String>>(topic: T, reason: R) -> Self {
        Self::InvalidTopic {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Create connection-lost error
    pub fn lost<S: Into<String>>(reason: S) -> Self {
        Self::Connection(ConnectionFailure::Lost(reason.into()))
    }

    /// Description suitable for logs and callbacks, with credentials redacted
    pub fn description(&self) -> String {
        sanitize_error_message(&self.to_string())
    }

    /// The configuration field this error names, if any
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Configuration { field, .. } => Some(*field),
            _ => None,
        }
    }

    /// Loss and protocol errors are recovered by reconnecting
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connection(ConnectionFailure::Lost(_))
                | Self::Connection(ConnectionFailure::Timeout(_))
                | Self::Connection(ConnectionFailure::Dial(_))
                | Self::Protocol { .. }
        )
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").expect("static regex")
});

static URL_CREDENTIALS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"://[^/@\s:]+:[^/@\s]+@").expect("static regex"));

/// Sanitize error messages so credentials never reach logs or callbacks
pub(crate) fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = URL_CREDENTIALS
        .replace_all(&sanitized, "://***@")
        .to_string();

    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
