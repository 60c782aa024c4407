//! Common error types for stratum-switcher.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from underlying error types used throughout the crate.
//! Errors that are reported to miners on the wire are modelled separately by
//! [`StratumError`](crate::stratum::StratumError) and wrap into this type.

use thiserror::Error;

use crate::stratum::StratumError;

/// Main error type for stratum-switcher operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Coordination store failures other than the two below
    #[error("Watch store error: {0}")]
    Store(String),

    #[error("Watch store node does not exist: {0}")]
    NoNode(String),

    #[error("Watch store node already exists: {0}")]
    NodeExists(String),

    /// Every session index on this server is in use
    #[error("Session id space is full")]
    SessionIdFull,

    #[error("Session id {0:08x} is already in use")]
    SessionIdOccupied(u32),

    #[error("Session id {0:08x} does not belong to this server")]
    InvalidSessionId(u32),

    /// First client bytes match no known dialect
    #[error("Unknown protocol")]
    UnknownProtocol,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Connection closed by {0}")]
    Closed(&'static str),

    /// Back-end sent something other than a usable subscribe response
    #[error("Parse subscribe response failed: {0}")]
    SubscribeResponse(String),

    #[error("Session id inconformity: server returned {returned}, expected {expected}")]
    SessionIdInconformity { returned: String, expected: String },

    #[error("Authorize failed for {0}")]
    AuthorizeFailed(String),

    /// Error that is also reported to the miner
    #[error("Stratum error: {0}")]
    Stratum(#[from] StratumError),

    /// Session was stopped or superseded while an operation was in flight
    #[error("Session is not running")]
    NotRunning,

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    /// Live upgrade hand-off errors
    #[error("Upgrade error: {0}")]
    Upgrade(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
