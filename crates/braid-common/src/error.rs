//! Error types for braid
//!
//! We use `thiserror` for structured error types that can be matched on,
//! and `anyhow` for error propagation in application code.

use thiserror::Error;

/// Central error type for braid operations
#[derive(Error, Debug)]
pub enum BraidError {
    // === Protocol Errors ===
    #[error("Invalid command byte: {0:#04x}")]
    InvalidCommand(u8),

    #[error("Frame too short: {len} bytes (min: {min})")]
    FrameTooShort { len: usize, min: usize },

    #[error("Frame too large: {len} bytes (max: {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Unexpected command: expected {expected}, got {actual}")]
    UnexpectedCommand {
        expected: &'static str,
        actual: &'static str,
    },

    // === Authentication Errors ===
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Login timed out")]
    LoginTimeout,

    // === Path Errors ===
    #[error("Empty dial path")]
    EmptyPath,

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    // === Session Errors ===
    #[error("Dial failed: {0}")]
    DialFailed(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    // === Transport Errors ===
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel overloaded")]
    ChannelOverloaded,

    #[error("Router closed")]
    RouterClosed,

    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Serialization ===
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias using BraidError
pub type Result<T> = std::result::Result<T, BraidError>;

impl From<serde_json::Error> for BraidError {
    fn from(err: serde_json::Error) -> Self {
        BraidError::Serialization(err.to_string())
    }
}
