//! Error types for the blueteeth stack.

use thiserror::Error;

/// Main error type for all blueteeth operations.
#[derive(Debug, Error)]
pub enum BlueteethError {
    /// I/O error on a serial link or socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Packet payload exceeds the fixed payload capacity.
    #[error("Payload of {len} bytes exceeds capacity of {capacity} bytes")]
    PayloadTooLarge {
        /// Length the caller tried to store.
        len: usize,
        /// Fixed payload capacity.
        capacity: usize,
    },

    /// Control-plane record is truncated or carries an unknown field.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Data-plane sentinel framing violated (length or sentinel mismatch).
    #[error("Framing error: {0}")]
    Framing(String),

    /// Invalid stack configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Terminal input that is not a known command.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Link closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - link write buffer full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

/// Result type alias using BlueteethError.
pub type Result<T> = std::result::Result<T, BlueteethError>;
