// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for muxing pipelines.
//!
//! Every error implements `Display` and converts to and from `String` so node
//! code can keep using `format!`-style messages at the edges.

use thiserror::Error;

/// Main error type for node and pipeline operations.
#[derive(Debug, Error)]
pub enum MuxKitError {
    /// Configuration or parameter validation error.
    ///
    /// Examples:
    /// - Unknown container format id
    /// - Malformed node parameters
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Runtime processing error during normal operation.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Stream negotiation error.
    ///
    /// Raised when an input never agrees on an encoding the target container
    /// can carry, so the session can never open.
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Codec or container library error.
    ///
    /// Examples:
    /// - Muxer could not be opened on its output sink
    /// - Muxer rejected the stream parameters
    /// - Header serialization failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// I/O error raised by an output sink.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results using `MuxKitError`.
pub type Result<T> = std::result::Result<T, MuxKitError>;

impl From<MuxKitError> for String {
    fn from(err: MuxKitError) -> Self {
        err.to_string()
    }
}

// Generic string errors default to Runtime.
impl From<String> for MuxKitError {
    fn from(s: String) -> Self {
        Self::Runtime(s)
    }
}

impl From<&str> for MuxKitError {
    fn from(s: &str) -> Self {
        Self::Runtime(s.to_string())
    }
}
