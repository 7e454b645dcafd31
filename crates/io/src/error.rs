//! Error types for the Ares I/O crate
//!
//! This module provides error handling for binary stream operations:
//! reading past the end of a stream, malformed variable-length integers,
//! and values that exceed negotiated limits.

use thiserror::Error;

/// I/O operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// Unexpected end of stream
    #[error("Unexpected end of stream: expected {expected} more bytes while reading {context}")]
    EndOfStream { expected: usize, context: String },

    /// Invalid data content
    #[error("Invalid data: {context}, value: {value}")]
    InvalidData { context: String, value: String },

    /// Invalid data format
    #[error("Invalid format: expected {expected_format}, reason: {reason}")]
    InvalidFormat {
        expected_format: String,
        reason: String,
    },

    /// Stream position error
    #[error("Stream position error: attempted to seek to {position}, stream size {size}")]
    StreamPosition { position: usize, size: usize },

    /// A length prefix exceeds the limit imposed by the caller
    #[error("Length limit exceeded: declared {declared}, limit {limit}")]
    LengthLimitExceeded { declared: u64, limit: u64 },
}

impl IoError {
    /// Create a new end-of-stream error
    pub fn end_of_stream<S: Into<String>>(expected: usize, context: S) -> Self {
        Self::EndOfStream {
            expected,
            context: context.into(),
        }
    }

    /// Create a new invalid-data error
    pub fn invalid_data<S: Into<String>>(context: S, value: S) -> Self {
        Self::InvalidData {
            context: context.into(),
            value: value.into(),
        }
    }

    /// Create a new invalid-format error
    pub fn invalid_format<S: Into<String>>(expected_format: S, reason: S) -> Self {
        Self::InvalidFormat {
            expected_format: expected_format.into(),
            reason: reason.into(),
        }
    }

    /// Create a new stream-position error
    pub fn stream_position(position: usize, size: usize) -> Self {
        Self::StreamPosition { position, size }
    }

    /// Create a new length-limit error
    pub fn length_limit_exceeded(declared: u64, limit: u64) -> Self {
        Self::LengthLimitExceeded { declared, limit }
    }
}

/// Result type for I/O operations
pub type IoResult<T> = std::result::Result<T, IoError>;

/// Alias for compatibility with existing code
pub type Result<T, E = IoError> = std::result::Result<T, E>;
