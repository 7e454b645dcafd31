//! Error types for the Ares VM crate
//!
//! This module provides error handling for VM operations: bytecode loading,
//! execution, memory accounting, and state persistence.

use thiserror::Error;

/// The pinned out-of-memory message. Allocation failure must not itself
/// allocate, so every surface that reports exhaustion reuses this string.
pub const OUT_OF_MEMORY_MESSAGE: &str = "not enough memory";

/// VM operation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VmError {
    /// Bytecode container is unreadable or rejected by validation
    #[error("Bad bytecode: {reason}")]
    BadBytecode { reason: String },

    /// A script raised an error with a string message
    #[error("Runtime error: {message}")]
    Runtime { message: String },

    /// Allocation failed
    #[error("not enough memory")]
    OutOfMemory,

    /// A per-category byte limit was exceeded
    #[error("Memory category {category} limit exceeded: used {used} bytes, limit {limit} bytes")]
    CategoryLimitExceeded {
        category: u8,
        used: usize,
        limit: usize,
    },

    /// Call depth ceiling reached
    #[error("Call depth limit exceeded: depth {depth}, limit {limit}")]
    CallDepthExceeded { depth: usize, limit: usize },

    /// A thread operation was attempted in the wrong state
    #[error("Invalid thread state: cannot {operation} a {status} task")]
    InvalidThreadState { operation: String, status: String },

    /// State serialization failed
    #[error("Persist error: {reason}")]
    Persist { reason: String },

    /// State deserialization failed
    #[error("Restore error: {reason}")]
    Restore { reason: String },

    /// A permanents-table key in the stream has no local counterpart
    #[error("Unknown permanent: {key}")]
    UnknownPermanent { key: String },

    /// A native function with no permanents entry reached the serializer
    #[error("Native function '{name}' has no portable representation")]
    ForbiddenNative { name: String },

    /// VM invariant violated; propagated as fatal
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// Low-level stream error
    #[error("I/O error: {message}")]
    Io { message: String },
}

impl VmError {
    /// Create a new bad-bytecode error
    pub fn bad_bytecode<S: Into<String>>(reason: S) -> Self {
        Self::BadBytecode {
            reason: reason.into(),
        }
    }

    /// Create a new runtime error
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Create a new invalid-thread-state error
    pub fn invalid_thread_state<S: Into<String>>(operation: S, status: S) -> Self {
        Self::InvalidThreadState {
            operation: operation.into(),
            status: status.into(),
        }
    }

    /// Create a new persist error
    pub fn persist<S: Into<String>>(reason: S) -> Self {
        Self::Persist {
            reason: reason.into(),
        }
    }

    /// Create a new restore error
    pub fn restore<S: Into<String>>(reason: S) -> Self {
        Self::Restore {
            reason: reason.into(),
        }
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Check if this error is unrecoverable by user code
    pub fn is_fatal(&self) -> bool {
        matches!(self, VmError::OutOfMemory | VmError::Internal { .. })
    }

    /// Check if this error belongs to the persistence subsystem
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            VmError::Persist { .. }
                | VmError::Restore { .. }
                | VmError::UnknownPermanent { .. }
                | VmError::ForbiddenNative { .. }
        )
    }

    /// Check if this error is a resource limit error
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            VmError::OutOfMemory
                | VmError::CategoryLimitExceeded { .. }
                | VmError::CallDepthExceeded { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            VmError::BadBytecode { .. } => "load",
            VmError::Runtime { .. } => "runtime",
            VmError::OutOfMemory | VmError::CategoryLimitExceeded { .. } => "memory",
            VmError::CallDepthExceeded { .. } => "stack",
            VmError::InvalidThreadState { .. } => "thread",
            VmError::Persist { .. }
            | VmError::Restore { .. }
            | VmError::UnknownPermanent { .. }
            | VmError::ForbiddenNative { .. } => "persistence",
            VmError::Internal { .. } => "internal",
            VmError::Io { .. } => "io",
        }
    }

    /// The message a script observes when this error unwinds into it.
    pub fn script_message(&self) -> String {
        match self {
            VmError::Runtime { message } => message.clone(),
            VmError::OutOfMemory => OUT_OF_MEMORY_MESSAGE.to_string(),
            other => other.to_string(),
        }
    }
}

/// Result type for VM operations
pub type VmResult<T> = std::result::Result<T, VmError>;

impl From<ares_io::IoError> for VmError {
    fn from(error: ares_io::IoError) -> Self {
        match error {
            ares_io::IoError::EndOfStream { context, .. } => {
                VmError::io(format!("unexpected end of stream: {context}"))
            }
            other => VmError::io(other.to_string()),
        }
    }
}
