//! Sandbox error types.

use thiserror::Error;

/// Result type for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors raised by the path resolver and the container orchestrator.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The engine client could not be constructed at startup.
    #[error("container engine unavailable")]
    EngineUnavailable,

    /// The engine has no container for this handle.
    #[error("container not found: {0}")]
    HandleNotFound(String),

    /// A resolved workspace path escaped the configured root.
    #[error("security violation: {0}")]
    SecurityViolation(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The engine rejected or failed an operation.
    #[error("container {operation} failed: {message}")]
    Engine { operation: String, message: String },

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn engine(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Engine {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}
