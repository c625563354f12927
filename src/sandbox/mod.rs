//! Per-tenant sandbox lifecycle.
//!
//! A sandbox is a data volume holder, an isolated network and a
//! resource-limited compute container. [`SandboxManager`] sequences the
//! engine calls that bring it up and tear it down.

pub mod lifecycle;
pub mod limits;

pub use lifecycle::SandboxManager;
pub use limits::ResourceLimits;

use crate::config::ConfigError;
use crate::container::EngineError;
use crate::naming::{NamingError, PathError};

/// Errors surfaced by the lifecycle manager and the file bridge.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Tenant id, data source or image name rejected
    #[error("Validation failed: {0}")]
    Validation(#[from] NamingError),

    /// Path escapes its root
    #[error("Invalid path: {0}")]
    Path(#[from] PathError),

    /// Engine unreachable or timed out
    #[error("Container engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Container, file or variable missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// A start step failed; earlier steps stay in place
    #[error("Sandbox start failed at step '{step}': {source}")]
    PartialFailure {
        /// Step that failed
        step: &'static str,
        /// Engine error of that step
        #[source]
        source: EngineError,
    },

    /// Engine rejected a request
    #[error("Container engine error: {0}")]
    Engine(EngineError),

    /// Inline payload above the configured ceiling
    #[error("Payload of {size} bytes exceeds the inline limit of {limit} bytes")]
    PayloadTooLarge {
        /// Payload size
        size: usize,
        /// Configured ceiling
        limit: usize,
    },

    /// A file operation addressed a directory
    #[error("{0} is a directory")]
    IsDirectory(String),

    /// Compute container has no network address
    #[error("Container {0} has no address")]
    NoAddress(String),

    /// A filesystem command inside a helper container failed
    #[error("{operation} failed for {path}: {message}")]
    FileOperation {
        /// Command name
        operation: &'static str,
        /// Container path
        path: String,
        /// Helper output
        message: String,
    },

    /// Host filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SandboxError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            SandboxError::Validation(_) => "validation",
            SandboxError::Path(_) => "path",
            SandboxError::EngineUnavailable(_) => "engine_unavailable",
            SandboxError::NotFound(_) => "not_found",
            SandboxError::PartialFailure { .. } => "partial_failure",
            SandboxError::Engine(_) => "engine",
            SandboxError::PayloadTooLarge { .. } => "payload_too_large",
            SandboxError::IsDirectory(_) => "is_directory",
            SandboxError::NoAddress(_) => "no_address",
            SandboxError::FileOperation { .. } => "file_operation",
            SandboxError::Io(_) => "io",
            SandboxError::Config(_) => "config",
        }
    }

    pub(crate) fn partial(step: &'static str, source: EngineError) -> Self {
        match source {
            EngineError::Unavailable(message) => SandboxError::EngineUnavailable(message),
            source => SandboxError::PartialFailure { step, source },
        }
    }
}

impl From<EngineError> for SandboxError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable(message) => SandboxError::EngineUnavailable(message),
            EngineError::NotFound(message) => SandboxError::NotFound(message),
            EngineError::IoError(e) => SandboxError::Io(e),
            other => SandboxError::Engine(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
