//! Container engine adapter.
//!
//! This module is the only place that talks to the container engine. The
//! lifecycle manager and the file bridge see it through the [`Engine`] trait,
//! which addresses every resource by the canonical name produced in
//! [`crate::naming`].
//!
//! ## Architecture
//!
//! - [`engine`]: the [`Engine`] contract plus the engine-neutral data it exchanges
//! - [`config`]: container creation specs and their builder
//! - [`network`]: network specs (and the Docker network calls)
//! - [`executor`]: one-shot helper jobs and the filesystem commands they run
//! - [`archive`]: tar packing/unpacking for copy-in and copy-out
//! - [`memory`]: an in-process engine used by tests
//! - `client` / `docker` (feature `docker`): the bollard-backed engine
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sandboxd::container::{ContainerSpec, DockerEngine, Engine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = DockerEngine::connect(&EngineConfig::default()).await?;
//!
//!     let spec = ContainerSpec::builder()
//!         .name("sbx-compute-alice")
//!         .image("alpine:latest")
//!         .memory_limit(268_435_456)
//!         .publish_loopback(9090)
//!         .build()?;
//!
//!     engine.create_container(&spec).await?;
//!     engine.start_container("sbx-compute-alice").await?;
//!     engine
//!         .stop_and_remove("sbx-compute-alice", std::time::Duration::from_secs(5))
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod archive;
mod config;
mod engine;
mod executor;
pub mod memory;
mod network;

#[cfg(feature = "docker")]
mod client;
#[cfg(feature = "docker")]
mod docker;

pub use archive::{ArchiveEntry, EntryKind};
pub use config::{ContainerSpec, ContainerSpecBuilder, PublishedPort};
pub use engine::{ArchiveStream, ContainerDetails, ContainerSummary, Engine, EngineConfig};
pub use executor::{ExecOutput, FsCommand, HelperJob, Owner};
pub use memory::MemoryEngine;
pub use network::NetworkSpec;

#[cfg(feature = "docker")]
pub use client::ContainerClient;
#[cfg(feature = "docker")]
pub use docker::DockerEngine;

use serde::Serialize;

/// Container engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Engine unreachable or the call timed out
    #[error("Container engine unavailable: {0}")]
    Unavailable(String),

    /// Container, network or path not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists or is in a conflicting state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Engine rejected the request
    #[error("Container API error ({status}): {message}")]
    Api {
        /// HTTP status returned by the engine
        status: u16,
        /// Engine-provided message
        message: String,
    },

    /// Container configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Tar archive could not be built or read
    #[error("Archive error: {0}")]
    Archive(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// General error
    #[error("Container error: {0}")]
    Other(String),
}

impl EngineError {
    /// Whether the error means the addressed resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

#[cfg(feature = "docker")]
impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error as BollardError;

        match err {
            BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            } => EngineError::NotFound(message),
            BollardError::DockerResponseServerError {
                status_code: 409,
                message,
            } => EngineError::Conflict(message),
            BollardError::DockerResponseServerError {
                status_code,
                message,
            } => EngineError::Api {
                status: status_code,
                message,
            },
            BollardError::RequestTimeoutError => {
                EngineError::Unavailable("request timed out".to_string())
            }
            e @ (BollardError::JsonDataError { .. } | BollardError::JsonSerdeError { .. }) => {
                EngineError::Other(e.to_string())
            }
            // Transport-level failures: socket missing, connection refused, broken pipe.
            e => EngineError::Unavailable(e.to_string()),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Outcome of an idempotent engine operation.
///
/// `Absent` means the call had nothing to act on (container already gone,
/// already stopped, network already present); it is a success, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    /// The operation changed engine state
    Applied,
    /// Nothing to do
    Absent,
}

impl Effect {
    /// Whether the operation changed engine state.
    pub fn applied(self) -> bool {
        matches!(self, Effect::Applied)
    }

    /// Combine two effects; applied if either was.
    pub fn or(self, other: Effect) -> Effect {
        if self.applied() || other.applied() {
            Effect::Applied
        } else {
            Effect::Absent
        }
    }
}
