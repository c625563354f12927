//! # sandboxd
//!
//! A control-plane daemon that provisions, isolates, monitors and tears down
//! per-tenant compute sandboxes on a shared container host, and bridges files
//! between the host and each sandbox.
//!
//! ## Architecture Overview
//!
//! - **[`naming`]**: deterministic resource names per tenant and path confinement
//! - **[`container`]**: the container engine adapter (Docker via bollard, or in-memory)
//! - **[`sandbox`]**: the per-tenant lifecycle state machine
//! - **[`watchdog`]**: idle deadlines and the eviction task
//! - **[`bridge`]**: inline and staged file transfers, secrets, listings
//! - **[`api`]**: the request catalogue and the line-delimited JSON listener
//!
//! Multi-tenant: every container and network name embeds the tenant id, and
//! every user-supplied path is confined under a fixed root before it reaches
//! the engine.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sandboxd::container::MemoryEngine;
//! use sandboxd::naming::{DataSourceRef, TenantId};
//! use sandboxd::sandbox::SandboxManager;
//! use sandboxd::watchdog::{IdleTimers, SystemClock};
//! use sandboxd::SandboxdConfig;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SandboxdConfig::default();
//!     let timers = Arc::new(IdleTimers::new(Arc::new(SystemClock)));
//!     let manager = SandboxManager::new(Arc::new(MemoryEngine::new()), timers, &config);
//!
//!     let alice = TenantId::parse("alice")?;
//!     let source = DataSourceRef::parse("demo")?;
//!     manager.start_sandbox(&alice, &source, "sandboxd/compute", "latest").await?;
//!     println!("running at {}", manager.get_address(&alice).await?);
//!
//!     manager.stop_sandbox(&alice).await?;
//!     Ok(())
//! }
//! ```

/// Request catalogue and TCP front end.
pub mod api;

/// Host ↔ container file transfers.
pub mod bridge;

/// Daemon configuration loaded from TOML.
pub mod config;

/// Container engine adapter.
pub mod container;

/// Environment constants and path utilities.
///
/// Centralizes fixed paths and directory names used throughout the daemon.
pub mod env;

/// Resource naming and path confinement.
pub mod naming;

/// Per-tenant sandbox lifecycle.
pub mod sandbox;

/// Idle eviction.
pub mod watchdog;

// CLI module for command-line interface
pub mod cli;

pub use api::{Request, Response, SandboxService};
pub use bridge::FileBridge;
pub use config::{ConfigError, SandboxdConfig};
pub use container::{Effect, Engine, EngineError};
pub use naming::{DataSourceRef, ResourceNames, TenantId};
pub use sandbox::{SandboxError, SandboxManager};
pub use watchdog::{IdleTimers, IdleWatchdog};
