//! CLI-specific functionality for the sandbox daemon
//!
//! This module contains argument parsing and configuration discovery.

pub mod args;
pub mod config;

pub use args::{Args, ExecutionMode, ServeConfig};
pub use config::ConfigDiscovery;
