//! Configuration discovery.
//!
//! Hierarchy, first match wins: an explicit `--config` path, `./sandboxd.toml`,
//! `./.sandboxd/config.toml`, `/etc/sandboxd/config.toml`, built-in defaults.

use crate::config::{ConfigError, SandboxdConfig};
use crate::env;
use std::env as std_env;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load the configuration, honouring an explicit path first.
    ///
    /// An explicit path that does not exist is an error; a missing
    /// discovered file falls through to the next candidate.
    pub fn load(config_override: Option<&Path>) -> Result<SandboxdConfig, ConfigError> {
        if let Some(path) = config_override {
            info!("Loading configuration override from: {:?}", path);
            return SandboxdConfig::from_toml_file(path);
        }
        Self::discover_config()
    }

    /// Discover and load configuration using the hierarchy
    pub fn discover_config() -> Result<SandboxdConfig, ConfigError> {
        if let Some(config_path) = Self::find_config_file() {
            info!("Loading configuration from: {:?}", config_path);
            return SandboxdConfig::from_toml_file(config_path);
        }

        info!("No configuration file found, using defaults");
        Ok(SandboxdConfig::default())
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        Self::first_existing(Self::get_config_candidates())
    }

    fn first_existing(candidates: Vec<PathBuf>) -> Option<PathBuf> {
        for candidate in candidates {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                debug!("Found config file: {:?}", candidate);
                return Some(candidate);
            }
        }

        debug!("No config file found in discovery hierarchy");
        None
    }

    /// Get list of configuration file candidates in priority order
    fn get_config_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(current_dir) = std_env::current_dir() {
            candidates.extend(Self::local_candidates(&current_dir));
        }
        candidates.push(PathBuf::from(env::SYSTEM_CONFIG_PATH));

        candidates
    }

    fn local_candidates(current_dir: &Path) -> [PathBuf; 2] {
        [
            env::local_config_file_path(current_dir),
            env::config_file_path(current_dir),
        ]
    }

    /// Show configuration discovery information for debugging
    pub fn show_discovery_info(config_override: Option<&Path>) {
        println!("Configuration Discovery Hierarchy:");
        println!();

        let mut candidates = Self::get_config_candidates();
        if let Some(path) = config_override {
            candidates.insert(0, path.to_path_buf());
        }

        for (i, candidate) in candidates.iter().enumerate() {
            let status = if candidate.exists() {
                if candidate.is_file() {
                    "✓ EXISTS"
                } else {
                    "✗ NOT A FILE"
                }
            } else {
                "✗ NOT FOUND"
            };

            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        match config_override
            .map(Path::to_path_buf)
            .or_else(Self::find_config_file)
        {
            Some(found) => println!("Active configuration: {:?}", found),
            None => println!("Active configuration: Built-in defaults"),
        }

        match std_env::var_os(env::TRANSFER_ROOT_ENV) {
            Some(root) => println!("Transfer root ({}): {:?}", env::TRANSFER_ROOT_ENV, root),
            None => println!("Transfer root ({}): not set", env::TRANSFER_ROOT_ENV),
        }
    }
}
