//! Command line argument parsing
//!
//! Subcommands:
//! - `serve`: Run the daemon
//! - `show-config`: Show configuration discovery and the resolved configuration
//! - `check-engine`: Verify the container engine is reachable

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug)]
pub enum ExecutionMode {
    Serve(ServeConfig),
    ShowConfig { config_override: Option<PathBuf> },
    CheckEngine { config_override: Option<PathBuf> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeConfig {
    pub config_override: Option<PathBuf>,
    pub listen_override: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Parser)]
#[command(name = "sandboxd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Per-tenant container sandbox daemon with idle eviction and a file bridge")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the daemon
    Serve {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Listen address, overrides `server.listen`
        #[arg(short = 'l', long = "listen")]
        listen: Option<String>,
        /// Log filter, e.g. `debug` or `sandboxd=trace`
        #[arg(long = "log-level", value_name = "FILTER")]
        log_level: Option<String>,
    },
    /// Show configuration discovery information and the resolved configuration
    ShowConfig {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
    /// Check that the container engine answers
    CheckEngine {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Serve {
                config,
                listen,
                log_level,
            }) => Ok(ExecutionMode::Serve(ServeConfig {
                config_override: config.clone(),
                listen_override: listen.clone(),
                log_level: log_level.clone(),
            })),
            Some(Commands::ShowConfig { config }) => Ok(ExecutionMode::ShowConfig {
                config_override: config.clone(),
            }),
            Some(Commands::CheckEngine { config }) => Ok(ExecutionMode::CheckEngine {
                config_override: config.clone(),
            }),
            None => Err(
                "No command specified. Use 'sandboxd --help' to see available commands."
                    .to_string(),
            ),
        }
    }
}
