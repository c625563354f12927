//! Environment constants and path utilities for the sandbox daemon.
//!
//! This module centralizes the well-known paths, names and environment
//! variables used throughout the daemon, making them easier to maintain.

use std::path::{Path, PathBuf};

/// Environment variable naming the host directory used for staged transfers.
pub const TRANSFER_ROOT_ENV: &str = "SANDBOXD_TRANSFER_ROOT";

/// Environment variable overriding the log filter.
pub const LOG_ENV: &str = "RUST_LOG";

/// Default tracing filter
pub const DEFAULT_LOG_FILTER: &str = "sandboxd=info";

/// Main configuration directory name (hidden directory like .git)
pub const CONFIG_DIR_NAME: &str = ".sandboxd";

/// Configuration file name inside [`CONFIG_DIR_NAME`]
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Stand-alone configuration file name in the working directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "sandboxd.toml";

/// System-wide configuration file
pub const SYSTEM_CONFIG_PATH: &str = "/etc/sandboxd/config.toml";

/// Default prefix of every engine resource name
pub const DEFAULT_NAME_PREFIX: &str = "sbx";

/// Default listen address of the request front end
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5001";

/// Longest accepted idle window, in seconds
pub const MAX_IDLE_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Default cap on one request line, in bytes
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

/// Container-side paths shared by the data image, the compute image and the file bridge.
pub mod container {
    /// Root of a tenant's files inside the data volume holder
    pub const USER_HOME: &str = "/home/user/data";

    /// Authentication secret created by the compute image
    pub const SECRET_PATH: &str = "/etc/rosauth/secret";

    /// Volume owned by the data holder that keeps the secret
    pub const SECRET_VOLUME: &str = "/etc/rosauth";

    /// Mount point of the staging area inside helper containers
    pub const STAGING_MOUNT: &str = "/transfer";

    /// Mount point of the read-only data-source tree inside compute containers
    pub const DATA_SOURCE_MOUNT: &str = "/episodes";
}

/// Non-root uid that owns user files inside the containers
pub const DEFAULT_OWNER_UID: u32 = 1000;

/// Exit code helper commands use to report a missing path
pub const EXIT_NOT_FOUND: i64 = 44;

/// Build the local configuration directory path
pub fn config_dir_path(base: &Path) -> PathBuf {
    base.join(CONFIG_DIR_NAME)
}

/// Build the configuration file path inside the configuration directory
pub fn config_file_path(base: &Path) -> PathBuf {
    config_dir_path(base).join(CONFIG_FILE_NAME)
}

/// Build the stand-alone configuration file path
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(LOCAL_CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths() {
        let current_dir = Path::new("/current/project");

        assert_eq!(
            local_config_file_path(current_dir),
            Path::new("/current/project/sandboxd.toml")
        );

        assert_eq!(
            config_file_path(current_dir),
            Path::new("/current/project/.sandboxd/config.toml")
        );
    }

    #[test]
    fn test_container_paths_are_absolute() {
        for path in [
            container::USER_HOME,
            container::SECRET_PATH,
            container::SECRET_VOLUME,
            container::STAGING_MOUNT,
            container::DATA_SOURCE_MOUNT,
        ] {
            assert!(path.starts_with('/'), "{path} must be absolute");
        }
        assert!(container::SECRET_PATH.starts_with(container::SECRET_VOLUME));
    }
}
