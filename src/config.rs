//! Daemon configuration.
//!
//! `SandboxdConfig` is loaded from TOML; every field has a default so an
//! empty file (or no file at all) yields a working configuration. The host
//! staging directory is not part of it; it comes from the
//! [`TRANSFER_ROOT_ENV`](crate::env::TRANSFER_ROOT_ENV) environment variable.

use crate::container::EngineConfig;
use crate::env::{
    self, container, DEFAULT_LISTEN_ADDR, DEFAULT_MAX_REQUEST_BYTES, DEFAULT_NAME_PREFIX,
    DEFAULT_OWNER_UID, MAX_IDLE_TIMEOUT_SECS,
};
use crate::sandbox::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file could not be read or written
    #[error("Failed to access {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML for this schema
    #[error("Failed to parse TOML configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration could not be rendered as TOML
    #[error("Failed to serialize configuration to TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Transfer root environment variable is not set
    #[error("environment variable {0} is not set")]
    MissingTransferRoot(&'static str),

    /// Transfer root does not name a directory
    #[error("transfer root {0} is not a directory")]
    TransferRootNotDirectory(PathBuf),

    /// A value is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxdConfig {
    /// Engine connection
    pub engine: EngineConfig,
    /// Resource naming
    pub naming: NamingConfig,
    /// Sandbox lifecycle
    pub lifecycle: LifecycleConfig,
    /// Idle eviction
    pub watchdog: WatchdogConfig,
    /// File bridge
    pub bridge: BridgeConfig,
    /// Request front end
    pub server: ServerConfig,
}

/// `[naming]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Prefix of every container and network name
    pub prefix: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_NAME_PREFIX.to_string(),
        }
    }
}

/// `[lifecycle]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Image of the data volume holder
    pub data_image: String,
    /// Port the compute service listens on
    pub service_port: u16,
    /// Entrypoint of the compute container; the image's own if unset
    pub compute_entrypoint: Option<Vec<String>>,
    /// Allocate a pseudo-terminal for the compute container
    pub tty: bool,
    /// Legacy links (`container:alias`) given to every compute container.
    /// Each linked container is joined to the tenant network before the
    /// compute container is created and must already exist.
    pub links: Vec<String>,
    /// Host directory holding data sources; bound read-only when set
    pub data_source_root: Option<PathBuf>,
    /// Default number of log lines returned
    pub log_tail: usize,
    /// Extra environment of every compute container
    pub service_env: BTreeMap<String, String>,
    /// Compute container resource ceilings
    pub limits: ResourceLimits,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            data_image: "sandboxd/user-data:latest".to_string(),
            service_port: 9090,
            compute_entrypoint: None,
            tty: true,
            links: Vec::new(),
            data_source_root: None,
            log_tail: 200,
            service_env: BTreeMap::new(),
            limits: ResourceLimits::default(),
        }
    }
}

/// `[watchdog]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Idle window after which a sandbox is stopped, in seconds; at most one day
    pub idle_timeout_secs: u64,
    /// Interval between deadline scans, in seconds
    pub poll_interval_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 600,
            poll_interval_secs: 5,
        }
    }
}

/// `[bridge]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Root of tenant files inside the data holder
    pub user_home: String,
    /// Location of the authentication secret
    pub secret_path: String,
    /// Where helper containers see the staging area
    pub staging_mount: String,
    /// Image of the one-shot helper containers
    pub helper_image: String,
    /// Owner uid (and gid) of files written for tenants
    pub owner_uid: u32,
    /// Largest payload moved inline; bigger ones use staged transfers
    pub max_inline_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            user_home: container::USER_HOME.to_string(),
            secret_path: container::SECRET_PATH.to_string(),
            staging_mount: container::STAGING_MOUNT.to_string(),
            helper_image: "busybox:latest".to_string(),
            owner_uid: DEFAULT_OWNER_UID,
            max_inline_bytes: 8 * 1024 * 1024,
        }
    }
}

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address of the request front end
    pub listen: String,
    /// Longest request line accepted; longer lines close the connection
    pub max_request_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN_ADDR.to_string(),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

impl SandboxdConfig {
    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SandboxdConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg.to_string()))
        };

        if self.naming.prefix.is_empty() || self.naming.prefix.contains('/') {
            return invalid("naming.prefix must be non-empty and contain no '/'");
        }
        for (field, path) in [
            ("bridge.user_home", &self.bridge.user_home),
            ("bridge.secret_path", &self.bridge.secret_path),
            ("bridge.staging_mount", &self.bridge.staging_mount),
        ] {
            if !path.starts_with('/') || path.len() < 2 {
                return Err(ConfigError::Invalid(format!(
                    "{field} must be an absolute path below /"
                )));
            }
        }
        if self.watchdog.poll_interval_secs == 0 {
            return invalid("watchdog.poll_interval_secs must be positive");
        }
        if !(1..=MAX_IDLE_TIMEOUT_SECS).contains(&self.watchdog.idle_timeout_secs) {
            return Err(ConfigError::Invalid(format!(
                "watchdog.idle_timeout_secs must be between 1 and {MAX_IDLE_TIMEOUT_SECS}"
            )));
        }
        if self.lifecycle.service_port == 0 {
            return invalid("lifecycle.service_port must be positive");
        }
        if self.lifecycle.limits.memory_units == 0 {
            return invalid("lifecycle.limits.memory_units must be positive");
        }
        // An inline write at the size limit has to fit in one request line.
        let inline_line = self.bridge.max_inline_bytes.div_ceil(3).saturating_mul(4);
        if self.server.max_request_bytes <= inline_line {
            return Err(ConfigError::Invalid(format!(
                "server.max_request_bytes must exceed {inline_line}, the encoded size of bridge.max_inline_bytes"
            )));
        }
        Ok(())
    }
}

/// Resolve the host staging directory from the environment.
///
/// # Errors
///
/// Fails when the variable is unset or does not name a directory.
pub fn transfer_root_from_env() -> Result<PathBuf, ConfigError> {
    let raw = std::env::var_os(env::TRANSFER_ROOT_ENV)
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingTransferRoot(env::TRANSFER_ROOT_ENV))?;
    validate_transfer_root(PathBuf::from(raw))
}

/// Check that `path` names an existing directory.
pub fn validate_transfer_root(path: PathBuf) -> Result<PathBuf, ConfigError> {
    if path.is_dir() {
        Ok(path)
    } else {
        Err(ConfigError::TransferRootNotDirectory(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = SandboxdConfig::default();
        config.validate().unwrap();

        assert_eq!(config.naming.prefix, "sbx");
        assert_eq!(config.watchdog.idle_timeout_secs, 600);
        assert_eq!(config.bridge.user_home, "/home/user/data");
        assert_eq!(config.server.listen, "127.0.0.1:5001");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = SandboxdConfig::from_toml_str(
            r#"
            [naming]
            prefix = "lab"

            [lifecycle]
            links = ["mongo:mongo"]

            [lifecycle.limits]
            memory_units = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.naming.prefix, "lab");
        assert_eq!(config.lifecycle.links, vec!["mongo:mongo"]);
        assert_eq!(config.lifecycle.limits.memory_units, 2);
        assert_eq!(config.lifecycle.limits.cpu_shares, 256);
        assert_eq!(config.bridge.helper_image, "busybox:latest");
    }

    #[test]
    fn test_toml_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sandboxd.toml");

        let mut config = SandboxdConfig::default();
        config.lifecycle.service_env.insert("MONGO_PORT".into(), "27017".into());
        config.to_toml_file(&path).unwrap();

        assert_eq!(SandboxdConfig::from_toml_file(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = SandboxdConfig::from_toml_str("[bridge]\nuser_home = \"relative\"\n");
        assert!(matches!(err, Err(ConfigError::Invalid(_))));

        let err = SandboxdConfig::from_toml_str("[watchdog]\npoll_interval_secs = 0\n");
        assert!(matches!(err, Err(ConfigError::Invalid(_))));

        let err = SandboxdConfig::from_toml_str("[naming]\nprefix = 3\n");
        assert!(matches!(err, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_idle_timeout_bounds() {
        for secs in [0, MAX_IDLE_TIMEOUT_SECS + 1, i64::MAX as u64] {
            let err = SandboxdConfig::from_toml_str(&format!(
                "[watchdog]\nidle_timeout_secs = {secs}\n"
            ));
            assert!(matches!(err, Err(ConfigError::Invalid(_))), "{secs}");
        }

        let config =
            SandboxdConfig::from_toml_str(&format!("[watchdog]\nidle_timeout_secs = {MAX_IDLE_TIMEOUT_SECS}\n"))
                .unwrap();
        assert_eq!(config.watchdog.idle_timeout_secs, 86_400);
    }

    #[test]
    fn test_request_cap_must_fit_inline_limit() {
        let err = SandboxdConfig::from_toml_str("[server]\nmax_request_bytes = 1024\n");
        assert!(matches!(err, Err(ConfigError::Invalid(_))));

        let config = SandboxdConfig::from_toml_str(
            "[bridge]\nmax_inline_bytes = 3000\n\n[server]\nmax_request_bytes = 8192\n",
        )
        .unwrap();
        assert_eq!(config.server.max_request_bytes, 8192);
    }

    #[test]
    fn test_transfer_root_validation() {
        let dir = TempDir::new().unwrap();
        assert!(validate_transfer_root(dir.path().to_path_buf()).is_ok());

        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            validate_transfer_root(file),
            Err(ConfigError::TransferRootNotDirectory(_))
        ));
    }
}
