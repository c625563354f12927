//! Container engine client.
//!
//! Wraps the bollard client with connection fallbacks and a reachability
//! check. The daemon keeps one client for its whole lifetime.

use crate::container::{EngineConfig, EngineError, Result};
use bollard::Docker;
use std::sync::Arc;
use tracing::{debug, info};

#[cfg(unix)]
const PODMAN_SYSTEM_SOCKET: &str = "unix:///run/podman/podman.sock";

/// Engine API client wrapper.
#[derive(Clone)]
pub struct ContainerClient {
    docker: Arc<Docker>,
}

impl ContainerClient {
    /// Connect to the engine described by `config` and verify it answers.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Unavailable` if no engine socket answers.
    pub async fn connect(config: &EngineConfig) -> Result<Self> {
        let docker = Self::open(config)?;
        let client = Self {
            docker: Arc::new(docker),
        };

        client.ping().await?;
        Ok(client)
    }

    /// Open a connection without talking to the engine yet.
    ///
    /// Tries, in order:
    /// 1. The configured socket, if any
    /// 2. Local defaults (`DOCKER_HOST` or the standard socket)
    /// 3. The system Podman socket
    fn open(config: &EngineConfig) -> Result<Docker> {
        if let Some(socket) = &config.socket {
            debug!("Connecting to container engine at {}", socket);
            return Self::via_socket(socket, config)
                .map_err(|e| EngineError::Unavailable(format!("{socket}: {e}")));
        }

        match Docker::connect_with_local_defaults() {
            Ok(docker) => {
                info!("Connected to container engine via local defaults");
                return Ok(docker.with_timeout(config.timeout()));
            }
            Err(e) => {
                debug!("Local defaults failed: {}", e);
            }
        }

        #[cfg(unix)]
        {
            debug!("Trying system Podman socket: {}", PODMAN_SYSTEM_SOCKET);

            match Self::via_socket(PODMAN_SYSTEM_SOCKET, config) {
                Ok(docker) => {
                    info!("Connected to Podman via system socket");
                    return Ok(docker);
                }
                Err(e) => {
                    debug!("Podman system socket failed: {}", e);
                }
            }
        }

        Err(EngineError::Unavailable(
            "Failed to connect to the container engine. Ensure Docker or Podman is running and the socket is accessible.".to_string(),
        ))
    }

    fn via_socket(socket: &str, config: &EngineConfig) -> std::result::Result<Docker, bollard::errors::Error> {
        Docker::connect_with_socket(socket, config.timeout_secs, bollard::API_DEFAULT_VERSION)
            .map(|docker| docker.with_timeout(config.timeout()))
    }

    /// Ping the engine to verify connectivity.
    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await.map_err(|e| {
            EngineError::Unavailable(format!("Failed to ping container engine: {}", e))
        })?;
        debug!("Container engine ping successful");
        Ok(())
    }

    /// Engine version string, e.g. `Docker 27.3.1 (API 1.47)`.
    pub async fn version(&self) -> Result<String> {
        let version = self.docker.version().await?;
        Ok(format!(
            "{} {} (API {})",
            version
                .platform
                .map(|p| p.name)
                .unwrap_or_else(|| "engine".to_string()),
            version.version.unwrap_or_default(),
            version.api_version.unwrap_or_default()
        ))
    }

    /// Get the underlying bollard client.
    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_socket_connection_carries_timeout() {
        let socket = NamedTempFile::new().unwrap();
        let config = EngineConfig {
            socket: Some(format!("unix://{}", socket.path().display())),
            timeout_secs: 7,
            ..Default::default()
        };

        let docker = ContainerClient::open(&config).unwrap();
        assert_eq!(docker.timeout(), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_missing_socket_is_unavailable() {
        let config = EngineConfig {
            socket: Some("unix:///nonexistent/sandboxd.sock".to_string()),
            ..Default::default()
        };

        assert!(matches!(
            ContainerClient::open(&config),
            Err(EngineError::Unavailable(_))
        ));
    }
}
