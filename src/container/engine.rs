//! The container engine contract.
//!
//! Everything the core needs from the engine, expressed without engine-specific
//! types so that [`super::MemoryEngine`] and [`super::DockerEngine`] are
//! interchangeable.

use super::{ContainerSpec, Effect, EngineError, ExecOutput, HelperJob, NetworkSpec, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

/// Stream of raw tar bytes copied out of a container.
pub type ArchiveStream = BoxStream<'static, Result<Vec<u8>>>;

/// Engine connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine socket (e.g. `unix:///var/run/docker.sock`); local defaults if unset
    pub socket: Option<String>,
    /// Upper bound for a single engine call, in seconds
    pub timeout_secs: u64,
    /// Grace period given to a container on stop, in seconds
    pub stop_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            socket: None,
            timeout_secs: 60,
            stop_timeout_secs: 5,
        }
    }
}

impl EngineConfig {
    /// Per-call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Stop grace period.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Container summary information as returned by a listing.
#[derive(Debug, Clone, Default)]
pub struct ContainerSummary {
    /// Container ID
    pub id: String,
    /// Container names (the engine reports them with a leading `/`)
    pub names: Vec<String>,
    /// Image name
    pub image: String,
    /// Container state (`running`, `exited`, ...)
    pub state: String,
}

impl ContainerSummary {
    /// Whether this container carries the given name.
    pub fn has_name(&self, name: &str) -> bool {
        self.names
            .iter()
            .any(|n| n.strip_prefix('/').unwrap_or(n) == name)
    }

    /// Whether the container is running.
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// The slice of a container inspection the core relies on.
#[derive(Debug, Clone, Default)]
pub struct ContainerDetails {
    /// Container ID
    pub id: String,
    /// Image the container was created from
    pub image: String,
    /// Environment as `KEY=value` strings
    pub env: Vec<String>,
    /// Whether the container is running
    pub running: bool,
    /// Address on the default bridge, if any
    pub ip_address: Option<String>,
    /// Address per attached network
    pub networks: BTreeMap<String, String>,
}

impl ContainerDetails {
    /// Look up one environment variable.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// Address on `network`; the default bridge address never stands in.
    pub fn address_on(&self, network: &str) -> Option<&str> {
        self.networks
            .get(network)
            .map(String::as_str)
            .filter(|ip| !ip.is_empty())
    }
}

/// Container engine control API.
///
/// Idempotent operations report [`Effect::Absent`] instead of failing when
/// the resource they act on is already in the target state.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Verify the engine is reachable.
    async fn ping(&self) -> Result<()>;

    /// List containers; `all` includes stopped ones.
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>>;

    /// Create a container from a spec; returns its ID.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a created container.
    async fn start_container(&self, name: &str) -> Result<()>;

    /// Stop a container; already stopped or absent is `Effect::Absent`.
    async fn stop_container(&self, name: &str, timeout: Duration) -> Result<Effect>;

    /// Force-remove a container; absent is `Effect::Absent`.
    async fn remove_container(&self, name: &str) -> Result<Effect>;

    /// Inspect a container.
    async fn inspect_container(&self, name: &str) -> Result<ContainerDetails>;

    /// Whether a network with this name exists.
    async fn network_exists(&self, name: &str) -> Result<bool>;

    /// Create a network; already present is `Effect::Absent`.
    async fn create_network(&self, spec: &NetworkSpec) -> Result<Effect>;

    /// Attach a container to a network; already attached is `Effect::Absent`.
    async fn connect_network(&self, network: &str, container: &str) -> Result<Effect>;

    /// Extract a tar archive into directory `dir` of a container.
    async fn upload_archive(&self, container: &str, dir: &str, tar: Vec<u8>) -> Result<()>;

    /// Copy `path` out of a container as a tar stream.
    async fn download_archive(&self, container: &str, path: &str) -> Result<ArchiveStream>;

    /// Run a one-shot helper container to completion.
    async fn run_helper(&self, job: &HelperJob) -> Result<ExecOutput>;

    /// Last `tail` lines of a container's output.
    async fn logs(&self, name: &str, tail: usize) -> Result<String>;

    /// Check if a container exists by name.
    async fn container_exists(&self, name: &str) -> Result<bool> {
        match self.inspect_container(name).await {
            Ok(_) => Ok(true),
            Err(EngineError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Stop and remove a container.
    ///
    /// A failed stop is logged and removal is still forced; the result is
    /// `Effect::Absent` only if the container did not exist at all.
    async fn stop_and_remove(&self, name: &str, timeout: Duration) -> Result<Effect> {
        let stopped = match self.stop_container(name, timeout).await {
            Ok(effect) => effect,
            Err(e) => {
                warn!("Failed to stop container {}: {}", name, e);
                Effect::Applied
            }
        };

        let removed = self.remove_container(name).await?;
        Ok(stopped.or(removed))
    }
}
