//! Docker-backed [`Engine`].
//!
//! Translates engine-neutral calls into bollard requests. Idempotent calls
//! map "no such container" and "already stopped" to [`Effect::Absent`].

use super::executor;
use super::network::NetworkManager;
use crate::container::{
    ArchiveStream, ContainerClient, ContainerDetails, ContainerSpec, ContainerSummary, Effect,
    Engine, EngineConfig, EngineError, ExecOutput, HelperJob, NetworkSpec, Result,
};
use async_trait::async_trait;
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, DownloadFromContainerOptionsBuilder,
    InspectContainerOptions, ListContainersOptionsBuilder, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
    UploadToContainerOptionsBuilder,
};
use futures::stream::{StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Container engine backed by a Docker-compatible API.
pub struct DockerEngine {
    client: ContainerClient,
    networks: NetworkManager,
}

impl DockerEngine {
    /// Connect to the engine and verify it answers.
    pub async fn connect(config: &EngineConfig) -> Result<Self> {
        let client = ContainerClient::connect(config).await?;
        Ok(Self::with_client(client))
    }

    /// Build an engine over an existing client.
    pub fn with_client(client: ContainerClient) -> Self {
        let networks = NetworkManager::new(client.docker().clone());
        Self { client, networks }
    }

    /// The underlying client.
    pub fn client(&self) -> &ContainerClient {
        &self.client
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn ping(&self) -> Result<()> {
        self.client.ping().await
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptionsBuilder::new().all(all).build();
        let containers = self
            .client
            .docker()
            .list_containers(Some(options))
            .await?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                state: c.state.map(|s| s.to_string()).unwrap_or_default(),
            })
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        debug!("Creating container {} from {}", spec.name, spec.image);

        let options = CreateContainerOptionsBuilder::new().name(&spec.name).build();
        let response = self
            .client
            .docker()
            .create_container(Some(options), spec.to_create_body())
            .await?;

        info!("Created container {} ({})", spec.name, response.id);
        Ok(response.id)
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        debug!("Starting container: {}", name);
        self.client
            .docker()
            .start_container(name, None::<StartContainerOptions>)
            .await?;
        info!("Started container: {}", name);
        Ok(())
    }

    async fn stop_container(&self, name: &str, timeout: Duration) -> Result<Effect> {
        match self.inspect_container(name).await {
            Ok(details) if details.running => {}
            Ok(_) | Err(EngineError::NotFound(_)) => return Ok(Effect::Absent),
            Err(e) => return Err(e),
        }

        debug!("Stopping container: {}", name);
        let options = StopContainerOptionsBuilder::new()
            .t(i32::try_from(timeout.as_secs()).unwrap_or(i32::MAX))
            .build();
        match self.client.docker().stop_container(name, Some(options)).await {
            Ok(()) => {
                info!("Stopped container: {}", name);
                Ok(Effect::Applied)
            }
            Err(e) => match EngineError::from(e) {
                EngineError::NotFound(_) => Ok(Effect::Absent),
                other => Err(other),
            },
        }
    }

    async fn remove_container(&self, name: &str) -> Result<Effect> {
        debug!("Removing container: {}", name);
        let options = RemoveContainerOptionsBuilder::new().force(true).build();
        match self
            .client
            .docker()
            .remove_container(name, Some(options))
            .await
        {
            Ok(()) => {
                info!("Removed container: {}", name);
                Ok(Effect::Applied)
            }
            Err(e) => match EngineError::from(e) {
                EngineError::NotFound(_) => Ok(Effect::Absent),
                other => Err(other),
            },
        }
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerDetails> {
        let inspect = self
            .client
            .docker()
            .inspect_container(name, None::<InspectContainerOptions>)
            .await?;

        let config = inspect.config.unwrap_or_default();
        let settings = inspect.network_settings.unwrap_or_default();
        let networks: BTreeMap<String, String> = settings
            .networks
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(net, endpoint)| endpoint.ip_address.map(|ip| (net, ip)))
            .collect();

        Ok(ContainerDetails {
            id: inspect.id.unwrap_or_default(),
            image: config.image.unwrap_or_default(),
            env: config.env.unwrap_or_default(),
            running: inspect.state.and_then(|s| s.running).unwrap_or(false),
            ip_address: settings.ip_address,
            networks,
        })
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        self.networks.network_exists(name).await
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<Effect> {
        self.networks.create_network(spec).await
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<Effect> {
        self.networks.connect(network, container).await
    }

    async fn upload_archive(&self, container: &str, dir: &str, tar: Vec<u8>) -> Result<()> {
        debug!(
            "Uploading {} byte archive to {}:{}",
            tar.len(),
            container,
            dir
        );
        let options = UploadToContainerOptionsBuilder::new().path(dir).build();
        self.client
            .docker()
            .upload_to_container(container, Some(options), bollard::body_full(tar.into()))
            .await?;
        Ok(())
    }

    async fn download_archive(&self, container: &str, path: &str) -> Result<ArchiveStream> {
        debug!("Downloading archive of {}:{}", container, path);
        let options = DownloadFromContainerOptionsBuilder::new().path(path).build();
        let stream = self
            .client
            .docker()
            .download_from_container(container, Some(options))
            .map_ok(|chunk| chunk.to_vec())
            .map_err(EngineError::from);
        Ok(stream.boxed())
    }

    async fn run_helper(&self, job: &HelperJob) -> Result<ExecOutput> {
        executor::run_helper(self.client.docker(), job).await
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<String> {
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .tail(&tail.to_string())
            .build();
        let mut stream = self.client.docker().logs(name, Some(options));
        let mut output = String::new();

        while let Some(result) = stream.next().await {
            output.push_str(&result?.to_string());
        }

        Ok(output)
    }
}
