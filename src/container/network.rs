//! Container networking.
//!
//! Every tenant gets one bridge network of its own; [`NetworkSpec`] describes
//! it and, with the `docker` feature, [`NetworkManager`] creates and joins it.

use std::collections::BTreeMap;

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    /// Network name
    pub name: String,
    /// Network driver (bridge, overlay, ...)
    pub driver: String,
    /// Internal network (no external connectivity)
    pub internal: bool,
    /// Network labels
    pub labels: BTreeMap<String, String>,
}

impl NetworkSpec {
    /// A bridge network with the given name.
    pub fn bridge<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            driver: "bridge".to_string(),
            internal: false,
            labels: BTreeMap::new(),
        }
    }

    /// Add a label.
    pub fn label<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

#[cfg(feature = "docker")]
pub(crate) use manager::NetworkManager;

#[cfg(feature = "docker")]
mod manager {
    use super::NetworkSpec;
    use crate::container::{Effect, EngineError, Result};
    use bollard::Docker;
    use bollard::models::{NetworkConnectRequest, NetworkCreateRequest};
    use bollard::query_parameters::InspectNetworkOptions;
    use std::collections::HashMap;
    use tracing::{debug, info};

    /// Network manager for tenant networks.
    pub(crate) struct NetworkManager {
        docker: Docker,
    }

    impl NetworkManager {
        /// Create a new network manager.
        pub(crate) fn new(docker: Docker) -> Self {
            Self { docker }
        }

        /// Create a network unless one with the same name exists.
        pub(crate) async fn create_network(&self, spec: &NetworkSpec) -> Result<Effect> {
            if self.network_exists(&spec.name).await? {
                debug!("Network {} already exists", spec.name);
                return Ok(Effect::Absent);
            }

            debug!("Creating network: {}", spec.name);

            let labels: HashMap<String, String> = spec
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            let request = NetworkCreateRequest {
                name: spec.name.clone(),
                driver: Some(spec.driver.clone()),
                internal: Some(spec.internal),
                labels: Some(labels),
                ..Default::default()
            };

            match self.docker.create_network(request).await {
                Ok(response) => {
                    info!("Created network: {} ({})", spec.name, response.id);
                    Ok(Effect::Applied)
                }
                // Lost a race with a concurrent creator.
                Err(e) => match EngineError::from(e) {
                    EngineError::Conflict(_) => Ok(Effect::Absent),
                    other => Err(other),
                },
            }
        }

        /// Attach a container to a network.
        pub(crate) async fn connect(&self, network: &str, container: &str) -> Result<Effect> {
            debug!("Connecting {} to network {}", container, network);

            let request = NetworkConnectRequest {
                container: Some(container.to_string()),
                endpoint_config: None,
            };

            match self.docker.connect_network(network, request).await {
                Ok(()) => Ok(Effect::Applied),
                Err(e) => match EngineError::from(e) {
                    // The engine answers 403 when the endpoint already exists.
                    EngineError::Api { status: 403, message } if message.contains("already exists") => {
                        Ok(Effect::Absent)
                    }
                    other => Err(other),
                },
            }
        }

        /// Check if a network exists.
        pub(crate) async fn network_exists(&self, name: &str) -> Result<bool> {
            match self
                .docker
                .inspect_network(name, None::<InspectNetworkOptions>)
                .await
            {
                Ok(_) => Ok(true),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
    }
}
