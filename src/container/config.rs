//! Container creation specs.
//!
//! Provides a fluent API for describing a container independently of the
//! engine that will create it. The Docker engine translates a
//! [`ContainerSpec`] into a create request; the in-memory engine stores it.

use crate::container::{EngineError, Result};
use std::collections::BTreeMap;

/// A container port published on a host interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPort {
    /// Container port (TCP)
    pub container_port: u16,
    /// Host interface to bind
    pub host_ip: String,
    /// Host port; `None` lets the engine pick an ephemeral one
    pub host_port: Option<u16>,
}

impl PublishedPort {
    /// Engine key for the port, e.g. `9090/tcp`.
    pub fn key(&self) -> String {
        format!("{}/tcp", self.container_port)
    }
}

/// Container spec builder.
///
/// Provides a fluent interface for constructing container specs with
/// validation at [`build`](ContainerSpecBuilder::build) time.
#[derive(Debug, Default)]
pub struct ContainerSpecBuilder {
    name: Option<String>,
    image: Option<String>,
    cmd: Option<Vec<String>>,
    entrypoint: Option<Vec<String>>,
    env: Vec<String>,
    labels: BTreeMap<String, String>,
    volumes: Vec<String>,
    tty: bool,
    user: Option<String>,
    memory_limit: Option<i64>,
    memory_swap: Option<i64>,
    cpu_shares: Option<i64>,
    binds: Vec<String>,
    volumes_from: Vec<String>,
    links: Vec<String>,
    published: Vec<PublishedPort>,
    network_mode: Option<String>,
}

impl ContainerSpecBuilder {
    /// Create a new spec builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the container name.
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the container image.
    pub fn image<S: Into<String>>(mut self, image: S) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Set the command to run in the container.
    pub fn cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = Some(cmd.into_iter().map(|s| s.into()).collect());
        self
    }

    /// Set the entrypoint for the container.
    pub fn entrypoint<I, S>(mut self, entrypoint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = Some(entrypoint.into_iter().map(|s| s.into()).collect());
        self
    }

    /// Add an environment variable.
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.push(format!("{}={}", key.into(), value.into()));
        self
    }

    /// Add multiple environment variables.
    pub fn envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in envs {
            self.env.push(format!("{}={}", k.into(), v.into()));
        }
        self
    }

    /// Add a label to the container.
    pub fn label<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Declare an anonymous volume at a container path.
    pub fn volume<S: Into<String>>(mut self, path: S) -> Self {
        self.volumes.push(path.into());
        self
    }

    /// Allocate a pseudo-terminal.
    pub fn tty(mut self, enable: bool) -> Self {
        self.tty = enable;
        self
    }

    /// Set user to run as in the container.
    pub fn user<S: Into<String>>(mut self, user: S) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set memory limit in bytes.
    pub fn memory_limit(mut self, bytes: i64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Set memory + swap limit in bytes.
    pub fn memory_swap(mut self, bytes: i64) -> Self {
        self.memory_swap = Some(bytes);
        self
    }

    /// Set the relative CPU weight.
    pub fn cpu_shares(mut self, shares: i64) -> Self {
        self.cpu_shares = Some(shares);
        self
    }

    /// Add a volume bind mount (host_path:container_path[:mode]).
    pub fn bind<S: Into<String>>(mut self, bind: S) -> Self {
        self.binds.push(bind.into());
        self
    }

    /// Mount every volume of another container.
    pub fn volumes_from<S: Into<String>>(mut self, container: S) -> Self {
        self.volumes_from.push(container.into());
        self
    }

    /// Add a legacy link (`name:alias`).
    pub fn link<S: Into<String>>(mut self, link: S) -> Self {
        self.links.push(link.into());
        self
    }

    /// Publish a container port on the host loopback with an ephemeral host port.
    pub fn publish_loopback(mut self, container_port: u16) -> Self {
        self.published.push(PublishedPort {
            container_port,
            host_ip: "127.0.0.1".to_string(),
            host_port: None,
        });
        self
    }

    /// Set network mode (e.g., "bridge", "none").
    pub fn network_mode<S: Into<String>>(mut self, mode: S) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    /// Build the container spec.
    ///
    /// # Errors
    ///
    /// Returns error if the name or image is missing.
    pub fn build(self) -> Result<ContainerSpec> {
        let name = self
            .name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| EngineError::ConfigError("Name is required".to_string()))?;
        let image = self
            .image
            .filter(|i| !i.is_empty())
            .ok_or_else(|| EngineError::ConfigError("Image is required".to_string()))?;

        Ok(ContainerSpec {
            name,
            image,
            cmd: self.cmd,
            entrypoint: self.entrypoint,
            env: self.env,
            labels: self.labels,
            volumes: self.volumes,
            tty: self.tty,
            user: self.user,
            memory_limit: self.memory_limit,
            memory_swap: self.memory_swap,
            cpu_shares: self.cpu_shares,
            binds: self.binds,
            volumes_from: self.volumes_from,
            links: self.links,
            published: self.published,
            network_mode: self.network_mode,
        })
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,
    /// Image name
    pub image: String,
    /// Command to run
    pub cmd: Option<Vec<String>>,
    /// Entrypoint
    pub entrypoint: Option<Vec<String>>,
    /// Environment variables as `KEY=value`
    pub env: Vec<String>,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Anonymous volumes
    pub volumes: Vec<String>,
    /// Pseudo-terminal
    pub tty: bool,
    /// User
    pub user: Option<String>,
    /// Memory ceiling in bytes
    pub memory_limit: Option<i64>,
    /// Memory + swap ceiling in bytes
    pub memory_swap: Option<i64>,
    /// Relative CPU weight
    pub cpu_shares: Option<i64>,
    /// Host bind mounts
    pub binds: Vec<String>,
    /// Containers whose volumes are mounted
    pub volumes_from: Vec<String>,
    /// Legacy links
    pub links: Vec<String>,
    /// Published ports
    pub published: Vec<PublishedPort>,
    /// Network mode
    pub network_mode: Option<String>,
}

impl ContainerSpec {
    /// Create a new spec builder.
    pub fn builder() -> ContainerSpecBuilder {
        ContainerSpecBuilder::new()
    }

    /// Look up one environment variable.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            (k == key).then_some(v)
        })
    }
}

#[cfg(feature = "docker")]
impl ContainerSpec {
    /// Translate into an engine create request.
    pub(crate) fn to_create_body(&self) -> bollard::models::ContainerCreateBody {
        use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
        use std::collections::HashMap;

        fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
            if v.is_empty() { None } else { Some(v) }
        }

        let exposed: HashMap<String, HashMap<(), ()>> = self
            .published
            .iter()
            .map(|p| (p.key(), HashMap::new()))
            .collect();
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = self
            .published
            .iter()
            .map(|p| {
                let binding = PortBinding {
                    host_ip: Some(p.host_ip.clone()),
                    host_port: p.host_port.map(|port| port.to_string()),
                };
                (p.key(), Some(vec![binding]))
            })
            .collect();
        let volumes: HashMap<String, HashMap<(), ()>> = self
            .volumes
            .iter()
            .map(|v| (v.clone(), HashMap::new()))
            .collect();

        let host_config = HostConfig {
            memory: self.memory_limit,
            memory_swap: self.memory_swap,
            cpu_shares: self.cpu_shares,
            binds: non_empty(self.binds.clone()),
            volumes_from: non_empty(self.volumes_from.clone()),
            links: non_empty(self.links.clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            network_mode: self.network_mode.clone(),
            ..Default::default()
        };

        ContainerCreateBody {
            image: Some(self.image.clone()),
            cmd: self.cmd.clone(),
            entrypoint: self.entrypoint.clone(),
            env: non_empty(self.env.clone()),
            labels: (!self.labels.is_empty())
                .then(|| self.labels.clone().into_iter().collect()),
            volumes: (!volumes.is_empty()).then_some(volumes),
            exposed_ports: (!exposed.is_empty()).then_some(exposed),
            tty: Some(self.tty),
            user: self.user.clone(),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_spec() {
        let spec = ContainerSpec::builder()
            .name("sbx-compute-alice")
            .image("compute:latest")
            .cmd(vec!["serve", "--port", "9090"])
            .build()
            .unwrap();

        assert_eq!(spec.name, "sbx-compute-alice");
        assert_eq!(spec.image, "compute:latest");
        assert_eq!(spec.cmd.as_deref().map(<[String]>::len), Some(3));
        assert!(!spec.tty);
    }

    #[test]
    fn test_resource_limits() {
        let spec = ContainerSpec::builder()
            .name("c")
            .image("compute:latest")
            .memory_limit(268_435_456)
            .memory_swap(1_073_741_824)
            .cpu_shares(256)
            .build()
            .unwrap();

        assert_eq!(spec.memory_limit, Some(268_435_456));
        assert_eq!(spec.memory_swap, Some(1_073_741_824));
        assert_eq!(spec.cpu_shares, Some(256));
    }

    #[test]
    fn test_environment_variables() {
        let spec = ContainerSpec::builder()
            .name("c")
            .image("compute:latest")
            .env("VIRTUAL_PORT", "9090")
            .envs([("A", "1"), ("B", "2")])
            .build()
            .unwrap();

        assert_eq!(spec.env_var("VIRTUAL_PORT"), Some("9090"));
        assert_eq!(spec.env_var("B"), Some("2"));
        assert_eq!(spec.env.len(), 3);
    }

    #[test]
    fn test_mounts_and_links() {
        let spec = ContainerSpec::builder()
            .name("c")
            .image("compute:latest")
            .bind("/srv/episodes/a:/episodes:ro")
            .volumes_from("sbx-data-alice")
            .link("mongo:mongo")
            .volume("/home/user/data")
            .build()
            .unwrap();

        assert_eq!(spec.binds, vec!["/srv/episodes/a:/episodes:ro"]);
        assert_eq!(spec.volumes_from, vec!["sbx-data-alice"]);
        assert_eq!(spec.links, vec!["mongo:mongo"]);
        assert_eq!(spec.volumes, vec!["/home/user/data"]);
    }

    #[test]
    fn test_loopback_publication() {
        let spec = ContainerSpec::builder()
            .name("c")
            .image("compute:latest")
            .publish_loopback(9090)
            .build()
            .unwrap();

        let port = &spec.published[0];
        assert_eq!(port.key(), "9090/tcp");
        assert_eq!(port.host_ip, "127.0.0.1");
        assert_eq!(port.host_port, None);
    }

    #[test]
    fn test_missing_fields_error() {
        let result = ContainerSpec::builder().name("c").build();
        assert!(matches!(result, Err(EngineError::ConfigError(_))));

        let result = ContainerSpec::builder().image("busybox").build();
        assert!(matches!(result, Err(EngineError::ConfigError(_))));
    }

    #[cfg(feature = "docker")]
    #[test]
    fn test_create_body_translation() {
        let spec = ContainerSpec::builder()
            .name("c")
            .image("compute:latest")
            .memory_limit(268_435_456)
            .volumes_from("sbx-data-alice")
            .publish_loopback(9090)
            .build()
            .unwrap();

        let body = spec.to_create_body();
        let host = body.host_config.unwrap();

        assert_eq!(body.image.as_deref(), Some("compute:latest"));
        assert!(body.exposed_ports.unwrap().contains_key("9090/tcp"));
        assert_eq!(host.memory, Some(268_435_456));
        assert_eq!(host.volumes_from, Some(vec!["sbx-data-alice".to_string()]));
        assert!(host.binds.is_none());

        let bindings = host.port_bindings.unwrap();
        let binding = &bindings["9090/tcp"].as_ref().unwrap()[0];
        assert_eq!(binding.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(binding.host_port, None);
    }
}
