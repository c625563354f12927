//! Sandbox lifecycle manager.
//!
//! Brings a tenant's sandbox from absent to running and back. Every public
//! operation logs engine failures with the tenant and converts them into a
//! [`SandboxError`]; nothing here panics on engine errors.
//!
//! Start, stop and data-holder creation for the same tenant are serialized by
//! a per-tenant lock. The idle timer map is only touched after that lock has
//! been released, so the watchdog (which holds the timer lock while evicting)
//! can always acquire a tenant lock.

use super::{Result, SandboxError};
use crate::config::{LifecycleConfig, SandboxdConfig};
use crate::container::{self, ContainerSpec, Effect, Engine, EngineError, NetworkSpec};
use crate::env::container::{DATA_SOURCE_MOUNT, SECRET_VOLUME};
use crate::naming::{self, DataSourceRef, ImageRef, ResourceNames, TenantId};
use crate::watchdog::{Evictor, IdleTimers};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};

/// Label carrying the owning tenant on every container and network.
pub const TENANT_LABEL: &str = "sandboxd.tenant";

/// Label carrying the sandbox role (`data`, `compute`).
pub const ROLE_LABEL: &str = "sandboxd.role";

/// Entrypoint of the data volume holder; it is never started.
const DATA_HOLDER_ENTRYPOINT: &str = "true";

/// Per-tenant sandbox lifecycle over a container [`Engine`].
pub struct SandboxManager {
    engine: Arc<dyn Engine>,
    timers: Arc<IdleTimers>,
    names: ResourceNames,
    lifecycle: LifecycleConfig,
    user_home: String,
    secret_dir: String,
    idle_window: Duration,
    stop_timeout: Duration,
    tenant_locks: DashMap<TenantId, Arc<Mutex<()>>>,
}

impl SandboxManager {
    pub fn new(engine: Arc<dyn Engine>, timers: Arc<IdleTimers>, config: &SandboxdConfig) -> Self {
        let secret_dir = naming::split_parent(&config.bridge.secret_path)
            .map(|(parent, _)| parent.to_string())
            .unwrap_or_else(|| SECRET_VOLUME.to_string());

        Self {
            engine,
            timers,
            names: ResourceNames::new(config.naming.prefix.clone()),
            lifecycle: config.lifecycle.clone(),
            user_home: config.bridge.user_home.clone(),
            secret_dir,
            idle_window: Duration::from_secs(config.watchdog.idle_timeout_secs),
            stop_timeout: config.engine.stop_timeout(),
            tenant_locks: DashMap::new(),
        }
    }

    /// Naming scheme in use.
    pub fn names(&self) -> &ResourceNames {
        &self.names
    }

    /// Idle window armed on every successful start.
    pub fn idle_window(&self) -> Duration {
        self.idle_window
    }

    /// Recreate and start the tenant's compute container.
    ///
    /// Steps run in order: remove the old compute and helper containers,
    /// ensure the data holder, ensure the network, join linked services to
    /// it, create the compute container on it, start it. The compute
    /// container is never attached to the default bridge. A failing step is
    /// reported as
    /// [`SandboxError::PartialFailure`]; earlier steps are left in place and
    /// the next start cleans up through the first step.
    pub async fn start_sandbox(
        &self,
        tenant: &TenantId,
        data_source: &DataSourceRef,
        image: &str,
        version: &str,
    ) -> Result<()> {
        let image = ImageRef::parse(image, version)?;

        {
            let _guard = self.tenant_lock(tenant).await;
            self.bring_up(tenant, data_source, &image).await?;
        }

        self.timers.arm(tenant, self.idle_window).await;
        info!(
            "Sandbox {} started for {} ({})",
            self.names.compute(tenant),
            tenant,
            image
        );
        Ok(())
    }

    /// Stop and remove the compute container and the tenant's helpers.
    ///
    /// The data holder and network are kept. Nothing to remove is
    /// [`Effect::Absent`].
    pub async fn stop_sandbox(&self, tenant: &TenantId) -> Result<Effect> {
        let effect = {
            let _guard = self.tenant_lock(tenant).await;
            self.teardown(tenant)
                .await
                .map_err(|e| self.report("stop_sandbox", tenant, e))?
        };

        self.timers.cancel(tenant).await;
        if effect.applied() {
            info!("Sandbox {} stopped", self.names.compute(tenant));
        }
        Ok(effect)
    }

    /// Create the data holder if missing; `true` only if created by this call.
    pub async fn create_data_holder(&self, tenant: &TenantId) -> Result<bool> {
        let _guard = self.tenant_lock(tenant).await;
        self.ensure_data_holder(tenant)
            .await
            .map_err(|e| self.report("create_data_holder", tenant, e))
    }

    /// Whether the compute container is running.
    pub async fn is_running(&self, tenant: &TenantId) -> Result<bool> {
        match self.engine.inspect_container(&self.names.compute(tenant)).await {
            Ok(details) => Ok(details.running),
            Err(EngineError::NotFound(_)) => Ok(false),
            Err(e) => Err(self.report("is_running", tenant, e)),
        }
    }

    /// Whether the compute container is running and was created from `image`.
    pub async fn is_running_image(&self, tenant: &TenantId, image: &str) -> Result<bool> {
        match self.engine.inspect_container(&self.names.compute(tenant)).await {
            Ok(details) => Ok(details.running && details.image == image),
            Err(EngineError::NotFound(_)) => Ok(false),
            Err(e) => Err(self.report("is_running_image", tenant, e)),
        }
    }

    /// Address of the compute container on the tenant network.
    ///
    /// A stopped container has none and yields [`SandboxError::NoAddress`].
    pub async fn get_address(&self, tenant: &TenantId) -> Result<String> {
        let compute = self.names.compute(tenant);
        let details = self
            .engine
            .inspect_container(&compute)
            .await
            .map_err(|e| self.report("get_address", tenant, e))?;

        details
            .address_on(&self.names.network(tenant))
            .map(str::to_string)
            .ok_or(SandboxError::NoAddress(compute))
    }

    /// One environment variable of the compute container.
    pub async fn container_env(&self, tenant: &TenantId, key: &str) -> Result<String> {
        let compute = self.names.compute(tenant);
        let details = self
            .engine
            .inspect_container(&compute)
            .await
            .map_err(|e| self.report("container_env", tenant, e))?;

        details
            .env_var(key)
            .map(str::to_string)
            .ok_or_else(|| SandboxError::NotFound(format!("{key} in {compute}")))
    }

    /// Tail of the compute container's output; `None` uses the configured default.
    pub async fn container_logs(&self, tenant: &TenantId, tail: Option<usize>) -> Result<String> {
        let tail = tail.unwrap_or(self.lifecycle.log_tail);
        self.engine
            .logs(&self.names.compute(tenant), tail)
            .await
            .map_err(|e| self.report("container_logs", tenant, e))
    }

    async fn tenant_lock(&self, tenant: &TenantId) -> OwnedMutexGuard<()> {
        let lock = self.tenant_locks.entry(tenant.clone()).or_default().clone();
        lock.lock_owned().await
    }

    fn report(&self, operation: &str, tenant: &TenantId, err: EngineError) -> SandboxError {
        error!("{} failed for tenant {}: {}", operation, tenant, err);
        err.into()
    }

    async fn bring_up(
        &self,
        tenant: &TenantId,
        data_source: &DataSourceRef,
        image: &ImageRef,
    ) -> Result<()> {
        let fail = |step: &'static str| {
            move |e: EngineError| {
                error!(
                    "start_sandbox failed for tenant {} at step {}: {}",
                    tenant, step, e
                );
                SandboxError::partial(step, e)
            }
        };

        let compute = self.names.compute(tenant);
        let network = self.names.network(tenant);

        self.teardown(tenant).await.map_err(fail("cleanup"))?;
        self.ensure_data_holder(tenant)
            .await
            .map_err(fail("data_holder"))?;

        let network_spec = NetworkSpec::bridge(&network).label(TENANT_LABEL, tenant.as_str());
        if self
            .engine
            .create_network(&network_spec)
            .await
            .map_err(fail("network"))?
            .applied()
        {
            info!("Created network {}", network);
        }

        for service in self.linked_services() {
            if self
                .engine
                .connect_network(&network, service)
                .await
                .map_err(fail("services"))?
                .applied()
            {
                info!("Joined {} to network {}", service, network);
            }
        }

        let spec = self
            .compute_spec(tenant, data_source, image)
            .map_err(fail("create"))?;
        self.engine
            .create_container(&spec)
            .await
            .map_err(fail("create"))?;
        self.engine
            .start_container(&compute)
            .await
            .map_err(fail("start"))?;

        Ok(())
    }

    /// Remove the compute container and every helper of the tenant.
    async fn teardown(&self, tenant: &TenantId) -> container::Result<Effect> {
        let compute = self.names.compute(tenant);
        let containers = self.engine.list_containers(true).await?;

        let targets: Vec<String> = containers
            .iter()
            .flat_map(|c| c.names.iter())
            .map(|n| n.trim_start_matches('/'))
            .filter(|n| *n == compute || self.names.is_helper_of(n, tenant))
            .map(str::to_string)
            .collect();

        let mut effect = Effect::Absent;
        for name in targets {
            debug!("Removing {} for tenant {}", name, tenant);
            effect = effect.or(self.engine.stop_and_remove(&name, self.stop_timeout).await?);
        }
        Ok(effect)
    }

    async fn ensure_data_holder(&self, tenant: &TenantId) -> container::Result<bool> {
        let data = self.names.data(tenant);
        if self.engine.container_exists(&data).await? {
            return Ok(false);
        }

        let spec = ContainerSpec::builder()
            .name(&data)
            .image(&self.lifecycle.data_image)
            .entrypoint([DATA_HOLDER_ENTRYPOINT])
            .volume(&self.secret_dir)
            .volume(&self.user_home)
            .label(TENANT_LABEL, tenant.as_str())
            .label(ROLE_LABEL, "data")
            .build()?;

        match self.engine.create_container(&spec).await {
            Ok(_) => {
                info!("Created data holder {}", data);
                Ok(true)
            }
            Err(EngineError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn compute_spec(
        &self,
        tenant: &TenantId,
        data_source: &DataSourceRef,
        image: &ImageRef,
    ) -> container::Result<ContainerSpec> {
        let compute = self.names.compute(tenant);
        let port = self.lifecycle.service_port;
        let limits = &self.lifecycle.limits;

        let mut builder = ContainerSpec::builder()
            .name(&compute)
            .image(image.to_string())
            .env("VIRTUAL_HOST", &compute)
            .env("VIRTUAL_PORT", port.to_string())
            .env("DATA_SOURCE", data_source.as_str())
            .env("USER_HOME", &self.user_home)
            .envs(&self.lifecycle.service_env)
            .tty(self.lifecycle.tty)
            .volumes_from(self.names.data(tenant))
            .network_mode(self.names.network(tenant))
            .publish_loopback(port)
            .cpu_shares(limits.cpu_shares())
            .label(TENANT_LABEL, tenant.as_str())
            .label(ROLE_LABEL, "compute");

        if let Some(memory) = limits.memory() {
            builder = builder.memory_limit(memory);
        }
        if let Some(swap) = limits.memory_swap() {
            builder = builder.memory_swap(swap);
        }
        for link in &self.lifecycle.links {
            builder = builder.link(link);
        }
        if let Some(root) = &self.lifecycle.data_source_root {
            let source = root.join(data_source.as_str());
            builder = builder.bind(format!("{}:{}:ro", source.display(), DATA_SOURCE_MOUNT));
        }
        if let Some(entrypoint) = &self.lifecycle.compute_entrypoint {
            builder = builder.entrypoint(entrypoint.iter().cloned());
        }

        builder.build()
    }

    /// Containers named by the configured links. Links resolve only between
    /// members of one network, so these join every tenant network.
    fn linked_services(&self) -> impl Iterator<Item = &str> {
        self.lifecycle
            .links
            .iter()
            .filter_map(|link| link.split(':').next())
            .filter(|name| !name.is_empty())
    }
}

#[async_trait]
impl Evictor for SandboxManager {
    async fn evict(&self, tenant: &TenantId) -> Result<()> {
        let _guard = self.tenant_lock(tenant).await;
        self.teardown(tenant)
            .await
            .map(|_| ())
            .map_err(|e| self.report("evict", tenant, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::MemoryEngine;
    use crate::watchdog::ManualClock;

    fn manager(config: &SandboxdConfig) -> (Arc<MemoryEngine>, SandboxManager) {
        let engine = Arc::new(MemoryEngine::new());
        let timers = Arc::new(IdleTimers::new(Arc::new(ManualClock::new())));
        let manager = SandboxManager::new(engine.clone(), timers, config);
        (engine, manager)
    }

    fn tenant() -> TenantId {
        TenantId::parse("alice").unwrap()
    }

    #[test]
    fn test_compute_spec_contents() {
        let mut config = SandboxdConfig::default();
        config.lifecycle.links = vec!["mongo:mongo".into()];
        config.lifecycle.data_source_root = Some("/srv/episodes".into());
        config
            .lifecycle
            .service_env
            .insert("MONGO_PORT".into(), "27017".into());
        let (_engine, manager) = manager(&config);

        let source = DataSourceRef::parse("robots/run-1").unwrap();
        let image = ImageRef::parse("sandboxd/compute", "1.2").unwrap();
        let spec = manager.compute_spec(&tenant(), &source, &image).unwrap();

        assert_eq!(spec.name, "sbx-compute-alice");
        assert_eq!(spec.image, "sandboxd/compute:1.2");
        assert_eq!(spec.env_var("VIRTUAL_HOST"), Some("sbx-compute-alice"));
        assert_eq!(spec.env_var("VIRTUAL_PORT"), Some("9090"));
        assert_eq!(spec.env_var("DATA_SOURCE"), Some("robots/run-1"));
        assert_eq!(spec.env_var("USER_HOME"), Some("/home/user/data"));
        assert_eq!(spec.env_var("MONGO_PORT"), Some("27017"));
        assert_eq!(spec.volumes_from, vec!["sbx-data-alice"]);
        assert_eq!(spec.network_mode.as_deref(), Some("sbx-net-alice"));
        assert_eq!(spec.links, vec!["mongo:mongo"]);
        assert_eq!(spec.binds, vec!["/srv/episodes/robots/run-1:/episodes:ro"]);
        assert_eq!(spec.memory_limit, Some(268_435_456));
        assert_eq!(spec.memory_swap, Some(1_073_741_824));
        assert_eq!(spec.cpu_shares, Some(256));
        assert_eq!(spec.published[0].host_ip, "127.0.0.1");
        assert!(spec.tty);
    }

    #[tokio::test]
    async fn test_data_holder_created_once() {
        let (engine, manager) = manager(&SandboxdConfig::default());

        assert!(manager.create_data_holder(&tenant()).await.unwrap());
        assert!(!manager.create_data_holder(&tenant()).await.unwrap());

        let spec = engine.spec_of("sbx-data-alice").unwrap();
        assert_eq!(spec.volumes, vec!["/etc/rosauth", "/home/user/data"]);
        assert_eq!(spec.entrypoint, Some(vec!["true".to_string()]));
        assert!(!engine.is_running("sbx-data-alice"));
    }

    #[test]
    fn test_linked_services() {
        let mut config = SandboxdConfig::default();
        config.lifecycle.links = vec!["mongo:db".into(), "redis".into(), ":x".into()];
        let (_engine, manager) = manager(&config);

        let services: Vec<&str> = manager.linked_services().collect();
        assert_eq!(services, ["mongo", "redis"]);
    }

    #[tokio::test]
    async fn test_invalid_image_rejected_before_engine_calls() {
        let (engine, manager) = manager(&SandboxdConfig::default());
        let source = DataSourceRef::parse("demo").unwrap();

        let err = manager
            .start_sandbox(&tenant(), &source, "Bad Image", "latest")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation");
        assert!(engine.calls().is_empty());
    }
}
