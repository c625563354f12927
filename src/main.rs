use anyhow::Context;
use sandboxd::api::{self, SandboxService};
use sandboxd::bridge::FileBridge;
use sandboxd::cli::{Args, ConfigDiscovery, ExecutionMode, ServeConfig};
use sandboxd::config;
use sandboxd::container::{DockerEngine, Engine};
use sandboxd::env::{DEFAULT_LOG_FILTER, LOG_ENV};
use sandboxd::sandbox::SandboxManager;
use sandboxd::watchdog::{IdleTimers, IdleWatchdog, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match mode {
        ExecutionMode::Serve(config) => run_serve_mode(config).await,
        ExecutionMode::ShowConfig { config_override } => {
            init_logging(None);
            ConfigDiscovery::show_discovery_info(config_override.as_deref());
            let config = ConfigDiscovery::load(config_override.as_deref())?;
            println!();
            println!("{}", config.to_toml_string()?);
            Ok(())
        }
        ExecutionMode::CheckEngine { config_override } => {
            init_logging(None);
            let config = ConfigDiscovery::load(config_override.as_deref())?;
            let engine = DockerEngine::connect(&config.engine)
                .await
                .context("container engine is not reachable")?;
            let version = engine.client().version().await?;
            println!("✓ Container engine reachable: {}", version);
            Ok(())
        }
    }
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_serve_mode(serve: ServeConfig) -> anyhow::Result<()> {
    init_logging(serve.log_level.as_deref());
    info!("Starting sandboxd {}", env!("CARGO_PKG_VERSION"));

    let mut config = ConfigDiscovery::load(serve.config_override.as_deref())?;
    if let Some(listen) = serve.listen_override {
        config.server.listen = listen;
    }
    let transfer_root = config::transfer_root_from_env()?;
    info!("Transfer root: {}", transfer_root.display());

    let engine: Arc<dyn Engine> = Arc::new(
        DockerEngine::connect(&config.engine)
            .await
            .context("container engine is not reachable")?,
    );

    let timers = Arc::new(IdleTimers::new(Arc::new(SystemClock)));
    let manager = Arc::new(SandboxManager::new(engine.clone(), timers.clone(), &config));
    let bridge = Arc::new(FileBridge::new(engine, &config, transfer_root));

    let watchdog = IdleWatchdog::new(
        timers.clone(),
        manager.clone(),
        Duration::from_secs(config.watchdog.poll_interval_secs),
    )
    .spawn();

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;
    let service = SandboxService::new(manager, bridge, timers);

    tokio::select! {
        result = api::server::serve(listener, service, config.server.max_request_bytes) => {
            if let Err(e) = result {
                error!("Request listener failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    watchdog.shutdown().await;
    info!("sandboxd stopped");
    Ok(())
}
