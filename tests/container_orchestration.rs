//! Integration tests against a real container engine.
//!
//! These tests verify the lifecycle manager and file bridge end-to-end with
//! Docker/Podman. Tests are skipped if Docker/Podman is not available or
//! SKIP_CONTAINER_TESTS=1.

#![cfg(feature = "docker")]

use sandboxd::bridge::FileBridge;
use sandboxd::container::{DockerEngine, Engine, EngineConfig};
use sandboxd::naming::{DataSourceRef, TenantId};
use sandboxd::sandbox::SandboxManager;
use sandboxd::watchdog::{IdleTimers, SystemClock};
use sandboxd::SandboxdConfig;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use test_tag::tag;

const TEST_IMAGE: &str = "busybox";
const TEST_TAG: &str = "latest";

/// Check if container tests should run.
fn should_run_container_tests() -> bool {
    if let Ok(value) = std::env::var("SKIP_CONTAINER_TESTS") {
        if value == "1" || value.eq_ignore_ascii_case("true") {
            return false;
        }
    }

    ["docker", "podman"].iter().any(|runtime| {
        std::process::Command::new(runtime)
            .arg("info")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    })
}

/// Make sure the test image is present locally.
fn pull_test_image() -> bool {
    std::process::Command::new("docker")
        .args(["pull", &format!("{TEST_IMAGE}:{TEST_TAG}")])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn test_config() -> SandboxdConfig {
    let mut config = SandboxdConfig::default();
    config.naming.prefix = "sbxtest".to_string();
    config.lifecycle.data_image = format!("{TEST_IMAGE}:{TEST_TAG}");
    config.lifecycle.compute_entrypoint = Some(vec!["sleep".to_string(), "300".to_string()]);
    config.lifecycle.tty = false;
    config.bridge.helper_image = format!("{TEST_IMAGE}:{TEST_TAG}");
    config
}

/// Remove everything a test may have left behind for `tenant`.
async fn cleanup(engine: &DockerEngine, manager: &SandboxManager, tenant: &TenantId) {
    let _ = manager.stop_sandbox(tenant).await;
    let _ = engine
        .stop_and_remove(&manager.names().data(tenant), Duration::from_secs(1))
        .await;
}

#[tokio::test]
#[serial]
#[tag(integration, container)]
async fn test_engine_connection() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests (Docker/Podman not available or SKIP_CONTAINER_TESTS=1)");
        return;
    }

    let engine = DockerEngine::connect(&EngineConfig::default()).await;
    assert!(engine.is_ok(), "Failed to connect: {:?}", engine.err());

    let engine = engine.unwrap();
    engine.ping().await.expect("ping should succeed");
    let version = engine.client().version().await.expect("version should be reported");
    assert!(!version.is_empty());

    println!("✓ Connected to container engine {}", version);
}

#[tokio::test]
#[serial]
#[tag(integration, container)]
async fn test_sandbox_lifecycle_and_files() {
    if !should_run_container_tests() || !pull_test_image() {
        eprintln!("Skipping container tests");
        return;
    }

    let config = test_config();
    let engine = Arc::new(
        DockerEngine::connect(&config.engine)
            .await
            .expect("Failed to connect"),
    );
    let timers = Arc::new(IdleTimers::new(Arc::new(SystemClock)));
    let manager = SandboxManager::new(engine.clone(), timers, &config);
    let staging = TempDir::new().unwrap();
    let bridge = FileBridge::new(engine.clone(), &config, staging.path().to_path_buf());

    let tenant = TenantId::parse("itest").unwrap();
    cleanup(&engine, &manager, &tenant).await;

    let source = DataSourceRef::parse("demo").unwrap();
    manager
        .start_sandbox(&tenant, &source, TEST_IMAGE, TEST_TAG)
        .await
        .expect("start should succeed");
    assert!(manager.is_running(&tenant).await.unwrap());

    let address = manager.get_address(&tenant).await.expect("address");
    assert!(!address.is_empty());
    println!("✓ Sandbox running at {}", address);

    bridge
        .write(&tenant, "notes/hello.txt", b"hello sandbox\n".to_vec(), None)
        .await
        .expect("write should succeed");
    assert_eq!(
        bridge.read(&tenant, "notes/hello.txt").await.unwrap(),
        b"hello sandbox\n"
    );
    assert!(bridge.exists(&tenant, "notes/hello.txt").await.unwrap());
    assert_eq!(bridge.list(&tenant, "notes", false).await.unwrap(), vec!["hello.txt"]);

    bridge.write_secret(&tenant, "token").await.unwrap();
    assert_eq!(bridge.read_secret(&tenant).await.unwrap(), "token");

    manager.stop_sandbox(&tenant).await.expect("stop should succeed");
    assert!(!manager.is_running(&tenant).await.unwrap());

    // Files outlive the compute container.
    assert!(bridge.exists(&tenant, "notes/hello.txt").await.unwrap());

    cleanup(&engine, &manager, &tenant).await;
    println!("✓ Full sandbox cycle completed");
}
