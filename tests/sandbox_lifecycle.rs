//! Lifecycle manager against the in-memory engine.

use sandboxd::container::{ContainerSpec, Effect, Engine, MemoryEngine};
use sandboxd::naming::{DataSourceRef, TenantId};
use sandboxd::sandbox::SandboxManager;
use sandboxd::watchdog::{IdleTimers, ManualClock};
use sandboxd::SandboxdConfig;
use std::sync::Arc;
use test_tag::tag;

struct Harness {
    engine: Arc<MemoryEngine>,
    timers: Arc<IdleTimers>,
    manager: Arc<SandboxManager>,
}

fn harness_with(config: &SandboxdConfig) -> Harness {
    let engine = Arc::new(MemoryEngine::new());
    let timers = Arc::new(IdleTimers::new(Arc::new(ManualClock::new())));
    let manager = Arc::new(SandboxManager::new(engine.clone(), timers.clone(), config));
    Harness {
        engine,
        timers,
        manager,
    }
}

fn harness() -> Harness {
    harness_with(&SandboxdConfig::default())
}

fn tenant(name: &str) -> TenantId {
    TenantId::parse(name).unwrap()
}

fn source() -> DataSourceRef {
    DataSourceRef::parse("robots/run-1").unwrap()
}

async fn start(h: &Harness, name: &str) {
    h.manager
        .start_sandbox(&tenant(name), &source(), "sandboxd/compute", "1.0")
        .await
        .expect("start should succeed");
}

fn compute_containers(engine: &MemoryEngine) -> Vec<String> {
    engine
        .container_names()
        .into_iter()
        .filter(|n| n.starts_with("sbx-compute-"))
        .collect()
}

#[tokio::test]
#[tag(lifecycle)]
async fn test_stop_without_sandbox_is_noop() {
    let h = harness();

    let effect = h.manager.stop_sandbox(&tenant("alice")).await.unwrap();

    assert_eq!(effect, Effect::Absent);
    assert_eq!(h.engine.count("remove_container"), 0);
    assert_eq!(h.engine.count("stop_container"), 0);
}

#[tokio::test]
#[tag(lifecycle)]
async fn test_start_brings_up_all_resources_in_order() {
    let h = harness();
    start(&h, "alice").await;

    let ops: Vec<(&str, String)> = h
        .engine
        .calls()
        .into_iter()
        .filter(|c| {
            matches!(
                c.op,
                "create_container" | "create_network" | "connect_network" | "start_container"
            )
        })
        .map(|c| (c.op, c.target))
        .collect();

    assert_eq!(
        ops,
        vec![
            ("create_container", "sbx-data-alice".to_string()),
            ("create_network", "sbx-net-alice".to_string()),
            ("create_container", "sbx-compute-alice".to_string()),
            ("start_container", "sbx-compute-alice".to_string()),
        ]
    );
    assert_eq!(h.engine.calls()[0].op, "list_containers");

    assert!(h.engine.is_running("sbx-compute-alice"));
    assert!(!h.engine.is_running("sbx-data-alice"));
    assert_eq!(
        h.engine.network_members("sbx-net-alice"),
        vec!["sbx-compute-alice"]
    );
    assert_eq!(
        h.engine
            .spec_of("sbx-compute-alice")
            .and_then(|spec| spec.network_mode),
        Some("sbx-net-alice".to_string())
    );
    assert!(h.timers.deadline(&tenant("alice")).await.is_some());
}

#[tokio::test]
#[tag(lifecycle)]
async fn test_start_twice_leaves_one_compute_container() {
    let h = harness();
    start(&h, "alice").await;
    start(&h, "alice").await;

    assert_eq!(compute_containers(&h.engine), vec!["sbx-compute-alice"]);
    let data_creations = h
        .engine
        .calls()
        .into_iter()
        .filter(|c| c.op == "create_container" && c.target == "sbx-data-alice")
        .count();
    assert_eq!(data_creations, 1);
}

#[tokio::test]
#[tag(lifecycle)]
async fn test_running_sandbox_has_address() {
    let h = harness();
    let alice = tenant("alice");
    start(&h, "alice").await;

    assert!(h.manager.is_running(&alice).await.unwrap());
    assert!(
        h.manager
            .is_running_image(&alice, "sandboxd/compute:1.0")
            .await
            .unwrap()
    );
    assert!(
        !h.manager
            .is_running_image(&alice, "sandboxd/compute:2.0")
            .await
            .unwrap()
    );

    let address = h.manager.get_address(&alice).await.unwrap();
    assert!(address.starts_with("10.10.0."), "unexpected address {address}");
}

#[tokio::test]
#[tag(lifecycle)]
async fn test_missing_sandbox_queries() {
    let h = harness();
    let bob = tenant("bob");

    assert!(!h.manager.is_running(&bob).await.unwrap());
    let err = h.manager.get_address(&bob).await.unwrap_err();
    assert_eq!(err.code(), "not_found");
    let err = h.manager.container_env(&bob, "DATA_SOURCE").await.unwrap_err();
    assert_eq!(err.code(), "not_found");
}

#[tokio::test]
#[tag(lifecycle)]
async fn test_stop_keeps_data_holder_and_cancels_timer() {
    let h = harness();
    let alice = tenant("alice");
    start(&h, "alice").await;

    let effect = h.manager.stop_sandbox(&alice).await.unwrap();

    assert_eq!(effect, Effect::Applied);
    assert!(compute_containers(&h.engine).is_empty());
    assert!(h.engine.container_names().contains(&"sbx-data-alice".to_string()));
    assert!(h.timers.deadline(&alice).await.is_none());
    assert!(!h.manager.is_running(&alice).await.unwrap());

    let effect = h.manager.stop_sandbox(&alice).await.unwrap();
    assert_eq!(effect, Effect::Absent);
}

#[tokio::test]
#[tag(lifecycle)]
async fn test_stop_removes_leftover_helpers() {
    let h = harness();
    let alice = tenant("alice");
    start(&h, "alice").await;

    let helper = h.manager.names().helper(&alice);
    let spec = ContainerSpec::builder()
        .name(&helper)
        .image("busybox:latest")
        .build()
        .unwrap();
    h.engine.create_container(&spec).await.unwrap();

    let bob_helper = h.manager.names().helper(&tenant("bob"));
    let spec = ContainerSpec::builder()
        .name(&bob_helper)
        .image("busybox:latest")
        .build()
        .unwrap();
    h.engine.create_container(&spec).await.unwrap();

    h.manager.stop_sandbox(&alice).await.unwrap();

    let names = h.engine.container_names();
    assert!(!names.contains(&helper));
    assert!(names.contains(&bob_helper));
}

#[tokio::test]
#[tag(lifecycle)]
async fn test_partial_failure_self_heals() {
    let h = harness();
    let alice = tenant("alice");

    h.engine.fail_next("start_container", "port already allocated");
    let err = h
        .manager
        .start_sandbox(&alice, &source(), "sandboxd/compute", "1.0")
        .await
        .unwrap_err();

    assert_eq!(err.code(), "partial_failure");
    assert!(err.to_string().contains("'start'"), "{err}");
    // Nothing is rolled back.
    assert_eq!(compute_containers(&h.engine), vec!["sbx-compute-alice"]);
    assert!(h.timers.deadline(&alice).await.is_none());

    start(&h, "alice").await;
    assert_eq!(compute_containers(&h.engine), vec!["sbx-compute-alice"]);
    assert!(h.manager.is_running(&alice).await.unwrap());
}

#[tokio::test]
#[tag(lifecycle)]
async fn test_network_failure_reports_step() {
    let h = harness();

    h.engine.fail_next("create_network", "address pool exhausted");
    let err = h
        .manager
        .start_sandbox(&tenant("alice"), &source(), "sandboxd/compute", "1.0")
        .await
        .unwrap_err();

    assert_eq!(err.code(), "partial_failure");
    assert!(err.to_string().contains("'network'"), "{err}");
    assert!(compute_containers(&h.engine).is_empty());
}

#[tokio::test]
#[tag(lifecycle)]
async fn test_unreachable_engine() {
    let h = harness();
    h.engine.set_unavailable(true);

    let err = h
        .manager
        .start_sandbox(&tenant("alice"), &source(), "sandboxd/compute", "1.0")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "engine_unavailable");

    let err = h.manager.is_running(&tenant("alice")).await.unwrap_err();
    assert_eq!(err.code(), "engine_unavailable");
}

#[tokio::test]
#[tag(lifecycle)]
async fn test_tenants_are_isolated() {
    let h = harness();
    start(&h, "alice").await;
    start(&h, "bob").await;

    h.manager.stop_sandbox(&tenant("bob")).await.unwrap();

    assert_eq!(compute_containers(&h.engine), vec!["sbx-compute-alice"]);
    assert!(h.manager.is_running(&tenant("alice")).await.unwrap());
    assert_eq!(
        h.engine.network_members("sbx-net-alice"),
        vec!["sbx-compute-alice"]
    );
}

#[tokio::test]
#[tag(lifecycle)]
async fn test_running_tenants_share_no_network() {
    let h = harness();
    start(&h, "alice").await;
    start(&h, "bob").await;

    let alice = h.engine.inspect_container("sbx-compute-alice").await.unwrap();
    let bob = h.engine.inspect_container("sbx-compute-bob").await.unwrap();

    assert_eq!(alice.networks.keys().collect::<Vec<_>>(), ["sbx-net-alice"]);
    assert_eq!(bob.networks.keys().collect::<Vec<_>>(), ["sbx-net-bob"]);
    assert_eq!(alice.ip_address, None);
    assert_eq!(bob.ip_address, None);
    assert_eq!(alice.address_on("sbx-net-bob"), None);
    assert_eq!(bob.address_on("sbx-net-alice"), None);
    assert_eq!(h.engine.network_members("bridge"), Vec::<String>::new());

    let alice_address = h.manager.get_address(&tenant("alice")).await.unwrap();
    let bob_address = h.manager.get_address(&tenant("bob")).await.unwrap();
    assert_ne!(alice_address, bob_address);
}

#[tokio::test]
#[tag(lifecycle)]
async fn test_linked_services_join_tenant_network() {
    let mut config = SandboxdConfig::default();
    config.lifecycle.links = vec!["mongo:mongo".to_string()];
    let h = harness_with(&config);
    let mongo = ContainerSpec::builder()
        .name("mongo")
        .image("mongo:7")
        .build()
        .unwrap();
    h.engine.create_container(&mongo).await.unwrap();
    h.engine.start_container("mongo").await.unwrap();

    start(&h, "alice").await;
    start(&h, "bob").await;

    let mut members = h.engine.network_members("sbx-net-alice");
    members.sort();
    assert_eq!(members, ["mongo", "sbx-compute-alice"]);
    assert!(!h.engine.network_members("sbx-net-alice").contains(&"sbx-compute-bob".to_string()));

    // A restart finds the service already attached.
    h.engine.clear_calls();
    start(&h, "alice").await;
    assert_eq!(h.engine.count("connect_network"), 1);
    assert_eq!(h.engine.network_members("sbx-net-alice").len(), 2);
}

#[tokio::test]
#[tag(lifecycle)]
async fn test_missing_linked_service_reports_step() {
    let mut config = SandboxdConfig::default();
    config.lifecycle.links = vec!["mongo:mongo".to_string()];
    let h = harness_with(&config);

    let err = h
        .manager
        .start_sandbox(&tenant("alice"), &source(), "sandboxd/compute", "1.0")
        .await
        .unwrap_err();

    assert_eq!(err.code(), "partial_failure");
    assert!(err.to_string().contains("'services'"), "{err}");
    assert!(compute_containers(&h.engine).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[tag(lifecycle, concurrency)]
async fn test_concurrent_start_stop_same_tenant() {
    let h = harness();
    let mut tasks = Vec::new();

    for i in 0..16 {
        let manager = h.manager.clone();
        tasks.push(tokio::spawn(async move {
            let alice = TenantId::parse("alice").unwrap();
            if i % 3 == 2 {
                manager.stop_sandbox(&alice).await.map(|_| ())
            } else {
                let source = DataSourceRef::parse("robots/run-1").unwrap();
                manager
                    .start_sandbox(&alice, &source, "sandboxd/compute", "1.0")
                    .await
            }
        }));
    }

    for task in tasks {
        task.await.unwrap().expect("operation should succeed");
    }

    assert!(compute_containers(&h.engine).len() <= 1);
    let data_creations = h
        .engine
        .calls()
        .into_iter()
        .filter(|c| c.op == "create_container" && c.target == "sbx-data-alice")
        .count();
    assert_eq!(data_creations, 1);
}

#[tokio::test]
#[tag(lifecycle)]
async fn test_container_env_and_logs() {
    let h = harness();
    let alice = tenant("alice");
    start(&h, "alice").await;

    assert_eq!(
        h.manager.container_env(&alice, "DATA_SOURCE").await.unwrap(),
        "robots/run-1"
    );
    assert_eq!(
        h.manager.container_env(&alice, "MISSING").await.unwrap_err().code(),
        "not_found"
    );

    for i in 0..5 {
        h.engine.push_log("sbx-compute-alice", &format!("line {i}"));
    }
    let logs = h.manager.container_logs(&alice, Some(2)).await.unwrap();
    assert_eq!(logs, "line 3\nline 4\n");

    let logs = h.manager.container_logs(&alice, None).await.unwrap();
    assert_eq!(logs.lines().count(), 5);
}
