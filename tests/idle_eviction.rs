//! Idle watchdog driving the lifecycle manager's teardown.

use sandboxd::container::MemoryEngine;
use sandboxd::naming::{DataSourceRef, TenantId};
use sandboxd::sandbox::SandboxManager;
use sandboxd::watchdog::{IdleTimers, IdleWatchdog, ManualClock};
use sandboxd::SandboxdConfig;
use std::sync::Arc;
use std::time::Duration;
use test_tag::tag;

const WINDOW: Duration = Duration::from_secs(600);

struct Harness {
    engine: Arc<MemoryEngine>,
    clock: Arc<ManualClock>,
    timers: Arc<IdleTimers>,
    manager: Arc<SandboxManager>,
}

fn harness() -> Harness {
    let engine = Arc::new(MemoryEngine::new());
    let clock = Arc::new(ManualClock::new());
    let timers = Arc::new(IdleTimers::new(clock.clone()));
    let manager = Arc::new(SandboxManager::new(
        engine.clone(),
        timers.clone(),
        &SandboxdConfig::default(),
    ));
    Harness {
        engine,
        clock,
        timers,
        manager,
    }
}

impl Harness {
    fn watchdog(&self, poll_interval: Duration) -> IdleWatchdog {
        IdleWatchdog::new(self.timers.clone(), self.manager.clone(), poll_interval)
    }

    async fn start(&self, tenant: &TenantId) {
        let source = DataSourceRef::parse("demo").unwrap();
        self.manager
            .start_sandbox(tenant, &source, "sandboxd/compute", "latest")
            .await
            .unwrap();
    }

    fn compute_removals(&self, tenant: &TenantId) -> usize {
        let compute = format!("sbx-compute-{tenant}");
        self.engine
            .calls()
            .into_iter()
            .filter(|c| c.op == "remove_container" && c.target == compute)
            .count()
    }
}

#[tokio::test]
#[tag(watchdog)]
async fn test_expired_sandbox_stopped_exactly_once() {
    let h = harness();
    let alice = TenantId::parse("alice").unwrap();
    h.start(&alice).await;
    h.engine.clear_calls();

    let watchdog = h.watchdog(Duration::from_secs(5));
    h.clock.advance(WINDOW + Duration::from_secs(1));

    let report = watchdog.poll_once().await;
    assert_eq!(report.evicted, vec![alice.clone()]);
    assert!(report.failed.is_empty());

    let again = watchdog.poll_once().await;
    assert!(again.is_empty());

    assert_eq!(h.compute_removals(&alice), 1);
    assert!(h.timers.is_empty().await);
    assert!(!h.manager.is_running(&alice).await.unwrap());
    assert!(h.engine.container_names().contains(&"sbx-data-alice".to_string()));
}

#[tokio::test]
#[tag(watchdog)]
async fn test_refresh_before_expiry_prevents_eviction() {
    let h = harness();
    let alice = TenantId::parse("alice").unwrap();
    h.start(&alice).await;
    let watchdog = h.watchdog(Duration::from_secs(5));

    h.clock.advance(Duration::from_secs(500));
    h.timers.refresh(&alice, WINDOW).await;
    h.clock.advance(Duration::from_secs(200));

    assert!(watchdog.poll_once().await.is_empty());
    assert!(h.manager.is_running(&alice).await.unwrap());

    h.clock.advance(Duration::from_secs(401));
    assert_eq!(watchdog.poll_once().await.evicted, vec![alice]);
}

#[tokio::test]
#[tag(watchdog)]
async fn test_only_expired_tenants_evicted() {
    let h = harness();
    let alice = TenantId::parse("alice").unwrap();
    let bob = TenantId::parse("bob").unwrap();
    h.start(&alice).await;
    h.clock.advance(Duration::from_secs(300));
    h.start(&bob).await;

    h.clock.advance(Duration::from_secs(301));
    let report = h.watchdog(Duration::from_secs(5)).poll_once().await;

    assert_eq!(report.evicted, vec![alice.clone()]);
    assert!(!h.manager.is_running(&alice).await.unwrap());
    assert!(h.manager.is_running(&bob).await.unwrap());
    assert_eq!(h.timers.tracked().await, vec![bob]);
}

#[tokio::test]
#[tag(watchdog)]
async fn test_explicit_stop_disarms_timer() {
    let h = harness();
    let alice = TenantId::parse("alice").unwrap();
    h.start(&alice).await;
    h.manager.stop_sandbox(&alice).await.unwrap();
    h.engine.clear_calls();

    h.clock.advance(WINDOW * 2);
    assert!(h.watchdog(Duration::from_secs(5)).poll_once().await.is_empty());
    assert!(h.engine.calls().is_empty());
}

#[tokio::test]
#[tag(watchdog)]
async fn test_failed_eviction_retried_on_next_poll() {
    let h = harness();
    let alice = TenantId::parse("alice").unwrap();
    h.start(&alice).await;
    let watchdog = h.watchdog(Duration::from_secs(5));
    let deadline = h.timers.deadline(&alice).await;

    h.clock.advance(WINDOW + Duration::from_secs(1));
    h.engine.set_unavailable(true);
    let report = watchdog.poll_once().await;
    assert_eq!(report.failed, vec![alice.clone()]);
    assert_eq!(h.timers.deadline(&alice).await, deadline);

    h.engine.set_unavailable(false);
    let report = watchdog.poll_once().await;
    assert_eq!(report.evicted, vec![alice.clone()]);
    assert!(!h.manager.is_running(&alice).await.unwrap());
}

#[tokio::test]
#[tag(watchdog)]
async fn test_background_task_evicts_and_shuts_down() {
    let h = harness();
    let alice = TenantId::parse("alice").unwrap();
    h.start(&alice).await;
    h.clock.advance(WINDOW + Duration::from_secs(1));

    let handle = h.watchdog(Duration::from_millis(10)).spawn();

    let evicted = tokio::time::timeout(Duration::from_secs(5), async {
        while !h.timers.is_empty().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(evicted.is_ok(), "watchdog did not evict in time");

    handle.shutdown().await;
    assert!(!h.manager.is_running(&alice).await.unwrap());
}
