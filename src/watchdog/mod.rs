//! Idle eviction.
//!
//! Every active tenant has a deadline in [`IdleTimers`]. One background task
//! scans the map every poll interval and tears down sandboxes whose deadline
//! has passed. Removal from the map and the teardown happen under the same
//! lock, so a deadline is never acted on twice.

pub mod clock;
pub mod timers;

pub use clock::{Clock, ManualClock, SystemClock};
pub use timers::{IdleTimer, IdleTimers};

use crate::naming::TenantId;
use crate::sandbox::SandboxError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

/// Tears down an expired sandbox.
#[async_trait]
pub trait Evictor: Send + Sync {
    /// Stop the tenant's compute container and helpers.
    ///
    /// Must not touch [`IdleTimers`]; the watchdog holds its lock.
    async fn evict(&self, tenant: &TenantId) -> Result<(), SandboxError>;
}

/// Outcome of one deadline scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionReport {
    /// Tenants torn down
    pub evicted: Vec<TenantId>,
    /// Tenants whose teardown failed; they are retried on the next scan
    pub failed: Vec<TenantId>,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty() && self.failed.is_empty()
    }
}

/// Periodic scanner over [`IdleTimers`].
#[derive(Clone)]
pub struct IdleWatchdog {
    timers: Arc<IdleTimers>,
    evictor: Arc<dyn Evictor>,
    poll_interval: Duration,
}

impl IdleWatchdog {
    pub fn new(timers: Arc<IdleTimers>, evictor: Arc<dyn Evictor>, poll_interval: Duration) -> Self {
        Self {
            timers,
            evictor,
            poll_interval,
        }
    }

    /// Evict every tenant whose deadline has passed.
    pub async fn poll_once(&self) -> EvictionReport {
        let mut map = self.timers.lock().await;
        let now = self.timers.now();

        let mut expired: Vec<(TenantId, IdleTimer)> = map
            .iter()
            .filter(|(_, timer)| timer.deadline <= now)
            .map(|(tenant, timer)| (tenant.clone(), *timer))
            .collect();
        expired.sort_by(|a, b| a.0.cmp(&b.0));

        let mut report = EvictionReport::default();
        for (tenant, timer) in expired {
            map.remove(&tenant);
            info!("Sandbox of {} idle for {:?}, stopping it", tenant, timer.window);

            match self.evictor.evict(&tenant).await {
                Ok(()) => report.evicted.push(tenant),
                Err(e) => {
                    warn!("Failed to evict idle sandbox of {}: {}", tenant, e);
                    map.insert(tenant.clone(), timer);
                    report.failed.push(tenant);
                }
            }
        }

        report
    }

    /// Run [`poll_once`](Self::poll_once) on a fixed interval in a background task.
    pub fn spawn(self) -> WatchdogHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let poll_interval = self.poll_interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.poll_once().await;
                        if !report.failed.is_empty() {
                            error!("{} idle sandbox(es) could not be stopped", report.failed.len());
                        } else if !report.evicted.is_empty() {
                            debug!("Evicted {} idle sandbox(es)", report.evicted.len());
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Idle watchdog stopped");
        });

        info!("Idle watchdog started with interval: {:?}", poll_interval);
        WatchdogHandle { shutdown_tx, task }
    }
}

/// Control handle of a running watchdog task.
pub struct WatchdogHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatchdogHandle {
    /// Stop the scanner and wait for it to finish its current scan.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!("Idle watchdog task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingEvictor {
        evicted: Mutex<Vec<TenantId>>,
        fail: bool,
    }

    #[async_trait]
    impl Evictor for RecordingEvictor {
        async fn evict(&self, tenant: &TenantId) -> Result<(), SandboxError> {
            self.evicted.lock().unwrap().push(tenant.clone());
            if self.fail {
                Err(SandboxError::EngineUnavailable("engine down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn setup(fail: bool) -> (Arc<ManualClock>, Arc<IdleTimers>, Arc<RecordingEvictor>, IdleWatchdog) {
        let clock = Arc::new(ManualClock::new());
        let timers = Arc::new(IdleTimers::new(clock.clone()));
        let evictor = Arc::new(RecordingEvictor {
            evicted: Mutex::new(Vec::new()),
            fail,
        });
        let watchdog = IdleWatchdog::new(timers.clone(), evictor.clone(), Duration::from_secs(5));
        (clock, timers, evictor, watchdog)
    }

    #[tokio::test]
    async fn test_expired_timer_evicted_once() {
        let (clock, timers, evictor, watchdog) = setup(false);
        let alice = TenantId::parse("alice").unwrap();
        timers.arm(&alice, Duration::from_secs(600)).await;

        assert!(watchdog.poll_once().await.is_empty());

        clock.advance(Duration::from_secs(601));
        let report = watchdog.poll_once().await;
        assert_eq!(report.evicted, vec![alice.clone()]);
        assert!(timers.is_empty().await);

        assert!(watchdog.poll_once().await.is_empty());
        assert_eq!(evictor.evicted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_eviction_is_retried() {
        let (clock, timers, evictor, watchdog) = setup(true);
        let bob = TenantId::parse("bob").unwrap();
        timers.arm(&bob, Duration::from_secs(10)).await;
        let deadline = timers.deadline(&bob).await;

        clock.advance(Duration::from_secs(11));
        let report = watchdog.poll_once().await;
        assert_eq!(report.failed, vec![bob.clone()]);
        assert_eq!(timers.deadline(&bob).await, deadline);

        watchdog.poll_once().await;
        assert_eq!(evictor.evicted.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_spawned_watchdog_shuts_down() {
        let (_clock, _timers, _evictor, watchdog) = setup(false);
        let handle = watchdog.spawn();
        handle.shutdown().await;
    }
}
