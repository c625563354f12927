use super::Clock;
use crate::naming::TenantId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// One tenant's idle deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleTimer {
    /// Instant at which the sandbox becomes evictable
    pub deadline: Instant,
    /// Window the timer was last armed with
    pub window: Duration,
}

pub(super) type TimerMap = HashMap<TenantId, IdleTimer>;

/// Deadline used when `now + window` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Idle deadlines of all active tenants behind a single lock.
pub struct IdleTimers {
    clock: Arc<dyn Clock>,
    map: Mutex<TimerMap>,
}

impl IdleTimers {
    /// Create an empty timer map reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or restart) a tenant's idle window.
    pub async fn arm(&self, tenant: &TenantId, window: Duration) {
        let now = self.clock.now();
        let deadline = now
            .checked_add(window)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        self.map
            .lock()
            .await
            .insert(tenant.clone(), IdleTimer { deadline, window });
        debug!("Idle timer for {} armed for {:?}", tenant, window);
    }

    /// Push a tenant's deadline out by `window` from now.
    pub async fn refresh(&self, tenant: &TenantId, window: Duration) {
        self.arm(tenant, window).await;
    }

    /// Drop a tenant's timer; `true` if one existed.
    pub async fn cancel(&self, tenant: &TenantId) -> bool {
        let removed = self.map.lock().await.remove(tenant).is_some();
        if removed {
            debug!("Idle timer for {} cancelled", tenant);
        }
        removed
    }

    /// A tenant's current deadline.
    pub async fn deadline(&self, tenant: &TenantId) -> Option<Instant> {
        self.map.lock().await.get(tenant).map(|t| t.deadline)
    }

    /// Number of tracked tenants.
    pub async fn len(&self) -> usize {
        self.map.lock().await.len()
    }

    /// Whether no tenant is tracked.
    pub async fn is_empty(&self) -> bool {
        self.map.lock().await.is_empty()
    }

    /// Tracked tenants, sorted.
    pub async fn tracked(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self.map.lock().await.keys().cloned().collect();
        tenants.sort();
        tenants
    }

    pub(super) fn now(&self) -> Instant {
        self.clock.now()
    }

    pub(super) async fn lock(&self) -> MutexGuard<'_, TimerMap> {
        self.map.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::ManualClock;

    fn tenant(raw: &str) -> TenantId {
        TenantId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_arm_refresh_cancel() {
        let clock = Arc::new(ManualClock::new());
        let timers = IdleTimers::new(clock.clone());
        let alice = tenant("alice");

        timers.arm(&alice, Duration::from_secs(600)).await;
        let first = timers.deadline(&alice).await.unwrap();

        clock.advance(Duration::from_secs(100));
        timers.refresh(&alice, Duration::from_secs(600)).await;
        let second = timers.deadline(&alice).await.unwrap();
        assert_eq!(second - first, Duration::from_secs(100));

        assert!(timers.cancel(&alice).await);
        assert!(!timers.cancel(&alice).await);
        assert!(timers.is_empty().await);
    }

    #[tokio::test]
    async fn test_oversized_window_saturates() {
        let clock = Arc::new(ManualClock::new());
        let timers = IdleTimers::new(clock.clone());
        let alice = tenant("alice");

        timers.arm(&alice, Duration::MAX).await;
        let deadline = timers.deadline(&alice).await.unwrap();
        assert!(deadline > clock.now() + Duration::from_secs(365 * 24 * 60 * 60));

        timers
            .arm(&alice, Duration::from_secs(i64::MAX as u64))
            .await;
        assert!(timers.deadline(&alice).await.unwrap() > clock.now());
    }

    #[tokio::test]
    async fn test_tracked_is_sorted() {
        let timers = IdleTimers::new(Arc::new(ManualClock::new()));
        for name in ["carol", "alice", "bob"] {
            timers.arm(&tenant(name), Duration::from_secs(1)).await;
        }

        let tracked: Vec<String> = timers
            .tracked()
            .await
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(tracked, ["alice", "bob", "carol"]);
        assert_eq!(timers.len().await, 3);
    }
}
