//! # The entity → monitor registry and its sweeper.
//!
//! One mutex guards the whole mapping. Workers read-modify-write through
//! [`MonitorRegistry::synchronize`] in a single lock acquisition; the
//! sweeper periodically reaps entries whose monitor has fired or been
//! stopped. Stopped entries left behind between sweeps are harmless:
//! every reader treats a stopped monitor as absent and installs a fresh one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::monitor::Monitor;

/// How often stopped monitors are reaped.
const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Concurrently mutated mapping from entity id to its live monitor.
///
/// At most one non-stopped monitor exists per entity id at any instant.
#[derive(Default)]
pub(crate) struct MonitorRegistry {
    monitors: Mutex<HashMap<String, Arc<dyn Monitor>>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Brings the entry for `entity_id` in line with `timeout` and returns
    /// the monitor updates should be dispatched to.
    ///
    /// Under one lock acquisition: a missing or stopped entry is replaced by
    /// a freshly created monitor; a live entry with a different configured
    /// timeout is stopped and replaced; otherwise the live entry is reused.
    pub fn synchronize<F>(&self, entity_id: &str, timeout: Duration, create: F) -> Arc<dyn Monitor>
    where
        F: FnOnce() -> Arc<dyn Monitor>,
    {
        let mut monitors = self.monitors.lock();
        if let Some(current) = monitors.get(entity_id) {
            if !current.is_stopped() {
                if current.timeout() == timeout {
                    return Arc::clone(current);
                }
                current.stop();
            }
        }

        let fresh = create();
        monitors.insert(entity_id.to_string(), Arc::clone(&fresh));
        fresh
    }

    /// Installs `monitor` for `entity_id`, replacing any previous entry.
    ///
    /// Used by recovery, which rebuilds entries before any worker runs.
    pub fn install(&self, entity_id: &str, monitor: Arc<dyn Monitor>) {
        self.monitors.lock().insert(entity_id.to_string(), monitor);
    }

    /// Removes every entry whose monitor is stopped.
    ///
    /// Stopped ids are collected first, then deleted one by one while
    /// re-checking under the lock, so the lock is never held for the whole
    /// scan.
    pub fn sweep(&self) {
        let stopped: Vec<String> = self
            .monitors
            .lock()
            .iter()
            .filter(|(_, monitor)| monitor.is_stopped())
            .map(|(id, _)| id.clone())
            .collect();

        for id in stopped {
            let mut monitors = self.monitors.lock();
            if monitors.get(&id).is_some_and(|m| m.is_stopped()) {
                monitors.remove(&id);
            }
        }
    }

    /// Stops and drops every monitor. Shutdown only.
    pub fn stop_all(&self) {
        let drained: Vec<Arc<dyn Monitor>> = {
            let mut monitors = self.monitors.lock();
            monitors.drain().map(|(_, monitor)| monitor).collect()
        };
        for monitor in drained {
            monitor.stop();
        }
    }

    /// Spawns the periodic sweeper; it runs until `token` is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => registry.sweep(),
                }
            }
        })
    }

    #[cfg(test)]
    pub fn timeout_for(&self, entity_id: &str) -> Option<Duration> {
        self.monitors.lock().get(entity_id).map(|m| m.timeout())
    }

    #[cfg(test)]
    pub fn contains(&self, entity_id: &str) -> bool {
        self.monitors.lock().contains_key(entity_id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.monitors.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use crate::error::KeepalivedError;
    use crate::types::Event;

    use super::*;

    struct StubMonitor {
        timeout: Duration,
        stopped: AtomicBool,
    }

    impl StubMonitor {
        fn with_timeout(timeout: Duration) -> Arc<dyn Monitor> {
            Arc::new(Self {
                timeout,
                stopped: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Monitor for StubMonitor {
        async fn handle_update(&self, _event: &Event) -> Result<(), KeepalivedError> {
            Ok(())
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    const T30: Duration = Duration::from_secs(30);
    const T60: Duration = Duration::from_secs(60);

    #[test]
    fn synchronize_installs_a_fresh_monitor() {
        let registry = MonitorRegistry::new();
        let monitor = registry.synchronize("web-01", T30, || StubMonitor::with_timeout(T30));

        assert_eq!(monitor.timeout(), T30);
        assert_eq!(registry.timeout_for("web-01"), Some(T30));
    }

    #[test]
    fn synchronize_reuses_a_live_monitor_with_the_same_timeout() {
        let registry = MonitorRegistry::new();
        let first = registry.synchronize("web-01", T30, || StubMonitor::with_timeout(T30));
        let second = registry.synchronize("web-01", T30, || {
            panic!("a live monitor with an unchanged timeout must be reused")
        });

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn synchronize_replaces_on_timeout_change_and_stops_the_old_monitor() {
        let registry = MonitorRegistry::new();
        let old = registry.synchronize("web-01", T30, || StubMonitor::with_timeout(T30));
        let new = registry.synchronize("web-01", T60, || StubMonitor::with_timeout(T60));

        assert!(old.is_stopped());
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(registry.timeout_for("web-01"), Some(T60));
    }

    #[test]
    fn synchronize_replaces_a_stopped_monitor() {
        let registry = MonitorRegistry::new();
        let old = registry.synchronize("web-01", T30, || StubMonitor::with_timeout(T30));
        old.stop();

        let new = registry.synchronize("web-01", T30, || StubMonitor::with_timeout(T30));
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(!new.is_stopped());
    }

    #[test]
    fn sweep_reaps_only_stopped_monitors() {
        let registry = MonitorRegistry::new();
        let stopped = registry.synchronize("gone", T30, || StubMonitor::with_timeout(T30));
        registry.synchronize("alive", T30, || StubMonitor::with_timeout(T30));
        stopped.stop();

        registry.sweep();

        assert!(!registry.contains("gone"));
        assert!(registry.contains("alive"));
    }

    #[test]
    fn stop_all_stops_and_drops_everything() {
        let registry = MonitorRegistry::new();
        let a = registry.synchronize("a", T30, || StubMonitor::with_timeout(T30));
        let b = registry.synchronize("b", T60, || StubMonitor::with_timeout(T60));

        registry.stop_all();

        assert!(a.is_stopped());
        assert!(b.is_stopped());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn sweeper_exits_when_cancelled() {
        let registry = Arc::new(MonitorRegistry::new());
        let token = CancellationToken::new();
        let handle = registry.spawn_sweeper(token.clone());

        token.cancel();
        time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not exit after cancellation")
            .unwrap();
    }
}
