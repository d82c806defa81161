//! # Per-entity timeout monitors.
//!
//! A [`Monitor`] is a single-entity timer: it fires once after a configured
//! quiet period and invokes a failure handler, unless updates keep resetting
//! it. The daemon installs one monitor per tracked entity and is itself the
//! [`UpdateHandler`] and [`FailureHandler`] behind every monitor it creates.
//!
//! ## High-level architecture
//!
//! ```text
//!  keepalive event ──► Monitor::handle_update ──► reset timer
//!                                 │
//!                                 └────► UpdateHandler (mark healthy)
//!
//!  quiet period elapsed ────► mark stopped ────► FailureHandler (alert)
//! ```
//!
//! Monitors hold **weak** back-references to their handlers: the daemon owns
//! the monitors, and a monitor firing after the daemon is gone simply does
//! nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::KeepalivedError;
use crate::types::{Entity, Event};

/// Receives keepalive updates observed by a monitor.
#[async_trait]
pub trait UpdateHandler: Send + Sync + 'static {
    /// Marks the event's entity healthy.
    async fn handle_update(&self, event: &Event) -> Result<(), KeepalivedError>;
}

/// Receives timeout notifications from a monitor.
#[async_trait]
pub trait FailureHandler: Send + Sync + 'static {
    /// Reacts to `entity` having gone quiet past its timeout.
    async fn handle_failure(&self, entity: &Entity) -> Result<(), KeepalivedError>;
}

/// A single-entity quiet-period timer.
#[async_trait]
pub trait Monitor: Send + Sync + 'static {
    /// Resets the timer if the monitor is still running, then forwards the
    /// event to the update handler.
    ///
    /// A stopped monitor still forwards: a late keepalive arriving after a
    /// failure must be able to mark the entity healthy again.
    async fn handle_update(&self, event: &Event) -> Result<(), KeepalivedError>;

    /// The configured quiet period.
    fn timeout(&self) -> Duration;

    /// True once the monitor has fired or been stopped.
    fn is_stopped(&self) -> bool;

    /// Disables the timer. Idempotent and non-blocking.
    fn stop(&self);
}

/// Creates monitors; injectable so tests can observe or stub them.
pub type MonitorFactory = Arc<
    dyn Fn(&Entity, Duration, Weak<dyn UpdateHandler>, Weak<dyn FailureHandler>) -> Arc<dyn Monitor>
        + Send
        + Sync,
>;

/// Timer-task backed [`Monitor`].
///
/// Each monitor owns one spawned task that waits out the quiet period,
/// restarting the wait whenever an update arrives. A timeout of zero fires
/// on the next scheduler tick.
pub struct KeepaliveMonitor {
    timeout: Duration,
    update: Weak<dyn UpdateHandler>,
    reset_tx: mpsc::Sender<()>,
    stopped: Arc<AtomicBool>,
    token: CancellationToken,
}

impl KeepaliveMonitor {
    /// Spawns the timer task and returns the monitor handle.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(
        entity: Entity,
        timeout: Duration,
        update: Weak<dyn UpdateHandler>,
        failure: Weak<dyn FailureHandler>,
    ) -> Arc<Self> {
        let stopped = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::new();
        let (reset_tx, reset_rx) = mpsc::channel(1);

        tokio::spawn(Self::watch(
            entity,
            timeout,
            failure,
            reset_rx,
            Arc::clone(&stopped),
            token.clone(),
        ));

        Arc::new(Self {
            timeout,
            update,
            reset_tx,
            stopped,
            token,
        })
    }

    /// The factory the daemon uses unless one is injected.
    #[must_use]
    pub fn default_factory() -> MonitorFactory {
        Arc::new(|entity: &Entity, timeout, update, failure| {
            let monitor: Arc<dyn Monitor> =
                KeepaliveMonitor::spawn(entity.clone(), timeout, update, failure);
            monitor
        })
    }

    async fn watch(
        entity: Entity,
        timeout: Duration,
        failure: Weak<dyn FailureHandler>,
        mut reset_rx: mpsc::Receiver<()>,
        stopped: Arc<AtomicBool>,
        token: CancellationToken,
    ) {
        loop {
            let quiet = time::sleep(timeout);
            tokio::pin!(quiet);

            tokio::select! {
                _ = &mut quiet => {
                    // Mark stopped before notifying so concurrent readers
                    // treat this monitor as gone while the alert is emitted.
                    stopped.store(true, Ordering::Release);
                    let Some(handler) = failure.upgrade() else { return };
                    if let Err(err) = handler.handle_failure(&entity).await {
                        warn!(
                            "failure handler for entity '{}' returned an error: {err}",
                            entity.id
                        );
                    }
                    return;
                }
                reset = reset_rx.recv() => {
                    // None means the monitor handle was dropped.
                    if reset.is_none() {
                        return;
                    }
                }
                _ = token.cancelled() => return,
            }
        }
    }
}

#[async_trait]
impl Monitor for KeepaliveMonitor {
    async fn handle_update(&self, event: &Event) -> Result<(), KeepalivedError> {
        if !self.is_stopped() {
            // Capacity 1: a reset already in flight covers this update too.
            let _ = self.reset_tx.try_send(());
        }
        match self.update.upgrade() {
            Some(handler) => handler.handle_update(event).await,
            None => Ok(()),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.token.cancel();
    }
}
