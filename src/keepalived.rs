//! # The keepalive daemon.
//!
//! [`Keepalived`] subscribes to the keepalive topic, fans inbound events out
//! to a fixed pool of workers, and keeps one timeout monitor per entity in
//! sync with the timeout each event declares. When a monitor fires, the
//! daemon emits a failing keepalive event and persists a failing-keepalive
//! record so a restarted daemon resumes alerting; the next successful
//! keepalive clears the record again.
//!
//! ## High-level architecture
//!
//! ```text
//!            ┌─────────────┐
//!  agents ──►│ MessageBus  │ topic "keepalive"
//!            └──────┬──────┘
//!              subscription
//!                   ▼
//!        [inbound channel, cap 10] ──► worker × handler_count
//!                                         │
//!                     validate ── register-on-first-sight ── synchronize
//!                                         ▼
//!                               ┌──────────────────┐
//!                               │ MonitorRegistry  │ one monitor per entity
//!                               └────────┬─────────┘
//!                          handle_update │ handle_failure
//!                                         ▼
//!                            Keepalived (store + bus effects)
//! ```
//!
//! The daemon implements the monitors' [`UpdateHandler`] and
//! [`FailureHandler`] itself, so a single object both consumes keepalive
//! events and receives timeout notifications. Monitors hold weak references
//! back to it; `stop` tears the monitors down before the daemon is released.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use log::{error, info};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::bus::{MessageBus, Subscription, TOPIC_EVENT, TOPIC_EVENT_RAW, TOPIC_KEEPALIVE};
use crate::config::Config;
use crate::deregistrar::Deregistrar;
use crate::error::{KeepalivedError, StoreError};
use crate::monitor::{FailureHandler, KeepaliveMonitor, Monitor, MonitorFactory, UpdateHandler};
use crate::registry::MonitorRegistry;
use crate::store::Store;
use crate::types::{unix_now, Entity, EntityClass, EntityContext, Event};

/// Default number of workers draining the inbound keepalive channel.
pub const DEFAULT_HANDLER_COUNT: usize = 10;

/// Default quiet period, in seconds, granted to entities that do not declare
/// their own keepalive timeout.
pub const DEFAULT_KEEPALIVE_TIMEOUT: u32 = 120;

/// Name of the check attached to keepalive status events.
pub const KEEPALIVE_CHECK_NAME: &str = "keepalive";

/// Handler named on keepalive status events.
pub const KEEPALIVE_HANDLER_NAME: &str = "keepalive";

/// Name of the check attached to registration events.
pub const REGISTRATION_CHECK_NAME: &str = "registration";

/// Handler named on registration events.
pub const REGISTRATION_HANDLER_NAME: &str = "registration";

/// Stable subscriber name under which the daemon binds to the keepalive
/// topic.
const SUBSCRIBER_NAME: &str = "keepalived";

/// Inbound channel capacity; producers block when it is full.
const KEEPALIVE_BUFFER: usize = 10;

/// Terminal-error channel capacity.
const ERROR_BUFFER: usize = 1;

/// Keepalive liveness daemon: monitors keepalive events and records
/// keepalives for entities.
pub struct Keepalived {
    store: Arc<dyn Store>,
    bus: Arc<dyn MessageBus>,
    deregistration_handler: String,
    handler_count: usize,
    monitor_factory: MonitorFactory,
    registry: Arc<MonitorRegistry>,
    shutdown: CancellationToken,

    inbound_tx: Mutex<Option<mpsc::Sender<Event>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    subscription: Mutex<Option<Box<dyn Subscription>>>,
    workers: tokio::sync::Mutex<JoinSet<()>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    err_tx: Mutex<Option<mpsc::Sender<KeepalivedError>>>,
    err_rx: Mutex<Option<mpsc::Receiver<KeepalivedError>>>,
}

impl Keepalived {
    /// Creates a new daemon. Channels and the worker set are constructed
    /// eagerly so `stop` is safe even before `start`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn MessageBus>, config: Config) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(KEEPALIVE_BUFFER);
        let (err_tx, err_rx) = mpsc::channel(ERROR_BUFFER);

        Self {
            store,
            bus,
            deregistration_handler: config.deregistration_handler,
            handler_count: config.handler_count.max(1),
            monitor_factory: KeepaliveMonitor::default_factory(),
            registry: Arc::new(MonitorRegistry::new()),
            shutdown: CancellationToken::new(),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            subscription: Mutex::new(None),
            workers: tokio::sync::Mutex::new(JoinSet::new()),
            sweeper: Mutex::new(None),
            err_tx: Mutex::new(Some(err_tx)),
            err_rx: Mutex::new(Some(err_rx)),
        }
    }

    /// Replaces the monitor factory. Intended for tests that need to observe
    /// or stub the monitors the daemon creates.
    #[must_use]
    pub fn with_monitor_factory(mut self, factory: MonitorFactory) -> Self {
        self.monitor_factory = factory;
        self
    }

    /// Starts the daemon: subscribes to the keepalive topic, rebuilds
    /// monitors from persisted failing-keepalive records, and launches the
    /// worker pool and the sweeper.
    ///
    /// If recovery fails the subscription is cancelled before the error is
    /// returned.
    pub async fn start(self: &Arc<Self>) -> Result<(), KeepalivedError> {
        let sender = self
            .inbound_tx
            .lock()
            .clone()
            .ok_or(KeepalivedError::Stopped)?;
        let subscription = self
            .bus
            .subscribe(TOPIC_KEEPALIVE, SUBSCRIBER_NAME, sender)
            .await
            .map_err(|source| KeepalivedError::Subscribe { source })?;
        *self.subscription.lock() = Some(subscription);

        if let Err(source) = self.init_from_store().await {
            let subscription = self.subscription.lock().take();
            if let Some(subscription) = subscription {
                if let Err(err) = subscription.cancel() {
                    error!("unable to unsubscribe from the message bus: {err}");
                }
            }
            return Err(KeepalivedError::Recovery { source });
        }

        self.start_workers().await?;
        let sweeper = self.registry.spawn_sweeper(self.shutdown.child_token());
        *self.sweeper.lock() = Some(sweeper);
        Ok(())
    }

    /// Stops the daemon: cancels the subscription, closes the inbound
    /// channel, waits for every worker to drain, stops all monitors, joins
    /// the sweeper, and closes the error channel.
    ///
    /// Returns the subscription cancellation error, if any, after the rest
    /// of shutdown has completed.
    pub async fn stop(&self) -> Result<(), KeepalivedError> {
        let subscription = self.subscription.lock().take();
        let cancel_result = match subscription {
            Some(subscription) => subscription.cancel(),
            None => Ok(()),
        };

        // Drop our send side; the cancelled subscription has released the
        // bus's clone, so workers drain what is buffered and exit.
        self.inbound_tx.lock().take();
        let mut workers = self.workers.lock().await;
        while workers.join_next().await.is_some() {}
        drop(workers);

        self.registry.stop_all();

        self.shutdown.cancel();
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }

        self.err_tx.lock().take();
        cancel_result.map_err(|source| KeepalivedError::Unsubscribe { source })
    }

    /// Health probe; the daemon is healthy whenever it is running.
    pub fn status(&self) -> Result<(), KeepalivedError> {
        Ok(())
    }

    /// Takes the receive side of the terminal-error channel.
    ///
    /// Terminal errors signal a premature shutdown; the channel is closed by
    /// `stop`. Yields `None` after the first call.
    pub fn errors(&self) -> Option<mpsc::Receiver<KeepalivedError>> {
        self.err_rx.lock().take()
    }

    /// The send side of the inbound keepalive channel, while running.
    pub fn receiver(&self) -> Option<mpsc::Sender<Event>> {
        self.inbound_tx.lock().clone()
    }

    /// Rebuilds monitors for the entities the daemon was alerting on before
    /// a restart.
    async fn init_from_store(self: &Arc<Self>) -> Result<(), StoreError> {
        let failing = self.store.failing_keepalives().await?;

        for record in failing {
            let ctx = EntityContext::new(&record.organization, &record.environment);
            let Some(event) = self
                .store
                .event_by_entity_check(&ctx, &record.entity_id, KEEPALIVE_CHECK_NAME)
                .await?
            else {
                // No event left: the entity was deregistered in the meantime.
                continue;
            };

            // Passing status means another backend already resolved it.
            match &event.check {
                Some(check) if check.status != 0 => {}
                _ => continue,
            }
            let Some(entity) = event.entity else { continue };

            // Replay the remaining portion of the original deadline.
            let remaining = (record.time - unix_now()).max(0) as u64;
            let monitor = self.new_monitor(&entity, Duration::from_secs(remaining));
            self.registry.install(&record.entity_id, monitor);
        }

        Ok(())
    }

    async fn start_workers(self: &Arc<Self>) -> Result<(), KeepalivedError> {
        let receiver = self
            .inbound_rx
            .lock()
            .take()
            .ok_or(KeepalivedError::AlreadyStarted)?;
        let inbound = Arc::new(tokio::sync::Mutex::new(receiver));

        let mut workers = self.workers.lock().await;
        for _ in 0..self.handler_count {
            let daemon = Arc::clone(self);
            let inbound = Arc::clone(&inbound);
            workers.spawn(async move { daemon.process_keepalives(inbound).await });
        }
        Ok(())
    }

    /// Worker loop: drain the shared inbound channel until it closes.
    async fn process_keepalives(
        self: Arc<Self>,
        inbound: Arc<tokio::sync::Mutex<mpsc::Receiver<Event>>>,
    ) {
        loop {
            let next = { inbound.lock().await.recv().await };
            let Some(event) = next else { break };

            // One panicking event must not burn a worker slot.
            let work = self.process_keepalive(event);
            if std::panic::AssertUnwindSafe(work).catch_unwind().await.is_err() {
                error!("keepalive worker caught a panic while processing an event");
            }
        }
    }

    async fn process_keepalive(self: &Arc<Self>, event: Event) {
        let Some(entity) = event.entity.clone() else {
            error!("received keepalive event without an entity");
            return;
        };
        if let Err(err) = entity.validate() {
            error!("invalid keepalive event: {err}");
            return;
        }

        if let Err(err) = self.handle_entity_registration(&entity).await {
            error!(
                "error handling registration for entity '{}': {err}",
                entity.id
            );
        }

        let timeout = Duration::from_secs(u64::from(entity.keepalive_timeout));
        let monitor = self
            .registry
            .synchronize(&entity.id, timeout, || self.new_monitor(&entity, timeout));

        if let Err(err) = monitor.handle_update(&event).await {
            error!("error monitoring entity '{}': {err}", entity.id);
        }
    }

    /// Publishes a registration event the first time an agent entity is
    /// seen. Only agents self-register; proxies are created out of band.
    async fn handle_entity_registration(&self, entity: &Entity) -> Result<(), KeepalivedError> {
        if entity.class != EntityClass::Agent {
            return Ok(());
        }

        let ctx = EntityContext::for_entity(entity);
        if self.store.entity_by_id(&ctx, &entity.id).await?.is_none() {
            self.bus.publish(TOPIC_EVENT, registration_event(entity)).await?;
        }
        Ok(())
    }

    /// Creates a monitor bound back to this daemon through weak handler
    /// references.
    fn new_monitor(self: &Arc<Self>, entity: &Entity, timeout: Duration) -> Arc<dyn Monitor> {
        let update_arc: Arc<dyn UpdateHandler> = self.clone();
        let update: Weak<dyn UpdateHandler> = Arc::downgrade(&update_arc);
        let failure_arc: Arc<dyn FailureHandler> = self.clone();
        let failure: Weak<dyn FailureHandler> = Arc::downgrade(&failure_arc);
        (self.monitor_factory)(entity, timeout, update, failure)
    }
}

#[async_trait]
impl UpdateHandler for Keepalived {
    /// Marks the entity healthy: clears any failing-keepalive record,
    /// advances `last_seen`, and publishes a passing keepalive event.
    async fn handle_update(&self, event: &Event) -> Result<(), KeepalivedError> {
        let Some(entity) = event.entity.as_ref() else {
            return Err(KeepalivedError::MissingEntity);
        };
        let ctx = EntityContext::for_entity(entity);
        self.store.delete_failing_keepalive(&ctx, entity).await?;

        let mut entity = entity.clone();
        entity.last_seen = event.timestamp;
        if let Err(err) = self.store.update_entity(&ctx, &entity).await {
            error!("error updating entity '{}' in store: {err}", entity.id);
            return Err(err.into());
        }

        self.bus
            .publish(TOPIC_EVENT_RAW, keepalive_event(&entity, 0))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FailureHandler for Keepalived {
    /// Reacts to a keepalive timeout: deregistering entities are retired,
    /// everything else gets a failing keepalive event and a persisted
    /// failing-keepalive record.
    async fn handle_failure(&self, entity: &Entity) -> Result<(), KeepalivedError> {
        if entity.deregister {
            let deregistrar = Deregistrar::new(
                Arc::clone(&self.store),
                Arc::clone(&self.bus),
                self.deregistration_handler.clone(),
            );
            return deregistrar.deregister(entity).await;
        }

        self.bus
            .publish(TOPIC_EVENT_RAW, keepalive_event(entity, 1))
            .await?;

        info!(
            "keepalive timed out, creating keepalive event for entity '{}'",
            entity.id
        );
        let ctx = EntityContext::for_entity(entity);
        let deadline = unix_now() + i64::from(entity.keepalive_timeout);
        self.store
            .update_failing_keepalive(&ctx, entity, deadline)
            .await?;
        Ok(())
    }
}

fn keepalive_event(entity: &Entity, status: u32) -> Event {
    Event::authored(entity, KEEPALIVE_CHECK_NAME, KEEPALIVE_HANDLER_NAME, status)
}

fn registration_event(entity: &Entity) -> Event {
    Event::authored(entity, REGISTRATION_CHECK_NAME, REGISTRATION_HANDLER_NAME, 1)
}

#[cfg(test)]
mod tests {
    use tokio::time;

    use crate::bus::MemoryBus;
    use crate::store::MemoryStore;
    use crate::types::EntityClass;

    use super::*;

    fn agent(id: &str, keepalive_timeout: u32) -> Entity {
        Entity {
            id: id.into(),
            class: EntityClass::Agent,
            organization: "acme".into(),
            environment: "prod".into(),
            keepalive_timeout,
            deregister: false,
            last_seen: 0,
        }
    }

    fn inbound(entity: &Entity) -> Event {
        Event {
            timestamp: unix_now(),
            entity: Some(entity.clone()),
            check: None,
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<Event>) -> Event {
        time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a published event")
            .expect("bus tap closed")
    }

    struct Harness {
        store: Arc<MemoryStore>,
        bus: Arc<MemoryBus>,
        events: mpsc::Receiver<Event>,
        raw: mpsc::Receiver<Event>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let (tap, events) = mpsc::channel(16);
        bus.subscribe(TOPIC_EVENT, "tap-event", tap).await.unwrap();
        let (tap, raw) = mpsc::channel(16);
        bus.subscribe(TOPIC_EVENT_RAW, "tap-raw", tap).await.unwrap();
        Harness {
            store,
            bus,
            events,
            raw,
        }
    }

    fn daemon(h: &Harness, config: Config) -> Arc<Keepalived> {
        Arc::new(Keepalived::new(h.store.clone(), h.bus.clone(), config))
    }

    /// Factory that records every monitor it creates.
    fn recording_factory() -> (MonitorFactory, Arc<Mutex<Vec<Arc<dyn Monitor>>>>) {
        let created: Arc<Mutex<Vec<Arc<dyn Monitor>>>> = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&created);
        let inner = KeepaliveMonitor::default_factory();
        let factory: MonitorFactory = Arc::new(move |entity, timeout, update, failure| {
            let monitor = inner(entity, timeout, update, failure);
            log.lock().push(Arc::clone(&monitor));
            monitor
        });
        (factory, created)
    }

    #[tokio::test]
    async fn first_keepalive_registers_and_installs_a_monitor() {
        let mut h = harness().await;
        let daemon = daemon(&h, Config::default());
        daemon.start().await.unwrap();

        let entity = agent("a1", 30);
        let event = inbound(&entity);
        daemon.receiver().unwrap().send(event.clone()).await.unwrap();

        // Unknown agent: a registration event goes out first.
        let registration = recv(&mut h.events).await;
        let check = registration.check.expect("registration event carries a check");
        assert_eq!(check.name, REGISTRATION_CHECK_NAME);
        assert_eq!(check.handlers, vec![REGISTRATION_HANDLER_NAME.to_string()]);
        assert_eq!(check.status, 1);
        assert_eq!(check.interval, 30);

        // The monitor update then marks the entity healthy.
        let passing = recv(&mut h.raw).await;
        let check = passing.check.expect("keepalive event carries a check");
        assert_eq!(check.name, KEEPALIVE_CHECK_NAME);
        assert_eq!(check.status, 0);

        assert_eq!(
            daemon.registry.timeout_for("a1"),
            Some(Duration::from_secs(30))
        );

        let ctx = EntityContext::for_entity(&entity);
        let stored = h.store.entity_by_id(&ctx, "a1").await.unwrap().unwrap();
        assert_eq!(stored.last_seen, event.timestamp);

        daemon.stop().await.unwrap();
    }

    #[tokio::test]
    async fn known_agents_are_not_reregistered() {
        let mut h = harness().await;
        let daemon = daemon(&h, Config::default());

        let entity = agent("a1", 30);
        let ctx = EntityContext::for_entity(&entity);
        h.store.update_entity(&ctx, &entity).await.unwrap();

        daemon.start().await.unwrap();
        daemon
            .receiver()
            .unwrap()
            .send(inbound(&entity))
            .await
            .unwrap();

        // The keepalive is processed (passing event emitted)...
        recv(&mut h.raw).await;
        // ...but no registration event was published.
        assert!(h.events.try_recv().is_err());

        daemon.stop().await.unwrap();
    }

    #[tokio::test]
    async fn timeout_change_replaces_the_monitor() {
        let mut h = harness().await;
        let (factory, created) = recording_factory();
        let daemon = Arc::new(
            Keepalived::new(h.store.clone(), h.bus.clone(), Config::default())
                .with_monitor_factory(factory),
        );
        daemon.start().await.unwrap();
        let sender = daemon.receiver().unwrap();

        sender.send(inbound(&agent("a1", 30))).await.unwrap();
        recv(&mut h.raw).await;

        sender.send(inbound(&agent("a1", 60))).await.unwrap();
        recv(&mut h.raw).await;

        assert_eq!(
            daemon.registry.timeout_for("a1"),
            Some(Duration::from_secs(60))
        );
        {
            let created = created.lock();
            assert_eq!(created.len(), 2);
            assert!(created[0].is_stopped());
            assert!(!created[1].is_stopped());
        }

        // Release our sender clone so the inbound channel can close.
        drop(sender);
        daemon.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failure_then_recovery_round_trips_the_failing_record() {
        let mut h = harness().await;
        let daemon = daemon(&h, Config::default());
        let entity = agent("a1", 30);

        let before = unix_now();
        daemon.handle_failure(&entity).await.unwrap();

        let alert = recv(&mut h.raw).await;
        assert_eq!(alert.check.as_ref().unwrap().status, 1);

        let records = h.store.failing_keepalives().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entity_id, "a1");
        assert!(records[0].time >= before + 30);
        assert!(records[0].time <= unix_now() + 30);

        // The next keepalive clears the record and marks the entity healthy.
        let event = inbound(&entity);
        daemon.handle_update(&event).await.unwrap();

        assert!(h.store.failing_keepalives().await.unwrap().is_empty());
        let ctx = EntityContext::for_entity(&entity);
        let stored = h.store.entity_by_id(&ctx, "a1").await.unwrap().unwrap();
        assert_eq!(stored.last_seen, event.timestamp);

        let passing = recv(&mut h.raw).await;
        assert_eq!(passing.check.as_ref().unwrap().status, 0);
    }

    #[tokio::test]
    async fn deregistering_failure_retires_the_entity_silently() {
        let mut h = harness().await;
        let daemon = daemon(
            &h,
            Config {
                deregistration_handler: "cleanup".into(),
                ..Config::default()
            },
        );

        let mut entity = agent("a2", 30);
        entity.deregister = true;
        let ctx = EntityContext::for_entity(&entity);
        h.store.update_entity(&ctx, &entity).await.unwrap();

        daemon.handle_failure(&entity).await.unwrap();

        // Exactly one deregistration notification, no failing keepalive.
        let announced = recv(&mut h.events).await;
        let check = announced.check.unwrap();
        assert_eq!(check.name, crate::deregistrar::DEREGISTRATION_CHECK_NAME);
        assert_eq!(check.handlers, vec!["cleanup".to_string()]);
        assert!(h.events.try_recv().is_err());
        assert!(h.raw.try_recv().is_err());

        assert_eq!(h.store.entity_by_id(&ctx, "a2").await.unwrap(), None);
        assert!(h.store.failing_keepalives().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recovery_rebuilds_monitors_and_skips_healthy_entities() {
        let h = harness().await;
        let daemon = daemon(&h, Config::default());

        let failing = agent("a1", 30);
        let healthy = agent("a2", 30);
        let ctx = EntityContext::for_entity(&failing);

        h.store
            .update_failing_keepalive(&ctx, &failing, unix_now() + 5)
            .await
            .unwrap();
        h.store.insert_event(
            &ctx,
            "a1",
            KEEPALIVE_CHECK_NAME,
            keepalive_event(&failing, 1),
        );

        h.store
            .update_failing_keepalive(&ctx, &healthy, unix_now() + 5)
            .await
            .unwrap();
        h.store.insert_event(
            &ctx,
            "a2",
            KEEPALIVE_CHECK_NAME,
            keepalive_event(&healthy, 0),
        );

        // A record without any event means the entity is gone entirely.
        h.store
            .update_failing_keepalive(&ctx, &agent("a3", 30), unix_now() + 5)
            .await
            .unwrap();

        daemon.start().await.unwrap();

        let timeout = daemon
            .registry
            .timeout_for("a1")
            .expect("failing entity must get a monitor back");
        assert!((4..=5).contains(&timeout.as_secs()));
        assert!(!daemon.registry.contains("a2"));
        assert!(!daemon.registry.contains("a3"));

        daemon.stop().await.unwrap();
    }

    #[tokio::test]
    async fn overdue_records_recover_with_a_zero_timeout() {
        let h = harness().await;
        let daemon = daemon(&h, Config::default());

        let entity = agent("a1", 30);
        let ctx = EntityContext::for_entity(&entity);
        h.store
            .update_failing_keepalive(&ctx, &entity, unix_now() - 100)
            .await
            .unwrap();
        h.store
            .insert_event(&ctx, "a1", KEEPALIVE_CHECK_NAME, keepalive_event(&entity, 1));

        daemon.start().await.unwrap();

        assert_eq!(daemon.registry.timeout_for("a1"), Some(Duration::ZERO));
        daemon.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_events_are_dropped_without_killing_workers() {
        let mut h = harness().await;
        let daemon = daemon(&h, Config { handler_count: 1, ..Config::default() });
        daemon.start().await.unwrap();
        let sender = daemon.receiver().unwrap();

        // No entity at all, then an entity that fails validation.
        sender
            .send(Event {
                timestamp: unix_now(),
                entity: None,
                check: None,
            })
            .await
            .unwrap();
        sender.send(inbound(&agent("", 30))).await.unwrap();

        // The sole worker must still be alive to process the valid event.
        sender.send(inbound(&agent("a1", 30))).await.unwrap();
        recv(&mut h.raw).await;
        assert!(daemon.registry.contains("a1"));
        assert!(!daemon.registry.contains(""));

        // Release our sender clone so the inbound channel can close.
        drop(sender);
        daemon.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_drains_workers_and_closes_the_error_channel() {
        let mut h = harness().await;
        let daemon = daemon(&h, Config::default());
        let mut errors = daemon.errors().expect("error channel is handed out once");
        assert!(daemon.errors().is_none());

        daemon.start().await.unwrap();
        daemon
            .receiver()
            .unwrap()
            .send(inbound(&agent("a1", 30)))
            .await
            .unwrap();
        recv(&mut h.raw).await;

        daemon.stop().await.unwrap();

        // Inbound channel is gone, the error channel is closed, and nothing
        // is published anymore.
        assert!(daemon.receiver().is_none());
        assert_eq!(errors.recv().await.map(|e| e.as_label().to_string()), None);
        assert!(h.raw.try_recv().is_err());
        assert!(daemon.status().is_ok());
    }

    #[tokio::test]
    async fn stop_before_start_is_safe() {
        let h = harness().await;
        let daemon = daemon(&h, Config::default());
        daemon.stop().await.unwrap();
        assert!(daemon.receiver().is_none());
    }

    #[tokio::test]
    async fn recovery_failure_cancels_the_subscription() {
        let h = harness().await;

        /// Store whose recovery read always fails.
        struct FailingRecovery;

        #[async_trait]
        impl Store for FailingRecovery {
            async fn failing_keepalives(
                &self,
            ) -> Result<Vec<crate::types::FailingKeepalive>, StoreError> {
                Err(StoreError::Unavailable {
                    reason: "connection refused".into(),
                })
            }

            async fn event_by_entity_check(
                &self,
                _ctx: &EntityContext,
                _entity_id: &str,
                _check_name: &str,
            ) -> Result<Option<Event>, StoreError> {
                Ok(None)
            }

            async fn entity_by_id(
                &self,
                _ctx: &EntityContext,
                _entity_id: &str,
            ) -> Result<Option<Entity>, StoreError> {
                Ok(None)
            }

            async fn update_entity(
                &self,
                _ctx: &EntityContext,
                _entity: &Entity,
            ) -> Result<(), StoreError> {
                Ok(())
            }

            async fn delete_entity(
                &self,
                _ctx: &EntityContext,
                _entity: &Entity,
            ) -> Result<(), StoreError> {
                Ok(())
            }

            async fn delete_failing_keepalive(
                &self,
                _ctx: &EntityContext,
                _entity: &Entity,
            ) -> Result<(), StoreError> {
                Ok(())
            }

            async fn update_failing_keepalive(
                &self,
                _ctx: &EntityContext,
                _entity: &Entity,
                _deadline: i64,
            ) -> Result<(), StoreError> {
                Ok(())
            }
        }

        let daemon = Arc::new(Keepalived::new(
            Arc::new(FailingRecovery),
            h.bus.clone(),
            Config::default(),
        ));

        let err = daemon.start().await.expect_err("recovery must fail");
        assert!(matches!(err, KeepalivedError::Recovery { .. }));

        // The subscription was unwound, so the name is free to bind again.
        let (tap, _rx) = mpsc::channel(1);
        let rebound = h.bus.subscribe(TOPIC_KEEPALIVE, SUBSCRIBER_NAME, tap).await;
        assert!(rebound.is_ok());
    }
}
