//! # keepvisor
//!
//! **Keepvisor** is a keepalive liveness monitoring core.
//!
//! Agents ("entities") periodically publish keepalive events on a message
//! bus; this crate detects entities that have gone quiet past their
//! per-entity timeout, emits failure events downstream, persists the failing
//! state so a restart resumes alerting, and coordinates registration and
//! deregistration of entities on their first and final keepalives.
//!
//! ## Features
//!
//! | Area           | Description                                                        | Key types / traits                         |
//! |----------------|--------------------------------------------------------------------|--------------------------------------------|
//! | **Daemon**     | Lifecycle, worker pool, recovery, monitor callbacks.               | [`Keepalived`], [`Config`]                 |
//! | **Monitors**   | Per-entity quiet-period timers with injectable factories.          | [`Monitor`], [`KeepaliveMonitor`]          |
//! | **Contracts**  | Seams for the bus and store the daemon consumes.                   | [`MessageBus`], [`Store`], [`Subscription`] |
//! | **Embedded**   | In-process bus and store for tests and single-process deployments. | [`MemoryBus`], [`MemoryStore`]             |
//! | **Data model** | Entities, checks, events, failing-keepalive records.               | [`Entity`], [`Event`], [`FailingKeepalive`] |
//! | **Errors**     | Typed errors per collaborator plus runtime errors.                 | [`KeepalivedError`], [`BusError`], [`StoreError`] |
//!
//! ```no_run
//! use std::sync::Arc;
//! use keepvisor::{Config, Keepalived, MemoryBus, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::new());
//!     let bus = Arc::new(MemoryBus::new());
//!
//!     let daemon = Arc::new(Keepalived::new(store, bus.clone(), Config::default()));
//!     daemon.start().await?;
//!
//!     // Agents now publish keepalive events on the bus; entities that go
//!     // quiet past their declared timeout produce failing keepalive events
//!     // on the raw-event topic.
//!
//!     daemon.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ---

mod bus;
mod config;
mod deregistrar;
mod error;
mod keepalived;
mod monitor;
mod registry;
mod store;
mod types;

// ---- Public re-exports ----

pub use bus::{MemoryBus, MessageBus, Subscription, TOPIC_EVENT, TOPIC_EVENT_RAW, TOPIC_KEEPALIVE};
pub use config::Config;
pub use deregistrar::{Deregistrar, DEREGISTRATION_CHECK_NAME};
pub use error::{BusError, EntityError, KeepalivedError, StoreError};
pub use keepalived::{
    Keepalived, DEFAULT_HANDLER_COUNT, DEFAULT_KEEPALIVE_TIMEOUT, KEEPALIVE_CHECK_NAME,
    KEEPALIVE_HANDLER_NAME, REGISTRATION_CHECK_NAME, REGISTRATION_HANDLER_NAME,
};
pub use monitor::{
    FailureHandler, KeepaliveMonitor, Monitor, MonitorFactory, UpdateHandler,
};
pub use store::{MemoryStore, Store};
pub use types::{Check, Entity, EntityClass, EntityContext, Event, FailingKeepalive};
