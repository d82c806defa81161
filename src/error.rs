//! # Error types used by the keepalive daemon and its collaborator contracts.
//!
//! This module defines four error enums:
//!
//! - [`KeepalivedError`] errors raised by the daemon runtime itself.
//! - [`BusError`] errors raised by message-bus implementations.
//! - [`StoreError`] errors raised by store implementations.
//! - [`EntityError`] entity validation failures.
//!
//! [`KeepalivedError`] provides `as_label` returning a short stable label for
//! logs and metrics.

use thiserror::Error;

/// # Errors produced by the keepalive daemon runtime.
///
/// Startup errors are returned from `start` after partial state has been
/// unwound; per-event errors are logged by the workers and never fatal;
/// shutdown errors are returned from `stop` after the rest of shutdown has
/// completed.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum KeepalivedError {
    /// The keepalive topic subscription was refused at startup.
    #[error("unable to subscribe to the keepalive topic: {source}")]
    Subscribe {
        #[source]
        source: BusError,
    },

    /// Rebuilding monitors from persisted failing-keepalive records failed.
    #[error("unable to rebuild keepalive monitors from the store: {source}")]
    Recovery {
        #[source]
        source: StoreError,
    },

    /// Cancelling the keepalive subscription failed during shutdown.
    #[error("unable to cancel the keepalive subscription: {source}")]
    Unsubscribe {
        #[source]
        source: BusError,
    },

    /// A keepalive event reached a handler without an entity attached.
    #[error("keepalive event carries no entity")]
    MissingEntity,

    /// The daemon was asked to start again while already running.
    #[error("keepalived is already running")]
    AlreadyStarted,

    /// The daemon was asked to act after it had been stopped.
    #[error("keepalived has already been stopped")]
    Stopped,

    /// An entity failed validation.
    #[error(transparent)]
    Entity(#[from] EntityError),

    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A message-bus operation failed.
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl KeepalivedError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            KeepalivedError::Subscribe { .. } => "keepalived_subscribe",
            KeepalivedError::Recovery { .. } => "keepalived_recovery",
            KeepalivedError::Unsubscribe { .. } => "keepalived_unsubscribe",
            KeepalivedError::MissingEntity => "keepalived_missing_entity",
            KeepalivedError::AlreadyStarted => "keepalived_already_started",
            KeepalivedError::Stopped => "keepalived_stopped",
            KeepalivedError::Entity(_) => "keepalived_invalid_entity",
            KeepalivedError::Store(_) => "keepalived_store",
            KeepalivedError::Bus(_) => "keepalived_bus",
        }
    }
}

/// # Errors produced by message-bus implementations.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BusError {
    /// A subscriber with the same name is already bound to the topic.
    #[error("subscriber '{subscriber}' is already bound to topic '{topic}'")]
    SubscriberExists { topic: String, subscriber: String },

    /// The bus is shutting down and no longer accepts work.
    #[error("message bus is closed")]
    Closed,

    /// Transport-specific failure.
    #[error("message bus failure: {reason}")]
    Internal { reason: String },
}

/// # Errors produced by store implementations.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("store backend unavailable: {reason}")]
    Unavailable { reason: String },

    /// The backend rejected or failed the operation.
    #[error("store operation failed: {reason}")]
    Internal { reason: String },
}

/// # Entity validation failures.
///
/// Raised before an entity is admitted to monitoring.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EntityError {
    #[error("entity id must not be empty")]
    MissingId,

    #[error("entity organization must not be empty")]
    MissingOrganization,

    #[error("entity environment must not be empty")]
    MissingEnvironment,

    #[error("keepalive timeout must be a positive number of seconds")]
    InvalidKeepaliveTimeout,
}
