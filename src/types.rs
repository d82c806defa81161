//! # Core data model: entities, checks, events, failing-keepalive records.
//!
//! Everything the daemon reads or writes is a plain serde-derived value:
//!
//! - [`Entity`] — an agent or proxy resource whose liveness is tracked.
//! - [`Check`] / [`Event`] — the check-result shape emitted onto the bus.
//! - [`FailingKeepalive`] — the persisted marker that an entity is currently
//!   considered not alive, carrying the absolute deadline it missed.
//! - [`EntityContext`] — the organization/environment scope derived from an
//!   entity before any store call.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::EntityError;

/// Classification of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityClass {
    /// A live agent process that sends its own keepalives.
    Agent,
    /// A proxy resource monitored on behalf of something that cannot speak
    /// for itself. Proxies never trigger registration events.
    Proxy,
}

/// An external agent or resource whose liveness is tracked.
///
/// An entity id is unique within its `(organization, environment)` scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub class: EntityClass,
    pub organization: String,
    pub environment: String,
    /// Quiet period in seconds after which the entity is considered failed.
    pub keepalive_timeout: u32,
    /// When set, a keepalive timeout retires the entity instead of alerting.
    #[serde(default)]
    pub deregister: bool,
    /// Unix seconds of the last observed keepalive.
    #[serde(default)]
    pub last_seen: i64,
}

impl Entity {
    /// Sanity-checks the fields the daemon relies on.
    pub fn validate(&self) -> Result<(), EntityError> {
        if self.id.is_empty() {
            return Err(EntityError::MissingId);
        }
        if self.organization.is_empty() {
            return Err(EntityError::MissingOrganization);
        }
        if self.environment.is_empty() {
            return Err(EntityError::MissingEnvironment);
        }
        if self.keepalive_timeout == 0 {
            return Err(EntityError::InvalidKeepaliveTimeout);
        }
        Ok(())
    }
}

/// A named check result carried by an [`Event`].
///
/// Status 0 is passing; status 1 is a warning that downstream handlers act
/// on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    /// Scheduling interval in seconds; for daemon-authored checks this is
    /// the entity's keepalive timeout.
    pub interval: u32,
    pub handlers: Vec<String>,
    pub organization: String,
    pub environment: String,
    pub status: u32,
}

/// A timestamped observation about an entity.
///
/// Inbound keepalive events may carry no check at all; daemon-authored
/// events always do. `entity` is optional on the wire and events without one
/// are dropped by the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Unix seconds.
    pub timestamp: i64,
    pub entity: Option<Entity>,
    pub check: Option<Check>,
}

impl Event {
    /// Builds a check event authored by the daemon on behalf of `entity`.
    pub(crate) fn authored(
        entity: &Entity,
        check_name: &str,
        handler_name: &str,
        status: u32,
    ) -> Self {
        let check = Check {
            name: check_name.to_string(),
            interval: entity.keepalive_timeout,
            handlers: vec![handler_name.to_string()],
            organization: entity.organization.clone(),
            environment: entity.environment.clone(),
            status,
        };
        Event {
            timestamp: unix_now(),
            entity: Some(entity.clone()),
            check: Some(check),
        }
    }
}

/// Persisted marker that an entity has a failing keepalive.
///
/// `time` is the absolute Unix-seconds deadline by which the entity was
/// expected to have been seen; a restarted daemon rebuilds its monitors from
/// these records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailingKeepalive {
    pub entity_id: String,
    pub organization: String,
    pub environment: String,
    pub time: i64,
}

/// Organization/environment scope for store operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityContext {
    pub organization: String,
    pub environment: String,
}

impl EntityContext {
    #[must_use]
    pub fn new(organization: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            environment: environment.into(),
        }
    }

    /// Scope derived from the entity itself.
    #[must_use]
    pub fn for_entity(entity: &Entity) -> Self {
        Self::new(&entity.organization, &entity.environment)
    }
}

/// Current wall-clock time in Unix seconds.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
