//! # Store contract and the embedded in-memory store.
//!
//! [`Store`] is the persistence seam the daemon consumes: entity records,
//! the current event per `(entity, check)`, and failing-keepalive markers.
//! Every scoped operation takes an explicit [`EntityContext`] naming the
//! organization/environment the caller derived from the entity at hand.
//!
//! [`MemoryStore`] is the embedded reference implementation used by the
//! tests and by single-process deployments.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::StoreError;
use crate::types::{Entity, EntityContext, Event, FailingKeepalive};

/// Persistent state consumed by the daemon.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// All failing-keepalive records, across every organization and
    /// environment.
    async fn failing_keepalives(&self) -> Result<Vec<FailingKeepalive>, StoreError>;

    /// The current event for `(entity_id, check_name)` within `ctx`, if any.
    async fn event_by_entity_check(
        &self,
        ctx: &EntityContext,
        entity_id: &str,
        check_name: &str,
    ) -> Result<Option<Event>, StoreError>;

    /// The entity registered under `entity_id` within `ctx`, if any.
    async fn entity_by_id(
        &self,
        ctx: &EntityContext,
        entity_id: &str,
    ) -> Result<Option<Entity>, StoreError>;

    /// Creates or replaces the entity record.
    async fn update_entity(&self, ctx: &EntityContext, entity: &Entity) -> Result<(), StoreError>;

    /// Removes the entity record.
    async fn delete_entity(&self, ctx: &EntityContext, entity: &Entity) -> Result<(), StoreError>;

    /// Removes the failing-keepalive marker for `entity`. Absence is not an
    /// error.
    async fn delete_failing_keepalive(
        &self,
        ctx: &EntityContext,
        entity: &Entity,
    ) -> Result<(), StoreError>;

    /// Creates or replaces the failing-keepalive marker for `entity` with
    /// the absolute Unix-seconds `deadline` it missed.
    async fn update_failing_keepalive(
        &self,
        ctx: &EntityContext,
        entity: &Entity,
        deadline: i64,
    ) -> Result<(), StoreError>;
}

/// `(organization, environment, entity id)`.
type ScopedKey = (String, String, String);

/// `(organization, environment, entity id, check name)`.
type EventKey = (String, String, String, String);

/// In-process store over concurrent maps.
///
/// Cloning is cheap; clones share the same underlying records.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entities: Arc<DashMap<ScopedKey, Entity>>,
    events: Arc<DashMap<EventKey, Event>>,
    failing: Arc<DashMap<ScopedKey, FailingKeepalive>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the current event for `(entity_id, check_name)` within `ctx`.
    ///
    /// The daemon itself never writes events to the store; this exists for
    /// embedders and recovery tests that need pre-existing check state.
    pub fn insert_event(
        &self,
        ctx: &EntityContext,
        entity_id: &str,
        check_name: &str,
        event: Event,
    ) {
        self.events.insert(
            (
                ctx.organization.clone(),
                ctx.environment.clone(),
                entity_id.to_string(),
                check_name.to_string(),
            ),
            event,
        );
    }

    fn scoped_key(ctx: &EntityContext, entity_id: &str) -> ScopedKey {
        (
            ctx.organization.clone(),
            ctx.environment.clone(),
            entity_id.to_string(),
        )
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn failing_keepalives(&self) -> Result<Vec<FailingKeepalive>, StoreError> {
        Ok(self.failing.iter().map(|r| r.value().clone()).collect())
    }

    async fn event_by_entity_check(
        &self,
        ctx: &EntityContext,
        entity_id: &str,
        check_name: &str,
    ) -> Result<Option<Event>, StoreError> {
        let key = (
            ctx.organization.clone(),
            ctx.environment.clone(),
            entity_id.to_string(),
            check_name.to_string(),
        );
        Ok(self.events.get(&key).map(|r| r.value().clone()))
    }

    async fn entity_by_id(
        &self,
        ctx: &EntityContext,
        entity_id: &str,
    ) -> Result<Option<Entity>, StoreError> {
        let key = Self::scoped_key(ctx, entity_id);
        Ok(self.entities.get(&key).map(|r| r.value().clone()))
    }

    async fn update_entity(&self, ctx: &EntityContext, entity: &Entity) -> Result<(), StoreError> {
        self.entities
            .insert(Self::scoped_key(ctx, &entity.id), entity.clone());
        Ok(())
    }

    async fn delete_entity(&self, ctx: &EntityContext, entity: &Entity) -> Result<(), StoreError> {
        self.entities.remove(&Self::scoped_key(ctx, &entity.id));
        Ok(())
    }

    async fn delete_failing_keepalive(
        &self,
        ctx: &EntityContext,
        entity: &Entity,
    ) -> Result<(), StoreError> {
        self.failing.remove(&Self::scoped_key(ctx, &entity.id));
        Ok(())
    }

    async fn update_failing_keepalive(
        &self,
        ctx: &EntityContext,
        entity: &Entity,
        deadline: i64,
    ) -> Result<(), StoreError> {
        self.failing.insert(
            Self::scoped_key(ctx, &entity.id),
            FailingKeepalive {
                entity_id: entity.id.clone(),
                organization: ctx.organization.clone(),
                environment: ctx.environment.clone(),
                time: deadline,
            },
        );
        Ok(())
    }
}
