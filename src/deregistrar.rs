//! # Ordered retirement of deregistering entities.

use std::sync::Arc;

use crate::bus::{MessageBus, TOPIC_EVENT};
use crate::error::KeepalivedError;
use crate::store::Store;
use crate::types::{Entity, EntityContext, Event};

/// Name of the check attached to deregistration notifications.
pub const DEREGISTRATION_CHECK_NAME: &str = "deregistration";

/// Retires an entity: removes its persisted state and announces the
/// departure downstream.
pub struct Deregistrar {
    store: Arc<dyn Store>,
    bus: Arc<dyn MessageBus>,
    deregistration_handler: String,
}

impl Deregistrar {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn MessageBus>,
        deregistration_handler: impl Into<String>,
    ) -> Self {
        Self {
            store,
            bus,
            deregistration_handler: deregistration_handler.into(),
        }
    }

    /// Deletes the entity record, deletes any failing-keepalive marker, and
    /// publishes a deregistration event naming the configured handler.
    ///
    /// The first error short-circuits the sequence.
    pub async fn deregister(&self, entity: &Entity) -> Result<(), KeepalivedError> {
        let ctx = EntityContext::for_entity(entity);
        self.store.delete_entity(&ctx, entity).await?;
        self.store.delete_failing_keepalive(&ctx, entity).await?;

        let event = Event::authored(
            entity,
            DEREGISTRATION_CHECK_NAME,
            &self.deregistration_handler,
            1,
        );
        self.bus.publish(TOPIC_EVENT, event).await?;
        Ok(())
    }
}
