//! # Message bus contract and the embedded in-memory bus.
//!
//! [`MessageBus`] is the topic pub/sub seam the daemon consumes. Subscribing
//! hands the bus the send side of the consumer's inbound channel; publishing
//! delivers a clone of the event to every binding on the topic.
//!
//! ## Key characteristics
//! - **Backpressure**: delivery awaits each subscriber's bounded channel, so
//!   a full consumer slows the publisher instead of losing events.
//! - **Cancellable**: a [`Subscription`] is cancelled synchronously; the bus
//!   drops its sender clone so the consumer channel can close.
//! - **No persistence**: a topic without subscribers drops events silently.
//!
//! [`MemoryBus`] is the embedded reference implementation used by the tests
//! and by deployments that run everything in one process.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::BusError;
use crate::types::Event;

/// Topic on which agents publish keepalive events; the daemon subscribes.
pub const TOPIC_KEEPALIVE: &str = "keepalive";

/// Topic for fully formed events entering the pipeline (registration,
/// deregistration).
pub const TOPIC_EVENT: &str = "event";

/// Topic for raw check events awaiting enrichment (keepalive status
/// transitions).
pub const TOPIC_EVENT_RAW: &str = "event-raw";

/// Topic pub/sub transport consumed by the daemon.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Binds `sender` to `topic` under a stable `subscriber` name.
    ///
    /// Every event published on the topic is delivered into `sender`;
    /// delivery applies the channel's backpressure.
    async fn subscribe(
        &self,
        topic: &str,
        subscriber: &str,
        sender: mpsc::Sender<Event>,
    ) -> Result<Box<dyn Subscription>, BusError>;

    /// Publishes `event` to every subscriber of `topic`.
    async fn publish(&self, topic: &str, event: Event) -> Result<(), BusError>;
}

/// A cancellable binding between a topic and a consumer.
pub trait Subscription: Send + Sync + std::fmt::Debug {
    /// Stops deliveries and releases the bus's sender clone.
    fn cancel(self: Box<Self>) -> Result<(), BusError>;
}

#[derive(Debug)]
struct TopicBinding {
    subscriber: String,
    sender: mpsc::Sender<Event>,
}

/// In-process message bus over per-subscriber mpsc channels.
///
/// Cloning is cheap; clones share the same topic table.
#[derive(Clone, Default)]
pub struct MemoryBus {
    topics: Arc<DashMap<String, Vec<TopicBinding>>>,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn subscribe(
        &self,
        topic: &str,
        subscriber: &str,
        sender: mpsc::Sender<Event>,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let mut bindings = self.topics.entry(topic.to_string()).or_default();
        if bindings.iter().any(|b| b.subscriber == subscriber) {
            return Err(BusError::SubscriberExists {
                topic: topic.to_string(),
                subscriber: subscriber.to_string(),
            });
        }
        bindings.push(TopicBinding {
            subscriber: subscriber.to_string(),
            sender,
        });

        Ok(Box::new(MemorySubscription {
            topics: Arc::clone(&self.topics),
            topic: topic.to_string(),
            subscriber: subscriber.to_string(),
        }))
    }

    async fn publish(&self, topic: &str, event: Event) -> Result<(), BusError> {
        // Clone the senders out so no map guard is held across an await.
        let senders: Vec<mpsc::Sender<Event>> = match self.topics.get(topic) {
            Some(bindings) => bindings.iter().map(|b| b.sender.clone()).collect(),
            None => return Ok(()),
        };

        for sender in senders {
            // A consumer that went away without cancelling is gone, not fatal.
            let _ = sender.send(event.clone()).await;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct MemorySubscription {
    topics: Arc<DashMap<String, Vec<TopicBinding>>>,
    topic: String,
    subscriber: String,
}

impl Subscription for MemorySubscription {
    fn cancel(self: Box<Self>) -> Result<(), BusError> {
        if let Some(mut bindings) = self.topics.get_mut(&self.topic) {
            bindings.retain(|b| b.subscriber != self.subscriber);
        }
        Ok(())
    }
}
