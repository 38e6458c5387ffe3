//! # In-Memory Broker
//!
//! Thread-safe in-process topic implementation for tests and single-host
//! deployments where coordinator and nodes share one process.
//!
//! ## Features
//!
//! - **Independent subscriptions**: each subscriber owns a bounded buffer
//! - **Publish order**: envelopes reach each subscription in send order
//! - **Backpressure**: a full subscription buffer makes the publisher wait

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::messaging::envelope::Envelope;
use crate::messaging::service::traits::MessageBroker;
use crate::messaging::service::types::{DestinationStats, MessageId, Subscription};
use crate::messaging::{MessagingError, MessagingResult};

/// Default per-subscription buffer size
const DEFAULT_SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Debug)]
struct SubscriberSlot {
    subscription_id: Uuid,
    sender: mpsc::Sender<Envelope>,
}

/// One topic with its live subscriptions
#[derive(Debug, Default)]
struct Topic {
    subscribers: Mutex<Vec<SubscriberSlot>>,
    next_id: AtomicU64,
    total_published: AtomicU64,
    total_delivered: AtomicU64,
    total_unrouted: AtomicU64,
}

impl Topic {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ..Default::default()
        }
    }

    /// Snapshot live senders, pruning subscriptions whose receiver was dropped
    fn live_senders(&self) -> Vec<(Uuid, mpsc::Sender<Envelope>)> {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|slot| !slot.sender.is_closed());
        subscribers
            .iter()
            .map(|slot| (slot.subscription_id, slot.sender.clone()))
            .collect()
    }
}

/// In-memory publish/subscribe broker
///
/// # Example
///
/// ```rust
/// use harvester_core::messaging::service::{InMemoryBroker, MessageBroker};
/// use harvester_core::messaging::Envelope;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// broker.ensure_destination("harvester.items").await?;
///
/// let mut subscription = broker.subscribe("harvester.items").await?;
/// let envelope = Envelope::wrap(&"hello", ["raw"].into_iter().collect(), Some(1))?;
/// broker.publish("harvester.items", envelope).await?;
///
/// let received = subscription.recv().await;
/// assert!(received.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryBroker {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    subscription_buffer: usize,
    closed: AtomicBool,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_subscription_buffer(DEFAULT_SUBSCRIPTION_BUFFER)
    }

    /// Create a broker whose subscriptions buffer at most `buffer` envelopes
    pub fn with_subscription_buffer(buffer: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            subscription_buffer: buffer.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a broker sized by the `[broker]` configuration section
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::with_subscription_buffer(config.subscription_buffer)
    }

    pub fn subscription_buffer(&self) -> usize {
        self.subscription_buffer
    }

    /// Shut the broker down, ending every live subscription
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let topics = self.topics.read().await;
        for topic in topics.values() {
            topic.subscribers.lock().clear();
        }
        info!("🛑 IN_MEMORY_BROKER: Shut down {} destinations", topics.len());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> MessagingResult<()> {
        if self.is_closed() {
            return Err(MessagingError::broker_closed(self.provider_name()));
        }
        Ok(())
    }

    async fn topic(&self, destination: &str) -> MessagingResult<Arc<Topic>> {
        let topics = self.topics.read().await;
        topics
            .get(destination)
            .cloned()
            .ok_or_else(|| MessagingError::destination_not_found(destination))
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn ensure_destination(&self, destination: &str) -> MessagingResult<()> {
        self.ensure_open()?;
        if destination.trim().is_empty() {
            return Err(MessagingError::invalid_destination(
                destination,
                "destination name cannot be empty",
            ));
        }

        let mut topics = self.topics.write().await;
        topics
            .entry(destination.to_string())
            .or_insert_with(|| Arc::new(Topic::new()));
        Ok(())
    }

    async fn publish(&self, destination: &str, envelope: Envelope) -> MessagingResult<MessageId> {
        self.ensure_open()?;
        let topic = self.topic(destination).await?;

        let id = topic.next_id.fetch_add(1, Ordering::Relaxed);
        topic.total_published.fetch_add(1, Ordering::Relaxed);

        // Send outside the topic lock so a slow subscription cannot block subscribe()
        let senders = topic.live_senders();
        if senders.is_empty() {
            topic.total_unrouted.fetch_add(1, Ordering::Relaxed);
            debug!(
                destination = %destination,
                envelope_id = %envelope.envelope_id,
                "📭 No live subscriptions, envelope not retained"
            );
            return Ok(MessageId::from(id));
        }

        for (subscription_id, sender) in senders {
            if sender.send(envelope.clone()).await.is_ok() {
                topic.total_delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                warn!(
                    destination = %destination,
                    subscription_id = %subscription_id,
                    "Subscription closed during publish"
                );
            }
        }

        Ok(MessageId::from(id))
    }

    async fn subscribe(&self, destination: &str) -> MessagingResult<Subscription> {
        self.ensure_open()?;
        let topic = self.topic(destination).await?;

        let (sender, receiver) = mpsc::channel(self.subscription_buffer);
        let subscription = Subscription::new(destination, receiver);
        topic.subscribers.lock().push(SubscriberSlot {
            subscription_id: subscription.subscription_id(),
            sender,
        });

        debug!(
            destination = %destination,
            subscription_id = %subscription.subscription_id(),
            "📬 Subscription created"
        );
        Ok(subscription)
    }

    async fn destination_stats(&self, destination: &str) -> MessagingResult<DestinationStats> {
        let topic = self.topic(destination).await?;
        let subscriber_count = topic.live_senders().len();

        Ok(DestinationStats {
            destination: destination.to_string(),
            subscriber_count,
            total_published: topic.total_published.load(Ordering::Relaxed),
            total_delivered: topic.total_delivered.load(Ordering::Relaxed),
            total_unrouted: topic.total_unrouted.load(Ordering::Relaxed),
        })
    }

    async fn health_check(&self) -> MessagingResult<bool> {
        Ok(!self.is_closed())
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}
