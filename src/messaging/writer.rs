//! # Message Bus Writer
//!
//! Publishing side of the bus: wraps each item in an [`Envelope`] carrying
//! its destination tags and sends it to one broker destination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error};

use crate::error::{HarvesterError, HarvesterResult};
use crate::messaging::envelope::Envelope;
use crate::messaging::service::{MessageBroker, MessageId};
use crate::messaging::tag::TagSet;

/// Publishes items to a bus destination
///
/// Clones share the broker connection and the sequence counter, so envelopes
/// from one writer are numbered in publish order.
#[derive(Clone)]
pub struct MessageBusWriter {
    broker: Arc<dyn MessageBroker>,
    destination: String,
    sequence: Arc<AtomicU64>,
}

impl std::fmt::Debug for MessageBusWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBusWriter")
            .field("provider", &self.broker.provider_name())
            .field("destination", &self.destination)
            .field("published", &self.published_count())
            .finish()
    }
}

impl MessageBusWriter {
    /// Connect to `destination`, creating it if the broker does not know it yet
    pub async fn connect(
        broker: Arc<dyn MessageBroker>,
        destination: impl Into<String>,
    ) -> HarvesterResult<Self> {
        let destination = destination.into();
        broker
            .ensure_destination(&destination)
            .await
            .map_err(|e| HarvesterError::configuration("message_bus_writer", e.to_string()))?;

        debug!(
            destination = %destination,
            provider = broker.provider_name(),
            "🔌 Message bus writer connected"
        );
        Ok(Self {
            broker,
            destination,
            sequence: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn published_count(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Publish one item addressed to `tags`
    ///
    /// An empty tag set is rejected before anything reaches the bus.
    pub async fn publish<T>(&self, item: &T, tags: &TagSet) -> HarvesterResult<MessageId>
    where
        T: Serialize + Sync,
    {
        if tags.is_empty() {
            return Err(HarvesterError::configuration(
                "message_bus_writer",
                "cannot publish an item without destination tags",
            ));
        }

        let mut envelope = Envelope::wrap(item, tags.clone(), None)
            .map_err(|e| HarvesterError::publish(format!("cannot serialize item: {e}")))?;
        // a failed serialization consumes no sequence number
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        envelope.sequence = Some(sequence);
        let envelope_id = envelope.envelope_id;

        match self.broker.publish(&self.destination, envelope).await {
            Ok(message_id) => {
                debug!(
                    destination = %self.destination,
                    envelope_id = %envelope_id,
                    sequence = sequence,
                    tags = %tags,
                    "📤 Published item"
                );
                Ok(message_id)
            }
            Err(e) => {
                error!(
                    destination = %self.destination,
                    envelope_id = %envelope_id,
                    error = %e,
                    "❌ Failed to publish item"
                );
                Err(HarvesterError::publish(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::service::InMemoryBroker;

    #[tokio::test]
    async fn test_publish_assigns_increasing_sequence() {
        let broker = Arc::new(InMemoryBroker::new());
        let writer = MessageBusWriter::connect(broker.clone(), "items").await.unwrap();
        let mut subscription = broker.subscribe("items").await.unwrap();

        let tags: TagSet = ["A"].into_iter().collect();
        writer.publish(&"first", &tags).await.unwrap();
        writer.publish(&"second", &tags).await.unwrap();

        let first = subscription.recv().await.unwrap();
        let second = subscription.recv().await.unwrap();
        assert_eq!(first.sequence, Some(1));
        assert_eq!(second.sequence, Some(2));
        assert_eq!(second.open::<String>().unwrap(), "second");
        assert_eq!(writer.published_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_tags_never_reach_the_broker() {
        let broker = Arc::new(InMemoryBroker::new());
        let writer = MessageBusWriter::connect(broker.clone(), "items").await.unwrap();

        let err = writer.publish(&1_u32, &TagSet::new()).await.unwrap_err();
        assert!(matches!(err, HarvesterError::Configuration { .. }));

        let stats = broker.destination_stats("items").await.unwrap();
        assert_eq!(stats.total_published, 0);
    }

    #[tokio::test]
    async fn test_unserializable_item_does_not_consume_a_sequence() {
        let broker = Arc::new(InMemoryBroker::new());
        let writer = MessageBusWriter::connect(broker.clone(), "items").await.unwrap();
        let mut subscription = broker.subscribe("items").await.unwrap();
        let tags: TagSet = ["A"].into_iter().collect();

        // JSON object keys must be strings
        let bad: std::collections::HashMap<(u8, u8), u8> = [((1, 2), 3)].into_iter().collect();
        let err = writer.publish(&bad, &tags).await.unwrap_err();
        assert!(matches!(err, HarvesterError::Publish { .. }));
        assert_eq!(writer.published_count(), 0);

        writer.publish(&"after", &tags).await.unwrap();
        let envelope = subscription.recv().await.unwrap();
        assert_eq!(envelope.sequence, Some(1));
        assert_eq!(envelope.open::<String>().unwrap(), "after");
    }

    #[tokio::test]
    async fn test_broker_failure_is_publish_error() {
        let broker = Arc::new(InMemoryBroker::new());
        let writer = MessageBusWriter::connect(broker.clone(), "items").await.unwrap();
        broker.shutdown().await;

        let tags: TagSet = ["A"].into_iter().collect();
        let err = writer.publish(&1_u32, &tags).await.unwrap_err();
        assert!(matches!(err, HarvesterError::Publish { .. }));
    }
}
