//! # Message Bus Consumer
//!
//! Node-side receiver: subscribes to one destination and fans each envelope
//! out to every registered handler whose tags intersect the envelope's
//! destination tags.
//!
//! ## Lifecycle
//!
//! ```text
//! new ──register_handler*──► open ──(receive loop)──► close
//!          ▲                   │
//!          └── register / unregister allowed at any time
//! ```
//!
//! Handlers registered after `open` only see envelopes received after their
//! registration. Envelopes matching no handler are counted as dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::cancellation::CancellationFlag;
use crate::config::{BrokerConfig, ConsumerConfig};
use crate::error::{HarvesterError, HarvesterResult};
use crate::messaging::envelope::Envelope;
use crate::messaging::registry::{HandlerRegistry, HandlerStatsSnapshot, ItemHandler, RegistrationId};
use crate::messaging::service::{MessageBroker, Subscription};
use crate::messaging::tag::{DestinationTag, TagSet};
use crate::pipeline::Item;

#[derive(Debug, Default)]
struct ConsumerCounters {
    received: AtomicU64,
    routed: AtomicU64,
    dropped: AtomicU64,
}

/// Delivery statistics for a consumer and its handlers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerStats {
    pub consumer_id: Uuid,
    pub destination: String,
    pub is_open: bool,
    pub received: u64,
    pub routed: u64,
    /// Envelopes whose tags matched no registered handler
    pub dropped: u64,
    pub handlers: Vec<HandlerStatsSnapshot>,
}

struct ReceiveLoop {
    stop: CancellationFlag,
    task: JoinHandle<()>,
}

/// Receives envelopes from the bus and dispatches them to handlers
pub struct MessageBusConsumer {
    consumer_id: Uuid,
    broker: Arc<dyn MessageBroker>,
    destination: String,
    registry: Arc<HandlerRegistry>,
    counters: Arc<ConsumerCounters>,
    receive_loop: Mutex<Option<ReceiveLoop>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for MessageBusConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBusConsumer")
            .field("consumer_id", &self.consumer_id)
            .field("destination", &self.destination)
            .field("registry", &self.registry)
            .field("is_open", &self.is_open())
            .finish()
    }
}

impl MessageBusConsumer {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        destination: impl Into<String>,
        handler_queue_capacity: usize,
    ) -> Self {
        Self {
            consumer_id: Uuid::new_v4(),
            broker,
            destination: destination.into(),
            registry: Arc::new(HandlerRegistry::new(handler_queue_capacity)),
            counters: Arc::new(ConsumerCounters::default()),
            receive_loop: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn from_config(
        broker: Arc<dyn MessageBroker>,
        broker_config: &BrokerConfig,
        consumer_config: &ConsumerConfig,
    ) -> Self {
        Self::new(
            broker,
            broker_config.destination.clone(),
            consumer_config.handler_queue_capacity,
        )
    }

    pub fn consumer_id(&self) -> Uuid {
        self.consumer_id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn is_open(&self) -> bool {
        self.receive_loop.lock().is_some()
    }

    /// Register `handler` for items tagged with any of `tags`
    ///
    /// Allowed before or after [`open`](Self::open). The item type is fixed
    /// by the handler; each matching envelope is decoded into a fresh `T`.
    pub async fn register_handler<T, H, I>(
        &self,
        handler: Arc<H>,
        tags: I,
    ) -> HarvesterResult<RegistrationId>
    where
        T: Item,
        H: ItemHandler<T>,
        I: IntoIterator,
        I::Item: Into<DestinationTag>,
    {
        let tags: TagSet = tags.into_iter().collect();
        self.registry.register::<T, H>(handler, tags)
    }

    pub fn unregister_handler(&self, registration_id: RegistrationId) -> bool {
        self.registry.unregister(registration_id)
    }

    /// Subscribe to the destination and start dispatching
    pub async fn open(&self) -> HarvesterResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(HarvesterError::illegal_state(format!(
                "consumer {} has been shut down",
                self.consumer_id
            )));
        }
        if self.is_open() {
            return Err(HarvesterError::illegal_state(format!(
                "consumer {} is already open",
                self.consumer_id
            )));
        }

        self.broker
            .ensure_destination(&self.destination)
            .await
            .map_err(|e| HarvesterError::configuration("message_bus_consumer", e.to_string()))?;
        let subscription = self.broker.subscribe(&self.destination).await?;

        let stop = CancellationFlag::new();
        let task = tokio::spawn(receive_loop(
            subscription,
            Arc::clone(&self.registry),
            Arc::clone(&self.counters),
            stop.clone(),
        ));

        let mut slot = self.receive_loop.lock();
        if slot.is_some() {
            // lost a race with a concurrent open()
            stop.cancel();
            return Err(HarvesterError::illegal_state(format!(
                "consumer {} is already open",
                self.consumer_id
            )));
        }
        *slot = Some(ReceiveLoop { stop, task });

        info!(
            consumer_id = %self.consumer_id,
            destination = %self.destination,
            handlers = self.registry.len(),
            "🚀 Message bus consumer opened"
        );
        Ok(())
    }

    /// Stop receiving; registrations survive and the consumer may be reopened
    pub async fn close(&self) -> HarvesterResult<()> {
        let Some(active) = self.receive_loop.lock().take() else {
            return Ok(());
        };
        active.stop.cancel();
        if let Err(e) = active.task.await {
            error!(consumer_id = %self.consumer_id, error = %e, "Receive loop ended abnormally");
            return Err(HarvesterError::illegal_state(format!("receive loop failed: {e}")));
        }
        info!(consumer_id = %self.consumer_id, "🛑 Message bus consumer closed");
        Ok(())
    }

    /// Close, drop every registration and wait for their queues to drain
    ///
    /// Terminal: a shut down consumer cannot be opened again. Use
    /// [`close`](Self::close) to pause between runs.
    pub async fn shutdown(&self) -> HarvesterResult<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        self.close().await?;
        self.registry.shutdown().await;
        Ok(())
    }

    pub fn handler_stats(&self, registration_id: RegistrationId) -> Option<HandlerStatsSnapshot> {
        self.registry.stats(registration_id)
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            consumer_id: self.consumer_id,
            destination: self.destination.clone(),
            is_open: self.is_open(),
            received: self.counters.received.load(Ordering::SeqCst),
            routed: self.counters.routed.load(Ordering::SeqCst),
            dropped: self.counters.dropped.load(Ordering::SeqCst),
            handlers: self.registry.all_stats(),
        }
    }
}

impl Drop for MessageBusConsumer {
    fn drop(&mut self) {
        if let Some(active) = self.receive_loop.get_mut().take() {
            active.stop.cancel();
        }
    }
}

async fn receive_loop(
    mut subscription: Subscription,
    registry: Arc<HandlerRegistry>,
    counters: Arc<ConsumerCounters>,
    stop: CancellationFlag,
) {
    let destination = subscription.destination().to_string();
    loop {
        let envelope = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            received = subscription.recv() => match received {
                Some(envelope) => envelope,
                None => {
                    debug!(destination = %destination, "Subscription ended");
                    break;
                }
            },
        };
        counters.received.fetch_add(1, Ordering::SeqCst);
        if !route(&registry, &counters, envelope, &stop).await {
            break;
        }
    }
    subscription.close();
}

/// Queue `envelope` for every matching handler
///
/// A full handler queue holds back delivery to the remaining handlers and to
/// later envelopes until it drains or the consumer is closed. Returns `false`
/// when closing interrupted delivery.
async fn route(
    registry: &HandlerRegistry,
    counters: &ConsumerCounters,
    envelope: Envelope,
    stop: &CancellationFlag,
) -> bool {
    let matched = registry.matching(&envelope.destinations);
    if matched.is_empty() {
        counters.dropped.fetch_add(1, Ordering::SeqCst);
        debug!(
            envelope_id = %envelope.envelope_id,
            tags = %envelope.destinations,
            "📭 No handler registered for envelope tags"
        );
        return true;
    }

    let envelope = Arc::new(envelope);
    for handler in matched {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                debug!(
                    envelope_id = %envelope.envelope_id,
                    registration_id = %handler.registration_id,
                    "Consumer closed while a handler queue was full"
                );
                return false;
            }
            sent = handler.queue.send(Arc::clone(&envelope)) => {
                // a closed queue means the handler was unregistered meanwhile
                if sent.is_err() {
                    debug!(
                        registration_id = %handler.registration_id,
                        "Handler unregistered before delivery"
                    );
                }
            }
        }
    }
    counters.routed.fetch_add(1, Ordering::SeqCst);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::service::InMemoryBroker;
    use crate::messaging::writer::MessageBusWriter;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Collect {
        name: &'static str,
        items: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ItemHandler<String> for Collect {
        fn handler_name(&self) -> &str {
            self.name
        }

        async fn ingest(&self, item: String) -> HarvesterResult<()> {
            self.items.lock().push(item);
            Ok(())
        }
    }

    fn collector(name: &'static str) -> Arc<Collect> {
        Arc::new(Collect {
            name,
            items: Mutex::new(Vec::new()),
        })
    }

    async fn wait_for(handler: &Collect, count: usize) {
        for _ in 0..200 {
            if handler.items.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_fan_out_by_tag() {
        let broker: Arc<dyn MessageBroker> = Arc::new(InMemoryBroker::new());
        let consumer = MessageBusConsumer::new(broker.clone(), "items", 16);
        let a = collector("a");
        let c = collector("c");
        consumer.register_handler(a.clone(), ["A"]).await.unwrap();
        let c_id = consumer.register_handler(c.clone(), ["C"]).await.unwrap();
        consumer.open().await.unwrap();

        let writer = MessageBusWriter::connect(broker, "items").await.unwrap();
        let tags: TagSet = ["A", "B"].into_iter().collect();
        for word in ["one", "two", "three"] {
            writer.publish(&word, &tags).await.unwrap();
        }

        wait_for(&a, 3).await;
        consumer.shutdown().await.unwrap();

        assert_eq!(*a.items.lock(), vec!["one", "two", "three"]);
        assert!(c.items.lock().is_empty());
        assert!(consumer.handler_stats(c_id).is_none());
    }

    #[tokio::test]
    async fn test_unmatched_envelopes_are_dropped() {
        let broker: Arc<dyn MessageBroker> = Arc::new(InMemoryBroker::new());
        let consumer = MessageBusConsumer::new(broker.clone(), "items", 16);
        let a = collector("a");
        consumer.register_handler(a.clone(), ["A"]).await.unwrap();
        consumer.open().await.unwrap();

        let writer = MessageBusWriter::connect(broker, "items").await.unwrap();
        writer
            .publish(&"lost", &["Z"].into_iter().collect())
            .await
            .unwrap();
        writer
            .publish(&"kept", &["A"].into_iter().collect())
            .await
            .unwrap();

        wait_for(&a, 1).await;
        let stats = consumer.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.routed, 1);
        assert_eq!(stats.handlers.len(), 1);
        consumer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_twice_is_illegal() {
        let broker: Arc<dyn MessageBroker> = Arc::new(InMemoryBroker::new());
        let consumer = MessageBusConsumer::new(broker, "items", 16);
        consumer.open().await.unwrap();
        let err = consumer.open().await.unwrap_err();
        assert!(matches!(err, HarvesterError::IllegalState { .. }));

        consumer.close().await.unwrap();
        assert!(!consumer.is_open());
        consumer.open().await.unwrap();
        consumer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_shut_down_consumer_cannot_reopen() {
        let broker: Arc<dyn MessageBroker> = Arc::new(InMemoryBroker::new());
        let consumer = MessageBusConsumer::new(broker, "items", 16);
        consumer.register_handler(collector("a"), ["A"]).await.unwrap();
        consumer.open().await.unwrap();
        consumer.shutdown().await.unwrap();

        let err = consumer.open().await.unwrap_err();
        assert!(matches!(err, HarvesterError::IllegalState { .. }));
        assert!(!consumer.is_open());
    }

    struct Stalled {
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl ItemHandler<String> for Stalled {
        fn handler_name(&self) -> &str {
            "stalled"
        }

        async fn ingest(&self, _item: String) -> HarvesterResult<()> {
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_close_is_not_blocked_by_a_full_handler_queue() {
        let broker: Arc<dyn MessageBroker> = Arc::new(InMemoryBroker::new());
        let consumer = MessageBusConsumer::new(broker.clone(), "items", 1);
        let stalled = Arc::new(Stalled {
            release: tokio::sync::Notify::new(),
        });
        consumer.register_handler(stalled.clone(), ["A"]).await.unwrap();
        consumer.open().await.unwrap();

        // one item in the handler, one queued, one waiting on the full queue
        let writer = MessageBusWriter::connect(broker, "items").await.unwrap();
        let tags: TagSet = ["A"].into_iter().collect();
        for word in ["one", "two", "three"] {
            writer.publish(&word, &tags).await.unwrap();
        }
        for _ in 0..200 {
            if consumer.stats().received == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(consumer.stats().received, 3);

        tokio::time::timeout(Duration::from_secs(1), consumer.close())
            .await
            .expect("close should not wait for the stalled handler")
            .unwrap();
        assert!(!consumer.is_open());
        assert_eq!(consumer.stats().routed, 2);
        stalled.release.notify_waiters();
    }

    #[tokio::test]
    async fn test_register_with_no_tags_fails() {
        let broker: Arc<dyn MessageBroker> = Arc::new(InMemoryBroker::new());
        let consumer = MessageBusConsumer::new(broker, "items", 16);
        let result = consumer
            .register_handler(collector("a"), Vec::<String>::new())
            .await;
        assert!(matches!(result, Err(HarvesterError::Configuration { .. })));
    }
}
