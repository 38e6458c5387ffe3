//! # Handler Registry
//!
//! Explicit registry of node-side item handlers, owned by one consumer.
//!
//! Every registration gets its own bounded queue and dispatch task. Envelopes
//! are queued for a registration in arrival order and the task handles them
//! one at a time, so each handler sees items in publish order while different
//! handlers progress independently. Decoding happens inside the dispatch task,
//! giving every handler a fresh copy of the item.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{HarvesterError, HarvesterResult};
use crate::messaging::envelope::Envelope;
use crate::messaging::tag::TagSet;
use crate::pipeline::Item;

pub type RegistrationId = Uuid;

/// Node-side consumer of decoded items
#[async_trait]
pub trait ItemHandler<T>: Send + Sync + 'static {
    /// Name used in logs and delivery statistics
    fn handler_name(&self) -> &str;

    /// Handle one item; may be called concurrently with other handlers
    async fn ingest(&self, item: T) -> HarvesterResult<()>;
}

/// Type-erased handler working on raw envelopes
#[async_trait]
trait EnvelopeHandler: Send + Sync {
    fn handler_name(&self) -> &str;

    async fn handle(&self, envelope: &Envelope) -> HarvesterResult<()>;
}

/// Decodes the envelope into `T` before handing it to the typed handler
struct TypedEnvelopeHandler<T, H> {
    handler: Arc<H>,
    _item: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, H> EnvelopeHandler for TypedEnvelopeHandler<T, H>
where
    T: Item,
    H: ItemHandler<T>,
{
    fn handler_name(&self) -> &str {
        self.handler.handler_name()
    }

    async fn handle(&self, envelope: &Envelope) -> HarvesterResult<()> {
        let item: T = envelope
            .open()
            .map_err(|e| HarvesterError::decode(self.handler.handler_name(), e.to_string()))?;
        self.handler.ingest(item).await
    }
}

/// Delivery counters for one registration
#[derive(Debug, Default)]
pub struct HandlerStats {
    delivered: AtomicU64,
    succeeded: AtomicU64,
    decode_failures: AtomicU64,
    handler_failures: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_delivery_at: Mutex<Option<DateTime<Utc>>>,
}

impl HandlerStats {
    fn record(&self, outcome: &HarvesterResult<()>) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
        *self.last_delivery_at.lock() = Some(Utc::now());
        match outcome {
            Ok(()) => {
                self.succeeded.fetch_add(1, Ordering::SeqCst);
            }
            Err(error) => {
                if matches!(error, HarvesterError::Decode { .. }) {
                    self.decode_failures.fetch_add(1, Ordering::SeqCst);
                } else {
                    self.handler_failures.fetch_add(1, Ordering::SeqCst);
                }
                *self.last_error.lock() = Some(error.to_string());
            }
        }
    }
}

/// Point-in-time view of a registration's delivery statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerStatsSnapshot {
    pub registration_id: RegistrationId,
    pub handler_name: String,
    pub tags: TagSet,
    pub delivered: u64,
    pub succeeded: u64,
    pub decode_failures: u64,
    pub handler_failures: u64,
    pub last_error: Option<String>,
    pub last_delivery_at: Option<DateTime<Utc>>,
}

struct Registration {
    handler_name: String,
    tags: TagSet,
    queue: mpsc::Sender<Arc<Envelope>>,
    stats: Arc<HandlerStats>,
    worker: JoinHandle<()>,
}

impl Registration {
    fn snapshot(&self, registration_id: RegistrationId) -> HandlerStatsSnapshot {
        HandlerStatsSnapshot {
            registration_id,
            handler_name: self.handler_name.clone(),
            tags: self.tags.clone(),
            delivered: self.stats.delivered.load(Ordering::SeqCst),
            succeeded: self.stats.succeeded.load(Ordering::SeqCst),
            decode_failures: self.stats.decode_failures.load(Ordering::SeqCst),
            handler_failures: self.stats.handler_failures.load(Ordering::SeqCst),
            last_error: self.stats.last_error.lock().clone(),
            last_delivery_at: *self.stats.last_delivery_at.lock(),
        }
    }
}

/// Queue handle of a registration whose tags match an envelope
pub(crate) struct MatchedHandler {
    pub registration_id: RegistrationId,
    pub queue: mpsc::Sender<Arc<Envelope>>,
}

/// Registry of handlers keyed by registration id
pub struct HandlerRegistry {
    registrations: DashMap<RegistrationId, Registration>,
    queue_capacity: usize,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registrations", &self.registrations.len())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            registrations: DashMap::new(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register `handler` for items carrying at least one of `tags`
    ///
    /// Spawns the registration's dispatch task, so this must run inside a
    /// Tokio runtime.
    pub fn register<T, H>(&self, handler: Arc<H>, tags: TagSet) -> HarvesterResult<RegistrationId>
    where
        T: Item,
        H: ItemHandler<T>,
    {
        let handler_name = handler.handler_name().to_string();
        if tags.is_empty() {
            return Err(HarvesterError::configuration(
                "handler_registry",
                format!("handler '{handler_name}' must be registered with at least one tag"),
            ));
        }

        let registration_id = Uuid::new_v4();
        let (queue, mut receiver) = mpsc::channel::<Arc<Envelope>>(self.queue_capacity);
        let stats = Arc::new(HandlerStats::default());

        let dispatcher: Arc<dyn EnvelopeHandler> = Arc::new(TypedEnvelopeHandler::<T, H> {
            handler,
            _item: PhantomData,
        });
        let worker_stats = Arc::clone(&stats);
        let worker = tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                let outcome = dispatcher.handle(&envelope).await;
                if let Err(error) = &outcome {
                    warn!(
                        registration_id = %registration_id,
                        handler = dispatcher.handler_name(),
                        envelope_id = %envelope.envelope_id,
                        error_kind = error.kind(),
                        error = %error,
                        "⚠️ Handler failed to ingest item"
                    );
                }
                worker_stats.record(&outcome);
            }
            debug!(registration_id = %registration_id, "Handler dispatch task finished");
        });

        info!(
            registration_id = %registration_id,
            handler = %handler_name,
            tags = %tags,
            "✅ Registered item handler"
        );
        self.registrations.insert(
            registration_id,
            Registration {
                handler_name,
                tags,
                queue,
                stats,
                worker,
            },
        );
        Ok(registration_id)
    }

    /// Remove a registration; items already queued for it are still handled
    pub fn unregister(&self, registration_id: RegistrationId) -> bool {
        match self.registrations.remove(&registration_id) {
            Some((_, registration)) => {
                info!(
                    registration_id = %registration_id,
                    handler = %registration.handler_name,
                    "Unregistered item handler"
                );
                true
            }
            None => false,
        }
    }

    /// Queues of every registration whose tags intersect `tags`
    pub(crate) fn matching(&self, tags: &TagSet) -> Vec<MatchedHandler> {
        self.registrations
            .iter()
            .filter(|entry| entry.value().tags.intersects(tags))
            .map(|entry| MatchedHandler {
                registration_id: *entry.key(),
                queue: entry.value().queue.clone(),
            })
            .collect()
    }

    pub fn contains(&self, registration_id: RegistrationId) -> bool {
        self.registrations.contains_key(&registration_id)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn stats(&self, registration_id: RegistrationId) -> Option<HandlerStatsSnapshot> {
        self.registrations
            .get(&registration_id)
            .map(|entry| entry.value().snapshot(registration_id))
    }

    pub fn all_stats(&self) -> Vec<HandlerStatsSnapshot> {
        self.registrations
            .iter()
            .map(|entry| entry.value().snapshot(*entry.key()))
            .collect()
    }

    /// Drop every registration and wait for queued items to drain
    pub async fn shutdown(&self) {
        let ids: Vec<RegistrationId> = self.registrations.iter().map(|e| *e.key()).collect();
        let mut workers = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, registration)) = self.registrations.remove(&id) {
                // dropping the queue sender ends the dispatch loop after it drains
                drop(registration.queue);
                workers.push(registration.worker);
            }
        }
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Handler dispatch task ended abnormally");
            }
        }
    }
}
