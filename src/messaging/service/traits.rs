//! # Broker Service Traits
//!
//! Core trait definition for provider-agnostic publish/subscribe.

use async_trait::async_trait;

use super::types::{DestinationStats, MessageId, Subscription};
use crate::messaging::envelope::Envelope;
use crate::messaging::MessagingResult;

/// Publish/subscribe broker contract
///
/// The engine assumes a topic with independent subscriptions:
///
/// - every live subscription receives every envelope published after it was
///   created, in the publisher's send order
/// - envelopes published while no subscription is live are not retained
/// - redelivery, if any, is a property of the provider
///
/// Implementations must be safe to share across tasks.
#[async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    /// Create a destination if it doesn't exist (idempotent)
    async fn ensure_destination(&self, destination: &str) -> MessagingResult<()>;

    /// Publish one envelope to a destination
    async fn publish(&self, destination: &str, envelope: Envelope) -> MessagingResult<MessageId>;

    /// Open a new independent subscription on a destination
    async fn subscribe(&self, destination: &str) -> MessagingResult<Subscription>;

    /// Statistics for monitoring
    async fn destination_stats(&self, destination: &str) -> MessagingResult<DestinationStats>;

    /// Verify the broker is reachable
    async fn health_check(&self) -> MessagingResult<bool>;

    /// Provider name for logging (e.g. "in_memory")
    fn provider_name(&self) -> &'static str;
}
