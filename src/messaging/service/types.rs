//! # Broker Service Types
//!
//! Core types for the provider-agnostic broker abstraction.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::messaging::envelope::Envelope;

/// Identifier assigned by the broker to a published envelope
///
/// The format is provider-specific:
/// - InMemory: per-destination sequence as string
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A live subscription to one destination
///
/// Each subscription has its own buffer: every envelope published after the
/// subscription was created is delivered to it independently of any other
/// subscription. Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    subscription_id: Uuid,
    destination: String,
    receiver: mpsc::Receiver<Envelope>,
}

impl Subscription {
    pub fn new(destination: impl Into<String>, receiver: mpsc::Receiver<Envelope>) -> Self {
        Self {
            subscription_id: Uuid::new_v4(),
            destination: destination.into(),
            receiver,
        }
    }

    pub fn subscription_id(&self) -> Uuid {
        self.subscription_id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Wait for the next envelope; `None` once the broker side is gone
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }

    /// Stop accepting new envelopes while still allowing buffered ones to be read
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

/// Destination statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DestinationStats {
    pub destination: String,
    /// Number of live subscriptions
    pub subscriber_count: usize,
    /// Total envelopes accepted for publication
    pub total_published: u64,
    /// Total envelope copies handed to subscriptions
    pub total_delivered: u64,
    /// Envelopes published while no subscription was live
    pub total_unrouted: u64,
}

impl DestinationStats {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            ..Default::default()
        }
    }
}
