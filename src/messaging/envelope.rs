//! # Bus Envelope
//!
//! The unit placed on the bus: serialized item payload plus routing metadata.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::{MessagingError, MessagingResult};
use super::tag::TagSet;

/// Serialized item plus routing metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique envelope identifier
    pub envelope_id: Uuid,
    /// Receiver roles that should consume this item
    pub destinations: TagSet,
    /// Per-publisher sequence number, if the publisher assigns one
    pub sequence: Option<u64>,
    /// When the envelope was published
    pub published_at: DateTime<Utc>,
    /// JSON-encoded item
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Build an envelope by serializing `item`
    ///
    /// Callers are expected to have rejected empty tag sets already; the
    /// envelope itself does not enforce it so that decoding never fails on
    /// routing metadata.
    pub fn wrap<T: Serialize>(
        item: &T,
        destinations: TagSet,
        sequence: Option<u64>,
    ) -> MessagingResult<Self> {
        let payload = serde_json::to_vec(item)
            .map_err(|e| MessagingError::message_serialization(e.to_string()))?;
        Ok(Self {
            envelope_id: Uuid::new_v4(),
            destinations,
            sequence,
            published_at: Utc::now(),
            payload,
        })
    }

    /// Deserialize a fresh copy of the payload
    pub fn open<T: DeserializeOwned>(&self) -> MessagingResult<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| MessagingError::message_deserialization(e.to_string()))
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}
