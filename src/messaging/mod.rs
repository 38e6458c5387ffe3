//! # Messaging Module
//!
//! Tag-addressed message bus between a coordinator and processing nodes.
//!
//! - [`MessageBusWriter`] publishes items wrapped in [`Envelope`]s
//! - [`MessageBusConsumer`] receives envelopes and fans them out to
//!   [`ItemHandler`]s by destination tag
//! - [`service`] holds the broker abstraction and its providers

pub mod consumer;
pub mod envelope;
pub mod errors;
pub mod registry;
pub mod service;
pub mod tag;
pub mod writer;

pub use consumer::{ConsumerStats, MessageBusConsumer};
pub use envelope::Envelope;
pub use errors::{MessagingError, MessagingResult};
pub use registry::{HandlerRegistry, HandlerStatsSnapshot, ItemHandler, RegistrationId};
pub use service::{DestinationStats, InMemoryBroker, MessageBroker, MessageId, Subscription};
pub use tag::{DestinationTag, TagSet};
pub use writer::MessageBusWriter;
