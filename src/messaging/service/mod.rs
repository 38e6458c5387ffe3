//! # Broker Service Abstraction
//!
//! Provider-agnostic publish/subscribe layer used by the bus writer and the
//! bus consumer.
//!
//! ```text
//! MessageBusWriter ──publish──→ MessageBroker ──subscription──→ MessageBusConsumer
//!                                   └── InMemoryBroker
//! ```

pub mod providers;
mod traits;
mod types;

pub use providers::InMemoryBroker;
pub use traits::MessageBroker;
pub use types::{DestinationStats, MessageId, Subscription};
