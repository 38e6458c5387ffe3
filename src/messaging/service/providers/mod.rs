//! # Broker Providers
//!
//! Concrete implementations of the `MessageBroker` trait.
//!
//! - [`InMemoryBroker`] - per-process topics backed by bounded channels

mod in_memory;

pub use in_memory::InMemoryBroker;
