//! # Sluice memory backends
//!
//! In-memory implementations of sluice's storage contracts — broker, event
//! store and projector state store — primarily for testing and development.
//! Nothing here is durable, but the state machines follow the same rules as
//! the Postgres backends: the broker's claim/retry/dead-letter transitions
//! and the state store's lock contention behave identically, with a mutex
//! standing in for row-level locking.

#![deny(missing_docs)]

mod broker;
mod event_store;
mod state_store;

pub use broker::{InMemoryBroker, InMemoryBrokerError};
pub use event_store::InMemoryEventStore;
pub use state_store::InMemoryStateStore;
