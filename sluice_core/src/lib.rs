//! # Sluice
//!
//! Core traits and types for a database-backed message broker and an
//! event-sourced projector runtime: immutable envelopes with a string
//! property bag, a claim-based broker contract with bounded retries and
//! dead-lettering, an append-only event store, and a replay worker that
//! drives checkpointed projectors with per-projector failure isolation.
//!
//! Storage backends live in companion crates; this crate defines the
//! contracts and the backend-independent machinery (retry decisions, the
//! replay worker, live dispatch, the middleware pipeline).

#![deny(missing_docs)]

pub mod broker;
pub mod envelope;
pub mod event;
pub mod live;
pub mod pipeline;
pub mod projector;
pub mod retry;
pub mod serializer;
pub mod state;
pub mod worker;

pub mod prelude {
    //! The prelude module for the `sluice_core` crate.
    pub use super::broker::{BrokerConfig, Delivery, MessageBody, MessageBroker};
    pub use super::envelope::{BrokenMessage, Envelope, Properties};
    pub use super::event::{BoxedEventStream, EventStore, EventStoreError, StoredEvent};
    pub use super::live::LiveDispatcher;
    pub use super::pipeline::{Handler, Middleware, Next, Pipeline};
    pub use super::projector::{Capabilities, Projector, ProjectorRegistry};
    pub use super::retry::{RejectOutcome, RetryPolicy};
    pub use super::serializer::{JsonSerializer, MessageSerializer};
    pub use super::state::{ProjectorState, ProjectorStateStore, StateStoreError};
    pub use super::worker::{ReplayObserver, ReplayProgress, Worker, WorkerConfig, WorkerError};
}
