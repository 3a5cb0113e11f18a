//! The read side of the event store consumed by the projector runtime: the
//! `StoredEvent` shape, the `EventStream` abstraction and the `EventStore`
//! query trait.

use crate::envelope::Properties;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use std::pin::Pin;

/// An event as read back from the append-only log.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent<M> {
    /// Global monotonic sequence number totally ordering the stream.
    pub position: i64,
    /// When the event became valid.
    pub valid_at: DateTime<Utc>,
    /// The event payload.
    pub message: M,
    /// Free-form event properties.
    pub properties: Properties,
}

/// Errors raised by the event store's read side.
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    /// The underlying storage failed.
    #[error("event storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// A persisted event could not be reconstructed.
    #[error("corrupt event at position {position}: {message}")]
    Corrupt {
        /// The position of the unreadable event.
        position: i64,
        /// Description of the failure.
        message: String,
    },
}

/// A finite, forward-only sequence of events ordered by position.
pub trait EventStream<M>: Stream<Item = Result<StoredEvent<M>, EventStoreError>> + Send {}

impl<M, S> EventStream<M> for S where
    S: Stream<Item = Result<StoredEvent<M>, EventStoreError>> + Send
{
}

/// Boxed event stream returned by [`EventStore`] queries.
pub type BoxedEventStream<M> = Pin<Box<dyn EventStream<M> + Send>>;

/// Query contract of the append-only event log.
///
/// Positions form a total order across the whole stream; a query from a date
/// returns every event valid at or after it, in ascending position order.
#[async_trait]
pub trait EventStore<M>: Send + Sync {
    /// Counts the events a [`stream_from`](EventStore::stream_from) call with
    /// the same bound would yield. Used for progress reporting.
    async fn count_from(&self, from: Option<DateTime<Utc>>) -> Result<u64, EventStoreError>;

    /// Opens the event stream from the given date, or from the beginning
    /// when `from` is `None`.
    async fn stream_from(
        &self,
        from: Option<DateTime<Utc>>,
    ) -> Result<BoxedEventStream<M>, EventStoreError>;

    /// Appends an event to the log, assigning it the next position.
    async fn append(
        &self,
        message: M,
        properties: Properties,
    ) -> Result<StoredEvent<M>, EventStoreError>;
}
