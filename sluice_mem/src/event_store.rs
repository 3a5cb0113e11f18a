//! An in-memory append-only event log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::envelope::Properties;
use sluice_core::event::{BoxedEventStream, EventStore, EventStoreError, StoredEvent};
use std::sync::Arc;
use tokio::sync::Mutex;

/// In-memory [`EventStore`] implementation for testing and development.
///
/// Events are held in append order; positions start at 1 and never repeat.
#[derive(Clone)]
pub struct InMemoryEventStore<M> {
    events: Arc<Mutex<Vec<StoredEvent<M>>>>,
}

impl<M> InMemoryEventStore<M> {
    /// Creates an empty event store.
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<M> Default for InMemoryEventStore<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<M> EventStore<M> for InMemoryEventStore<M>
where
    M: Clone + Send + Sync + 'static,
{
    async fn count_from(&self, from: Option<DateTime<Utc>>) -> Result<u64, EventStoreError> {
        let events = self.events.lock().await;
        let count = events
            .iter()
            .filter(|e| from.map_or(true, |f| e.valid_at >= f))
            .count();
        Ok(count as u64)
    }

    async fn stream_from(
        &self,
        from: Option<DateTime<Utc>>,
    ) -> Result<BoxedEventStream<M>, EventStoreError> {
        let events = self.events.lock().await;
        let snapshot: Vec<Result<StoredEvent<M>, EventStoreError>> = events
            .iter()
            .filter(|e| from.map_or(true, |f| e.valid_at >= f))
            .cloned()
            .map(Ok)
            .collect();
        Ok(Box::pin(tokio_stream::iter(snapshot)))
    }

    async fn append(
        &self,
        message: M,
        properties: Properties,
    ) -> Result<StoredEvent<M>, EventStoreError> {
        let mut events = self.events.lock().await;
        let event = StoredEvent {
            position: events.len() as i64 + 1,
            valid_at: Utc::now(),
            message,
            properties,
        };
        events.push(event.clone());
        Ok(event)
    }
}
