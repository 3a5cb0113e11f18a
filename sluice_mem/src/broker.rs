//! An in-memory message broker mirroring the row-level semantics of the
//! Postgres backend, so the full dispatch/claim/reject state machine can be
//! exercised without a database.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sluice_core::broker::{BrokerConfig, Delivery, MessageBody, MessageBroker};
use sluice_core::envelope::{BrokenMessage, Envelope, Properties, keys};
use sluice_core::retry::{RejectOutcome, decide};
use sluice_core::serializer::{MessageSerializer, NameMapper, SerializationError};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// One queued message, shaped like the Postgres row.
#[derive(Debug, Clone)]
struct QueueRow {
    serial: i64,
    queue: String,
    headers: Properties,
    type_name: String,
    content_type: String,
    body: Vec<u8>,
    retry_count: u32,
    has_failed: bool,
    retry_at: Option<DateTime<Utc>>,
    consumed_at: Option<DateTime<Utc>>,
}

impl QueueRow {
    /// A row is claimable iff it is unconsumed and its retry timer, if any,
    /// has elapsed. `has_failed` is a historical marker, not part of the
    /// predicate: dead-lettered rows stay out of the pool because their
    /// `consumed_at` is never cleared.
    fn claimable(&self, queue: &str, now: DateTime<Utc>) -> bool {
        self.queue == queue
            && self.consumed_at.is_none()
            && self.retry_at.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Default)]
struct QueueData {
    rows: Vec<QueueRow>,
    next_serial: i64,
}

/// Errors raised by the in-memory broker.
#[derive(Debug, thiserror::Error)]
pub enum InMemoryBrokerError {
    /// The message body could not be serialized at dispatch time.
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    /// A reject referenced a serial this broker has never issued.
    #[error("no queued row with serial {0}")]
    UnknownSerial(i64),
}

/// In-memory [`MessageBroker`] implementation.
///
/// Useful for testing and development; nothing is durable. The claim,
/// retry and dead-letter transitions follow the same rules as the Postgres
/// backend, applied under a single mutex instead of row-level locking.
#[derive(Clone)]
pub struct InMemoryBroker<M> {
    data: Arc<Mutex<QueueData>>,
    serializer: Arc<dyn MessageSerializer<M>>,
    names: Arc<dyn NameMapper<M>>,
    config: BrokerConfig,
}

impl<M> InMemoryBroker<M> {
    /// Creates a broker over the given serializer and name mapper.
    pub fn new(
        serializer: Arc<dyn MessageSerializer<M>>,
        names: Arc<dyn NameMapper<M>>,
        config: BrokerConfig,
    ) -> Self {
        log::debug!("creating InMemoryBroker for queue '{}'", config.queue);
        Self {
            data: Arc::new(Mutex::new(QueueData::default())),
            serializer,
            names,
            config,
        }
    }

    /// Number of rows carrying the has-failed marker. The marker is
    /// historical: it stays set on rows that were retried and later
    /// succeeded, not only on dead-lettered ones.
    pub async fn failed_count(&self) -> usize {
        let data = self.data.lock().await;
        data.rows.iter().filter(|r| r.has_failed).count()
    }

    /// Total number of rows held, regardless of state.
    pub async fn len(&self) -> usize {
        self.data.lock().await.rows.len()
    }

    /// Whether the broker holds no rows at all.
    pub async fn is_empty(&self) -> bool {
        self.data.lock().await.rows.is_empty()
    }

    /// Inserts a raw, pre-serialized row into the queue.
    ///
    /// Exists so tests can plant bodies that fail to deserialize; regular
    /// callers go through [`MessageBroker::dispatch`].
    pub async fn inject_raw(
        &self,
        type_name: &str,
        content_type: &str,
        body: Vec<u8>,
        mut headers: Properties,
    ) -> i64 {
        headers
            .entry(keys::MESSAGE_ID.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string());
        headers.insert(keys::MESSAGE_TYPE.to_string(), type_name.to_string());
        headers.insert(keys::CONTENT_TYPE.to_string(), content_type.to_string());
        let mut data = self.data.lock().await;
        let serial = data.next_serial;
        data.next_serial += 1;
        data.rows.push(QueueRow {
            serial,
            queue: self.config.queue.clone(),
            headers,
            type_name: type_name.to_string(),
            content_type: content_type.to_string(),
            body,
            retry_count: 0,
            has_failed: false,
            retry_at: None,
            consumed_at: None,
        });
        serial
    }

    async fn insert(
        &self,
        message: &M,
        mut headers: Properties,
        retry_count: u32,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), InMemoryBrokerError> {
        let content_type = headers
            .get(keys::CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| self.config.content_type.clone());
        let body = self.serializer.serialize(message, &content_type)?;
        let type_name = self.names.name_for(message);

        headers
            .entry(keys::MESSAGE_ID.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string());
        headers.insert(keys::MESSAGE_TYPE.to_string(), type_name.clone());
        headers.insert(keys::CONTENT_TYPE.to_string(), content_type.clone());

        let mut data = self.data.lock().await;
        let serial = data.next_serial;
        data.next_serial += 1;
        data.rows.push(QueueRow {
            serial,
            queue: self.config.queue.clone(),
            headers,
            type_name,
            content_type,
            body,
            retry_count,
            has_failed: false,
            retry_at,
            consumed_at: None,
        });
        Ok(())
    }
}

#[async_trait]
impl<M> MessageBroker<M> for InMemoryBroker<M>
where
    M: Send + Sync,
{
    type Error = InMemoryBrokerError;

    async fn dispatch(&self, envelope: Envelope<M>) -> Result<(), Self::Error> {
        let (message, mut properties) = envelope.into_parts();
        // A resend must never collide with a previous delivery's identity.
        properties.insert(keys::MESSAGE_ID.to_string(), Uuid::new_v4().to_string());
        self.insert(&message, properties, 0, None).await
    }

    async fn get(&self) -> Result<Option<Delivery<M>>, Self::Error> {
        let now = Utc::now();
        let mut data = self.data.lock().await;

        let claimed = data
            .rows
            .iter_mut()
            .filter(|r| r.claimable(&self.config.queue, now))
            .min_by_key(|r| r.serial);
        let Some(row) = claimed else {
            return Ok(None);
        };
        row.consumed_at = Some(now);

        match self
            .serializer
            .deserialize(&row.type_name, &row.content_type, &row.body)
        {
            Ok(message) => Ok(Some(Delivery {
                serial: Some(row.serial),
                body: MessageBody::Intact(message),
                properties: row.headers.clone(),
            })),
            Err(e) => {
                // Corrupt payloads must not stall the consumer loop: the row
                // is dead-lettered on the spot and surfaced as Broken.
                let error = e.to_string();
                row.has_failed = true;
                row.headers.insert(keys::ERROR.to_string(), error.clone());
                log::warn!(
                    "failed to deserialize message serial {}: {}",
                    row.serial,
                    error
                );
                Ok(Some(Delivery {
                    serial: Some(row.serial),
                    body: MessageBody::Broken(BrokenMessage {
                        message_type: Some(row.type_name.clone()),
                        content_type: Some(row.content_type.clone()),
                        error,
                    }),
                    properties: row.headers.clone(),
                }))
            }
        }
    }

    async fn ack(&self, _delivery: &Delivery<M>) -> Result<(), Self::Error> {
        // Acknowledgement happened atomically at claim time.
        Ok(())
    }

    async fn reject(
        &self,
        delivery: Delivery<M>,
        error: Option<&(dyn std::error::Error + Send + Sync)>,
    ) -> Result<(), Self::Error> {
        let note = error.map(|e| e.to_string());
        let outcome = decide(&delivery.properties, &self.config.retry);

        match (outcome, delivery.serial) {
            (RejectOutcome::Retry { delay, attempt }, Some(serial)) => {
                let retry_at = Utc::now()
                    + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
                let mut data = self.data.lock().await;
                let row = data
                    .rows
                    .iter_mut()
                    .find(|r| r.serial == serial)
                    .ok_or(InMemoryBrokerError::UnknownSerial(serial))?;
                // Duplicate rejects must never regress the count.
                row.retry_count = row.retry_count.max(attempt);
                row.has_failed = true;
                row.retry_at = Some(retry_at);
                row.consumed_at = None;
                row.headers = delivery.properties;
                row.headers
                    .insert(keys::RETRY_COUNT.to_string(), row.retry_count.to_string());
                if let Some(note) = note {
                    row.headers.insert(keys::ERROR.to_string(), note);
                }
                Ok(())
            }
            (RejectOutcome::Retry { delay, attempt }, None) => {
                // Never persisted through this broker: re-dispatch as a brand
                // new row, preserving the message id if one is present.
                match delivery.body {
                    MessageBody::Intact(message) => {
                        let mut headers = delivery.properties;
                        headers.insert(keys::RETRY_COUNT.to_string(), attempt.to_string());
                        if let Some(note) = note {
                            headers.insert(keys::ERROR.to_string(), note);
                        }
                        let retry_at = Utc::now()
                            + ChronoDuration::from_std(delay)
                                .unwrap_or_else(|_| ChronoDuration::zero());
                        self.insert(&message, headers, attempt, Some(retry_at)).await
                    }
                    MessageBody::Broken(_) => {
                        log::warn!("dropping broken synthesized message on reject");
                        Ok(())
                    }
                }
            }
            (RejectOutcome::Exhausted | RejectOutcome::Fatal, Some(serial)) => {
                let mut data = self.data.lock().await;
                let row = data
                    .rows
                    .iter_mut()
                    .find(|r| r.serial == serial)
                    .ok_or(InMemoryBrokerError::UnknownSerial(serial))?;
                row.has_failed = true;
                if let Some(note) = note {
                    row.headers.insert(keys::ERROR.to_string(), note);
                }
                Ok(())
            }
            (RejectOutcome::Exhausted | RejectOutcome::Fatal, None) => {
                // Nothing persisted to mark.
                Ok(())
            }
        }
    }
}
