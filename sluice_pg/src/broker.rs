//! Postgres-backed message broker.
//!
//! One table, one claim statement: the queue's at-most-one-claimant
//! guarantee comes from claiming and marking the row in a single
//! `UPDATE ... RETURNING` against the oldest claimable serial, with
//! `FOR UPDATE SKIP LOCKED` keeping concurrent claimants off each other's
//! rows without blocking.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sluice_core::broker::{BrokerConfig, Delivery, MessageBody, MessageBroker};
use sluice_core::envelope::{BrokenMessage, Envelope, Properties, keys};
use sluice_core::retry::{RejectOutcome, decide};
use sluice_core::serializer::{MessageSerializer, NameMapper, SerializationError};
use sqlx::{FromRow, PgPool};
use std::sync::Arc;
use uuid::Uuid;

/// Errors returned by the [`PgMessageBroker`].
#[derive(Debug, thiserror::Error)]
pub enum PgBrokerError {
    /// A database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// The message body could not be serialized at dispatch time.
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    /// The persisted headers column did not decode as a string map.
    #[error("corrupt headers on serial {serial}: {source}")]
    CorruptHeaders {
        /// The row whose headers failed to decode.
        serial: i64,
        /// The underlying decode error.
        #[source]
        source: serde_json::Error,
    },
    /// A reject referenced a serial that no longer exists.
    #[error("no queued row with serial {0}")]
    UnknownSerial(i64),
}

/// Database representation of a queued message.
#[derive(Debug, FromRow)]
struct PgMessageRow {
    serial: i64,
    headers: serde_json::Value,
    #[sqlx(rename = "type")]
    type_name: Option<String>,
    content_type: Option<String>,
    body: Option<Vec<u8>>,
}

/// A postgres based message broker.
#[derive(Clone)]
pub struct PgMessageBroker<M> {
    pool: PgPool,
    serializer: Arc<dyn MessageSerializer<M>>,
    names: Arc<dyn NameMapper<M>>,
    config: BrokerConfig,
}

impl<M> PgMessageBroker<M> {
    /// Creates a new `PgMessageBroker` over the given pool.
    ///
    /// The schema is managed by [`crate::migrations::Migrator`]; run it
    /// before first use.
    pub fn new(
        pool: PgPool,
        serializer: Arc<dyn MessageSerializer<M>>,
        names: Arc<dyn NameMapper<M>>,
        config: BrokerConfig,
    ) -> Self {
        log::debug!("Creating a new PgMessageBroker for queue '{}'", config.queue);
        Self {
            pool,
            serializer,
            names,
            config,
        }
    }

    /// Number of rows in this broker's queue carrying the has-failed marker,
    /// for operator introspection. The marker is historical: it stays set on
    /// rows that were retried and later succeeded, not only on dead-lettered
    /// ones.
    pub async fn failed_count(&self) -> Result<i64, PgBrokerError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM sluice_message_broker
            WHERE queue = $1 AND has_failed = TRUE
            "#,
        )
        .bind(&self.config.queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Rows in this broker's queue flagged has-failed, oldest first.
    ///
    /// Dead-lettered rows stay in place; this is the query operators use to
    /// inspect them, alongside rows whose earlier deliveries failed before
    /// a successful retry.
    pub async fn failed_messages(&self) -> Result<Vec<FailedMessage>, PgBrokerError> {
        let rows: Vec<PgFailedRow> = sqlx::query_as(
            r#"
            SELECT serial, id, headers, type, retry_count, created_at
            FROM sluice_message_broker
            WHERE queue = $1 AND has_failed = TRUE
            ORDER BY serial ASC
            "#,
        )
        .bind(&self.config.queue)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let headers = decode_headers(row.serial, row.headers)?;
                Ok(FailedMessage {
                    serial: row.serial,
                    id: row.id,
                    message_type: row.type_name,
                    error: headers.get(keys::ERROR).cloned(),
                    headers,
                    retry_count: row.retry_count as u32,
                    created_at: row.created_at,
                })
            })
            .collect()
    }

    async fn insert(
        &self,
        message: &M,
        mut headers: Properties,
        retry_count: u32,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), PgBrokerError> {
        let content_type = headers
            .get(keys::CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| self.config.content_type.clone());
        let body = self.serializer.serialize(message, &content_type)?;
        let type_name = self.names.name_for(message);

        let id = match headers.get(keys::MESSAGE_ID) {
            Some(existing) => Uuid::parse_str(existing).unwrap_or_else(|_| Uuid::new_v4()),
            None => Uuid::new_v4(),
        };
        headers.insert(keys::MESSAGE_ID.to_string(), id.to_string());
        headers.insert(keys::MESSAGE_TYPE.to_string(), type_name.clone());
        headers.insert(keys::CONTENT_TYPE.to_string(), content_type.clone());

        sqlx::query(
            r#"
            INSERT INTO sluice_message_broker
                (id, queue, headers, type, content_type, body, retry_count, retry_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(id)
        .bind(&self.config.queue)
        .bind(serde_json::to_value(&headers).unwrap_or_default())
        .bind(&type_name)
        .bind(&content_type)
        .bind(&body)
        .bind(retry_count as i32)
        .bind(retry_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn decode_headers(serial: i64, value: serde_json::Value) -> Result<Properties, PgBrokerError> {
    serde_json::from_value(value).map_err(|source| PgBrokerError::CorruptHeaders { serial, source })
}

/// A dead-lettered row as seen by operators.
#[derive(Debug, Clone)]
pub struct FailedMessage {
    /// Storage ordering key of the failed row.
    pub serial: i64,
    /// Logical message id.
    pub id: Uuid,
    /// Persisted logical type name, if any.
    pub message_type: Option<String>,
    /// Failure note recorded on the headers, if any.
    pub error: Option<String>,
    /// The full persisted header bag.
    pub headers: Properties,
    /// Retry attempts recorded before the row was dead-lettered.
    pub retry_count: u32,
    /// When the row was first enqueued.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct PgFailedRow {
    serial: i64,
    id: Uuid,
    headers: serde_json::Value,
    #[sqlx(rename = "type")]
    type_name: Option<String>,
    retry_count: i32,
    created_at: DateTime<Utc>,
}

#[async_trait]
impl<M> MessageBroker<M> for PgMessageBroker<M>
where
    M: Send + Sync,
{
    type Error = PgBrokerError;

    async fn dispatch(&self, envelope: Envelope<M>) -> Result<(), Self::Error> {
        let (message, mut properties) = envelope.into_parts();
        // A resend must never collide with a previous delivery's identity.
        properties.remove(keys::MESSAGE_ID);
        self.insert(&message, properties, 0, None).await
    }

    async fn get(&self) -> Result<Option<Delivery<M>>, Self::Error> {
        let row: Option<PgMessageRow> = sqlx::query_as(
            r#"
            UPDATE sluice_message_broker
            SET consumed_at = NOW()
            WHERE serial = (
                SELECT serial FROM sluice_message_broker
                WHERE queue = $1
                  AND consumed_at IS NULL
                  AND (retry_at IS NULL OR retry_at <= NOW())
                ORDER BY serial ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING serial, headers, type, content_type, body
            "#,
        )
        .bind(&self.config.queue)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut headers = decode_headers(row.serial, row.headers)?;

        match self.serializer.deserialize(
            row.type_name.as_deref().unwrap_or_default(),
            row.content_type.as_deref().unwrap_or_default(),
            row.body.as_deref().unwrap_or_default(),
        ) {
            Ok(message) => Ok(Some(Delivery {
                serial: Some(row.serial),
                body: MessageBody::Intact(message),
                properties: headers,
            })),
            Err(e) => {
                // Corrupt payloads must not stall the consumer loop: the row
                // is dead-lettered on the spot and surfaced as Broken.
                let error = e.to_string();
                headers.insert(keys::ERROR.to_string(), error.clone());
                log::warn!(
                    "failed to deserialize message serial {}: {}",
                    row.serial,
                    error
                );
                sqlx::query(
                    r#"
                    UPDATE sluice_message_broker
                    SET has_failed = TRUE, headers = $2
                    WHERE serial = $1
                    "#,
                )
                .bind(row.serial)
                .bind(serde_json::to_value(&headers).unwrap_or_default())
                .execute(&self.pool)
                .await?;

                Ok(Some(Delivery {
                    serial: Some(row.serial),
                    body: MessageBody::Broken(BrokenMessage {
                        message_type: row.type_name,
                        content_type: row.content_type,
                        error,
                    }),
                    properties: headers,
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
                let mut headers = delivery.properties;
                if let Some(note) = note {
                    headers.insert(keys::ERROR.to_string(), note);
                }
                let retry_at = Utc::now()
                    + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());

                // `GREATEST` guards duplicate rejects from regressing the
                // count; jsonb_set keeps the persisted headers in step with
                // the column in the same statement.
                let updated = sqlx::query(
                    r#"
                    UPDATE sluice_message_broker
                    SET consumed_at = NULL,
                        has_failed = TRUE,
                        retry_at = $2,
                        retry_count = GREATEST(retry_count, $3),
                        headers = jsonb_set(
                            $4::jsonb,
                            '{retry_count}',
                            to_jsonb(GREATEST(retry_count, $3)::text)
                        )
                    WHERE serial = $1
                    "#,
                )
                .bind(serial)
                .bind(retry_at)
                .bind(attempt as i32)
                .bind(serde_json::to_value(&headers).unwrap_or_default())
                .execute(&self.pool)
                .await?;

                if updated.rows_affected() == 0 {
                    return Err(PgBrokerError::UnknownSerial(serial));
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
                let mut headers = delivery.properties;
                if let Some(note) = note {
                    headers.insert(keys::ERROR.to_string(), note);
                }
                let updated = sqlx::query(
                    r#"
                    UPDATE sluice_message_broker
                    SET has_failed = TRUE, headers = $2
                    WHERE serial = $1
                    "#,
                )
                .bind(serial)
                .bind(serde_json::to_value(&headers).unwrap_or_default())
                .execute(&self.pool)
                .await?;

                if updated.rows_affected() == 0 {
                    return Err(PgBrokerError::UnknownSerial(serial));
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
