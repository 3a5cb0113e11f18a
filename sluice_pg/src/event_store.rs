//! Postgres-backed append-only event store.

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sluice_core::envelope::Properties;
use sluice_core::event::{BoxedEventStream, EventStore, EventStoreError, StoredEvent};
use sqlx::{FromRow, PgPool};
use std::marker::PhantomData;

/// Database representation of a stored event.
#[derive(Debug, FromRow)]
struct PgDBEvent {
    position: i64,
    valid_at: DateTime<Utc>,
    payload: serde_json::Value,
    properties: serde_json::Value,
}

/// A postgres based event store.
///
/// Payloads are persisted as JSONB; `position` comes from the table's
/// sequence and is the stream's total order.
#[derive(Clone, Debug)]
pub struct PgEventStore<M> {
    pool: PgPool,
    _marker: PhantomData<fn() -> M>,
}

impl<M> PgEventStore<M> {
    /// Creates a new `PgEventStore`.
    ///
    /// The schema is managed by [`crate::migrations::Migrator`]; run it
    /// before first use.
    pub fn new(pool: PgPool) -> Self {
        log::debug!("Creating a new PgEventStore");
        Self {
            pool,
            _marker: PhantomData,
        }
    }
}

fn storage_error(e: sqlx::Error) -> EventStoreError {
    EventStoreError::Storage(Box::new(e))
}

fn decode_event<M: DeserializeOwned>(row: PgDBEvent) -> Result<StoredEvent<M>, EventStoreError> {
    let message: M =
        serde_json::from_value(row.payload).map_err(|e| EventStoreError::Corrupt {
            position: row.position,
            message: e.to_string(),
        })?;
    let properties: Properties =
        serde_json::from_value(row.properties).map_err(|e| EventStoreError::Corrupt {
            position: row.position,
            message: e.to_string(),
        })?;
    Ok(StoredEvent {
        position: row.position,
        valid_at: row.valid_at,
        message,
        properties,
    })
}

#[async_trait]
impl<M> EventStore<M> for PgEventStore<M>
where
    M: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn count_from(&self, from: Option<DateTime<Utc>>) -> Result<u64, EventStoreError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM sluice_events
            WHERE $1::timestamptz IS NULL OR valid_at >= $1
            "#,
        )
        .bind(from)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(count as u64)
    }

    async fn stream_from(
        &self,
        from: Option<DateTime<Utc>>,
    ) -> Result<BoxedEventStream<M>, EventStoreError> {
        let pool = self.pool.clone();
        let stream = try_stream! {
            let mut rows = sqlx::query_as::<_, PgDBEvent>(
                r#"
                SELECT "position", valid_at, payload, properties
                FROM sluice_events
                WHERE $1::timestamptz IS NULL OR valid_at >= $1
                ORDER BY "position" ASC
                "#,
            )
            .bind(from)
            .fetch(&pool);

            while let Some(row) = rows.next().await {
                let row = row.map_err(storage_error)?;
                let event = decode_event::<M>(row)?;
                yield event;
            }
        };

        Ok(Box::pin(stream))
    }

    async fn append(
        &self,
        message: M,
        properties: Properties,
    ) -> Result<StoredEvent<M>, EventStoreError> {
        let payload =
            serde_json::to_value(&message).map_err(|e| EventStoreError::Storage(Box::new(e)))?;
        let (position, valid_at): (i64, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO sluice_events (payload, properties)
            VALUES ($1, $2)
            RETURNING "position", valid_at
            "#,
        )
        .bind(payload)
        .bind(serde_json::to_value(&properties).unwrap_or_default())
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(StoredEvent {
            position,
            valid_at,
            message,
            properties,
        })
    }
}
