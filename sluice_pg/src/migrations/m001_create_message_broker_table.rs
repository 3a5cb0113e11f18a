//! Migration 001: Create the message broker queue table.
//!
//! One row per queued message. `serial` is the true ordering key and the
//! handle used by claim/reject operations; `id` is the logical message
//! identity and is not guaranteed stable across redispatch.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Creates the queue table backing the message broker.
pub struct CreateMessageBrokerTable;

#[async_trait]
impl Migration for CreateMessageBrokerTable {
    fn version(&self) -> i64 {
        1
    }

    fn name(&self) -> &'static str {
        "create_message_broker_table"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sluice_message_broker (
                id UUID NOT NULL,
                serial BIGSERIAL PRIMARY KEY,
                queue VARCHAR(255) NOT NULL DEFAULT 'default',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                consumed_at TIMESTAMPTZ,
                has_failed BOOLEAN NOT NULL DEFAULT FALSE,
                headers JSONB NOT NULL DEFAULT '{}'::jsonb,
                type VARCHAR(255),
                content_type VARCHAR(255),
                body BYTEA,
                retry_count INTEGER NOT NULL DEFAULT 0,
                retry_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
