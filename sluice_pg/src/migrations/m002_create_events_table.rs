//! Migration 002: Create the append-only events table.
//!
//! `position` comes from a sequence and totally orders the stream; rows are
//! never updated or deleted.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Creates the events table read by the projector runtime.
pub struct CreateEventsTable;

#[async_trait]
impl Migration for CreateEventsTable {
    fn version(&self) -> i64 {
        2
    }

    fn name(&self) -> &'static str {
        "create_events_table"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sluice_events (
                "position" BIGSERIAL PRIMARY KEY,
                valid_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                payload JSONB NOT NULL,
                properties JSONB NOT NULL DEFAULT '{}'::jsonb
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sluice_events_valid_at
            ON sluice_events (valid_at)
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
