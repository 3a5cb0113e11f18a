//! Migration 003: Create the projector states table.
//!
//! One row per projector: its checkpoint, lock flag and error state. The
//! projector identifier is the primary key, which makes every mutating
//! statement single-row atomic.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Creates the per-projector state table.
pub struct CreateProjectorStatesTable;

#[async_trait]
impl Migration for CreateProjectorStatesTable {
    fn version(&self) -> i64 {
        3
    }

    fn name(&self) -> &'static str {
        "create_projector_states_table"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sluice_projector_states (
                id VARCHAR(255) PRIMARY KEY,
                "position" BIGINT NOT NULL DEFAULT 0,
                event_date TIMESTAMPTZ,
                locked BOOLEAN NOT NULL DEFAULT FALSE,
                error BOOLEAN NOT NULL DEFAULT FALSE,
                error_message TEXT
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
