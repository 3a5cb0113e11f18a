//! Migration 004: Add a partial index covering the claim predicate.
//!
//! The claim statement scans for the oldest unconsumed row in a queue; a
//! partial index on `(queue, serial)` restricted to unconsumed rows keeps
//! that scan cheap however large the consumed backlog grows.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Adds the partial claim index on the message broker table.
pub struct AddClaimIndex;

#[async_trait]
impl Migration for AddClaimIndex {
    fn version(&self) -> i64 {
        4
    }

    fn name(&self) -> &'static str {
        "add_claim_index"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sluice_message_broker_claim
            ON sluice_message_broker (queue, serial)
            WHERE consumed_at IS NULL
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
