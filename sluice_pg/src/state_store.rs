//! Postgres-backed projector state store.
//!
//! Every mutating operation is a single upsert keyed by the projector id,
//! which is what makes `lock` safe under concurrent workers: the claim is
//! decided inside one statement, with no read-then-write window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::state::{ProjectorState, ProjectorStateStore, StateStoreError};
use sqlx::{FromRow, PgPool};

#[derive(Debug, FromRow)]
struct PgStateRow {
    id: String,
    position: i64,
    event_date: Option<DateTime<Utc>>,
    locked: bool,
    error: bool,
    error_message: Option<String>,
}

impl From<PgStateRow> for ProjectorState {
    fn from(row: PgStateRow) -> Self {
        ProjectorState {
            id: row.id,
            position: row.position,
            event_date: row.event_date,
            locked: row.locked,
            error: row.error,
            error_message: row.error_message,
        }
    }
}

fn storage_error(e: sqlx::Error) -> StateStoreError {
    StateStoreError::Storage(Box::new(e))
}

/// A postgres based [`ProjectorStateStore`].
#[derive(Clone, Debug)]
pub struct PgProjectorStateStore {
    pool: PgPool,
}

impl PgProjectorStateStore {
    /// Creates a new `PgProjectorStateStore`.
    ///
    /// The schema is managed by [`crate::migrations::Migrator`]; run it
    /// before first use.
    pub fn new(pool: PgPool) -> Self {
        log::debug!("Creating a new PgProjectorStateStore");
        Self { pool }
    }
}

#[async_trait]
impl ProjectorStateStore for PgProjectorStateStore {
    async fn latest(&self, id: &str) -> Result<Option<ProjectorState>, StateStoreError> {
        let row: Option<PgStateRow> = sqlx::query_as(
            r#"
            SELECT id, "position", event_date, locked, error, error_message
            FROM sluice_projector_states
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(row.map(Into::into))
    }

    async fn lock(&self, id: &str) -> Result<ProjectorState, StateStoreError> {
        // The conditional upsert returns no row when the lock is already
        // held, which is the contention signal.
        let row: Option<PgStateRow> = sqlx::query_as(
            r#"
            INSERT INTO sluice_projector_states (id, locked)
            VALUES ($1, TRUE)
            ON CONFLICT (id) DO UPDATE
            SET locked = TRUE
            WHERE sluice_projector_states.locked = FALSE
            RETURNING id, "position", event_date, locked, error, error_message
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        row.map(Into::into)
            .ok_or_else(|| StateStoreError::AlreadyLocked(id.to_string()))
    }

    async fn update(
        &self,
        id: &str,
        position: i64,
        event_date: Option<DateTime<Utc>>,
        unlock: bool,
    ) -> Result<(), StateStoreError> {
        // GREATEST keeps the checkpoint monotonic whatever is written.
        sqlx::query(
            r#"
            INSERT INTO sluice_projector_states
                (id, "position", event_date, locked, error, error_message)
            VALUES ($1, $2, $3, FALSE, FALSE, NULL)
            ON CONFLICT (id) DO UPDATE
            SET "position" = GREATEST(sluice_projector_states."position", $2),
                event_date = CASE
                    WHEN $2 > sluice_projector_states."position" THEN $3
                    ELSE sluice_projector_states.event_date
                END,
                error = FALSE,
                error_message = NULL,
                locked = CASE WHEN $4 THEN FALSE ELSE sluice_projector_states.locked END
            "#,
        )
        .bind(id)
        .bind(position)
        .bind(event_date)
        .bind(unlock)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn exception(
        &self,
        id: &str,
        position: i64,
        event_date: Option<DateTime<Utc>>,
        message: &str,
        unlock: bool,
    ) -> Result<ProjectorState, StateStoreError> {
        let row: PgStateRow = sqlx::query_as(
            r#"
            INSERT INTO sluice_projector_states
                (id, "position", event_date, locked, error, error_message)
            VALUES ($1, $2, $3, FALSE, TRUE, $5)
            ON CONFLICT (id) DO UPDATE
            SET "position" = GREATEST(sluice_projector_states."position", $2),
                event_date = CASE
                    WHEN $2 > sluice_projector_states."position" THEN $3
                    ELSE sluice_projector_states.event_date
                END,
                error = TRUE,
                error_message = $5,
                locked = CASE WHEN $4 THEN FALSE ELSE sluice_projector_states.locked END
            RETURNING id, "position", event_date, locked, error, error_message
            "#,
        )
        .bind(id)
        .bind(position)
        .bind(event_date)
        .bind(unlock)
        .bind(message)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(row.into())
    }

    async fn remove(&self, id: &str) -> Result<(), StateStoreError> {
        sqlx::query(
            r#"
            DELETE FROM sluice_projector_states WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }
}
