//! Database migration system for sluice_pg.
//!
//! A simple, embedded migration system for managing PostgreSQL schema
//! changes. Migrations are versioned, checksummed, and tracked in the
//! database.
//!
//! # Usage
//!
//! ```rust,ignore
//! use sluice_pg::migrations::Migrator;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://...").await?;
//! let migrator = Migrator::new(pool);
//!
//! // Run all pending migrations
//! let applied = migrator.run().await?;
//! println!("Applied {} migrations", applied);
//! ```
//!
//! # Adding New Migrations
//!
//! 1. Create a new file `mXXX_description.rs` in this directory
//! 2. Implement the `Migration` trait
//! 3. Add the migration to the `MIGRATIONS` array in this file

mod m001_create_message_broker_table;
mod m002_create_events_table;
mod m003_create_projector_states_table;
mod m004_add_claim_index;

use m001_create_message_broker_table::CreateMessageBrokerTable;
use m002_create_events_table::CreateEventsTable;
use m003_create_projector_states_table::CreateProjectorStatesTable;
use m004_add_claim_index::AddClaimIndex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Row, Transaction};

/// All migrations in order. Add new migrations to the end.
///
/// The system is forward-only: there is no `down()`. The queue and event
/// tables are sources of truth that cannot be un-written, and projector
/// state can always be rebuilt by replay, so rollbacks buy little and risk
/// data loss. For development, use a fresh database instead.
const MIGRATIONS: &[&dyn Migration] = &[
    &CreateMessageBrokerTable,
    &CreateEventsTable,
    &CreateProjectorStatesTable,
    &AddClaimIndex,
];

/// Errors that can occur during migration operations.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A migration's checksum doesn't match what was previously applied.
    #[error("Migration {version} ({name}) checksum mismatch: expected {expected}, found {found}")]
    ChecksumMismatch {
        /// The version of the migration with mismatched checksum.
        version: i64,
        /// The name of the migration.
        name: String,
        /// The checksum that was expected (from the database).
        expected: String,
        /// The checksum that was found (from the code).
        found: String,
    },

    /// A migration failed to execute.
    #[error("Migration {version} ({name}) failed: {reason}")]
    MigrationFailed {
        /// The version of the migration that failed.
        version: i64,
        /// The name of the migration.
        name: String,
        /// The reason for the failure.
        reason: String,
    },
}

/// Represents a single database migration.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Unique version number (e.g., 1, 2, 3...).
    ///
    /// Must be unique across all migrations and should be sequential.
    fn version(&self) -> i64;

    /// Human-readable name (e.g., "create_events_table").
    fn name(&self) -> &'static str;

    /// Execute the migration within the provided transaction.
    ///
    /// The transaction is managed by the Migrator - do not commit or rollback.
    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError>;

    /// Returns the checksum of this migration for tamper detection.
    ///
    /// Default implementation computes SHA-256 of version + name.
    fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version().to_le_bytes());
        hasher.update(self.name().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Record of a migration that has been applied.
#[derive(Debug, Clone)]
pub struct AppliedMigration {
    /// The version number of the migration.
    pub version: i64,
    /// The human-readable name of the migration.
    pub name: String,
    /// When the migration was applied.
    pub applied_at: chrono::DateTime<chrono::Utc>,
    /// The checksum recorded when the migration was applied.
    pub checksum: String,
}

/// Handles database migrations for sluice_pg.
///
/// The migrator tracks applied migrations in the `_sluice_migrations` table
/// and ensures migrations are applied in order, exactly once.
#[derive(Debug, Clone)]
pub struct Migrator {
    pool: PgPool,
}

impl Migrator {
    /// Creates a new migrator with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Ensures the migration tracking table exists.
    async fn ensure_tracking_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _sluice_migrations (
                version BIGINT PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                checksum VARCHAR(64) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Runs all pending migrations.
    ///
    /// Each migration runs in its own transaction. If a migration fails,
    /// that transaction is rolled back but previously applied migrations
    /// remain committed.
    ///
    /// Returns the number of migrations applied.
    pub async fn run(&self) -> Result<usize, MigrationError> {
        self.ensure_tracking_table().await?;

        // Check for checksum mismatches first
        let applied = self.applied().await?;
        for applied_migration in &applied {
            if let Some(migration) = MIGRATIONS
                .iter()
                .find(|m| m.version() == applied_migration.version)
            {
                let current_checksum = migration.checksum();
                if current_checksum != applied_migration.checksum {
                    return Err(MigrationError::ChecksumMismatch {
                        version: applied_migration.version,
                        name: applied_migration.name.clone(),
                        expected: applied_migration.checksum.clone(),
                        found: current_checksum,
                    });
                }
            }
        }

        let applied_versions: std::collections::HashSet<i64> =
            applied.iter().map(|m| m.version).collect();

        let mut count = 0;
        for migration in MIGRATIONS {
            if applied_versions.contains(&migration.version()) {
                log::debug!(
                    "Skipping migration {} ({}): already applied",
                    migration.version(),
                    migration.name()
                );
                continue;
            }

            log::info!(
                "Running migration {} ({})...",
                migration.version(),
                migration.name()
            );

            let mut tx = self.pool.begin().await?;

            migration.up(&mut tx).await.map_err(|e| match e {
                MigrationError::Database(db_err) => MigrationError::MigrationFailed {
                    version: migration.version(),
                    name: migration.name().to_string(),
                    reason: db_err.to_string(),
                },
                other => other,
            })?;

            sqlx::query(
                r#"
                INSERT INTO _sluice_migrations (version, name, checksum)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(migration.version())
            .bind(migration.name())
            .bind(migration.checksum())
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            log::info!(
                "Migration {} ({}) applied successfully",
                migration.version(),
                migration.name()
            );
            count += 1;
        }

        Ok(count)
    }

    /// Returns the current migration version (0 if no migrations applied).
    pub async fn current_version(&self) -> Result<i64, MigrationError> {
        self.ensure_tracking_table().await?;

        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT version FROM _sluice_migrations
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(v,)| v).unwrap_or(0))
    }

    /// Returns list of all pending migrations.
    pub async fn pending(&self) -> Result<Vec<&'static dyn Migration>, MigrationError> {
        self.ensure_tracking_table().await?;

        let applied_versions: std::collections::HashSet<i64> =
            self.applied().await?.iter().map(|m| m.version).collect();

        Ok(MIGRATIONS
            .iter()
            .filter(|m| !applied_versions.contains(&m.version()))
            .copied()
            .collect())
    }

    /// Returns list of all applied migrations.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_tracking_table().await?;

        let rows = sqlx::query(
            r#"
            SELECT version, name, applied_at, checksum
            FROM _sluice_migrations
            ORDER BY version ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| AppliedMigration {
                version: row.get("version"),
                name: row.get("name"),
                applied_at: row.get("applied_at"),
                checksum: row.get("checksum"),
            })
            .collect())
    }
}
