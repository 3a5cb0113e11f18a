//! # Sluice postgres backends
//!
//! PostgreSQL implementations of sluice's storage contracts. The broker's
//! claim and the state store's lock are each a single atomic statement, so
//! any number of processes can poll the same database safely.

#![deny(missing_docs)]

/// The message broker implementation for postgres
pub mod broker;

/// The event store implementation for postgres
pub mod event_store;

/// Database migrations for sluice_pg schema management
pub mod migrations;

/// The projector state store implementation for postgres
pub mod state_store;

pub use broker::{FailedMessage, PgBrokerError, PgMessageBroker};
pub use event_store::PgEventStore;
pub use migrations::{AppliedMigration, Migration, MigrationError, Migrator};
pub use state_store::PgProjectorStateStore;
