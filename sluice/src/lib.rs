//! # Sluice
//!
//! A transactional message broker and event-sourced projector runtime over
//! a relational database. This facade crate re-exports the core contracts
//! and, behind feature flags, the storage backends:
//!
//! - `in-memory`: the [`mem`] backends for testing and development.
//! - `postgres`: the [`pg`] backends for production use.

#![deny(missing_docs)]

pub use sluice_core::*;

#[cfg(feature = "in-memory")]
/// In-memory storage backends.
pub mod mem {
    //! Re-exports of the `sluice_mem` crate.
    pub use sluice_mem::*;
}

#[cfg(feature = "postgres")]
/// PostgreSQL storage backends.
pub mod pg {
    //! Re-exports of the `sluice_pg` crate.
    pub use sluice_pg::*;
}

pub mod prelude {
    //! The prelude module for the `sluice` crate.
    pub use sluice_core::prelude::*;

    #[cfg(feature = "in-memory")]
    pub use super::mem::*;
    #[cfg(feature = "postgres")]
    pub use super::pg::*;
}
