//! Projector state: the externally tracked checkpoint, lock and error flags
//! for each projector, and the store that is their single source of truth.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Per-projector progress and coordination state.
///
/// `position` is a monotonic high-water mark: the store never moves it
/// backward, whatever is written.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectorState {
    /// The projector identifier this state belongs to.
    pub id: String,
    /// Position of the last event processed (or last attempted, after an
    /// error). Zero means the projector has never run.
    pub position: i64,
    /// Date of the event at `position`.
    pub event_date: Option<DateTime<Utc>>,
    /// Whether a worker currently holds exclusive replay rights.
    pub locked: bool,
    /// Whether the last run ended in an error. Sticky until a successful
    /// update or an explicit reset.
    pub error: bool,
    /// Message describing the last error, if any.
    pub error_message: Option<String>,
}

impl ProjectorState {
    /// The implicit state of a projector that has never run: position zero,
    /// unlocked, no error.
    pub fn initial(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            position: 0,
            event_date: None,
            locked: false,
            error: false,
            error_message: None,
        }
    }

    /// Whether the projector has processed at least one event.
    pub fn has_run(&self) -> bool {
        self.position >= 1
    }
}

/// Errors raised by the projector state store.
///
/// Lock contention is a distinct, catchable condition: the worker treats it
/// as "skip this projector, continue with the rest".
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    /// Another worker holds the lock for this projector.
    #[error("projector '{0}' is already locked")]
    AlreadyLocked(String),
    /// The underlying storage failed.
    #[error("state storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Persistence for [`ProjectorState`].
///
/// `lock` must be a single atomic claim against the backend — no
/// read-then-write window — with the same contention contract as the
/// broker's claim statement.
#[async_trait]
pub trait ProjectorStateStore: Send + Sync {
    /// Reads the current state, or `None` if the projector has never run.
    async fn latest(&self, id: &str) -> Result<Option<ProjectorState>, StateStoreError>;

    /// Atomically claims exclusive replay rights for a projector, creating
    /// its state if absent. Fails with [`StateStoreError::AlreadyLocked`]
    /// when another lock is outstanding.
    async fn lock(&self, id: &str) -> Result<ProjectorState, StateStoreError>;

    /// Advances the checkpoint to the given event, clears any error flag and
    /// releases the lock if `unlock` is set. Never moves the position
    /// backward.
    async fn update(
        &self,
        id: &str,
        position: i64,
        event_date: Option<DateTime<Utc>>,
        unlock: bool,
    ) -> Result<(), StateStoreError>;

    /// Records an error at the given (last-attempted) position, releases the
    /// lock if `unlock` is set, and returns the updated state. Never moves
    /// the position backward.
    async fn exception(
        &self,
        id: &str,
        position: i64,
        event_date: Option<DateTime<Utc>>,
        message: &str,
        unlock: bool,
    ) -> Result<ProjectorState, StateStoreError>;

    /// Deletes the state row entirely, returning the projector to its
    /// implicit "never ran" state. Used after a projector reset.
    async fn remove(&self, id: &str) -> Result<(), StateStoreError>;
}
