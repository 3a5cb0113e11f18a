//! An in-memory projector state store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::state::{ProjectorState, ProjectorStateStore, StateStoreError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// In-memory [`ProjectorStateStore`] implementation.
///
/// The single mutex stands in for the database's atomic upsert: lock
/// acquisition is check-and-set under it, so concurrent callers observe the
/// same contention behavior as against Postgres.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    states: Arc<Mutex<HashMap<String, ProjectorState>>>,
}

impl InMemoryStateStore {
    /// Creates an empty state store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a projector's state wholesale. Test helper for preparing
    /// locked or errored fixtures.
    pub async fn put(&self, state: ProjectorState) {
        let mut states = self.states.lock().await;
        states.insert(state.id.clone(), state);
    }
}

#[async_trait]
impl ProjectorStateStore for InMemoryStateStore {
    async fn latest(&self, id: &str) -> Result<Option<ProjectorState>, StateStoreError> {
        let states = self.states.lock().await;
        Ok(states.get(id).cloned())
    }

    async fn lock(&self, id: &str) -> Result<ProjectorState, StateStoreError> {
        let mut states = self.states.lock().await;
        let state = states
            .entry(id.to_string())
            .or_insert_with(|| ProjectorState::initial(id));
        if state.locked {
            return Err(StateStoreError::AlreadyLocked(id.to_string()));
        }
        state.locked = true;
        Ok(state.clone())
    }

    async fn update(
        &self,
        id: &str,
        position: i64,
        event_date: Option<DateTime<Utc>>,
        unlock: bool,
    ) -> Result<(), StateStoreError> {
        let mut states = self.states.lock().await;
        let state = states
            .entry(id.to_string())
            .or_insert_with(|| ProjectorState::initial(id));
        if position > state.position {
            state.position = position;
            state.event_date = event_date;
        }
        state.error = false;
        state.error_message = None;
        if unlock {
            state.locked = false;
        }
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
        let mut states = self.states.lock().await;
        let state = states
            .entry(id.to_string())
            .or_insert_with(|| ProjectorState::initial(id));
        if position > state.position {
            state.position = position;
            state.event_date = event_date;
        }
        state.error = true;
        state.error_message = Some(message.to_string());
        if unlock {
            state.locked = false;
        }
        Ok(state.clone())
    }

    async fn remove(&self, id: &str) -> Result<(), StateStoreError> {
        let mut states = self.states.lock().await;
        states.remove(id);
        Ok(())
    }
}
