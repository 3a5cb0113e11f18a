//! Live single-event dispatch: applies a freshly stored event to every
//! projector registered for live delivery, without the batch worker's
//! locking protocol.

use crate::event::StoredEvent;
use crate::projector::ProjectorRegistry;
use crate::state::{ProjectorStateStore, StateStoreError};
use log::warn;
use std::sync::Arc;

/// Pushes individual events to live projectors as they are stored.
///
/// Unlike the replay [`Worker`](crate::worker::Worker), the dispatcher never
/// takes the projector lock; all state writes pass `unlock = false` so a
/// concurrently running batch replay keeps its lock untouched. The same
/// containment contract applies: one projector's failure is recorded as its
/// error state and never stops delivery to the others.
pub struct LiveDispatcher<M, S> {
    registry: Arc<ProjectorRegistry<M>>,
    states: S,
}

impl<M, S> LiveDispatcher<M, S>
where
    M: Send + Sync,
    S: ProjectorStateStore,
{
    /// Creates a dispatcher over the given registry and state store.
    pub fn new(registry: Arc<ProjectorRegistry<M>>, states: S) -> Self {
        Self { registry, states }
    }

    /// Applies one stored event to every live projector whose checkpoint is
    /// behind it. Projectors at or past the event's position are skipped
    /// silently.
    ///
    /// Errored projectors are also skipped: an error state is sticky and only
    /// clears on a successful checkpoint update, so pushing further events at
    /// a projector that already failed would apply them out of order once it
    /// is repaired. It catches up through a batch replay instead.
    pub async fn dispatch(&self, event: &StoredEvent<M>) -> Result<(), StateStoreError> {
        for entry in self.registry.live() {
            let id = entry.id();

            let state = self.states.latest(id).await?;
            if let Some(state) = &state {
                if state.error {
                    continue;
                }
                if state.position >= event.position {
                    continue;
                }
            }

            match entry.projector.on_event(event).await {
                Ok(()) => {
                    self.states
                        .update(id, event.position, Some(event.valid_at), false)
                        .await?;
                }
                Err(e) => {
                    let message = format!("event at position {} failed: {}", event.position, e);
                    warn!("live dispatch to projector '{}': {}", id, message);
                    // The checkpoint stays where it was so the event can be
                    // re-attempted by a batch replay.
                    let (position, date) = state
                        .as_ref()
                        .map(|s| (s.position, s.event_date))
                        .unwrap_or((0, None));
                    self.states
                        .exception(id, position, date, &message, false)
                        .await?;
                }
            }
        }
        Ok(())
    }
}
