//! Projectors and their registry.
//!
//! A projector is a named, idempotent consumer of events whose progress is
//! tracked externally (see [`crate::state`]). Capabilities — whether a
//! projector can be reset, and whether it participates in live dispatch —
//! are declared on the registration record, not discovered at runtime.

use crate::event::StoredEvent;
use async_trait::async_trait;
use std::sync::Arc;

/// A consumer that folds events into a derived read model.
///
/// Implementations must tolerate redelivery of events at or below their
/// recorded position; the runtime guards against it but the guarantee is
/// at-least-once.
#[async_trait]
pub trait Projector<M>: Send + Sync {
    /// Stable identifier, unique within the registry. Used as the state
    /// store key.
    fn id(&self) -> &str;

    /// Applies a single event to the read model.
    async fn on_event(
        &self,
        event: &StoredEvent<M>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Drops the derived read model so it can be rebuilt from scratch.
    ///
    /// Only invoked when the projector was registered as replayable; the
    /// default implementation does nothing.
    async fn reset(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

/// Capability flags declared at registration time.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// The projector supports [`Projector::reset`] and may be replayed from
    /// the beginning.
    pub replayable: bool,
    /// The projector receives freshly stored events through the live
    /// dispatch path. Batch replay always includes it regardless.
    pub live: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            replayable: true,
            live: true,
        }
    }
}

impl Capabilities {
    /// A projector excluded from live dispatch, only played in batch.
    pub fn batch_only() -> Self {
        Self {
            replayable: true,
            live: false,
        }
    }
}

/// A registered projector together with its capability flags.
pub struct ProjectorEntry<M> {
    /// The projector itself.
    pub projector: Arc<dyn Projector<M>>,
    /// Its declared capabilities.
    pub capabilities: Capabilities,
}

impl<M> ProjectorEntry<M> {
    /// Shorthand for the projector's identifier.
    pub fn id(&self) -> &str {
        self.projector.id()
    }
}

/// Error raised when registering a projector.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A projector with the same identifier is already registered.
    #[error("projector '{0}' is already registered")]
    DuplicateProjector(String),
}

/// Explicitly constructed collection of projectors, built once at startup
/// and passed by reference to the runtime. There is no ambient global
/// registry.
pub struct ProjectorRegistry<M> {
    entries: Vec<ProjectorEntry<M>>,
}

impl<M> Default for ProjectorRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> ProjectorRegistry<M> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers a projector with the given capabilities.
    pub fn register(
        &mut self,
        projector: Arc<dyn Projector<M>>,
        capabilities: Capabilities,
    ) -> Result<(), RegistryError> {
        let id = projector.id().to_string();
        if self.entries.iter().any(|e| e.id() == id) {
            return Err(RegistryError::DuplicateProjector(id));
        }
        self.entries.push(ProjectorEntry {
            projector,
            capabilities,
        });
        Ok(())
    }

    /// Looks up a projector by identifier.
    pub fn get(&self, id: &str) -> Option<&ProjectorEntry<M>> {
        self.entries.iter().find(|e| e.id() == id)
    }

    /// All registered projectors, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ProjectorEntry<M>> {
        self.entries.iter()
    }

    /// The projectors participating in live dispatch.
    pub fn live(&self) -> impl Iterator<Item = &ProjectorEntry<M>> {
        self.entries.iter().filter(|e| e.capabilities.live)
    }

    /// Whether the registry holds no projectors.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of registered projectors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopProjector {
        id: String,
    }

    #[async_trait]
    impl Projector<String> for NoopProjector {
        fn id(&self) -> &str {
            &self.id
        }

        async fn on_event(
            &self,
            _event: &StoredEvent<String>,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
    }

    fn projector(id: &str) -> Arc<dyn Projector<String>> {
        Arc::new(NoopProjector { id: id.to_string() })
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut registry = ProjectorRegistry::new();
        registry
            .register(projector("orders"), Capabilities::default())
            .unwrap();

        let result = registry.register(projector("orders"), Capabilities::default());
        assert!(matches!(result, Err(RegistryError::DuplicateProjector(id)) if id == "orders"));
    }

    #[test]
    fn live_filter_excludes_batch_only_entries() {
        let mut registry = ProjectorRegistry::new();
        registry
            .register(projector("live"), Capabilities::default())
            .unwrap();
        registry
            .register(projector("batch"), Capabilities::batch_only())
            .unwrap();

        let live: Vec<&str> = registry.live().map(|e| e.id()).collect();
        assert_eq!(live, vec!["live"]);
        assert_eq!(registry.len(), 2);
    }
}
