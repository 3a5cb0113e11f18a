//! The replay orchestrator: drives one or many projectors through the
//! ordered event stream with per-projector locking, checkpointing and
//! failure containment.

use crate::event::{EventStore, EventStoreError, StoredEvent};
use crate::projector::{ProjectorEntry, ProjectorRegistry};
use crate::state::{ProjectorStateStore, StateStoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use log::{info, warn};
use std::sync::Arc;

/// Progress notifications emitted while a replay runs, suitable for progress
/// bars and logging surfaces.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayProgress {
    /// A replay started over `total` events.
    Began {
        /// Number of events the stream will yield.
        total: u64,
    },
    /// One event was dispatched to the working set.
    Advanced {
        /// 1-based index of the event within this run.
        index: u64,
        /// Number of events the stream will yield.
        total: u64,
        /// Position of the event just processed.
        position: i64,
    },
    /// A projector raised from its event handler and was stopped for the
    /// remainder of the run.
    ProjectorFailed {
        /// The failing projector's identifier.
        id: String,
        /// Position of the event that failed.
        position: i64,
        /// Human-readable error description.
        message: String,
    },
    /// Every projector in the working set has stopped; the stream was
    /// abandoned early.
    Broken {
        /// Index of the last event dispatched.
        index: u64,
        /// Number of events the stream would have yielded.
        total: u64,
    },
    /// The replay finished.
    Finished {
        /// Number of events dispatched.
        processed: u64,
        /// Number of events the stream yielded in total.
        total: u64,
    },
}

/// Observer attachment point for [`ReplayProgress`] notifications.
#[async_trait]
pub trait ReplayObserver: Send + Sync {
    /// Called for every progress notification, in order.
    async fn on_progress(&self, progress: &ReplayProgress);
}

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Include projectors whose state is an error state in new runs. When
    /// `false` (the default), errored projectors are skipped until their
    /// state is repaired.
    pub continue_on_error: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            continue_on_error: false,
        }
    }
}

/// Errors raised synchronously by the worker's entry points.
///
/// These indicate misconfiguration, not transient conditions, and are never
/// retried internally. Projector callback failures are *not* represented
/// here — they are contained and persisted as error state instead.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The registry holds no projectors at all.
    #[error("no projectors registered")]
    NoProjectorsRegistered,
    /// Every candidate was locked or in an error state; nothing to do.
    #[error("no projectors available to play")]
    NoProjectorsAvailable,
    /// The requested projector id is not registered.
    #[error("unknown projector '{0}'")]
    UnknownProjector(String),
    /// The projector was not registered as replayable.
    #[error("projector '{0}' is not replayable")]
    NotReplayable(String),
    /// A projector's own reset hook failed.
    #[error("reset of projector '{id}' failed: {source}")]
    ResetFailed {
        /// The projector whose reset failed.
        id: String,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The state store failed.
    #[error(transparent)]
    StateStore(#[from] StateStoreError),
    /// The event store failed.
    #[error(transparent)]
    EventStore(#[from] EventStoreError),
}

/// Outcome summary of a replay run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Number of events the stream yielded.
    pub events: u64,
    /// Size of the working set that took part in the run.
    pub projectors: usize,
}

/// One projector taking part in a run.
struct ActiveProjector {
    entry_index: usize,
    /// Highest position already applied, from the locked state.
    baseline: i64,
    baseline_date: Option<DateTime<Utc>>,
    /// Last event applied during this run; persisted at finalization.
    last_seen: Option<(i64, DateTime<Utc>)>,
    stopped: bool,
}

enum Target<'a> {
    One(&'a str),
    All,
}

/// Replays the event stream across registered projectors.
///
/// One projector's exception or lock contention never halts the others: lock
/// conflicts are skipped with a log line, handler exceptions are persisted as
/// that projector's error state and the run continues.
pub struct Worker<M, E, S> {
    registry: Arc<ProjectorRegistry<M>>,
    events: E,
    states: S,
    config: WorkerConfig,
    observers: Vec<Arc<dyn ReplayObserver>>,
}

impl<M, E, S> Worker<M, E, S>
where
    M: Send + Sync,
    E: EventStore<M>,
    S: ProjectorStateStore,
{
    /// Creates a worker over the given registry and stores with default
    /// configuration.
    pub fn new(registry: Arc<ProjectorRegistry<M>>, events: E, states: S) -> Self {
        Self {
            registry,
            events,
            states,
            config: WorkerConfig::default(),
            observers: Vec::new(),
        }
    }

    /// Replaces the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a progress observer.
    pub fn add_observer(&mut self, observer: Arc<dyn ReplayObserver>) {
        self.observers.push(observer);
    }

    /// Plays a single projector from its own checkpoint.
    pub async fn play(&self, id: &str) -> Result<ReplaySummary, WorkerError> {
        self.run(Target::One(id), None).await
    }

    /// Plays a single projector from an explicit start date.
    pub async fn play_from(
        &self,
        id: &str,
        from: DateTime<Utc>,
    ) -> Result<ReplaySummary, WorkerError> {
        self.run(Target::One(id), Some(from)).await
    }

    /// Plays every registered projector from the collective lower bound of
    /// their checkpoints. Batch replay includes projectors excluded from
    /// live dispatch.
    pub async fn play_all(&self) -> Result<ReplaySummary, WorkerError> {
        self.run(Target::All, None).await
    }

    /// Plays every registered projector from an explicit start date.
    pub async fn play_all_from(&self, from: DateTime<Utc>) -> Result<ReplaySummary, WorkerError> {
        self.run(Target::All, Some(from)).await
    }

    /// Invokes the projector's own reset hook.
    ///
    /// Fails with [`WorkerError::NotReplayable`] when the projector was not
    /// registered as replayable. The state-store row is not touched here;
    /// callers that want the checkpoint cleared as well use
    /// [`ProjectorStateStore::remove`].
    pub async fn reset(&self, id: &str) -> Result<(), WorkerError> {
        let entry = self
            .registry
            .get(id)
            .ok_or_else(|| WorkerError::UnknownProjector(id.to_string()))?;
        if !entry.capabilities.replayable {
            return Err(WorkerError::NotReplayable(id.to_string()));
        }
        entry
            .projector
            .reset()
            .await
            .map_err(|source| WorkerError::ResetFailed {
                id: id.to_string(),
                source,
            })
    }

    /// Best-effort reset of every replayable projector. Non-replayable
    /// projectors are skipped silently; individual reset failures are
    /// logged and do not abort the rest.
    pub async fn reset_all(&self) -> Result<(), WorkerError> {
        for entry in self.registry.iter() {
            if !entry.capabilities.replayable {
                continue;
            }
            if let Err(e) = entry.projector.reset().await {
                warn!("reset of projector '{}' failed: {}", entry.id(), e);
            }
        }
        Ok(())
    }

    async fn emit(&self, progress: ReplayProgress) {
        for observer in &self.observers {
            observer.on_progress(&progress).await;
        }
    }

    /// Builds the working set: lock each candidate, skipping locked and
    /// (unless configured otherwise) errored projectors.
    async fn working_set(
        &self,
        candidates: Vec<(usize, &ProjectorEntry<M>)>,
    ) -> Result<Vec<ActiveProjector>, WorkerError> {
        let mut set = Vec::new();
        for (entry_index, entry) in candidates {
            let id = entry.id();

            // Error check happens before locking so a skipped projector's
            // sticky error state is never disturbed by a lock/unlock cycle.
            if !self.config.continue_on_error {
                if let Some(state) = self.states.latest(id).await? {
                    if state.error {
                        info!("skipping projector '{}': in error state", id);
                        continue;
                    }
                }
            }

            let state = match self.states.lock(id).await {
                Ok(state) => state,
                Err(StateStoreError::AlreadyLocked(_)) => {
                    info!("skipping projector '{}': locked by another worker", id);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            set.push(ActiveProjector {
                entry_index,
                baseline: state.position,
                baseline_date: state.event_date,
                last_seen: None,
                stopped: false,
            });
        }
        Ok(set)
    }

    /// The earliest date to replay from: the minimum checkpoint date across
    /// the working set. Collapses to "from the beginning" when any member
    /// has never run, because that member needs everything.
    fn lower_bound(set: &[ActiveProjector]) -> Option<DateTime<Utc>> {
        let mut bound: Option<DateTime<Utc>> = None;
        for active in set {
            if active.baseline < 1 {
                return None;
            }
            match (active.baseline_date, bound) {
                (None, _) => return None,
                (Some(date), None) => bound = Some(date),
                (Some(date), Some(current)) if date < current => bound = Some(date),
                _ => {}
            }
        }
        bound
    }

    async fn run(
        &self,
        target: Target<'_>,
        from: Option<DateTime<Utc>>,
    ) -> Result<ReplaySummary, WorkerError> {
        if self.registry.is_empty() {
            return Err(WorkerError::NoProjectorsRegistered);
        }

        let entries: Vec<&ProjectorEntry<M>> = self.registry.iter().collect();
        let candidates: Vec<(usize, &ProjectorEntry<M>)> = match target {
            Target::One(id) => {
                let index = entries
                    .iter()
                    .position(|e| e.id() == id)
                    .ok_or_else(|| WorkerError::UnknownProjector(id.to_string()))?;
                vec![(index, entries[index])]
            }
            Target::All => entries.iter().copied().enumerate().collect(),
        };

        let mut set = self.working_set(candidates).await?;
        if set.is_empty() {
            return Err(WorkerError::NoProjectorsAvailable);
        }

        let start = from.or_else(|| Self::lower_bound(&set));

        // The locks taken above are persisted rows with no lease; a storage
        // error escaping with them still held would wedge those projectors
        // for every later run.
        match self.replay(&mut set, &entries, start).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                self.release_locks(&set, &entries).await;
                Err(e)
            }
        }
    }

    /// The streaming phase of a run: counting, dispatching, finalization.
    /// Callers own the working set's locks and release them if this fails.
    async fn replay(
        &self,
        set: &mut [ActiveProjector],
        entries: &[&ProjectorEntry<M>],
        start: Option<DateTime<Utc>>,
    ) -> Result<ReplaySummary, WorkerError> {
        let total = self.events.count_from(start).await?;
        self.emit(ReplayProgress::Began { total }).await;

        let mut stream = self.events.stream_from(start).await?;
        let mut index: u64 = 0;

        while let Some(item) = stream.next().await {
            let event = item?;
            index += 1;

            self.dispatch_one(&event, set, entries).await?;
            self.emit(ReplayProgress::Advanced {
                index,
                total,
                position: event.position,
            })
            .await;

            if set.iter().all(|a| a.stopped) {
                self.emit(ReplayProgress::Broken { index, total }).await;
                drop(stream);
                return Ok(ReplaySummary {
                    events: index,
                    projectors: set.len(),
                });
            }
        }
        drop(stream);

        // Checkpoint writes are deferred to end-of-run; a projector that saw
        // nothing new is finalized at its baseline so its lock is released
        // through the same path.
        for active in set.iter().filter(|a| !a.stopped) {
            let id = entries[active.entry_index].id();
            match active.last_seen {
                Some((position, date)) => {
                    self.states.update(id, position, Some(date), true).await?;
                }
                None => {
                    self.states
                        .update(id, active.baseline, active.baseline_date, true)
                        .await?;
                }
            }
        }

        self.emit(ReplayProgress::Finished {
            processed: index,
            total,
        })
        .await;

        Ok(ReplaySummary {
            events: index,
            projectors: set.len(),
        })
    }

    /// Dispatches one event to every still-active member of the working set.
    async fn dispatch_one(
        &self,
        event: &StoredEvent<M>,
        set: &mut [ActiveProjector],
        entries: &[&ProjectorEntry<M>],
    ) -> Result<(), WorkerError> {
        for active in set.iter_mut().filter(|a| !a.stopped) {
            let seen = active.last_seen.map(|(p, _)| p).unwrap_or(active.baseline);
            if event.position <= seen {
                // Idempotent re-entry guard: already applied, stays active.
                continue;
            }

            let entry = entries[active.entry_index];
            match entry.projector.on_event(event).await {
                Ok(()) => {
                    active.last_seen = Some((event.position, event.valid_at));
                }
                Err(e) => {
                    let message = format!("event at position {} failed: {}", event.position, e);
                    warn!("projector '{}': {}", entry.id(), message);
                    active.stopped = true;
                    // The checkpoint stays at the last success so a later run
                    // re-attempts the failing event.
                    let (position, date) = active
                        .last_seen
                        .map(|(p, d)| (p, Some(d)))
                        .unwrap_or((active.baseline, active.baseline_date));
                    self.states
                        .exception(entry.id(), position, date, &message, true)
                        .await?;
                    self.emit(ReplayProgress::ProjectorFailed {
                        id: entry.id().to_string(),
                        position: event.position,
                        message,
                    })
                    .await;
                }
            }
        }
        Ok(())
    }

    /// Best-effort release of the working set's locks after a failed run.
    ///
    /// Progress made before the failure is kept: each member is finalized at
    /// its last applied position, or its baseline when it saw nothing.
    /// Stopped members already released their lock when their error state was
    /// persisted. Secondary failures are logged, not propagated; the original
    /// error is what the caller needs to see.
    async fn release_locks(&self, set: &[ActiveProjector], entries: &[&ProjectorEntry<M>]) {
        for active in set.iter().filter(|a| !a.stopped) {
            let id = entries[active.entry_index].id();
            let (position, date) = active
                .last_seen
                .map(|(p, d)| (p, Some(d)))
                .unwrap_or((active.baseline, active.baseline_date));
            if let Err(e) = self.states.update(id, position, date, true).await {
                warn!("failed to release lock on projector '{}': {}", id, e);
            }
        }
    }
}
