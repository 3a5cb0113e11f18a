use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::envelope::Properties;
use sluice_core::event::{BoxedEventStream, EventStore, EventStoreError, StoredEvent};
use sluice_core::live::LiveDispatcher;
use sluice_core::projector::{Capabilities, Projector, ProjectorRegistry};
use sluice_core::state::{ProjectorState, ProjectorStateStore};
use sluice_core::worker::{ReplayObserver, ReplayProgress, Worker, WorkerConfig, WorkerError};
use sluice_mem::{InMemoryEventStore, InMemoryStateStore};
use std::sync::{Arc, Mutex};

type TestEvent = String;

/// Records every position it is given.
struct Recording {
    id: String,
    seen: Mutex<Vec<i64>>,
    resets: Mutex<u32>,
}

impl Recording {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            seen: Mutex::new(Vec::new()),
            resets: Mutex::new(0),
        })
    }

    fn seen(&self) -> Vec<i64> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Projector<TestEvent> for Recording {
    fn id(&self) -> &str {
        &self.id
    }

    async fn on_event(
        &self,
        event: &StoredEvent<TestEvent>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.seen.lock().unwrap().push(event.position);
        Ok(())
    }

    async fn reset(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        *self.resets.lock().unwrap() += 1;
        self.seen.lock().unwrap().clear();
        Ok(())
    }
}

/// Fails on one specific position, succeeds elsewhere.
struct FailingAt {
    id: String,
    position: i64,
    seen: Mutex<Vec<i64>>,
}

impl FailingAt {
    fn new(id: &str, position: i64) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            position,
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Projector<TestEvent> for FailingAt {
    fn id(&self) -> &str {
        &self.id
    }

    async fn on_event(
        &self,
        event: &StoredEvent<TestEvent>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if event.position == self.position {
            return Err("simulated handler failure".into());
        }
        self.seen.lock().unwrap().push(event.position);
        Ok(())
    }
}

struct CollectingObserver {
    events: Mutex<Vec<ReplayProgress>>,
}

#[async_trait]
impl ReplayObserver for CollectingObserver {
    async fn on_progress(&self, progress: &ReplayProgress) {
        self.events.lock().unwrap().push(progress.clone());
    }
}

/// Yields one good event, then a storage error.
struct InterruptedEventStore;

#[async_trait]
impl EventStore<TestEvent> for InterruptedEventStore {
    async fn count_from(&self, _from: Option<DateTime<Utc>>) -> Result<u64, EventStoreError> {
        Ok(2)
    }

    async fn stream_from(
        &self,
        _from: Option<DateTime<Utc>>,
    ) -> Result<BoxedEventStream<TestEvent>, EventStoreError> {
        let items = vec![
            Ok(StoredEvent {
                position: 1,
                valid_at: Utc::now(),
                message: "event-0".to_string(),
                properties: Properties::new(),
            }),
            Err(EventStoreError::Storage("connection reset".into())),
        ];
        Ok(Box::pin(tokio_stream::iter(items)))
    }

    async fn append(
        &self,
        _message: TestEvent,
        _properties: Properties,
    ) -> Result<StoredEvent<TestEvent>, EventStoreError> {
        Err(EventStoreError::Storage("connection reset".into()))
    }
}

async fn seeded_store(n: usize) -> InMemoryEventStore<TestEvent> {
    let store = InMemoryEventStore::new();
    for i in 0..n {
        store
            .append(format!("event-{i}"), Properties::new())
            .await
            .unwrap();
    }
    store
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[tokio::test]
async fn replay_is_idempotent() {
    init_logging();
    let events = seeded_store(3).await;
    let states = InMemoryStateStore::new();
    let projector = Recording::new("counter");
    let mut registry = ProjectorRegistry::new();
    registry
        .register(projector.clone(), Capabilities::default())
        .unwrap();

    let worker = Worker::new(Arc::new(registry), events, states.clone());
    worker.play_all().await.unwrap();
    worker.play_all().await.unwrap();

    // The second run dispatches nothing: every position is already applied.
    assert_eq!(projector.seen(), vec![1, 2, 3]);
    let state = states.latest("counter").await.unwrap().unwrap();
    assert_eq!(state.position, 3);
    assert!(!state.locked);
    assert!(!state.error);
}

#[tokio::test]
async fn a_failing_projector_never_halts_its_siblings() {
    init_logging();
    let events = seeded_store(3).await;
    let states = InMemoryStateStore::new();
    let failing = FailingAt::new("failing", 2);
    let healthy = Recording::new("healthy");
    let mut registry = ProjectorRegistry::new();
    registry
        .register(failing, Capabilities::default())
        .unwrap();
    registry
        .register(healthy.clone(), Capabilities::default())
        .unwrap();

    let worker = Worker::new(Arc::new(registry), events, states.clone());
    worker.play_all().await.unwrap();

    let failed = states.latest("failing").await.unwrap().unwrap();
    assert_eq!(failed.position, 1, "checkpoint stays at the last success");
    assert!(failed.error);
    assert!(failed.error_message.unwrap().contains("position 2"));
    assert!(!failed.locked);

    let ok = states.latest("healthy").await.unwrap().unwrap();
    assert_eq!(ok.position, 3);
    assert!(!ok.error);
    assert_eq!(healthy.seen(), vec![1, 2, 3]);
}

#[tokio::test]
async fn locked_projectors_are_skipped_without_failing_the_batch() {
    init_logging();
    let events = seeded_store(3).await;
    let states = InMemoryStateStore::new();
    states
        .put(ProjectorState {
            locked: true,
            ..ProjectorState::initial("held")
        })
        .await;

    let held = Recording::new("held");
    let free = Recording::new("free");
    let mut registry = ProjectorRegistry::new();
    registry.register(held.clone(), Capabilities::default()).unwrap();
    registry.register(free.clone(), Capabilities::default()).unwrap();

    let worker = Worker::new(Arc::new(registry), events, states.clone());
    worker.play_all().await.unwrap();

    let held_state = states.latest("held").await.unwrap().unwrap();
    assert_eq!(held_state.position, 0);
    assert!(held_state.locked, "foreign lock left untouched");
    assert!(held.seen().is_empty());

    assert_eq!(states.latest("free").await.unwrap().unwrap().position, 3);
    assert_eq!(free.seen(), vec![1, 2, 3]);
}

#[tokio::test]
async fn errored_projectors_sit_out_until_continue_on_error_is_set() {
    init_logging();
    let events = seeded_store(3).await;
    let states = InMemoryStateStore::new();
    let failing = FailingAt::new("flaky", 2);
    let mut registry = ProjectorRegistry::new();
    registry.register(failing, Capabilities::default()).unwrap();
    let registry = Arc::new(registry);

    let worker = Worker::new(registry.clone(), events.clone(), states.clone());
    worker.play_all().await.unwrap();
    assert!(states.latest("flaky").await.unwrap().unwrap().error);

    // The errored projector is the only candidate, so the next run has
    // nothing to do.
    let err = worker.play_all().await.unwrap_err();
    assert!(matches!(err, WorkerError::NoProjectorsAvailable));

    let retrying = Worker::new(registry, events, states.clone()).with_config(WorkerConfig {
        continue_on_error: true,
    });
    retrying.play_all().await.unwrap();
    // It fails at position 2 again; the error state is refreshed.
    assert!(states.latest("flaky").await.unwrap().unwrap().error);
}

#[tokio::test]
async fn worker_entry_points_report_distinct_misconfigurations() {
    init_logging();
    let events = seeded_store(1).await;
    let states = InMemoryStateStore::new();

    let empty: ProjectorRegistry<TestEvent> = ProjectorRegistry::new();
    let worker = Worker::new(Arc::new(empty), events.clone(), states.clone());
    assert!(matches!(
        worker.play_all().await.unwrap_err(),
        WorkerError::NoProjectorsRegistered
    ));

    let mut registry = ProjectorRegistry::new();
    registry
        .register(Recording::new("known"), Capabilities::default())
        .unwrap();
    let worker = Worker::new(Arc::new(registry), events, states);
    assert!(matches!(
        worker.play("missing").await.unwrap_err(),
        WorkerError::UnknownProjector(_)
    ));
}

#[tokio::test]
async fn play_targets_a_single_projector() {
    init_logging();
    let events = seeded_store(2).await;
    let states = InMemoryStateStore::new();
    let a = Recording::new("a");
    let b = Recording::new("b");
    let mut registry = ProjectorRegistry::new();
    registry.register(a.clone(), Capabilities::default()).unwrap();
    registry.register(b.clone(), Capabilities::default()).unwrap();

    let worker = Worker::new(Arc::new(registry), events, states.clone());
    worker.play("a").await.unwrap();

    assert_eq!(a.seen(), vec![1, 2]);
    assert!(b.seen().is_empty());
    assert!(states.latest("b").await.unwrap().is_none());
}

#[tokio::test]
async fn progress_events_bracket_the_run() {
    init_logging();
    let events = seeded_store(2).await;
    let states = InMemoryStateStore::new();
    let mut registry = ProjectorRegistry::new();
    registry
        .register(Recording::new("p"), Capabilities::default())
        .unwrap();

    let observer = Arc::new(CollectingObserver {
        events: Mutex::new(Vec::new()),
    });
    let mut worker = Worker::new(Arc::new(registry), events, states);
    worker.add_observer(observer.clone());
    worker.play_all().await.unwrap();

    let seen = observer.events.lock().unwrap().clone();
    assert_eq!(seen.first(), Some(&ReplayProgress::Began { total: 2 }));
    assert_eq!(
        seen.last(),
        Some(&ReplayProgress::Finished {
            processed: 2,
            total: 2
        })
    );
    let advanced = seen
        .iter()
        .filter(|p| matches!(p, ReplayProgress::Advanced { .. }))
        .count();
    assert_eq!(advanced, 2);
}

#[tokio::test]
async fn all_projectors_stopping_abandons_the_stream() {
    init_logging();
    let events = seeded_store(5).await;
    let states = InMemoryStateStore::new();
    let mut registry = ProjectorRegistry::new();
    registry
        .register(FailingAt::new("only", 2), Capabilities::default())
        .unwrap();

    let observer = Arc::new(CollectingObserver {
        events: Mutex::new(Vec::new()),
    });
    let mut worker = Worker::new(Arc::new(registry), events, states);
    worker.add_observer(observer.clone());
    worker.play_all().await.unwrap();

    let seen = observer.events.lock().unwrap().clone();
    assert!(
        seen.iter()
            .any(|p| matches!(p, ReplayProgress::Broken { index: 2, .. })),
        "stream abandoned at the failing event rather than drained"
    );
}

#[tokio::test]
async fn a_storage_error_mid_run_releases_the_locks() {
    init_logging();
    let states = InMemoryStateStore::new();
    let projector = Recording::new("resilient");
    let mut registry = ProjectorRegistry::new();
    registry
        .register(projector.clone(), Capabilities::default())
        .unwrap();

    let worker = Worker::new(Arc::new(registry), InterruptedEventStore, states.clone());
    let err = worker.play_all().await.unwrap_err();
    assert!(matches!(err, WorkerError::EventStore(_)));

    // The lock is released and the progress made before the failure kept,
    // so a later run picks up where this one stopped instead of wedging on
    // a stale lock.
    let state = states.latest("resilient").await.unwrap().unwrap();
    assert!(!state.locked, "lock released despite the failed run");
    assert_eq!(state.position, 1);
    assert!(!state.error);
    states.lock("resilient").await.unwrap();
}

#[tokio::test]
async fn play_all_from_replays_only_events_at_or_after_the_bound() {
    init_logging();
    let events = InMemoryEventStore::new();
    let mut bound = None;
    for i in 0..4 {
        let stored = events
            .append(format!("event-{i}"), Properties::new())
            .await
            .unwrap();
        if stored.position == 3 {
            bound = Some(stored.valid_at);
        }
    }
    let states = InMemoryStateStore::new();
    let projector = Recording::new("bounded");
    let mut registry = ProjectorRegistry::new();
    registry
        .register(projector.clone(), Capabilities::default())
        .unwrap();

    let worker = Worker::new(Arc::new(registry), events, states.clone());
    worker.play_all_from(bound.unwrap()).await.unwrap();

    // The explicit date overrides the collective lower bound: events before
    // it are never streamed, those at or after it apply as usual.
    assert_eq!(projector.seen(), vec![3, 4]);
    let state = states.latest("bounded").await.unwrap().unwrap();
    assert_eq!(state.position, 4);
    assert!(!state.locked);
}

#[tokio::test]
async fn play_from_bounds_a_single_projector() {
    init_logging();
    let events = InMemoryEventStore::new();
    let mut bound = None;
    for i in 0..3 {
        let stored = events
            .append(format!("event-{i}"), Properties::new())
            .await
            .unwrap();
        if stored.position == 2 {
            bound = Some(stored.valid_at);
        }
    }
    let states = InMemoryStateStore::new();
    let solo = Recording::new("solo");
    let bystander = Recording::new("bystander");
    let mut registry = ProjectorRegistry::new();
    registry.register(solo.clone(), Capabilities::default()).unwrap();
    registry
        .register(bystander.clone(), Capabilities::default())
        .unwrap();

    let worker = Worker::new(Arc::new(registry), events, states.clone());
    worker.play_from("solo", bound.unwrap()).await.unwrap();

    assert_eq!(solo.seen(), vec![2, 3]);
    assert!(bystander.seen().is_empty());
    assert_eq!(states.latest("solo").await.unwrap().unwrap().position, 3);
}

#[tokio::test]
async fn reset_honors_the_replayable_flag() {
    init_logging();
    let events = seeded_store(1).await;
    let states = InMemoryStateStore::new();
    let resettable = Recording::new("resettable");
    let pinned = Recording::new("pinned");
    let mut registry = ProjectorRegistry::new();
    registry
        .register(resettable.clone(), Capabilities::default())
        .unwrap();
    registry
        .register(
            pinned.clone(),
            Capabilities {
                replayable: false,
                live: true,
            },
        )
        .unwrap();

    let worker = Worker::new(Arc::new(registry), events, states);

    worker.reset("resettable").await.unwrap();
    assert_eq!(*resettable.resets.lock().unwrap(), 1);

    assert!(matches!(
        worker.reset("pinned").await.unwrap_err(),
        WorkerError::NotReplayable(_)
    ));

    worker.reset_all().await.unwrap();
    assert_eq!(*resettable.resets.lock().unwrap(), 2);
    assert_eq!(*pinned.resets.lock().unwrap(), 0);
}

#[tokio::test]
async fn live_dispatch_reaches_only_live_projectors_and_isolates_failures() {
    init_logging();
    let events = InMemoryEventStore::new();
    let states = InMemoryStateStore::new();
    let live = Recording::new("live");
    let batch = Recording::new("batch");
    let failing = FailingAt::new("brittle", 1);
    let mut registry = ProjectorRegistry::new();
    registry.register(live.clone(), Capabilities::default()).unwrap();
    registry
        .register(batch.clone(), Capabilities::batch_only())
        .unwrap();
    registry.register(failing, Capabilities::default()).unwrap();

    let dispatcher = LiveDispatcher::new(Arc::new(registry), states.clone());
    let event = events
        .append("hello".to_string(), Properties::new())
        .await
        .unwrap();
    dispatcher.dispatch(&event).await.unwrap();

    assert_eq!(live.seen(), vec![1]);
    assert!(batch.seen().is_empty(), "batch-only projector excluded");

    let live_state = states.latest("live").await.unwrap().unwrap();
    assert_eq!(live_state.position, 1);
    assert!(!live_state.locked);

    let brittle = states.latest("brittle").await.unwrap().unwrap();
    assert!(brittle.error);
    assert_eq!(brittle.position, 0, "failed event not marked applied");
}
