mod common;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use sluice_core::envelope::Properties;
use sluice_core::event::EventStore;
use sluice_pg::{Migrator, PgEventStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum TestEvent {
    Happened { value: String },
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn append_assigns_increasing_positions_and_streams_in_order() {
    let _ = env_logger::builder().is_test(true).try_init();
    let pool = common::get_pg_pool().await;
    Migrator::new(pool.clone()).run().await.expect("migrations");
    let store: PgEventStore<TestEvent> = PgEventStore::new(pool);

    let first = store
        .append(
            TestEvent::Happened {
                value: "one".to_string(),
            },
            Properties::new(),
        )
        .await
        .unwrap();
    let second = store
        .append(
            TestEvent::Happened {
                value: "two".to_string(),
            },
            Properties::new(),
        )
        .await
        .unwrap();
    assert!(second.position > first.position);

    let count = store.count_from(Some(first.valid_at)).await.unwrap();
    assert!(count >= 2);

    let mut stream = store.stream_from(Some(first.valid_at)).await.unwrap();
    let mut last_position = 0;
    let mut seen = 0;
    while let Some(event) = stream.next().await {
        let event = event.unwrap();
        assert!(event.position > last_position, "stream out of order");
        last_position = event.position;
        seen += 1;
    }
    assert!(seen >= 2);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn migrations_are_idempotent_and_forward_only() {
    let _ = env_logger::builder().is_test(true).try_init();
    let pool = common::get_pg_pool().await;
    let migrator = Migrator::new(pool);

    migrator.run().await.expect("first run");
    let second_run = migrator.run().await.expect("second run");
    assert_eq!(second_run, 0, "nothing pending on the second run");

    assert!(migrator.current_version().await.unwrap() >= 4);
    assert!(migrator.pending().await.unwrap().is_empty());
}
