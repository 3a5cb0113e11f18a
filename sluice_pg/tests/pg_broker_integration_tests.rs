mod common;

use serde::{Deserialize, Serialize};
use sluice_core::broker::{BrokerConfig, MessageBroker};
use sluice_core::envelope::{Envelope, keys};
use sluice_core::serializer::{JsonSerializer, MessageName, MessageNameMapper};
use sluice_pg::{Migrator, PgMessageBroker};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum TestMessage {
    Foo { value: String },
    Bar { value: u32 },
}

impl MessageName for TestMessage {
    fn message_name(&self) -> &str {
        match self {
            TestMessage::Foo { .. } => "Foo",
            TestMessage::Bar { .. } => "Bar",
        }
    }
}

async fn broker(pool: &PgPool) -> PgMessageBroker<TestMessage> {
    let _ = env_logger::builder().is_test(true).try_init();
    Migrator::new(pool.clone()).run().await.expect("migrations");
    PgMessageBroker::new(
        pool.clone(),
        Arc::new(JsonSerializer),
        Arc::new(MessageNameMapper),
        BrokerConfig {
            // Isolated per test run so parallel tests never share rows.
            queue: format!("test-{}", Uuid::new_v4()),
            ..BrokerConfig::default()
        },
    )
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn dispatch_then_get_in_serial_order_then_empty() {
    let pool = common::get_pg_pool().await;
    let broker = broker(&pool).await;

    broker
        .dispatch(Envelope::new(TestMessage::Foo {
            value: "a".to_string(),
        }))
        .await
        .unwrap();
    broker
        .dispatch(Envelope::new(TestMessage::Bar { value: 7 }))
        .await
        .unwrap();

    let first = broker.get().await.unwrap().expect("first delivery");
    assert_eq!(first.property(keys::MESSAGE_TYPE), Some("Foo"));
    let second = broker.get().await.unwrap().expect("second delivery");
    assert_eq!(second.property(keys::MESSAGE_TYPE), Some("Bar"));
    assert!(broker.get().await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn concurrent_consumers_claim_each_row_exactly_once() {
    let pool = common::get_pg_pool().await;
    let broker = broker(&pool).await;

    let total = 50u32;
    for i in 0..total {
        broker
            .dispatch(Envelope::new(TestMessage::Bar { value: i }))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let consumer = broker.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            let mut last_serial = 0;
            while let Some(delivery) = consumer.get().await.unwrap() {
                let serial = delivery.serial.unwrap();
                assert!(serial > last_serial, "claims regress within a consumer");
                last_serial = serial;
                claimed.push(delivery.message().cloned().unwrap());
            }
            claimed
        }));
    }

    let mut all: Vec<TestMessage> = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }

    assert_eq!(all.len(), total as usize, "no duplicates, no losses");
    let mut values: Vec<u32> = all
        .iter()
        .map(|m| match m {
            TestMessage::Bar { value } => *value,
            other => panic!("unexpected message {other:?}"),
        })
        .collect();
    values.sort_unstable();
    assert_eq!(values, (0..total).collect::<Vec<_>>());
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn retries_are_bounded_and_final_count_equals_max() {
    let pool = common::get_pg_pool().await;
    let broker = broker(&pool).await;
    let max = 3;

    broker
        .dispatch(
            Envelope::new(TestMessage::Foo {
                value: "flaky".to_string(),
            })
            .with_retry(0, max),
        )
        .await
        .unwrap();

    let mut claims = 0;
    let mut last_count = None;
    while let Some(delivery) = broker.get().await.unwrap() {
        claims += 1;
        last_count = delivery.property(keys::RETRY_COUNT).map(str::to_string);
        broker.reject(delivery, None).await.unwrap();
        assert!(claims <= max + 1, "message claimed more often than budgeted");
    }

    assert_eq!(claims, max + 1);
    assert_eq!(last_count.as_deref(), Some("3"));
    assert!(broker.get().await.unwrap().is_none());
    assert_eq!(broker.failed_count().await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn fatal_reject_dead_letters_and_shows_up_for_operators() {
    let pool = common::get_pg_pool().await;
    let broker = broker(&pool).await;

    broker
        .dispatch(Envelope::new(TestMessage::Foo {
            value: "doomed".to_string(),
        }))
        .await
        .unwrap();

    let delivery = broker.get().await.unwrap().expect("delivery");
    let cause = std::io::Error::other("handler exploded");
    broker.reject(delivery, Some(&cause)).await.unwrap();

    assert!(broker.get().await.unwrap().is_none());

    let failed = broker.failed_messages().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].message_type.as_deref(), Some("Foo"));
    assert_eq!(failed[0].error.as_deref(), Some("handler exploded"));
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn broken_payload_is_isolated_and_does_not_block_the_queue() {
    let pool = common::get_pg_pool().await;
    let broker = broker(&pool).await;

    // Plant a row whose body is not valid JSON, then a healthy message.
    broker
        .dispatch(Envelope::new(TestMessage::Foo {
            value: "x".to_string(),
        }))
        .await
        .unwrap();
    sqlx::query(
        r#"
        UPDATE sluice_message_broker SET body = $1
        WHERE serial = (SELECT MAX(serial) FROM sluice_message_broker)
        "#,
    )
    .bind(b"{not json".to_vec())
    .execute(&pool)
    .await
    .unwrap();
    broker
        .dispatch(Envelope::new(TestMessage::Bar { value: 2 }))
        .await
        .unwrap();

    let first = broker.get().await.unwrap().expect("broken delivery");
    assert!(first.broken().is_some());
    assert!(first.property(keys::ERROR).is_some());

    let second = broker.get().await.unwrap().expect("intact delivery");
    assert_eq!(second.message(), Some(&TestMessage::Bar { value: 2 }));

    assert!(broker.get().await.unwrap().is_none());
    assert_eq!(broker.failed_count().await.unwrap(), 1);
}
