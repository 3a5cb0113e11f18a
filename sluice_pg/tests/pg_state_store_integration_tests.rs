mod common;

use sluice_core::state::{ProjectorStateStore, StateStoreError};
use sluice_pg::{Migrator, PgProjectorStateStore};
use sqlx::PgPool;
use uuid::Uuid;

async fn store(pool: &PgPool) -> PgProjectorStateStore {
    let _ = env_logger::builder().is_test(true).try_init();
    Migrator::new(pool.clone()).run().await.expect("migrations");
    PgProjectorStateStore::new(pool.clone())
}

fn unique_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn lock_is_exclusive_until_released() {
    let pool = common::get_pg_pool().await;
    let store = store(&pool).await;
    let id = unique_id("locker");

    let state = store.lock(&id).await.unwrap();
    assert!(state.locked);
    assert_eq!(state.position, 0);

    let contended = store.lock(&id).await;
    assert!(matches!(contended, Err(StateStoreError::AlreadyLocked(_))));

    store.update(&id, 5, Some(chrono::Utc::now()), true).await.unwrap();
    let relocked = store.lock(&id).await.unwrap();
    assert_eq!(relocked.position, 5);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn concurrent_lockers_admit_exactly_one() {
    let pool = common::get_pg_pool().await;
    let store = store(&pool).await;
    let id = unique_id("contended");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move { store.lock(&id).await.is_ok() }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn position_never_moves_backward() {
    let pool = common::get_pg_pool().await;
    let store = store(&pool).await;
    let id = unique_id("monotonic");
    let now = chrono::Utc::now();

    store.update(&id, 10, Some(now), true).await.unwrap();
    store.update(&id, 3, Some(now), true).await.unwrap();

    let state = store.latest(&id).await.unwrap().unwrap();
    assert_eq!(state.position, 10);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn exception_records_sticky_error_until_next_update() {
    let pool = common::get_pg_pool().await;
    let store = store(&pool).await;
    let id = unique_id("errored");

    let state = store
        .exception(&id, 4, Some(chrono::Utc::now()), "boom", true)
        .await
        .unwrap();
    assert!(state.error);
    assert_eq!(state.error_message.as_deref(), Some("boom"));
    assert!(!state.locked);

    store.update(&id, 5, Some(chrono::Utc::now()), true).await.unwrap();
    let repaired = store.latest(&id).await.unwrap().unwrap();
    assert!(!repaired.error);
    assert!(repaired.error_message.is_none());
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn update_with_unlock_false_leaves_a_foreign_lock_alone() {
    let pool = common::get_pg_pool().await;
    let store = store(&pool).await;
    let id = unique_id("live-updated");

    store.lock(&id).await.unwrap();
    store.update(&id, 2, Some(chrono::Utc::now()), false).await.unwrap();

    let state = store.latest(&id).await.unwrap().unwrap();
    assert!(state.locked, "live-path update must not release the lock");
    assert_eq!(state.position, 2);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn remove_returns_the_projector_to_never_run() {
    let pool = common::get_pg_pool().await;
    let store = store(&pool).await;
    let id = unique_id("removed");

    store.update(&id, 7, Some(chrono::Utc::now()), true).await.unwrap();
    store.remove(&id).await.unwrap();
    assert!(store.latest(&id).await.unwrap().is_none());
}
