//! Postgres item store tests.
//!
//! Run with `--features db-tests` against a database reachable through the
//! `TALLY_DATABASE_URL` or the `TALLY_DB_*` variables.

#![cfg(feature = "db-tests")]

use tally_core::{CounterColumn, IdGenerator, Item, ItemId, ItemUpdate, RandomIdGenerator, StorageError};
use tally_storage::{ItemStore, PgConfig, PgItemStore};

async fn store() -> PgItemStore {
    let config = PgConfig {
        ensure_schema: true,
        ..PgConfig::from_env()
    };
    PgItemStore::connect(&config).await.expect("store")
}

fn fresh_item() -> Item {
    Item {
        id: RandomIdGenerator::default().generate(),
        title: "Postgres item".to_string(),
        content: "Stored by the db-tests suite".to_string(),
        excerpt: Some("excerpt".to_string()),
        image: None,
        view_count: 0,
    }
}

#[tokio::test]
async fn test_pg_create_get_delete() {
    let store = store().await;
    let item = fresh_item();

    store.create(&item).await.unwrap();
    assert_eq!(store.get_by_id(&item.id).await.unwrap(), Some(item.clone()));

    assert_eq!(store.delete_by_id(&item.id).await.unwrap(), 1);
    assert_eq!(store.get_by_id(&item.id).await.unwrap(), None);
    assert_eq!(store.delete_by_id(&item.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_pg_duplicate_id_is_unique_violation() {
    let store = store().await;
    let item = fresh_item();
    store.create(&item).await.unwrap();

    let err = store.create(&item).await.unwrap_err();
    assert!(matches!(err, StorageError::UniqueViolation { .. }));

    store.delete_by_id(&item.id).await.unwrap();
}

#[tokio::test]
async fn test_pg_increment_and_update() {
    let store = store().await;
    let item = fresh_item();
    store.create(&item).await.unwrap();

    let rows = store
        .increment_column(&item.id, CounterColumn::ViewCount, 8)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let update = ItemUpdate {
        title: Some("Renamed".to_string()),
        ..Default::default()
    };
    let updated = store.update_by_id(&item.id, &update).await.unwrap().unwrap();
    assert_eq!(updated.title, "Renamed");
    assert_eq!(updated.view_count, 8);

    assert_eq!(
        store
            .update_by_id(&ItemId::new("missing-item"), &update)
            .await
            .unwrap(),
        None
    );

    store.delete_by_id(&item.id).await.unwrap();
}

#[tokio::test]
async fn test_pg_null_view_count_reads_as_zero() {
    let store = store().await;
    let item = fresh_item();
    store.create(&item).await.unwrap();

    let pool = PgConfig::from_env().create_pool().unwrap();
    let conn = pool.get().await.unwrap();
    conn.execute(
        r#"UPDATE blog SET "viewCount" = NULL WHERE id = $1"#,
        &[&item.id.as_str()],
    )
    .await
    .unwrap();

    let read = store.get_by_id(&item.id).await.unwrap().unwrap();
    assert_eq!(read.view_count, 0);
    store
        .increment_column(&item.id, CounterColumn::ViewCount, 3)
        .await
        .unwrap();
    assert_eq!(store.get_by_id(&item.id).await.unwrap().unwrap().view_count, 3);

    store.delete_by_id(&item.id).await.unwrap();
}
