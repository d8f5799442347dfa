//! Postgres Identity Store Tests
//!
//! Run against the database named by the `DATABASE_*` environment variables:
//!
//! ```text
//! cargo test -p clientele-api --features db-tests --test postgres_store_tests
//! ```

#![cfg(feature = "db-tests")]

use clientele_api::{DbConfig, PostgresIdentityStore};
use clientele_core::{generate_bearer_key, ClientFilter, ClientInput, ClienteleResult};
use clientele_domain::UpsertEngine;
use clientele_storage::{ClientRepository, IdentityStore};
use clientele_test_utils::assertions::assert_store_error;
use std::sync::Arc;

async fn test_store() -> ClienteleResult<PostgresIdentityStore> {
    let store = PostgresIdentityStore::from_config(&DbConfig::from_env())?;
    store.ensure_schema().await?;
    Ok(store)
}

/// Name unique to one test run, so reads by name see only this test's rows.
fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, &generate_bearer_key()[..12])
}

#[tokio::test]
async fn test_health_check_and_idempotent_schema() -> ClienteleResult<()> {
    let store = test_store().await?;
    store.ensure_schema().await?;
    store.health_check().await
}

#[tokio::test]
async fn test_conflict_on_key_updates_name_only() -> ClienteleResult<()> {
    let store = Arc::new(test_store().await?);
    let engine = UpsertEngine::new(store.clone());
    let key = generate_bearer_key();

    let first = engine
        .upsert(vec![ClientInput::named(unique_name("acme")).with_bearer_key(&key)])
        .await?;
    assert_eq!(first.len(), 1);

    let renamed = unique_name("acme-corp");
    let second = engine
        .upsert(vec![ClientInput::named(&renamed).with_bearer_key(&key)])
        .await?;
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, first[0].id);
    assert_eq!(second[0].name, renamed);
    assert_eq!(second[0].created_at, first[0].created_at);
    assert!(second[0].updated_at >= first[0].updated_at);

    assert_eq!(
        store
            .delete_by_filter(&ClientFilter::by_bearer_key(&key))
            .await?,
        1
    );
    assert!(!store.is_exists(&key).await?);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_keys_in_one_batch_last_wins() -> ClienteleResult<()> {
    let store = test_store().await?;
    let key = generate_bearer_key();
    let now = chrono::Utc::now();

    let mut first = ClientInput::named(unique_name("first")).with_bearer_key(&key);
    let mut last = ClientInput::named(unique_name("last")).with_bearer_key(&key);
    first.prepare(now);
    last.prepare(now);
    store.upsert(&[first, last.clone()]).await?;

    let rows = store
        .find_by_filter(&ClientFilter::by_bearer_key(&key), false)
        .await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].name, last.name);

    store
        .delete_by_filter(&ClientFilter::by_bearer_key(&key))
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_empty_key_violates_constraint() -> ClienteleResult<()> {
    let store = test_store().await?;
    let input = ClientInput {
        name: unique_name("keyless"),
        bearer_key: String::new(),
        created_at: Some(chrono::Utc::now()),
        updated_at: Some(chrono::Utc::now()),
    };

    let result = store.upsert(&[input]).await;
    assert_store_error(&result);
    Ok(())
}

#[tokio::test]
async fn test_rollback_and_drop_discard_writes() -> ClienteleResult<()> {
    let store = test_store().await?;
    let now = chrono::Utc::now();

    let rolled_back = generate_bearer_key();
    let tx = store.begin().await?;
    let mut input = ClientInput::named(unique_name("rollback")).with_bearer_key(&rolled_back);
    input.prepare(now);
    tx.repository().upsert(&[input]).await?;
    assert!(tx.repository().is_exists(&rolled_back).await?);
    tx.rollback().await?;
    assert!(!store.is_exists(&rolled_back).await?);

    let dropped = generate_bearer_key();
    {
        let tx = store.begin().await?;
        let mut input = ClientInput::named(unique_name("dropped")).with_bearer_key(&dropped);
        input.prepare(now);
        tx.repository().upsert(&[input]).await?;
    }
    assert!(!store.is_exists(&dropped).await?);

    let committed = generate_bearer_key();
    let tx = store.begin().await?;
    let mut input = ClientInput::named(unique_name("commit")).with_bearer_key(&committed);
    input.prepare(now);
    tx.repository().upsert(&[input]).await?;
    tx.commit().await?;
    assert!(store.is_exists(&committed).await?);

    store
        .delete_by_filter(&ClientFilter::by_bearer_key(&committed))
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_empty_filter_rejected_before_query() {
    let store = match test_store().await {
        Ok(store) => store,
        Err(e) => panic!("database unavailable: {}", e),
    };
    let result = store.find_by_filter(&ClientFilter::default(), false).await;
    clientele_test_utils::assertions::assert_invalid_filter(&result);
}
