/// User refresh: coalescing, staleness, conditional fetches and the
/// snapshot fallback
use crate::common::*;
use iapsync::{
    services::{transport::Method, MemoryStorage},
    IapError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

#[tokio::test]
async fn test_concurrent_getters_share_one_fetch() {
    let test = setup_engine().await;
    test.backend.set_delay(Duration::from_millis(100));

    let mut tasks = JoinSet::new();
    for _ in 0..10 {
        let engine = test.engine.clone();
        tasks.spawn(async move { engine.get_products_for_sale().await });
    }

    let mut results = Vec::new();
    while let Some(result) = tasks.join_next().await {
        results.push(result.unwrap().unwrap());
    }

    assert_eq!(test.backend.user_fetches().len(), 1);
    assert_eq!(results.len(), 10);
    assert!(results.iter().all(|products| *products == results[0]));
    assert_eq!(results[0].len(), 4);
}

#[tokio::test]
async fn test_fresh_state_skips_network() {
    let test = setup_engine().await;

    test.engine.get_products_for_sale().await.unwrap();
    test.engine.get_products_for_sale().await.unwrap();
    test.engine.get_active_products(&[]).await.unwrap();

    assert_eq!(test.backend.user_fetches().len(), 1);
}

#[tokio::test]
async fn test_stale_state_uses_etag() {
    let test = setup_engine().await;
    let first = test.engine.get_products_for_sale().await.unwrap();

    assert!(test.engine.set_lang("fr").unwrap());
    let second = test.engine.get_products_for_sale().await.unwrap();

    let fetches = test.backend.user_fetches();
    assert_eq!(fetches.len(), 2);
    assert_eq!(fetches[1].header("if-none-match"), Some("\"v1\""));
    assert_eq!(fetches[1].param("lang"), Some("fr"));
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_failed_refresh_serves_cached_data() {
    let test = setup_engine().await;
    let products = test.engine.get_products_for_sale().await.unwrap();

    test.backend.fail_user_fetch(Some(500));
    test.engine.set_lang("de").unwrap();
    let fallback = test.engine.get_products_for_sale().await.unwrap();

    assert_eq!(products, fallback);
    // One initial fetch, then the failing call with its two retries
    assert_eq!(test.backend.user_fetches().len(), 4);
}

#[tokio::test]
async fn test_failed_first_fetch_is_an_error() {
    let test = setup_engine().await;
    test.backend.fail_user_fetch(Some(500));

    let result = test.engine.get_products_for_sale().await;
    assert!(matches!(result, Err(IapError::Server { status: Some(500), .. })));
}

#[tokio::test]
async fn test_unresolved_products_are_filtered_until_store_knows_them() {
    let billing = stocked_billing();
    billing.remove_product("sub_year");
    let test = setup_engine_with(
        test_config(),
        MockBackend::new(),
        billing,
        Arc::new(MemoryStorage::new()),
    )
    .await;

    let products = test.engine.get_products_for_sale().await.unwrap();
    assert!(products.iter().all(|p| p.sku != "sub_year"));

    test.billing
        .add_product(iapsync::models::product::ProductDetails::new("sub_year", 59.99, "USD"));
    let changed = test.engine.refresh().await.unwrap();
    assert!(changed);

    let products = test.engine.get_products_for_sale().await.unwrap();
    assert!(products.iter().any(|p| p.sku == "sub_year"));
    assert_eq!(test.backend.user_fetches().len(), 1);
}

#[tokio::test]
async fn test_snapshot_restored_across_instances() {
    let storage = Arc::new(MemoryStorage::new());
    let first = setup_engine_with(test_config(), MockBackend::new(), stocked_billing(), storage.clone()).await;
    let products = first.engine.get_products_for_sale().await.unwrap();
    first.engine.stop().await;

    let backend = MockBackend::new();
    let second = setup_engine_with(test_config(), backend.clone(), stocked_billing(), storage).await;

    assert_eq!(second.engine.user_id(), first.engine.user_id());
    assert_eq!(second.engine.get_products_for_sale().await.unwrap(), products);
    assert!(backend.user_fetches().is_empty());
}

#[tokio::test]
async fn test_snapshot_of_older_cache_version_is_ignored() {
    let storage = Arc::new(MemoryStorage::new());
    let first = setup_engine_with(test_config(), MockBackend::new(), stocked_billing(), storage.clone()).await;
    first.engine.get_products_for_sale().await.unwrap();

    let mut config = test_config();
    config.engine.cache_version = "2".to_string();
    let backend = MockBackend::new();
    let second = setup_engine_with(config, backend.clone(), stocked_billing(), storage).await;
    second.engine.get_products_for_sale().await.unwrap();

    assert_eq!(backend.user_fetches().len(), 1);
    assert!(backend.user_fetches()[0].header("if-none-match").is_none());
}

#[tokio::test]
async fn test_login_merges_anonymous_user() {
    let test = setup_engine().await;
    let anonymous_id = test.engine.user_id();
    test.engine.get_products_for_sale().await.unwrap();

    test.engine.login("42").await.unwrap();
    assert_eq!(test.engine.user_id(), "42");

    let logins = test.backend.requests_to(Method::Post, &["login"]);
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].segments[1], anonymous_id);
    assert_eq!(logins[0].body.as_ref().unwrap()["userId"], "42");

    test.engine.get_products_for_sale().await.unwrap();
    let fetches = test.backend.user_fetches();
    assert_eq!(fetches.last().unwrap().segments[1], "42");

    test.engine.logout().await.unwrap();
    assert_eq!(test.engine.user_id(), anonymous_id);
}

#[tokio::test]
async fn test_concurrent_tags_are_rejected() {
    let test = setup_engine().await;
    test.backend.set_delay(Duration::from_millis(50));

    let tags = std::collections::HashMap::from([("plan".to_string(), "pro".to_string())]);
    let (first, second) = tokio::join!(
        test.engine.set_tags(tags.clone()),
        test.engine.set_tags(tags.clone())
    );

    assert!(first.is_ok());
    assert!(matches!(second, Err(IapError::UserTagsProcessing)));
    assert!(test.engine.set_tags(tags).await.is_ok());
}

#[tokio::test]
async fn test_invalid_lang_is_rejected() {
    let test = setup_engine().await;
    let err = test.engine.set_lang("french").unwrap_err();
    assert_eq!(err.code(), "unexpected");
}

#[tokio::test]
async fn test_update_notification_on_change() {
    let test = setup_engine().await;
    let mut updates = test.engine.subscribe_user_updates();

    test.engine.get_products_for_sale().await.unwrap();

    let update = tokio::time::timeout(Duration::from_secs(1), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.user_id, test.engine.user_id());
}

#[tokio::test]
async fn test_concurrent_getters_wait_for_snapshot_restore() {
    let storage = Arc::new(MemoryStorage::new());
    let first = setup_engine_with(test_config(), MockBackend::new(), stocked_billing(), storage.clone()).await;
    let products = first.engine.get_products_for_sale().await.unwrap();
    assert_eq!(products.len(), 4);
    first.engine.stop().await;

    // The store no longer knows sub_year, so a fresh fetch would filter it
    let backend = MockBackend::new();
    backend.set_delay(Duration::from_millis(300));
    let billing = stocked_billing();
    billing.remove_product("sub_year");
    let second = setup_engine_with(
        test_config(),
        backend.clone(),
        billing,
        SlowStorage::wrap(storage, Duration::from_millis(100)),
    )
    .await;

    let engine_a = second.engine.clone();
    let engine_b = second.engine.clone();
    let (a, b) = tokio::join!(engine_a.get_products_for_sale(), async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine_b.get_products_for_sale().await
    });

    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a, b);
    assert_eq!(a, products);
    assert!(backend.user_fetches().is_empty());
}

#[tokio::test]
async fn test_login_fetches_new_identity() {
    let test = setup_engine().await;
    test.engine.login("42").await.unwrap();

    let fetches = test.backend.user_fetches();
    assert_eq!(fetches.len(), 1);
    assert_eq!(fetches[0].segments[1], "42");
    assert_eq!(fetches[0].param("context"), Some("login"));

    // Already fresh for the new identity
    test.engine.get_products_for_sale().await.unwrap();
    assert_eq!(test.backend.user_fetches().len(), 1);
}
