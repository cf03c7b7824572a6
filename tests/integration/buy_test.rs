/// Purchase flow: intent lifecycle, receipt validation and store finishing
use crate::common::*;
use iapsync::{
    models::{common::Platform, intent::BuyOptions, product::ProductDetails},
    services::{billing::BillingClient, transport::Method, MemoryStorage, MockBillingClient},
    IapError,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_buy_consumable() {
    let test = setup_engine().await;

    let transaction = test
        .engine
        .buy("coins_100", BuyOptions::default())
        .await
        .unwrap();

    assert_eq!(transaction.sku(), "coins_100");
    assert_eq!(transaction.price(), Some(0.99));
    assert_eq!(test.billing.consumed_tokens(), vec!["mock_token_1".to_string()]);
    assert!(test.billing.acknowledged_tokens().is_empty());

    let receipts = test.backend.receipts();
    assert_eq!(receipts.len(), 1);
    let body = receipts[0].body.as_ref().unwrap();
    assert_eq!(body["context"], "purchase");
    assert_eq!(body["purchaseIntent"], "intent_1");
    assert_eq!(body["prices"][0]["price"], 0.99);

    let confirms = test.backend.requests_to(Method::Post, &["confirm"]);
    assert_eq!(confirms.len(), 1);
    assert_eq!(confirms[0].segments[2], "intent_1");
    assert_eq!(confirms[0].body.as_ref().unwrap()["status"], "success");
}

#[tokio::test]
async fn test_buy_subscription_becomes_active() {
    let test = setup_engine().await;

    let transaction = test
        .engine
        .buy("sub_month", BuyOptions::default())
        .await
        .unwrap();
    assert_eq!(transaction.sku(), "sub_month");
    assert_eq!(transaction.price(), Some(9.99));
    assert_eq!(test.billing.acknowledged_tokens(), vec!["mock_token_1".to_string()]);

    // Group siblings are priced alongside the receipt
    let body = test.backend.receipts()[0].body.clone().unwrap();
    let priced: Vec<&str> = body["prices"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|p| p["sku"].as_str())
        .collect();
    assert_eq!(priced, vec!["sub_month", "sub_year"]);

    let active = test.engine.get_active_products(&[]).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].sku(), "sub_month");
}

#[tokio::test]
async fn test_second_buy_while_processing_is_rejected() {
    let test = setup_engine().await;
    test.backend.set_delay(Duration::from_millis(50));

    let (first, second) = tokio::join!(
        test.engine.buy("coins_100", BuyOptions::default()),
        test.engine.buy("premium", BuyOptions::default())
    );

    assert!(first.is_ok());
    assert!(matches!(second, Err(IapError::BuyProcessing)));
}

#[tokio::test]
async fn test_owned_product_cannot_be_bought_twice() {
    let test = setup_engine().await;

    test.engine.buy("premium", BuyOptions::default()).await.unwrap();
    let result = test.engine.buy("premium", BuyOptions::default()).await;

    assert!(matches!(result, Err(IapError::ProductAlreadyPurchased(sku)) if sku == "premium"));
    let confirms = test.backend.requests_to(Method::Post, &["confirm"]);
    assert_eq!(confirms.len(), 2);
    assert_eq!(
        confirms[1].body.as_ref().unwrap()["errorCode"],
        "product_already_purchased"
    );
}

#[tokio::test]
async fn test_unresolved_product_is_not_available() {
    let billing = stocked_billing();
    billing.remove_product("sub_year");
    let test = setup_engine_with(
        test_config(),
        MockBackend::new(),
        billing,
        Arc::new(MemoryStorage::new()),
    )
    .await;

    let result = test.engine.buy("sub_year", BuyOptions::default()).await;
    assert!(matches!(result, Err(IapError::ProductNotAvailable(_))));

    // The slot is released whatever the outcome
    test.billing.add_product(ProductDetails::new("sub_year", 59.99, "USD"));
    assert!(test.engine.buy("sub_year", BuyOptions::default()).await.is_ok());
}

#[tokio::test]
async fn test_cancelled_purchase_is_confirmed_as_failed() {
    let test = setup_engine().await;
    test.billing.push_purchase_result(Err(IapError::UserCancelled));

    let result = test.engine.buy("coins_100", BuyOptions::default()).await;
    assert!(matches!(result, Err(IapError::UserCancelled)));
    assert!(test.backend.receipts().is_empty());

    let confirms = test.backend.requests_to(Method::Post, &["confirm"]);
    let body = confirms[0].body.as_ref().unwrap();
    assert_eq!(body["status"], "failed");
    assert_eq!(body["errorCode"], "user_cancelled");
}

#[tokio::test]
async fn test_anonymous_purchase_can_be_disabled() {
    let mut config = test_config();
    config.engine.allow_anonymous_purchase = false;
    let test = setup_engine_with(
        config,
        MockBackend::new(),
        stocked_billing(),
        Arc::new(MemoryStorage::new()),
    )
    .await;

    let result = test.engine.buy("coins_100", BuyOptions::default()).await;
    assert!(matches!(result, Err(IapError::AnonymousPurchaseNotAllowed)));

    test.engine.login("42").await.unwrap();
    assert!(test.engine.buy("coins_100", BuyOptions::default()).await.is_ok());
}

#[tokio::test]
async fn test_invalid_receipt_is_finished() {
    let test = setup_engine().await;
    test.backend
        .push_receipt_response(serde_json::json!({ "status": "invalid" }));

    let err = test
        .engine
        .buy("premium", BuyOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "receipt_invalid");
    assert_eq!(test.billing.acknowledged_tokens(), vec!["mock_token_1".to_string()]);
}

#[tokio::test]
async fn test_unavailable_store_fails_without_waiting() {
    let billing = Arc::new(MockBillingClient::pending(Platform::Ios));
    billing.readiness().mark_unavailable();
    let test = setup_engine_with(
        test_config(),
        MockBackend::new(),
        billing,
        Arc::new(MemoryStorage::new()),
    )
    .await;

    let started = tokio::time::Instant::now();
    let result = test.engine.buy("coins_100", BuyOptions::default()).await;

    assert!(matches!(result, Err(IapError::BillingUnavailable)));
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(test.backend.receipts().is_empty());
}

#[tokio::test]
async fn test_sibling_limit_counts_siblings_only() {
    let mut config = test_config();
    config.engine.sibling_price_limit = 1;
    let test = setup_engine_with(
        config,
        MockBackend::new(),
        stocked_billing(),
        Arc::new(MemoryStorage::new()),
    )
    .await;

    test.engine.buy("sub_month", BuyOptions::default()).await.unwrap();

    let body = test.backend.receipts()[0].body.clone().unwrap();
    let priced: Vec<&str> = body["prices"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|p| p["sku"].as_str())
        .collect();
    assert_eq!(priced, vec!["sub_month", "sub_year"]);
}
