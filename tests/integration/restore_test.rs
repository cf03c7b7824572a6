/// Restore: replaying owned store purchases and the soft-success rule
use crate::common::*;
use iapsync::{services::StorePurchase, IapError};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_restore_returns_new_purchases() {
    let test = setup_engine().await;
    test.billing
        .add_owned_purchase(StorePurchase::purchased("restore_premium", "premium"));
    test.billing
        .add_owned_purchase(StorePurchase::purchased("restore_sub", "sub_month"));

    let response = test.engine.restore().await.unwrap();

    let skus: Vec<&str> = response.new_purchases.iter().map(|t| t.sku()).collect();
    assert_eq!(skus, vec!["premium", "sub_month"]);
    assert!(response.transferred_active_products.is_empty());

    let receipts = test.backend.receipts();
    assert_eq!(receipts.len(), 2);
    assert!(receipts
        .iter()
        .all(|r| r.body.as_ref().unwrap()["context"] == "restore"));

    let active = test.engine.get_active_products(&[]).await.unwrap();
    assert_eq!(active.len(), 2);
    assert_eq!(test.billing.acknowledged_tokens().len(), 2);
}

#[tokio::test]
async fn test_restore_with_nothing_owned_succeeds() {
    let test = setup_engine().await;

    let response = test.engine.restore().await.unwrap();
    assert!(response.new_purchases.is_empty());
    assert!(response.transferred_active_products.is_empty());
    // Restore always ends with a forced refresh
    assert_eq!(test.backend.user_fetches().len(), 1);
}

#[tokio::test]
async fn test_restore_fails_when_nothing_was_recovered() {
    let test = setup_engine().await;
    test.billing
        .add_owned_purchase(StorePurchase::purchased("restore_premium", "premium"));
    test.backend.push_receipt_response(json!({ "status": "failed" }));

    let err = test.engine.restore().await.unwrap_err();
    assert_eq!(err.code(), "receipt_failed");
    // Not finished, the store will deliver it again
    assert!(test.billing.acknowledged_tokens().is_empty());
}

#[tokio::test]
async fn test_restore_partial_failure_is_soft_success() {
    let test = setup_engine().await;
    test.billing
        .add_owned_purchase(StorePurchase::purchased("restore_bad", "premium"));
    test.billing
        .add_owned_purchase(StorePurchase::purchased("restore_sub", "sub_month"));
    test.backend.push_receipt_response(json!({ "status": "failed" }));

    let response = test.engine.restore().await.unwrap();
    let skus: Vec<&str> = response.new_purchases.iter().map(|t| t.sku()).collect();
    assert_eq!(skus, vec!["sub_month"]);
}

#[tokio::test]
async fn test_concurrent_restore_is_rejected() {
    let test = setup_engine().await;
    test.backend.set_delay(Duration::from_millis(50));

    let (first, second) = tokio::join!(test.engine.restore(), test.engine.restore());

    assert!(first.is_ok());
    assert!(matches!(second, Err(IapError::RestoreProcessing)));
}
