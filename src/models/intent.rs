use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Server-side handle for one purchase attempt
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseIntent {
    pub id: String,
    #[serde(default)]
    pub sku: String,
    #[serde(default = "OffsetDateTime::now_utc", skip)]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseIntentRequest<'a> {
    pub sku: &'a str,
    pub environment: &'a str,
    pub platform: &'a str,
}

/// Outcome reported when an intent is confirmed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseIntentConfirmation {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_subcode: Option<String>,
}

/// Options accepted by `buy`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuyOptions {
    /// Allow buying although a subscription is active on another platform
    pub allow_cross_platform_conflict: bool,
}
