use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::common::{Platform, ProductType, SubscriptionState};

/// Store-side metadata resolved by the billing library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductDetails {
    pub sku: String,
    #[serde(default)]
    pub localized_title: Option<String>,
    #[serde(default)]
    pub localized_description: Option<String>,
    #[serde(default)]
    pub localized_price: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    /// ISO 8601 duration, e.g. "P1M"
    #[serde(default)]
    pub subscription_duration: Option<String>,
    #[serde(default)]
    pub subscription_trial_duration: Option<String>,
}

impl ProductDetails {
    pub fn new(sku: impl Into<String>, price: f64, currency: impl Into<String>) -> Self {
        Self {
            sku: sku.into(),
            localized_title: None,
            localized_description: None,
            localized_price: None,
            price: Some(price),
            currency: Some(currency.into()),
            subscription_duration: None,
            subscription_trial_duration: None,
        }
    }
}

/// Catalog product as returned by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub sku: String,
    #[serde(rename = "type")]
    pub product_type: ProductType,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ProductDetails>,
}

impl Product {
    /// A product can only be displayed or bought once the store resolved it
    pub fn is_purchasable(&self) -> bool {
        self.details.is_some()
    }

    pub fn price(&self) -> Option<f64> {
        self.details.as_ref().and_then(|d| d.price)
    }

    pub fn currency(&self) -> Option<&str> {
        self.details.as_ref().and_then(|d| d.currency.as_deref())
    }
}

/// Product owned by the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveProduct {
    #[serde(flatten)]
    pub product: Product,
    #[serde(default)]
    pub purchase: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub purchase_date: Option<OffsetDateTime>,
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expiration_date: Option<OffsetDateTime>,
    #[serde(default)]
    pub subscription_state: Option<SubscriptionState>,
    #[serde(default)]
    pub subscription_period_type: Option<String>,
    #[serde(default)]
    pub is_subscription_renewable: bool,
    #[serde(default)]
    pub subscription_renewal_product: Option<String>,
    #[serde(default)]
    pub subscription_renewal_product_sku: Option<String>,
    #[serde(default)]
    pub is_family_share: bool,
    #[serde(default)]
    pub is_promo: bool,
}

impl ActiveProduct {
    pub fn sku(&self) -> &str {
        &self.product.sku
    }

    pub fn is_subscription(&self) -> bool {
        self.product.product_type.is_subscription()
    }

    /// Subscription that has not expired as of `now`
    pub fn is_active_subscription(&self, now: OffsetDateTime) -> bool {
        if !self.is_subscription() || self.subscription_state == Some(SubscriptionState::Expired) {
            return false;
        }
        self.expiration_date.map(|date| date > now).unwrap_or(true)
    }
}

/// Validated purchase returned by the backend for a receipt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(flatten)]
    pub active: ActiveProduct,
    #[serde(default)]
    pub webhook_status: Option<String>,
    /// Server-assigned id of the owning user
    #[serde(default)]
    pub user: Option<String>,
}

impl Transaction {
    pub fn sku(&self) -> &str {
        self.active.sku()
    }

    pub fn product_type(&self) -> ProductType {
        self.active.product.product_type
    }

    pub fn price(&self) -> Option<f64> {
        self.active.product.price()
    }
}

/// Strips the store-specific base plan suffix ("sku:plan")
pub fn base_sku(sku: &str) -> &str {
    sku.split(':').next().unwrap_or(sku)
}
