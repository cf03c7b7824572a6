use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::product::{ActiveProduct, Product};

/// Prefix of generated anonymous user ids
pub const ANONYMOUS_PREFIX: &str = "a:";

/// Reconciled user state, persisted as a versioned snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserState {
    pub id: String,
    pub is_anonymous: bool,
    #[serde(default)]
    pub iaphub_id: Option<String>,
    #[serde(default)]
    pub products_for_sale: Vec<Product>,
    /// Catalog products whose store metadata could not be resolved
    #[serde(default)]
    pub filtered_products_for_sale: Vec<Product>,
    #[serde(default)]
    pub active_products: Vec<ActiveProduct>,
    #[serde(default)]
    pub paywall_id: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub fetch_date: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub receipt_post_date: Option<OffsetDateTime>,
    /// Seconds, as provided by the backend
    #[serde(default)]
    pub foreground_refresh_interval: Option<u64>,
    /// Set by identity, tag or language changes until the next fetch
    #[serde(default)]
    pub needs_fetch: bool,
    pub cache_version: String,
}

impl UserState {
    pub fn new(id: impl Into<String>, cache_version: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            is_anonymous: is_anonymous_id(&id),
            id,
            iaphub_id: None,
            products_for_sale: Vec::new(),
            filtered_products_for_sale: Vec::new(),
            active_products: Vec::new(),
            paywall_id: None,
            etag: None,
            fetch_date: None,
            receipt_post_date: None,
            foreground_refresh_interval: None,
            needs_fetch: false,
            cache_version: cache_version.into(),
        }
    }

    pub fn generate_anonymous_id() -> String {
        format!("{}{}", ANONYMOUS_PREFIX, uuid::Uuid::new_v4())
    }

    pub fn has_active_subscription(&self, now: OffsetDateTime) -> bool {
        self.active_products
            .iter()
            .any(|p| p.is_active_subscription(now))
    }

    /// Looks a sku up in the catalog, resolved or not
    pub fn find_product(&self, sku: &str) -> Option<&Product> {
        self.products_for_sale
            .iter()
            .chain(self.filtered_products_for_sale.iter())
            .chain(self.active_products.iter().map(|p| &p.product))
            .find(|p| p.sku == sku)
    }
}

pub fn is_anonymous_id(id: &str) -> bool {
    id.starts_with(ANONYMOUS_PREFIX)
}

/// Payload of the user update notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserUpdate {
    pub user_id: String,
}

/// Products returned together by `get_products`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductsResponse {
    pub products_for_sale: Vec<Product>,
    pub active_products: Vec<ActiveProduct>,
}

/// Outcome of a restore
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResponse {
    pub new_purchases: Vec<super::product::Transaction>,
    pub transferred_active_products: Vec<ActiveProduct>,
}
