use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::product::{ActiveProduct, Product};

/// GET /user/{id} response body
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    /// Server-assigned user id
    pub id: String,
    #[serde(default)]
    pub products_for_sale: Vec<Product>,
    #[serde(default)]
    pub active_products: Vec<ActiveProduct>,
    #[serde(default)]
    pub paywall_id: Option<String>,
    #[serde(default)]
    pub foreground_refresh_interval: Option<u64>,
}

/// Result of a conditional user fetch
#[derive(Debug, Clone, PartialEq)]
pub enum UserFetch {
    NotModified,
    Updated {
        user: UserResponse,
        etag: Option<String>,
    },
}

#[derive(Debug, Serialize)]
pub struct TagsRequest<'a> {
    pub tags: &'a HashMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest<'a> {
    pub user_id: &'a str,
}

/// Error entry posted to the log endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLog {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subcode: Option<String>,
    pub message: String,
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}
