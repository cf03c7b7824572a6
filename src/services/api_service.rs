use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, instrument};

use reqwest::Url;

use crate::{
    config::ApiConfig,
    error::{IapError, Result},
    models::{
        api::{ErrorLog, LoginRequest, TagsRequest, UserFetch, UserResponse},
        common::{FetchContext, Platform},
        intent::{PurchaseIntent, PurchaseIntentConfirmation, PurchaseIntentRequest},
        product::Product,
        receipt::{Receipt, ReceiptResponse},
    },
    services::transport::{ApiResponse, HttpRequest, Method, RetryPolicy, RetryableTransport},
    utils::token_digest,
};

const LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Backend REST client
pub struct ApiClient {
    config: ApiConfig,
    platform: Platform,
    transport: RetryableTransport,
}

impl ApiClient {
    pub fn new(config: &ApiConfig, platform: Platform, transport: RetryableTransport) -> Self {
        Self {
            config: config.clone(),
            platform,
            transport,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<HttpRequest> {
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|e| IapError::unexpected("invalid_base_url", e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| IapError::unexpected("invalid_base_url", "Base url cannot have a path"))?
            .pop_if_empty()
            .push("app")
            .push(&self.config.app_id)
            .extend(segments);

        Ok(HttpRequest::new(method, url.to_string())
            .header("Authorization", format!("ApiKey {}", self.config.api_key))
            .header("Accept", "application/json")
            .param("environment", self.config.environment.as_str())
            .param("platform", self.platform.as_str())
            .param("libraryVersion", LIBRARY_VERSION)
            .timeouts(self.config.timeouts()))
    }

    /// GET /user/{id}, conditional on the last etag
    #[instrument(skip(self, etag))]
    pub async fn get_user(
        &self,
        user_id: &str,
        etag: Option<&str>,
        lang: Option<&str>,
        context: FetchContext,
    ) -> Result<UserFetch> {
        let mut request = self
            .request(Method::Get, &["user", user_id])?
            .param("context", context.as_str())
            .if_none_match(etag);
        if let Some(lang) = lang {
            request = request.param("lang", lang);
        }

        let response = self.transport.send(&request).await?;
        if response.is_not_modified() {
            debug!("User {} not modified", user_id);
            return Ok(UserFetch::NotModified);
        }

        let etag = response.etag.clone();
        let user: UserResponse = parse(response)?;
        Ok(UserFetch::Updated { user, etag })
    }

    /// POST /user/{id}/receipt
    #[instrument(skip(self, receipt), fields(sku = %receipt.sku, token = %token_digest(&receipt.token)))]
    pub async fn post_receipt(&self, user_id: &str, receipt: &Receipt) -> Result<ReceiptResponse> {
        let request = self
            .request(Method::Post, &["user", user_id, "receipt"])?
            .json(serde_json::to_value(receipt)?)
            .timeouts(self.config.receipt_timeouts());

        parse(self.transport.send(&request).await?)
    }

    /// POST /user/{id}/tags
    #[instrument(skip(self, tags))]
    pub async fn post_tags(&self, user_id: &str, tags: &HashMap<String, String>) -> Result<()> {
        let request = self
            .request(Method::Post, &["user", user_id, "tags"])?
            .json(serde_json::to_value(TagsRequest { tags })?);

        self.transport.send(&request).await?;
        Ok(())
    }

    /// POST /user/{currentId}/login
    #[instrument(skip(self))]
    pub async fn login(&self, current_id: &str, new_id: &str) -> Result<()> {
        let request = self
            .request(Method::Post, &["user", current_id, "login"])?
            .json(serde_json::to_value(LoginRequest { user_id: new_id })?);

        self.transport.send(&request).await?;
        Ok(())
    }

    /// POST /user/{id}/purchase/intent
    #[instrument(skip(self))]
    pub async fn create_purchase_intent(&self, user_id: &str, sku: &str) -> Result<PurchaseIntent> {
        let body = PurchaseIntentRequest {
            sku,
            environment: &self.config.environment,
            platform: self.platform.as_str(),
        };
        let request = self
            .request(Method::Post, &["user", user_id, "purchase", "intent"])?
            .json(serde_json::to_value(body)?);

        let mut intent: PurchaseIntent = parse(self.transport.send(&request).await?)?;
        if intent.sku.is_empty() {
            intent.sku = sku.to_string();
        }
        Ok(intent)
    }

    /// POST /purchase/intent/{id}/confirm
    #[instrument(skip(self))]
    pub async fn confirm_purchase_intent(
        &self,
        intent_id: &str,
        confirmation: &PurchaseIntentConfirmation,
    ) -> Result<()> {
        let request = self
            .request(Method::Post, &["purchase", "intent", intent_id, "confirm"])?
            .json(serde_json::to_value(confirmation)?);

        self.transport.send(&request).await?;
        Ok(())
    }

    /// GET /product/{sku}
    #[instrument(skip(self))]
    pub async fn get_product(&self, sku: &str) -> Result<Product> {
        let request = self.request(Method::Get, &["product", sku])?;
        parse(self.transport.send(&request).await?)
    }

    /// POST /log, single attempt
    pub async fn post_log(&self, entry: &ErrorLog) -> Result<()> {
        let request = self
            .request(Method::Post, &["log"])?
            .json(json!({ "data": entry }));

        let policy = RetryPolicy {
            retries: 0,
            ..Default::default()
        };
        self.transport.send_with_policy(&request, policy).await?;
        Ok(())
    }
}

fn parse<T: DeserializeOwned>(response: ApiResponse) -> Result<T> {
    let data = response.data.unwrap_or(Value::Null);
    serde_json::from_value(data)
        .map_err(|e| IapError::unexpected("response_parsing_failed", e.to_string()))
}
