// Shared test setup: an in-memory backend and an engine wired to it

use async_trait::async_trait;
use iapsync::{
    models::{common::Platform, product::ProductDetails},
    services::{
        transport::{HttpRequest, Method, Transport, TransportResponse},
        CacheStorage, MemoryStorage, MockBillingClient, TracingErrorSink,
    },
    Result,
    Config, Engine, EngineDeps,
};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const SERVER_USER_ID: &str = "srv_1";

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub segments: Vec<String>,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

struct BackendState {
    catalog: Vec<Value>,
    active: Vec<Value>,
    version: u32,
    receipt_responses: VecDeque<Value>,
    known_tokens: HashMap<String, Value>,
    requests: Vec<RecordedRequest>,
    delay: Duration,
    user_status: Option<u16>,
    intent_counter: u32,
}

/// Backend double: serves the catalog, validates every receipt it has not
/// seen before and tracks the resulting active products
pub struct MockBackend {
    state: Mutex<BackendState>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BackendState {
                catalog: vec![
                    catalog_product("coins_100", "consumable", None),
                    catalog_product("premium", "non_consumable", None),
                    catalog_product("sub_month", "renewable_subscription", Some("g1")),
                    catalog_product("sub_year", "renewable_subscription", Some("g1")),
                ],
                active: Vec::new(),
                version: 1,
                receipt_responses: VecDeque::new(),
                known_tokens: HashMap::new(),
                requests: Vec::new(),
                delay: Duration::ZERO,
                user_status: None,
                intent_counter: 0,
            }),
        })
    }

    /// Delay applied to every request
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    /// Makes user fetches fail with the given status
    pub fn fail_user_fetch(&self, status: Option<u16>) {
        self.state.lock().unwrap().user_status = status;
    }

    /// Response returned for the next receipt instead of the computed one
    pub fn push_receipt_response(&self, response: Value) {
        self.state.lock().unwrap().receipt_responses.push_back(response);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Requests whose path ends with the given segments
    pub fn requests_to(&self, method: Method, suffix: &[&str]) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.segments.ends_with_str(suffix))
            .collect()
    }

    pub fn user_fetches(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == Method::Get && r.segments.len() == 2 && r.segments[0] == "user")
            .collect()
    }

    pub fn receipts(&self) -> Vec<RecordedRequest> {
        self.requests_to(Method::Post, &["receipt"])
    }

    fn respond(&self, request: &HttpRequest, segments: &[&str]) -> TransportResponse {
        let mut state = self.state.lock().unwrap();
        match (request.method, segments) {
            (Method::Get, ["user", _]) => {
                if let Some(status) = state.user_status {
                    return status_response(status, json!({ "error": "server_error" }));
                }
                let etag = format!("\"v{}\"", state.version);
                let cached = request
                    .headers
                    .iter()
                    .any(|(key, value)| key.eq_ignore_ascii_case("if-none-match") && *value == etag);
                if cached {
                    return TransportResponse {
                        status: Some(304),
                        etag: Some(etag),
                        ..Default::default()
                    };
                }
                TransportResponse {
                    status: Some(200),
                    data: Some(json!({
                        "id": SERVER_USER_ID,
                        "productsForSale": state.catalog,
                        "activeProducts": state.active,
                    })),
                    etag: Some(etag),
                    error: None,
                }
            }
            (Method::Post, ["user", _, "receipt"]) => {
                if let Some(response) = state.receipt_responses.pop_front() {
                    return ok(response);
                }
                let body = request.body.clone().unwrap_or_default();
                let token = body["token"].as_str().unwrap_or_default().to_string();
                let sku = body["sku"].as_str().unwrap_or_default().to_string();

                if let Some(known) = state.known_tokens.get(&token) {
                    return ok(json!({ "status": "success", "oldTransactions": [known] }));
                }

                let Some(product) = state.catalog.iter().find(|p| p["sku"] == sku).cloned() else {
                    return ok(json!({ "status": "invalid" }));
                };
                let transaction = transaction_for(&product, state.known_tokens.len() + 1);
                if product["type"] != "consumable" {
                    state.active.retain(|p| p["sku"] != sku);
                    state.active.push(transaction.clone());
                    state.version += 1;
                }
                state.known_tokens.insert(token, transaction.clone());
                ok(json!({ "status": "success", "newTransactions": [transaction] }))
            }
            (Method::Post, ["user", _, "purchase", "intent"]) => {
                state.intent_counter += 1;
                ok(json!({ "id": format!("intent_{}", state.intent_counter) }))
            }
            (Method::Get, ["product", sku]) => {
                match state.catalog.iter().find(|p| p["sku"] == *sku) {
                    Some(product) => ok(product.clone()),
                    None => status_response(404, json!({ "error": "product_not_found" })),
                }
            }
            _ => ok(json!({})),
        }
    }
}

trait EndsWithStr {
    fn ends_with_str(&self, suffix: &[&str]) -> bool;
}

impl EndsWithStr for Vec<String> {
    fn ends_with_str(&self, suffix: &[&str]) -> bool {
        self.len() >= suffix.len()
            && self[self.len() - suffix.len()..]
                .iter()
                .zip(suffix)
                .all(|(a, b)| a == b)
    }
}

#[async_trait]
impl Transport for MockBackend {
    async fn send(&self, request: &HttpRequest) -> TransportResponse {
        let segments: Vec<String> = request
            .url
            .split("/app/")
            .nth(1)
            .unwrap_or_default()
            .split('/')
            .skip(1)
            .map(str::to_string)
            .collect();

        let delay = {
            let mut state = self.state.lock().unwrap();
            state.requests.push(RecordedRequest {
                method: request.method,
                segments: segments.clone(),
                params: request.params.clone(),
                headers: request.headers.clone(),
                body: request.body.clone(),
            });
            state.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
        self.respond(request, &segments)
    }
}

fn ok(data: Value) -> TransportResponse {
    status_response(200, data)
}

fn status_response(status: u16, data: Value) -> TransportResponse {
    TransportResponse {
        status: Some(status),
        data: Some(data),
        ..Default::default()
    }
}

fn catalog_product(sku: &str, product_type: &str, group: Option<&str>) -> Value {
    json!({
        "id": format!("id_{}", sku),
        "sku": sku,
        "type": product_type,
        "group": group,
    })
}

fn transaction_for(product: &Value, n: usize) -> Value {
    let now = OffsetDateTime::now_utc();
    let mut transaction = product.clone();
    transaction["purchase"] = json!(format!("purchase_{}", n));
    transaction["purchaseDate"] = json!(now.format(&Rfc3339).unwrap());
    transaction["platform"] = json!("ios");
    transaction["user"] = json!(SERVER_USER_ID);
    transaction["webhookStatus"] = json!("success");
    if product["type"] == "renewable_subscription" {
        let expiration = now + time::Duration::days(30);
        transaction["expirationDate"] = json!(expiration.format(&Rfc3339).unwrap());
        transaction["subscriptionState"] = json!("active");
        transaction["isSubscriptionRenewable"] = json!(true);
    }
    transaction
}

pub fn test_config() -> Config {
    let mut config = Config::new("app_1", "test_key");
    config.api.base_url = "http://backend.test/v1".to_string();
    config.api.retry_delay_ms = 10;
    config.engine.store_ready_timeout_secs = 1;
    config
}

/// Store knowing every catalog product
pub fn stocked_billing() -> Arc<MockBillingClient> {
    let billing = Arc::new(MockBillingClient::new(Platform::Ios));
    billing.add_product(ProductDetails::new("coins_100", 0.99, "USD"));
    billing.add_product(ProductDetails::new("premium", 4.99, "USD"));
    billing.add_product(ProductDetails::new("sub_month", 9.99, "USD"));
    billing.add_product(ProductDetails::new("sub_year", 59.99, "USD"));
    billing
}

/// Memory storage whose user snapshot reads take `delay`
pub struct SlowStorage {
    inner: Arc<MemoryStorage>,
    delay: Duration,
}

impl SlowStorage {
    pub fn wrap(inner: Arc<MemoryStorage>, delay: Duration) -> Arc<Self> {
        Arc::new(Self { inner, delay })
    }
}

#[async_trait]
impl CacheStorage for SlowStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if key.starts_with("iaphub_user") {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(key).await
    }
}

pub struct TestEngine {
    pub engine: Arc<Engine>,
    pub backend: Arc<MockBackend>,
    pub billing: Arc<MockBillingClient>,
}

pub async fn setup_engine() -> TestEngine {
    setup_engine_with(
        test_config(),
        MockBackend::new(),
        stocked_billing(),
        Arc::new(MemoryStorage::new()),
    )
    .await
}

pub async fn setup_engine_with(
    config: Config,
    backend: Arc<MockBackend>,
    billing: Arc<MockBillingClient>,
    storage: Arc<dyn CacheStorage>,
) -> TestEngine {
    let deps = EngineDeps::new(backend.clone(), billing.clone(), storage)
        .with_error_sink(Arc::new(TracingErrorSink));
    let engine = Engine::new(config, deps)
        .await
        .expect("Failed to build engine");
    engine.start().await;

    TestEngine {
        engine: Arc::new(engine),
        backend,
        billing,
    }
}

/// Polls `condition` until it holds, panicking after two seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "Condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
