//! Network access with bounded retry
//!
//! [`Transport`] is the raw HTTP seam. [`RetryableTransport`] owns every
//! higher-level rule: retries on connection failures and 5xx, 304 handling,
//! and detection of the JSON `error` field.

use async_trait::async_trait;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{IapError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub total: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            total: Duration::from_secs(10),
        }
    }
}

/// Retry budget of one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    /// Query parameters for GET, merged into the JSON body for POST
    pub params: Vec<(String, String)>,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    pub timeouts: Timeouts,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            params: Vec::new(),
            body: None,
            headers: Vec::new(),
            timeouts: Timeouts::default(),
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.push((key.to_string(), value.into()));
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn if_none_match(self, etag: Option<&str>) -> Self {
        match etag {
            Some(etag) => self.header(IF_NONE_MATCH.as_str(), etag),
            None => self,
        }
    }
}

/// What the raw transport observed. `status` is `None` when no response
/// was received at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportResponse {
    pub error: Option<String>,
    pub data: Option<Value>,
    pub status: Option<u16>,
    pub etag: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> TransportResponse;
}

/// Successful backend response
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    /// `None` for 304 and empty bodies
    pub data: Option<Value>,
    pub etag: Option<String>,
}

impl ApiResponse {
    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }
}

enum Outcome {
    Success(ApiResponse),
    Retryable(IapError),
    Terminal(IapError),
}

pub struct RetryableTransport {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl RetryableTransport {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub async fn send(&self, request: &HttpRequest) -> Result<ApiResponse> {
        self.send_with_policy(request, self.policy).await
    }

    /// Sends with an explicit retry budget; `policy.retries` retries means
    /// at most `retries + 1` attempts.
    pub async fn send_with_policy(
        &self,
        request: &HttpRequest,
        policy: RetryPolicy,
    ) -> Result<ApiResponse> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            debug!(
                method = request.method.as_str(),
                url = %request.url,
                attempt = attempts,
                "→ Request"
            );

            let response = self.transport.send(request).await;
            match classify(response) {
                Outcome::Success(response) => {
                    debug!(url = %request.url, status = response.status, "← Response");
                    return Ok(response);
                }
                Outcome::Retryable(err) if attempts <= policy.retries => {
                    warn!(
                        url = %request.url,
                        attempt = attempts,
                        "Request failed, retrying in {:?}: {}",
                        policy.delay,
                        err
                    );
                    tokio::time::sleep(policy.delay).await;
                }
                Outcome::Retryable(err) | Outcome::Terminal(err) => {
                    warn!(url = %request.url, attempts, "Request failed: {}", err);
                    return Err(err);
                }
            }
        }
    }
}

fn classify(response: TransportResponse) -> Outcome {
    let Some(status) = response.status else {
        return Outcome::Retryable(IapError::network(
            "request_failed",
            response
                .error
                .unwrap_or_else(|| "No response received".to_string()),
        ));
    };

    if status == 304 {
        return Outcome::Success(ApiResponse {
            status,
            data: None,
            etag: response.etag,
        });
    }

    if status >= 500 {
        return Outcome::Retryable(server_error(status, response.data.as_ref(), response.error));
    }

    if status == 429 {
        return Outcome::Terminal(IapError::Server {
            code: "rate_limit".to_string(),
            subcode: None,
            message: "Too many requests".to_string(),
            status: Some(status),
            silent: true,
        });
    }

    if status >= 400 {
        return Outcome::Terminal(server_error(status, response.data.as_ref(), response.error));
    }

    // 2xx or 3xx with a body the transport could not parse
    if let Some(error) = response.error {
        return Outcome::Terminal(IapError::unexpected("response_parsing_failed", error));
    }

    if let Some(code) = error_field(response.data.as_ref()) {
        return Outcome::Terminal(server_error(status, response.data.as_ref(), Some(code)));
    }

    Outcome::Success(ApiResponse {
        status,
        data: response.data,
        etag: response.etag,
    })
}

fn error_field(data: Option<&Value>) -> Option<String> {
    data?.get("error")?.as_str().map(str::to_string)
}

fn server_error(status: u16, data: Option<&Value>, transport_error: Option<String>) -> IapError {
    let code = error_field(data).unwrap_or_else(|| format!("http_{}", status));
    let subcode = data
        .and_then(|d| d.get("subcode"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let message = data
        .and_then(|d| d.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or(transport_error)
        .unwrap_or_else(|| format!("Request failed with status {}", status));

    IapError::Server {
        code,
        subcode,
        message,
        status: Some(status),
        silent: false,
    }
}

/// HTTP transport backed by reqwest
pub struct ReqwestTransport {
    client: reqwest::Client,
    connect_timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = build_client(connect_timeout)?;
        Ok(Self {
            client,
            connect_timeout,
        })
    }

    fn client_for(&self, timeouts: &Timeouts) -> Result<reqwest::Client> {
        // reqwest only supports connect timeouts per client
        if timeouts.connect == self.connect_timeout {
            Ok(self.client.clone())
        } else {
            build_client(timeouts.connect)
        }
    }
}

fn build_client(connect_timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| IapError::unexpected("http_client", e.to_string()))
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> TransportResponse {
        let client = match self.client_for(&request.timeouts) {
            Ok(client) => client,
            Err(e) => {
                return TransportResponse {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        let mut builder = match request.method {
            Method::Get => client.get(&request.url).query(&request.params),
            Method::Post => {
                let mut body = request
                    .body
                    .clone()
                    .unwrap_or_else(|| Value::Object(Default::default()));
                if let Value::Object(map) = &mut body {
                    for (key, value) in &request.params {
                        map.entry(key.clone())
                            .or_insert_with(|| Value::String(value.clone()));
                    }
                }
                client.post(&request.url).json(&body)
            }
        };
        builder = builder.timeout(request.timeouts.total);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                return TransportResponse {
                    error: Some(e.to_string()),
                    status: e.status().map(|s| s.as_u16()),
                    ..Default::default()
                }
            }
        };

        let status = response.status().as_u16();
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                return TransportResponse {
                    error: Some(format!("Failed to read body: {}", e)),
                    status: Some(status),
                    etag,
                    ..Default::default()
                }
            }
        };

        if text.trim().is_empty() {
            return TransportResponse {
                status: Some(status),
                etag,
                ..Default::default()
            };
        }

        match serde_json::from_str::<Value>(&text) {
            Ok(data) => TransportResponse {
                error: None,
                data: Some(data),
                status: Some(status),
                etag,
            },
            Err(e) => TransportResponse {
                error: Some(format!("Invalid JSON body: {}", e)),
                data: None,
                status: Some(status),
                etag,
            },
        }
    }
}
