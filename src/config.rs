use serde::Deserialize;
use std::time::Duration;
use validator::Validate;

use crate::services::transport::{RetryPolicy, Timeouts};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub api: ApiConfig,
    #[serde(default)]
    #[validate(nested)]
    pub engine: EngineConfig,
    #[serde(default)]
    #[validate(nested)]
    pub error_reporting: ErrorReportingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    #[validate(url)]
    pub base_url: String,
    #[validate(length(min = 1, max = 100))]
    pub app_id: String,
    #[validate(length(min = 1))]
    pub api_key: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Receipt validation can take longer than a regular request
    #[serde(default = "default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    #[validate(range(max = 10))]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct EngineConfig {
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Interval used while an active subscription exists
    #[serde(default = "default_subscription_refresh_interval_secs")]
    pub subscription_refresh_interval_secs: u64,
    #[serde(default = "default_receipt_dedup_window_ms")]
    pub receipt_dedup_window_ms: u64,
    #[serde(default = "default_store_ready_timeout_secs")]
    #[validate(range(min = 1))]
    pub store_ready_timeout_secs: u64,
    #[serde(default = "default_cache_version")]
    #[validate(length(min = 1))]
    pub cache_version: String,
    /// Sibling skus of the same group priced alongside a receipt
    #[serde(default = "default_sibling_price_limit")]
    pub sibling_price_limit: usize,
    #[serde(default = "default_true")]
    pub allow_anonymous_purchase: bool,
    #[serde(default)]
    pub lang: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ErrorReportingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_reports")]
    #[validate(range(min = 1))]
    pub max_reports: usize,
    #[serde(default = "default_window_secs")]
    #[validate(range(min = 1))]
    pub window_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    /// Directory of the file cache; in-memory when unset
    #[serde(default)]
    pub directory: Option<String>,
}

fn default_base_url() -> String {
    "https://api.iaphub.com/v1".to_string()
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_receipt_timeout_secs() -> u64 {
    35
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_refresh_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_subscription_refresh_interval_secs() -> u64 {
    60
}

fn default_receipt_dedup_window_ms() -> u64 {
    500
}

fn default_store_ready_timeout_secs() -> u64 {
    20
}

fn default_cache_version() -> String {
    "1".to_string()
}

fn default_sibling_price_limit() -> usize {
    20
}

fn default_true() -> bool {
    true
}

fn default_max_reports() -> usize {
    10
}

fn default_window_secs() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            subscription_refresh_interval_secs: default_subscription_refresh_interval_secs(),
            receipt_dedup_window_ms: default_receipt_dedup_window_ms(),
            store_ready_timeout_secs: default_store_ready_timeout_secs(),
            cache_version: default_cache_version(),
            sibling_price_limit: default_sibling_price_limit(),
            allow_anonymous_purchase: true,
            lang: None,
        }
    }
}

impl Default for ErrorReportingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_reports: default_max_reports(),
            window_secs: default_window_secs(),
        }
    }
}

impl ApiConfig {
    pub fn new(app_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: default_base_url(),
            app_id: app_id.into(),
            api_key: api_key.into(),
            environment: default_environment(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            receipt_timeout_secs: default_receipt_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retry_attempts,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            total: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn receipt_timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            total: Duration::from_secs(self.receipt_timeout_secs),
        }
    }
}

impl EngineConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn subscription_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.subscription_refresh_interval_secs)
    }

    pub fn receipt_dedup_window(&self) -> Duration {
        Duration::from_millis(self.receipt_dedup_window_ms)
    }

    pub fn store_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.store_ready_timeout_secs)
    }
}

impl Config {
    /// Programmatic configuration with defaults for everything but credentials
    pub fn new(app_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api: ApiConfig::new(app_id, api_key),
            engine: EngineConfig::default(),
            error_reporting: ErrorReportingConfig::default(),
            cache: CacheConfig::default(),
        }
    }

    pub fn load() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists (for environment variable overrides)
        dotenvy::dotenv().ok();

        // config.{yml,toml} is optional, every value can come from the environment
        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("IAPSYNC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
