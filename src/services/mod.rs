// Service modules
pub mod api_service;
pub mod billing;
pub mod cache_service;
pub mod error_reporter;
pub mod purchase_intent_service;
pub mod receipt_service;
pub mod transport;
pub mod user_service;

pub use api_service::ApiClient;
pub use billing::{BillingClient, MockBillingClient, StorePurchase};
pub use cache_service::{CacheService, CacheStorage, FileStorage, MemoryStorage};
pub use error_reporter::{ApiErrorSink, ErrorReporter, ErrorSink, TracingErrorSink};
pub use purchase_intent_service::PurchaseIntentService;
pub use receipt_service::ReceiptService;
pub use transport::{ReqwestTransport, RetryableTransport, Transport};
pub use user_service::UserService;
