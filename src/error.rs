use std::fmt;

/// Coarse classification used for reporting and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Server,
    Receipt,
    Unexpected,
    Domain,
}

/// Receipt validation outcomes that surface as errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptErrorKind {
    Invalid,
    Stale,
    Failed,
    Processing,
}

impl ReceiptErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "receipt_invalid",
            Self::Stale => "receipt_stale",
            Self::Failed => "receipt_failed",
            Self::Processing => "receipt_processing",
        }
    }
}

impl fmt::Display for ReceiptErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum IapError {
    #[error("Network error: {message}")]
    Network { subcode: String, message: String },

    #[error("Server error {code}: {message}")]
    Server {
        code: String,
        subcode: Option<String>,
        message: String,
        status: Option<u16>,
        silent: bool,
    },

    #[error("Receipt error {kind}: {message}")]
    Receipt {
        kind: ReceiptErrorKind,
        message: String,
        silent: bool,
    },

    #[error("Unexpected error ({subcode}): {message}")]
    Unexpected { subcode: String, message: String },

    #[error("Billing unavailable")]
    BillingUnavailable,

    #[error("Payment deferred")]
    DeferredPayment,

    #[error("Purchase cancelled by the user")]
    UserCancelled,

    #[error("Product not available: {0}")]
    ProductNotAvailable(String),

    #[error("Anonymous purchases are not allowed")]
    AnonymousPurchaseNotAllowed,

    #[error("Transaction belongs to a different user")]
    UserConflict,

    #[error("Product already purchased: {0}")]
    ProductAlreadyPurchased(String),

    #[error("Active subscription on {0} conflicts with this purchase")]
    CrossPlatformConflict(String),

    #[error("Product {0} is already scheduled to replace the current product at renewal")]
    ProductChangeNextRenewal(String),

    #[error("Transaction not found for product {0}")]
    TransactionNotFound(String),

    #[error("A purchase is already being processed")]
    BuyProcessing,

    #[error("A restore is already being processed")]
    RestoreProcessing,

    #[error("Tags are already being updated")]
    UserTagsProcessing,
}

impl IapError {
    pub fn network(subcode: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            subcode: subcode.into(),
            message: message.into(),
        }
    }

    pub fn unexpected(subcode: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unexpected {
            subcode: subcode.into(),
            message: message.into(),
        }
    }

    pub fn receipt(kind: ReceiptErrorKind, message: impl Into<String>) -> Self {
        Self::Receipt {
            kind,
            message: message.into(),
            silent: false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::Network,
            Self::Server { .. } => ErrorKind::Server,
            Self::Receipt { .. } => ErrorKind::Receipt,
            Self::Unexpected { .. } => ErrorKind::Unexpected,
            _ => ErrorKind::Domain,
        }
    }

    /// Stable code exposed to callers
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network_error",
            Self::Server { .. } => "server_error",
            Self::Receipt { kind, .. } => kind.as_str(),
            Self::Unexpected { .. } => "unexpected",
            Self::BillingUnavailable => "billing_unavailable",
            Self::DeferredPayment => "deferred_payment",
            Self::UserCancelled => "user_cancelled",
            Self::ProductNotAvailable(_) => "product_not_available",
            Self::AnonymousPurchaseNotAllowed => "anonymous_purchase_not_allowed",
            Self::UserConflict => "user_conflict",
            Self::ProductAlreadyPurchased(_) => "product_already_purchased",
            Self::CrossPlatformConflict(_) => "cross_platform_conflict",
            Self::ProductChangeNextRenewal(_) => "product_change_next_renewal",
            Self::TransactionNotFound(_) => "transaction_not_found",
            Self::BuyProcessing => "buy_processing",
            Self::RestoreProcessing => "restore_processing",
            Self::UserTagsProcessing => "user_tags_processing",
        }
    }

    pub fn subcode(&self) -> Option<&str> {
        match self {
            Self::Network { subcode, .. } | Self::Unexpected { subcode, .. } => Some(subcode),
            Self::Server { code, subcode, .. } => subcode.as_deref().or(Some(code.as_str())),
            _ => None,
        }
    }

    /// Key used to deduplicate error reports
    pub fn fingerprint(&self) -> String {
        match self.subcode() {
            Some(subcode) => format!("{}/{}", self.code(), subcode),
            None => self.code().to_string(),
        }
    }

    /// Silent errors are returned to the caller but never reported.
    /// Unexpected errors are never silent.
    pub fn is_silent(&self) -> bool {
        match self {
            Self::Server { silent, status, .. } => *silent || *status == Some(429),
            Self::Receipt { silent, .. } => *silent,
            Self::Unexpected { .. } => false,
            _ => false,
        }
    }

    pub fn silenced(self) -> Self {
        match self {
            Self::Server {
                code,
                subcode,
                message,
                status,
                ..
            } => Self::Server {
                code,
                subcode,
                message,
                status,
                silent: true,
            },
            Self::Receipt { kind, message, .. } => Self::Receipt {
                kind,
                message,
                silent: true,
            },
            other => other,
        }
    }
}

impl From<serde_json::Error> for IapError {
    fn from(e: serde_json::Error) -> Self {
        IapError::unexpected("json_error", e.to_string())
    }
}

impl From<std::io::Error> for IapError {
    fn from(e: std::io::Error) -> Self {
        IapError::unexpected("io_error", e.to_string())
    }
}

// Helper type for results
pub type Result<T> = std::result::Result<T, IapError>;
