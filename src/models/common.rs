use serde::{Deserialize, Serialize};
use std::fmt;

/// Store platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ios => "ios",
            Self::Android => "android",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a receipt is being posted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptContext {
    Purchase,
    Refresh,
    Restore,
}

impl ReceiptContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Refresh => "refresh",
            Self::Restore => "restore",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    Consumable,
    NonConsumable,
    Subscription,
    RenewableSubscription,
}

impl ProductType {
    pub fn is_subscription(&self) -> bool {
        matches!(self, Self::Subscription | Self::RenewableSubscription)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Active,
    GracePeriod,
    RetryPeriod,
    Paused,
    Expired,
    #[serde(other)]
    Unknown,
}

/// What triggered a user fetch, sent along for server-side analytics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchContext {
    Refresh,
    Purchase,
    Receipt,
    Restore,
    Login,
}

impl FetchContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refresh => "refresh",
            Self::Purchase => "purchase",
            Self::Receipt => "receipt",
            Self::Restore => "restore",
            Self::Login => "login",
        }
    }
}
