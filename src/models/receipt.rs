use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{
    common::ReceiptContext,
    product::{base_sku, Transaction},
};

/// Price of one sku at the time a receipt is posted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductPrice {
    pub sku: String,
    pub price: f64,
    pub currency: String,
}

/// Store purchase token awaiting validation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub token: String,
    pub sku: String,
    pub context: ReceiptContext,
    #[serde(with = "time::serde::rfc3339")]
    pub process_date: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase_intent: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub prices: Vec<ProductPrice>,
}

impl Receipt {
    pub fn new(token: impl Into<String>, sku: impl Into<String>, context: ReceiptContext) -> Self {
        Self {
            token: token.into(),
            sku: sku.into(),
            context,
            process_date: OffsetDateTime::now_utc(),
            purchase_intent: None,
            prices: Vec::new(),
        }
    }

    pub fn with_purchase_intent(mut self, intent_id: impl Into<String>) -> Self {
        self.purchase_intent = Some(intent_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Success,
    Invalid,
    Expired,
    Stale,
    Failed,
    Processing,
    Deferred,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionFilter {
    New,
    Old,
}

/// Backend answer to a posted receipt
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptResponse {
    pub status: ReceiptStatus,
    #[serde(default)]
    pub new_transactions: Vec<Transaction>,
    #[serde(default)]
    pub old_transactions: Vec<Transaction>,
}

impl ReceiptResponse {
    /// Finds a transaction by sku, ignoring base plan suffixes. With
    /// `use_renewal_sku` the match is made on the product the subscription
    /// renews into instead.
    pub fn find_transaction_by_sku(
        &self,
        sku: &str,
        filter: TransactionFilter,
        use_renewal_sku: bool,
    ) -> Option<&Transaction> {
        let transactions = match filter {
            TransactionFilter::New => &self.new_transactions,
            TransactionFilter::Old => &self.old_transactions,
        };
        let wanted = base_sku(sku);

        transactions.iter().find(|transaction| {
            let candidate = if use_renewal_sku {
                match transaction.active.subscription_renewal_product_sku.as_deref() {
                    Some(renewal) => renewal,
                    None => return false,
                }
            } else {
                transaction.sku()
            };
            base_sku(candidate) == wanted
        })
    }
}
