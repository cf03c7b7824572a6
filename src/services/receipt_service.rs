use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::EngineConfig,
    error::{IapError, ReceiptErrorKind, Result},
    models::{
        common::{FetchContext, ProductType, ReceiptContext},
        product::{ProductDetails, Transaction},
        receipt::{ProductPrice, Receipt, ReceiptResponse, ReceiptStatus, TransactionFilter},
    },
    services::{billing::BillingClient, user_service::UserService},
    utils::{token_digest, Completion, QueueItem, SequentialQueue},
};

/// Result of one processed receipt
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiptOutcome {
    /// Transaction matching the receipt sku, if any
    pub transaction: Option<Transaction>,
    /// Every transaction the backend reported as new for this receipt
    pub new_transactions: Vec<Transaction>,
}

/// Decision taken for a validated receipt
#[derive(Debug)]
pub struct ReceiptResolution {
    /// Whether the store transaction must be finished
    pub should_finish: bool,
    pub outcome: Result<Option<Transaction>>,
}

/// Resolves a receipt against the backend response.
///
/// Purchase receipts look for a new transaction by sku, then by renewal sku.
/// Old transactions are only used to explain a miss: an old purchase owned
/// by another user is a `user_conflict`, any other one means the product was
/// already bought. Other contexts look at old transactions only and a miss is
/// not an error.
pub fn resolve_receipt(
    receipt: &Receipt,
    response: &ReceiptResponse,
    caller_id: Option<&str>,
    details: &HashMap<String, ProductDetails>,
    now: OffsetDateTime,
) -> ReceiptResolution {
    let is_purchase = receipt.context == ReceiptContext::Purchase;
    let quiet = |err: IapError| if is_purchase { err } else { err.silenced() };

    let (should_finish, error) = match response.status {
        ReceiptStatus::Success => (true, None),
        ReceiptStatus::Invalid | ReceiptStatus::Expired => (
            true,
            Some(quiet(IapError::receipt(
                ReceiptErrorKind::Invalid,
                if response.status == ReceiptStatus::Expired {
                    "Receipt is expired"
                } else {
                    "Receipt is invalid"
                },
            ))),
        ),
        ReceiptStatus::Stale => (
            true,
            Some(quiet(IapError::receipt(ReceiptErrorKind::Stale, "Receipt is stale"))),
        ),
        ReceiptStatus::Failed => (
            false,
            Some(quiet(IapError::receipt(ReceiptErrorKind::Failed, "Receipt validation failed"))),
        ),
        ReceiptStatus::Processing => (
            false,
            Some(quiet(IapError::receipt(
                ReceiptErrorKind::Processing,
                "Receipt validation still processing",
            ))),
        ),
        ReceiptStatus::Deferred => (false, Some(IapError::DeferredPayment)),
        ReceiptStatus::Unknown => (
            false,
            Some(IapError::unexpected(
                "receipt_status_unknown",
                "Unknown receipt status",
            )),
        ),
    };
    if let Some(err) = error {
        return ReceiptResolution {
            should_finish,
            outcome: Err(err),
        };
    }

    let found = if is_purchase {
        response
            .find_transaction_by_sku(&receipt.sku, TransactionFilter::New, false)
            .or_else(|| response.find_transaction_by_sku(&receipt.sku, TransactionFilter::New, true))
    } else {
        response.find_transaction_by_sku(&receipt.sku, TransactionFilter::Old, false)
    };

    let outcome = match found {
        Some(transaction) if owned_by_other(transaction, caller_id) => Err(IapError::UserConflict),
        Some(transaction) => {
            let mut transaction = transaction.clone();
            if transaction.active.product.details.is_none() {
                transaction.active.product.details = details.get(transaction.sku()).cloned();
            }
            Ok(Some(transaction))
        }
        None if !is_purchase => Ok(None),
        None => match response.find_transaction_by_sku(&receipt.sku, TransactionFilter::Old, false) {
            Some(old)
                if (old.product_type() == ProductType::NonConsumable
                    || old.active.is_active_subscription(now))
                    && owned_by_other(old, caller_id) =>
            {
                Err(IapError::UserConflict)
            }
            Some(_) => Err(IapError::ProductAlreadyPurchased(receipt.sku.clone())),
            None => Err(IapError::TransactionNotFound(receipt.sku.clone())),
        },
    };

    ReceiptResolution {
        should_finish,
        outcome,
    }
}

fn owned_by_other(transaction: &Transaction, caller_id: Option<&str>) -> bool {
    match (transaction.user.as_deref(), caller_id) {
        (Some(owner), Some(caller)) => owner != caller,
        _ => false,
    }
}

/// Receipt waiting in the processing queue
pub struct PendingReceipt {
    pub receipt: Receipt,
    reply: Option<oneshot::Sender<Result<ReceiptOutcome>>>,
}

struct LastReceipt {
    token: String,
    processed_at: Instant,
}

/// Processes receipts one at a time, in the order they were submitted
pub struct ReceiptService {
    config: EngineConfig,
    user: Arc<UserService>,
    billing: Arc<dyn BillingClient>,
    queue: SequentialQueue<PendingReceipt>,
    last_receipt: Mutex<Option<LastReceipt>>,
}

impl ReceiptService {
    /// Must be called inside a Tokio runtime
    pub fn new(
        config: &EngineConfig,
        user: Arc<UserService>,
        billing: Arc<dyn BillingClient>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let queue = SequentialQueue::new(
                "receipts",
                move |item: QueueItem<PendingReceipt>, completion: Completion| {
                    let Some(service) = weak.upgrade() else {
                        completion.complete();
                        return;
                    };
                    tokio::spawn(async move {
                        service.handle(item).await;
                        completion.complete();
                    });
                },
            );

            Self {
                config: config.clone(),
                user,
                billing,
                queue,
                last_receipt: Mutex::new(None),
            }
        })
    }

    /// Queues a receipt without waiting for it
    pub fn enqueue(&self, receipt: Receipt) {
        self.queue.enqueue(PendingReceipt {
            receipt,
            reply: None,
        });
    }

    /// Queues a receipt; the receiver resolves once it has been processed
    pub fn submit(&self, receipt: Receipt) -> oneshot::Receiver<Result<ReceiptOutcome>> {
        let (tx, rx) = oneshot::channel();
        self.queue.enqueue(PendingReceipt {
            receipt,
            reply: Some(tx),
        });
        rx
    }

    /// Queues a receipt and waits for its outcome
    pub async fn process(&self, receipt: Receipt) -> Result<ReceiptOutcome> {
        self.submit(receipt)
            .await
            .map_err(|_| IapError::unexpected("receipt_dropped", "Receipt left the queue unprocessed"))?
    }

    pub fn pause(&self) {
        self.queue.pause();
    }

    pub fn resume(&self) {
        self.queue.resume(None);
    }

    /// Waits until every queued receipt is processed
    pub async fn drain(&self) {
        self.queue.drain().await;
    }

    async fn handle(&self, item: QueueItem<PendingReceipt>) {
        let waited = item.age();
        let PendingReceipt { receipt, reply } = item.payload;
        debug!(
            "Processing {} receipt for {} after {:?} in queue",
            receipt.context.as_str(),
            receipt.sku,
            waited
        );

        let result = self.process_receipt(receipt).await;
        if let Err(e) = &result {
            self.user.reporter().report(e, Some(&self.user.user_id()));
        }
        if let Some(reply) = reply {
            // The caller may have stopped waiting
            let _ = reply.send(result);
        }
    }

    /// Records the receipt and returns whether it repeats the previous one
    fn is_duplicate(&self, receipt: &Receipt) -> bool {
        let now = Instant::now();
        let mut last = self
            .last_receipt
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let duplicate = receipt.context == ReceiptContext::Refresh
            && matches!(
                last.as_ref(),
                Some(prev) if prev.token == receipt.token
                    && now.duration_since(prev.processed_at) < self.config.receipt_dedup_window()
            );

        *last = Some(LastReceipt {
            token: receipt.token.clone(),
            processed_at: now,
        });
        duplicate
    }

    #[instrument(skip(self, receipt), fields(sku = %receipt.sku, token = %token_digest(&receipt.token), context = receipt.context.as_str()))]
    async fn process_receipt(&self, mut receipt: Receipt) -> Result<ReceiptOutcome> {
        if self.is_duplicate(&receipt) {
            debug!("Skipping duplicate receipt");
            return Ok(ReceiptOutcome::default());
        }

        receipt.prices = self.pricing_snapshot(&receipt.sku).await;
        let response = self.user.post_receipt(&receipt).await?;
        info!("Receipt validated with status {:?}", response.status);

        let terminal = matches!(
            response.status,
            ReceiptStatus::Success
                | ReceiptStatus::Invalid
                | ReceiptStatus::Expired
                | ReceiptStatus::Stale
        );
        if terminal {
            if let Err(e) = self.user.fetch(FetchContext::Receipt).await {
                warn!("User refresh after receipt failed: {}", e);
            }
        }

        let resolution = resolve_receipt(
            &receipt,
            &response,
            self.user.iaphub_id().as_deref(),
            &self.user.known_details(),
            OffsetDateTime::now_utc(),
        );

        if resolution.should_finish {
            self.finish(&receipt, &response).await;
        }

        let transaction = resolution.outcome?;
        Ok(ReceiptOutcome {
            transaction,
            new_transactions: response.new_transactions,
        })
    }

    /// Prices of the receipt sku and its group siblings, as far as the store
    /// knows them
    async fn pricing_snapshot(&self, sku: &str) -> Vec<ProductPrice> {
        let skus = self.user.group_skus(sku, self.config.sibling_price_limit);
        let details = self.user.resolve_details(&skus).await;

        skus.iter()
            .filter_map(|sku| details.get(sku))
            .filter_map(|d| {
                Some(ProductPrice {
                    sku: d.sku.clone(),
                    price: d.price?,
                    currency: d.currency.clone()?,
                })
            })
            .collect()
    }

    /// Consumes consumables and acknowledges everything else
    async fn finish(&self, receipt: &Receipt, response: &ReceiptResponse) {
        let product_type = response
            .find_transaction_by_sku(&receipt.sku, TransactionFilter::New, false)
            .or_else(|| response.find_transaction_by_sku(&receipt.sku, TransactionFilter::Old, false))
            .map(Transaction::product_type)
            .or_else(|| {
                self.user
                    .snapshot()
                    .find_product(&receipt.sku)
                    .map(|p| p.product_type)
            });

        let result = if product_type == Some(ProductType::Consumable) {
            self.billing.consume(&receipt.token).await
        } else {
            self.billing.acknowledge(&receipt.token).await
        };

        match result {
            Ok(()) => debug!("Finished store transaction {}", token_digest(&receipt.token)),
            Err(e) => warn!(
                "Failed to finish store transaction {}: {}",
                token_digest(&receipt.token),
                e
            ),
        }
    }
}
