//! Platform billing seam
//!
//! The engine talks to the store through [`BillingClient`]. The embedding app
//! provides the real implementation; [`MockBillingClient`] is the in-process
//! variant used by tests and the CLI.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::{
    error::{IapError, Result},
    models::{common::Platform, product::ProductDetails},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseState {
    Purchased,
    Pending,
    Unknown,
}

/// Purchase event emitted by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePurchase {
    pub token: String,
    pub sku: String,
    pub is_acknowledged: bool,
    pub state: PurchaseState,
}

impl StorePurchase {
    pub fn purchased(token: impl Into<String>, sku: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            sku: sku.into(),
            is_acknowledged: false,
            state: PurchaseState::Purchased,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Unavailable,
}

/// Gate released once the billing library is connected
#[derive(Debug)]
pub struct StoreReadiness {
    tx: watch::Sender<Readiness>,
}

impl Default for StoreReadiness {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(Readiness::Pending);
        Self { tx }
    }
}

impl StoreReadiness {
    pub fn mark_ready(&self) {
        self.tx.send_replace(Readiness::Ready);
    }

    pub fn mark_unavailable(&self) {
        self.tx.send_replace(Readiness::Unavailable);
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow() == Readiness::Ready
    }

    /// Waits for the store, failing with `billing_unavailable` on timeout.
    /// Every concurrent waiter gets the same treatment.
    pub async fn wait(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.tx.subscribe();
        let settled = tokio::time::timeout(timeout, rx.wait_for(|r| *r != Readiness::Pending)).await;

        match settled {
            Ok(Ok(state)) if *state == Readiness::Ready => Ok(()),
            Ok(_) => Err(IapError::BillingUnavailable),
            Err(_) => {
                warn!("Store not ready after {:?}", timeout);
                Err(IapError::BillingUnavailable)
            }
        }
    }
}

#[async_trait]
pub trait BillingClient: Send + Sync {
    fn platform(&self) -> Platform;

    fn readiness(&self) -> &StoreReadiness;

    /// Stream of purchase updates; can only be taken once
    fn take_purchase_events(&self) -> Option<mpsc::UnboundedReceiver<StorePurchase>>;

    async fn get_products_details(&self, skus: &[String]) -> Result<Vec<ProductDetails>>;

    /// Starts the platform purchase flow and returns the resulting purchase
    async fn purchase(&self, sku: &str) -> Result<StorePurchase>;

    /// Purchases currently owned according to the store
    async fn restore(&self) -> Result<Vec<StorePurchase>>;

    /// Idempotent on an already finished token
    async fn acknowledge(&self, token: &str) -> Result<()>;

    /// Idempotent on an already finished token
    async fn consume(&self, token: &str) -> Result<()>;
}

#[derive(Default)]
struct MockState {
    details: HashMap<String, ProductDetails>,
    owned: Vec<StorePurchase>,
    purchase_results: VecDeque<Result<StorePurchase>>,
    acknowledged: Vec<String>,
    consumed: Vec<String>,
    detail_requests: usize,
    token_counter: usize,
}

/// In-memory store
pub struct MockBillingClient {
    platform: Platform,
    readiness: StoreReadiness,
    state: Mutex<MockState>,
    events_tx: mpsc::UnboundedSender<StorePurchase>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<StorePurchase>>>,
}

impl MockBillingClient {
    /// Ready immediately
    pub fn new(platform: Platform) -> Self {
        let client = Self::pending(platform);
        client.readiness.mark_ready();
        client
    }

    /// Not ready until `readiness().mark_ready()` is called
    pub fn pending(platform: Platform) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            platform,
            readiness: StoreReadiness::default(),
            state: Mutex::new(MockState::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_product(&self, details: ProductDetails) {
        self.lock().details.insert(details.sku.clone(), details);
    }

    pub fn remove_product(&self, sku: &str) {
        self.lock().details.remove(sku);
    }

    pub fn add_owned_purchase(&self, purchase: StorePurchase) {
        self.lock().owned.push(purchase);
    }

    /// Result returned by the next `purchase` call instead of a generated one
    pub fn push_purchase_result(&self, result: Result<StorePurchase>) {
        self.lock().purchase_results.push_back(result);
    }

    /// Simulates an asynchronous store callback
    pub fn emit_purchase(&self, purchase: StorePurchase) {
        if self.events_tx.send(purchase).is_err() {
            warn!("Purchase event dropped, no listener");
        }
    }

    pub fn acknowledged_tokens(&self) -> Vec<String> {
        self.lock().acknowledged.clone()
    }

    pub fn consumed_tokens(&self) -> Vec<String> {
        self.lock().consumed.clone()
    }

    pub fn detail_requests(&self) -> usize {
        self.lock().detail_requests
    }
}

#[async_trait]
impl BillingClient for MockBillingClient {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn readiness(&self) -> &StoreReadiness {
        &self.readiness
    }

    fn take_purchase_events(&self) -> Option<mpsc::UnboundedReceiver<StorePurchase>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn get_products_details(&self, skus: &[String]) -> Result<Vec<ProductDetails>> {
        let mut state = self.lock();
        state.detail_requests += 1;
        Ok(skus
            .iter()
            .filter_map(|sku| state.details.get(sku).cloned())
            .collect())
    }

    async fn purchase(&self, sku: &str) -> Result<StorePurchase> {
        let mut state = self.lock();
        if let Some(result) = state.purchase_results.pop_front() {
            return result;
        }
        if !state.details.contains_key(sku) {
            return Err(IapError::ProductNotAvailable(sku.to_string()));
        }

        state.token_counter += 1;
        let purchase = StorePurchase::purchased(format!("mock_token_{}", state.token_counter), sku);
        state.owned.push(purchase.clone());
        debug!("Mock purchase of {} completed", sku);
        Ok(purchase)
    }

    async fn restore(&self) -> Result<Vec<StorePurchase>> {
        Ok(self.lock().owned.clone())
    }

    async fn acknowledge(&self, token: &str) -> Result<()> {
        let mut state = self.lock();
        if !state.acknowledged.iter().any(|t| t == token) {
            state.acknowledged.push(token.to_string());
        }
        Ok(())
    }

    async fn consume(&self, token: &str) -> Result<()> {
        let mut state = self.lock();
        if !state.consumed.iter().any(|t| t == token) {
            state.consumed.push(token.to_string());
        }
        state.owned.retain(|p| p.token != token);
        Ok(())
    }
}
