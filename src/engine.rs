use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

use crate::{
    config::Config,
    error::{IapError, Result},
    models::{
        common::{FetchContext, ReceiptContext, SubscriptionState},
        intent::BuyOptions,
        product::{ActiveProduct, Product, Transaction},
        receipt::Receipt,
        user::{ProductsResponse, RestoreResponse, UserUpdate},
    },
    services::{
        billing::{PurchaseState, StorePurchase},
        purchase_intent_service::{check_purchase_allowed, IntentReservation},
        user_service::RefreshPolicy,
        ApiClient, ApiErrorSink, BillingClient, CacheService, CacheStorage, ErrorReporter,
        ErrorSink, PurchaseIntentService, ReceiptService, RetryableTransport, Transport,
        UserService,
    },
    utils::{token_digest, ProcessingFlag},
};

/// Collaborators provided by the embedding app
pub struct EngineDeps {
    pub transport: Arc<dyn Transport>,
    pub billing: Arc<dyn BillingClient>,
    pub storage: Arc<dyn CacheStorage>,
    /// Defaults to posting reports to the backend log endpoint
    pub error_sink: Option<Arc<dyn ErrorSink>>,
}

impl EngineDeps {
    pub fn new(
        transport: Arc<dyn Transport>,
        billing: Arc<dyn BillingClient>,
        storage: Arc<dyn CacheStorage>,
    ) -> Self {
        Self {
            transport,
            billing,
            storage,
            error_sink: None,
        }
    }

    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = Some(sink);
        self
    }
}

type PurchaseEvents = mpsc::UnboundedReceiver<StorePurchase>;

struct Listener {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<PurchaseEvents>,
}

/// Purchase reconciliation engine, one per app instance
pub struct Engine {
    config: Arc<Config>,
    billing: Arc<dyn BillingClient>,
    user: Arc<UserService>,
    receipts: Arc<ReceiptService>,
    intents: PurchaseIntentService,
    restore_processing: ProcessingFlag,
    events: Mutex<Option<PurchaseEvents>>,
    listener: tokio::sync::Mutex<Option<Listener>>,
}

impl Engine {
    /// Wires every service. Starts as the install's anonymous user; call
    /// [`Engine::login`] to switch identity.
    pub async fn new(config: Config, deps: EngineDeps) -> Result<Self> {
        config
            .validate()
            .map_err(|e| IapError::unexpected("invalid_config", e.to_string()))?;

        let platform = deps.billing.platform();
        let transport = RetryableTransport::new(deps.transport, config.api.retry_policy());
        let api = Arc::new(ApiClient::new(&config.api, platform, transport));

        let sink = deps
            .error_sink
            .unwrap_or_else(|| Arc::new(ApiErrorSink::new(api.clone())));
        let reporter = Arc::new(ErrorReporter::new(sink, &config.error_reporting));

        let cache = CacheService::new(
            deps.storage,
            &config.api.app_id,
            &config.engine.cache_version,
        );
        let anonymous_id = cache.anonymous_id().await?;

        let user = Arc::new(UserService::new(
            &config.engine,
            api.clone(),
            deps.billing.clone(),
            cache,
            reporter,
            anonymous_id,
        ));
        let receipts = ReceiptService::new(&config.engine, user.clone(), deps.billing.clone());
        let events = deps.billing.take_purchase_events();

        info!(
            "Engine initialized for app {} on {} ({})",
            config.api.app_id, platform, config.api.environment
        );

        Ok(Self {
            intents: PurchaseIntentService::new(api),
            config: Arc::new(config),
            billing: deps.billing,
            user,
            receipts,
            restore_processing: ProcessingFlag::default(),
            events: Mutex::new(events),
            listener: tokio::sync::Mutex::new(None),
        })
    }

    /// Starts listening to store purchase events
    pub async fn start(&self) {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return;
        }
        self.receipts.resume();

        let events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut events) = events else {
            warn!("Store purchase events unavailable, listener not started");
            return;
        };

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let receipts = self.receipts.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    event = events.recv() => match event {
                        Some(purchase) => on_store_purchase(&receipts, purchase),
                        None => break,
                    },
                }
            }
            events
        });

        *listener = Some(Listener { shutdown, handle });
        info!("Engine started");
    }

    /// Stops the event listener and pauses receipt processing. Receipts
    /// already queued are kept for the next start.
    pub async fn stop(&self) {
        let listener = self.listener.lock().await.take();
        if let Some(Listener { shutdown, handle }) = listener {
            let _ = shutdown.send(true);
            match handle.await {
                Ok(events) => {
                    *self.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(events);
                }
                Err(e) => warn!("Purchase listener ended abnormally: {}", e),
            }
        }
        self.receipts.pause();
        info!("Engine stopped");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn user_id(&self) -> String {
        self.user.user_id()
    }

    pub fn subscribe_user_updates(&self) -> broadcast::Receiver<UserUpdate> {
        self.user.subscribe()
    }

    fn report(&self, err: &IapError) {
        self.user.reporter().report(err, Some(&self.user.user_id()));
    }

    /// Switches to `user_id` and fetches the new identity. A failed fetch
    /// does not fail the login; the next getter retries it.
    pub async fn login(&self, user_id: &str) -> Result<()> {
        if let Err(e) = self.user.login(user_id).await {
            self.report(&e);
            return Err(e);
        }
        if let Err(e) = self
            .user
            .refresh(RefreshPolicy::Adaptive, FetchContext::Login)
            .await
        {
            warn!("Fetch after login failed: {}", e);
        }
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        self.user.logout().await
    }

    pub async fn set_tags(&self, tags: HashMap<String, String>) -> Result<()> {
        let result = self.user.set_tags(tags).await;
        if let Err(e) = &result {
            self.report(e);
        }
        result
    }

    /// Returns whether the language changed
    pub fn set_lang(&self, lang: &str) -> Result<bool> {
        self.user.set_lang(lang)
    }

    /// Refreshes the user when the staleness policy says so
    pub async fn refresh(&self) -> Result<bool> {
        self.user
            .refresh(RefreshPolicy::Adaptive, FetchContext::Refresh)
            .await
    }

    pub async fn get_products_for_sale(&self) -> Result<Vec<Product>> {
        self.user.get_products_for_sale().await
    }

    pub async fn get_active_products(
        &self,
        include_states: &[SubscriptionState],
    ) -> Result<Vec<ActiveProduct>> {
        self.user.get_active_products(include_states).await
    }

    pub async fn get_products(&self, include_states: &[SubscriptionState]) -> Result<ProductsResponse> {
        self.user.get_products(include_states).await
    }

    /// Buys a product and returns the validated transaction
    #[instrument(skip(self, options))]
    pub async fn buy(&self, sku: &str, options: BuyOptions) -> Result<Transaction> {
        let result = self.try_buy(sku, &options).await;
        match &result {
            Ok(transaction) => info!("Purchase of {} completed", transaction.sku()),
            Err(e) => {
                warn!("Purchase of {} failed: {}", sku, e);
                self.report(e);
            }
        }
        result
    }

    async fn try_buy(&self, sku: &str, options: &BuyOptions) -> Result<Transaction> {
        let snapshot = self.user.snapshot();
        if snapshot.is_anonymous && !self.config.engine.allow_anonymous_purchase {
            return Err(IapError::AnonymousPurchaseNotAllowed);
        }

        let reservation = self.intents.reserve()?;
        let outcome = self.purchase(&reservation, sku, options).await;
        reservation.confirm(&outcome).await;
        outcome
    }

    async fn purchase(
        &self,
        reservation: &IntentReservation<'_>,
        sku: &str,
        options: &BuyOptions,
    ) -> Result<Transaction> {
        self.billing
            .readiness()
            .wait(self.config.engine.store_ready_timeout())
            .await?;

        reservation.create(&self.user.user_id(), sku).await?;
        self.user
            .refresh(RefreshPolicy::Required, FetchContext::Purchase)
            .await?;

        let product = self.user.find_product(sku).await?;
        let active_products = self.user.snapshot().active_products;
        check_purchase_allowed(
            &active_products,
            &product,
            self.billing.platform(),
            options,
            OffsetDateTime::now_utc(),
        )?;

        let purchase = self.billing.purchase(&product.sku).await?;
        if purchase.state == PurchaseState::Pending {
            return Err(IapError::DeferredPayment);
        }

        let mut receipt = Receipt::new(purchase.token, purchase.sku, ReceiptContext::Purchase);
        if let Some(intent_id) = reservation.intent_id() {
            receipt = receipt.with_purchase_intent(intent_id);
        }

        self.receipts
            .process(receipt)
            .await?
            .transaction
            .ok_or_else(|| IapError::TransactionNotFound(sku.to_string()))
    }

    /// Replays every purchase the store knows about.
    ///
    /// Succeeds when nothing failed or when anything was recovered, in which
    /// case partial failures are only logged.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<RestoreResponse> {
        let _guard = self
            .restore_processing
            .try_acquire()
            .ok_or(IapError::RestoreProcessing)?;

        self.billing
            .readiness()
            .wait(self.config.engine.store_ready_timeout())
            .await?;

        let before = self.user.snapshot().active_products;
        let purchases = self.billing.restore().await?;
        info!("Restoring {} store purchases", purchases.len());

        self.receipts.pause();
        let replies: Vec<_> = purchases
            .into_iter()
            .map(|p| {
                self.receipts
                    .submit(Receipt::new(p.token, p.sku, ReceiptContext::Restore))
            })
            .collect();
        self.receipts.drain().await;

        let mut new_purchases: Vec<Transaction> = Vec::new();
        let mut error = None;
        for reply in replies {
            match reply.await {
                Ok(Ok(outcome)) => {
                    for transaction in outcome.new_transactions {
                        if !new_purchases.contains(&transaction) {
                            new_purchases.push(transaction);
                        }
                    }
                }
                Ok(Err(e)) => {
                    error.get_or_insert(e);
                }
                Err(_) => {
                    error.get_or_insert(IapError::unexpected(
                        "receipt_dropped",
                        "Restored receipt left the queue unprocessed",
                    ));
                }
            }
        }

        self.user.mark_stale();
        if let Err(e) = self
            .user
            .refresh(RefreshPolicy::Required, FetchContext::Restore)
            .await
        {
            error.get_or_insert(e);
        }

        let transferred_active_products: Vec<ActiveProduct> = self
            .user
            .snapshot()
            .active_products
            .into_iter()
            .filter(|active| {
                !before.iter().any(|b| b.sku() == active.sku())
                    && !new_purchases.iter().any(|n| n.sku() == active.sku())
            })
            .collect();

        let recovered = !new_purchases.is_empty() || !transferred_active_products.is_empty();
        match error {
            Some(e) if !recovered => {
                self.report(&e);
                Err(e)
            }
            error => {
                if let Some(e) = error {
                    warn!("Restore partially failed: {}", e);
                }
                info!(
                    "Restore done: {} new purchases, {} transferred",
                    new_purchases.len(),
                    transferred_active_products.len()
                );
                Ok(RestoreResponse {
                    new_purchases,
                    transferred_active_products,
                })
            }
        }
    }
}

/// Store callbacks outside of `buy` are validated as refresh receipts
fn on_store_purchase(receipts: &ReceiptService, purchase: StorePurchase) {
    if purchase.state != PurchaseState::Purchased || purchase.is_acknowledged {
        debug!(
            "Ignoring store event for {} ({:?}, acknowledged={})",
            purchase.sku, purchase.state, purchase.is_acknowledged
        );
        return;
    }

    debug!(
        "Store purchase event for {} ({})",
        purchase.sku,
        token_digest(&purchase.token)
    );
    receipts.enqueue(Receipt::new(
        purchase.token,
        purchase.sku,
        ReceiptContext::Refresh,
    ));
}
