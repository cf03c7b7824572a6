//! User state ownership: staleness policy, coalesced fetches, snapshot
//! restore and identity changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::EngineConfig,
    error::{IapError, Result},
    models::{
        api::{UserFetch, UserResponse},
        common::{FetchContext, SubscriptionState},
        product::{ActiveProduct, Product, ProductDetails},
        receipt::{Receipt, ReceiptResponse},
        user::{is_anonymous_id, ProductsResponse, UserState, UserUpdate},
    },
    services::{
        api_service::ApiClient, billing::BillingClient, cache_service::CacheService,
        error_reporter::ErrorReporter,
    },
    utils::{ProcessingFlag, SingleFlight},
};

/// How fresh the state must be for a refresh to skip the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Server interval, tightened while a subscription is active
    Adaptive,
    /// Always fetch
    Required,
}

/// Interval used by [`RefreshPolicy::Adaptive`]
pub fn refresh_interval(state: &UserState, now: OffsetDateTime, config: &EngineConfig) -> Duration {
    if state.has_active_subscription(now) {
        return config.subscription_refresh_interval();
    }
    state
        .foreground_refresh_interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.refresh_interval())
}

pub fn is_fetch_due(
    state: &UserState,
    now: OffsetDateTime,
    policy: RefreshPolicy,
    config: &EngineConfig,
) -> bool {
    let Some(fetch_date) = state.fetch_date else {
        return true;
    };
    if state.needs_fetch {
        return true;
    }
    if matches!(state.receipt_post_date, Some(posted) if posted > fetch_date) {
        return true;
    }

    let interval = match policy {
        RefreshPolicy::Required => return true,
        RefreshPolicy::Adaptive => refresh_interval(state, now, config),
    };
    // An interval too large to represent never elapses
    match time::Duration::try_from(interval)
        .ok()
        .and_then(|interval| fetch_date.checked_add(interval))
    {
        Some(due_date) => now >= due_date,
        None => false,
    }
}

type FetchOutcome = std::result::Result<bool, IapError>;

pub struct UserService {
    config: EngineConfig,
    api: Arc<ApiClient>,
    billing: Arc<dyn BillingClient>,
    cache: CacheService,
    reporter: Arc<ErrorReporter>,
    state: Mutex<UserState>,
    lang: Mutex<Option<String>>,
    fetch_flight: SingleFlight<FetchOutcome>,
    /// Bumped on every identity switch
    generation: AtomicU64,
    /// Generation whose snapshot has been looked up; held across the load
    cache_checked: AsyncMutex<Option<u64>>,
    tags_processing: ProcessingFlag,
    updates: broadcast::Sender<UserUpdate>,
}

impl UserService {
    pub fn new(
        config: &EngineConfig,
        api: Arc<ApiClient>,
        billing: Arc<dyn BillingClient>,
        cache: CacheService,
        reporter: Arc<ErrorReporter>,
        user_id: String,
    ) -> Self {
        let (updates, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(UserState::new(user_id, config.cache_version.as_str())),
            lang: Mutex::new(config.lang.clone()),
            config: config.clone(),
            api,
            billing,
            cache,
            reporter,
            fetch_flight: SingleFlight::new(),
            generation: AtomicU64::new(0),
            cache_checked: AsyncMutex::new(None),
            tags_processing: ProcessingFlag::default(),
            updates,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, UserState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> UserState {
        self.lock_state().clone()
    }

    pub fn user_id(&self) -> String {
        self.lock_state().id.clone()
    }

    pub fn iaphub_id(&self) -> Option<String> {
        self.lock_state().iaphub_id.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserUpdate> {
        self.updates.subscribe()
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    /// Forces the next refresh to hit the network
    pub fn mark_stale(&self) {
        self.lock_state().needs_fetch = true;
    }

    fn notify(&self) {
        let user_id = self.user_id();
        debug!("User {} updated", user_id);
        // No receivers is fine
        let _ = self.updates.send(UserUpdate { user_id });
    }

    async fn save(&self) {
        let snapshot = self.snapshot();
        if let Err(e) = self.cache.save(&snapshot).await {
            warn!("Failed to save user snapshot: {}", e);
        }
    }

    /// Restores the cached snapshot once, before the first fetch of the
    /// current identity. Concurrent callers wait for the lookup to finish.
    async fn restore_cached_once(&self) {
        let mut checked = self.cache_checked.lock().await;
        let generation = self.generation.load(Ordering::SeqCst);
        if *checked == Some(generation) {
            return;
        }
        *checked = Some(generation);

        let (id, anonymous, fetched) = {
            let state = self.lock_state();
            (state.id.clone(), state.is_anonymous, state.fetch_date.is_some())
        };
        if fetched {
            return;
        }

        if let Some(cached) = self.cache.load(&id, anonymous).await {
            let mut state = self.lock_state();
            if state.id == cached.id && state.fetch_date.is_none() {
                let needs_fetch = state.needs_fetch || cached.needs_fetch;
                *state = cached;
                state.needs_fetch = needs_fetch;
                info!("Restored cached snapshot for user {}", id);
            }
        }
    }

    /// Fetches the user, joining the in-flight fetch if there is one.
    /// Returns whether the state changed.
    pub async fn fetch(self: &Arc<Self>, context: FetchContext) -> Result<bool> {
        let this = self.clone();
        let flight = self
            .fetch_flight
            .run(move || async move { this.fetch_now(context).await })
            .await?;

        if flight.first && matches!(flight.value, Ok(true)) {
            self.notify();
        }
        flight.value
    }

    #[instrument(skip(self))]
    async fn fetch_now(&self, context: FetchContext) -> Result<bool> {
        self.restore_cached_once().await;

        let (id, etag) = {
            let state = self.lock_state();
            (state.id.clone(), state.etag.clone())
        };
        let lang = self.lang.lock().unwrap_or_else(PoisonError::into_inner).clone();

        let fetched = self
            .api
            .get_user(&id, etag.as_deref(), lang.as_deref(), context)
            .await?;

        match fetched {
            UserFetch::NotModified => {
                {
                    let mut state = self.lock_state();
                    if state.id != id {
                        debug!("Identity changed during fetch, dropping response");
                        return Ok(false);
                    }
                    state.fetch_date = Some(OffsetDateTime::now_utc());
                    state.needs_fetch = false;
                }
                let changed = self.update_filtered_products().await;
                self.save().await;
                Ok(changed)
            }
            UserFetch::Updated { user, etag } => {
                let changed = self.apply_user_response(&id, user, etag).await;
                if changed.is_some() {
                    self.save().await;
                }
                Ok(changed.unwrap_or(false))
            }
        }
    }

    /// `None` when the identity changed while the request was in flight
    async fn apply_user_response(
        &self,
        requested_id: &str,
        response: UserResponse,
        etag: Option<String>,
    ) -> Option<bool> {
        let mut skus: Vec<String> = response
            .products_for_sale
            .iter()
            .map(|p| p.sku.clone())
            .chain(response.active_products.iter().map(|p| p.sku().to_string()))
            .collect();
        skus.sort();
        skus.dedup();
        let details = self.resolve_details(&skus).await;

        let (products_for_sale, filtered_products_for_sale): (Vec<Product>, Vec<Product>) =
            response
                .products_for_sale
                .into_iter()
                .map(|mut product| {
                    product.details = details.get(&product.sku).cloned();
                    product
                })
                .partition(Product::is_purchasable);

        let active_products: Vec<ActiveProduct> = response
            .active_products
            .into_iter()
            .map(|mut active| {
                active.product.details = details.get(active.sku()).cloned();
                active
            })
            .collect();

        if !filtered_products_for_sale.is_empty() {
            warn!(
                "{} products could not be resolved by the store: {:?}",
                filtered_products_for_sale.len(),
                filtered_products_for_sale
                    .iter()
                    .map(|p| p.sku.as_str())
                    .collect::<Vec<_>>()
            );
        }

        let mut state = self.lock_state();
        if state.id != requested_id {
            debug!("Identity changed during fetch, dropping response");
            return None;
        }

        let changed = state.products_for_sale != products_for_sale
            || state.filtered_products_for_sale != filtered_products_for_sale
            || state.active_products != active_products
            || state.paywall_id != response.paywall_id;

        state.iaphub_id = Some(response.id);
        state.products_for_sale = products_for_sale;
        state.filtered_products_for_sale = filtered_products_for_sale;
        state.active_products = active_products;
        state.paywall_id = response.paywall_id;
        state.foreground_refresh_interval = response.foreground_refresh_interval;
        state.etag = etag;
        state.fetch_date = Some(OffsetDateTime::now_utc());
        state.needs_fetch = false;

        info!(
            "Fetched user {}: {} products for sale, {} active (changed={})",
            state.id,
            state.products_for_sale.len(),
            state.active_products.len(),
            changed
        );
        Some(changed)
    }

    /// Store metadata for the given skus; empty when the store is unavailable
    pub async fn resolve_details(&self, skus: &[String]) -> HashMap<String, ProductDetails> {
        if skus.is_empty() {
            return HashMap::new();
        }
        if let Err(e) = self
            .billing
            .readiness()
            .wait(self.config.store_ready_timeout())
            .await
        {
            warn!("Cannot resolve product details: {}", e);
            return HashMap::new();
        }

        match self.billing.get_products_details(skus).await {
            Ok(details) => details.into_iter().map(|d| (d.sku.clone(), d)).collect(),
            Err(e) => {
                warn!("Product details lookup failed: {}", e);
                HashMap::new()
            }
        }
    }

    /// Retries store metadata for filtered products, without a network call.
    /// Returns whether any product became available.
    async fn update_filtered_products(&self) -> bool {
        let skus: Vec<String> = self
            .lock_state()
            .filtered_products_for_sale
            .iter()
            .map(|p| p.sku.clone())
            .collect();
        if skus.is_empty() {
            return false;
        }

        let details = self.resolve_details(&skus).await;
        if details.is_empty() {
            return false;
        }

        let moved = {
            let mut state = self.lock_state();
            let filtered = std::mem::take(&mut state.filtered_products_for_sale);
            let (resolved, still_filtered): (Vec<Product>, Vec<Product>) = filtered
                .into_iter()
                .map(|mut product| {
                    if let Some(d) = details.get(&product.sku) {
                        product.details = Some(d.clone());
                    }
                    product
                })
                .partition(Product::is_purchasable);
            state.filtered_products_for_sale = still_filtered;
            let moved = resolved.len();
            state.products_for_sale.extend(resolved);
            moved
        };

        debug!("{} filtered products resolved", moved);
        moved > 0
    }

    /// Fetches when the staleness policy says so, otherwise only retries
    /// unresolved products
    pub async fn refresh(self: &Arc<Self>, policy: RefreshPolicy, context: FetchContext) -> Result<bool> {
        self.restore_cached_once().await;

        let due = {
            let state = self.lock_state();
            is_fetch_due(&state, OffsetDateTime::now_utc(), policy, &self.config)
        };
        if due {
            return self.fetch(context).await;
        }

        let changed = self.update_filtered_products().await;
        if changed {
            self.save().await;
            self.notify();
        }
        Ok(changed)
    }

    /// Refreshes, falling back to cached data when the refresh fails and a
    /// previous fetch succeeded
    async fn refresh_or_cached(self: &Arc<Self>, policy: RefreshPolicy) -> Result<UserState> {
        match self.refresh(policy, FetchContext::Refresh).await {
            Ok(_) => Ok(self.snapshot()),
            Err(e) => {
                let snapshot = self.snapshot();
                self.reporter.report(&e, Some(&snapshot.id));
                if snapshot.fetch_date.is_some() {
                    warn!("Refresh failed, serving cached data: {}", e);
                    Ok(snapshot)
                } else {
                    Err(e)
                }
            }
        }
    }

    pub async fn get_products_for_sale(self: &Arc<Self>) -> Result<Vec<Product>> {
        Ok(self
            .refresh_or_cached(RefreshPolicy::Adaptive)
            .await?
            .products_for_sale)
    }

    /// Active products; subscriptions in retry or paused states are only
    /// included when listed in `include_states`
    pub async fn get_active_products(
        self: &Arc<Self>,
        include_states: &[SubscriptionState],
    ) -> Result<Vec<ActiveProduct>> {
        let state = self.refresh_or_cached(RefreshPolicy::Adaptive).await?;
        Ok(filter_active(state.active_products, include_states))
    }

    pub async fn get_products(
        self: &Arc<Self>,
        include_states: &[SubscriptionState],
    ) -> Result<ProductsResponse> {
        let state = self.refresh_or_cached(RefreshPolicy::Adaptive).await?;
        Ok(ProductsResponse {
            products_for_sale: state.products_for_sale,
            active_products: filter_active(state.active_products, include_states),
        })
    }

    /// Catalog product, or an on-demand lookup for unknown skus
    pub async fn find_product(&self, sku: &str) -> Result<Product> {
        let cached = self.lock_state().find_product(sku).cloned();
        let mut product = match cached {
            Some(product) => product,
            None => {
                debug!("Sku {} not in catalog, fetching it", sku);
                self.api.get_product(sku).await?
            }
        };

        if product.details.is_none() {
            product.details = self
                .resolve_details(&[product.sku.clone()])
                .await
                .remove(&product.sku);
        }
        if !product.is_purchasable() {
            return Err(IapError::ProductNotAvailable(sku.to_string()));
        }
        Ok(product)
    }

    /// Details of every product the state knows about
    pub fn known_details(&self) -> HashMap<String, ProductDetails> {
        let state = self.lock_state();
        state
            .products_for_sale
            .iter()
            .chain(state.active_products.iter().map(|p| &p.product))
            .filter_map(|p| p.details.clone().map(|d| (p.sku.clone(), d)))
            .collect()
    }

    /// Skus of the product's group: the given sku first, then at most
    /// `limit` siblings
    pub fn group_skus(&self, sku: &str, limit: usize) -> Vec<String> {
        let state = self.lock_state();
        let group = state.find_product(sku).and_then(|p| p.group.clone());

        let mut skus = vec![sku.to_string()];
        if let Some(group) = group {
            skus.extend(
                state
                    .products_for_sale
                    .iter()
                    .chain(state.filtered_products_for_sale.iter())
                    .filter(|p| p.group.as_deref() == Some(group.as_str()) && p.sku != sku)
                    .map(|p| p.sku.clone())
                    .take(limit),
            );
        }
        skus
    }

    /// Posts a receipt and records the post date, which forces the next
    /// refresh to fetch
    pub async fn post_receipt(&self, receipt: &Receipt) -> Result<ReceiptResponse> {
        let id = self.user_id();
        let response = self.api.post_receipt(&id, receipt).await?;
        self.lock_state().receipt_post_date = Some(OffsetDateTime::now_utc());
        Ok(response)
    }

    #[instrument(skip(self))]
    pub async fn login(&self, user_id: &str) -> Result<()> {
        if user_id.is_empty() || is_anonymous_id(user_id) {
            return Err(IapError::unexpected("user_id_invalid", format!("Invalid user id '{}'", user_id)));
        }

        let (current_id, anonymous, iaphub_id) = {
            let state = self.lock_state();
            (state.id.clone(), state.is_anonymous, state.iaphub_id.clone())
        };
        if current_id == user_id {
            return Ok(());
        }

        // Lets the backend merge the anonymous user's purchases
        if anonymous && iaphub_id.is_some() {
            self.api.login(&current_id, user_id).await?;
        }

        self.save().await;
        self.switch_identity(user_id);
        info!("Logged in as {}", user_id);
        Ok(())
    }

    /// Switches back to the install's anonymous identity
    pub async fn logout(&self) -> Result<()> {
        if self.lock_state().is_anonymous {
            return Ok(());
        }
        let anonymous_id = self.cache.anonymous_id().await?;
        self.switch_identity(&anonymous_id);
        if let Err(e) = self.cache.clear(false).await {
            warn!("Failed to clear user snapshot: {}", e);
        }
        info!("Logged out");
        Ok(())
    }

    fn switch_identity(&self, user_id: &str) {
        {
            let mut state = self.lock_state();
            *state = UserState::new(user_id, self.config.cache_version.as_str());
            state.needs_fetch = true;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.notify();
    }

    #[instrument(skip(self, tags))]
    pub async fn set_tags(&self, tags: HashMap<String, String>) -> Result<()> {
        let _guard = self
            .tags_processing
            .try_acquire()
            .ok_or(IapError::UserTagsProcessing)?;

        let id = self.user_id();
        self.api.post_tags(&id, &tags).await?;
        self.mark_stale();
        self.save().await;
        Ok(())
    }

    /// Returns whether the language changed
    pub fn set_lang(&self, lang: &str) -> Result<bool> {
        if lang.len() != 2 || !lang.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(IapError::unexpected("lang_invalid", format!("Invalid language '{}'", lang)));
        }

        let lang = lang.to_lowercase();
        let mut current = self.lang.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_deref() == Some(lang.as_str()) {
            return Ok(false);
        }
        *current = Some(lang);
        drop(current);
        self.mark_stale();
        Ok(true)
    }
}

fn filter_active(
    products: Vec<ActiveProduct>,
    include_states: &[SubscriptionState],
) -> Vec<ActiveProduct> {
    products
        .into_iter()
        .filter(|p| match p.subscription_state {
            None | Some(SubscriptionState::Active) | Some(SubscriptionState::GracePeriod) => true,
            Some(state) => include_states.contains(&state),
        })
        .collect()
}
