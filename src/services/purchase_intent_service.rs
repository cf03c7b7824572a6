//! Purchase intent tracking
//!
//! A purchase goes `idle → creating → open → idle`. Only one purchase may be
//! in progress; the slot is released when the [`IntentReservation`] drops,
//! whatever the outcome.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{IapError, Result},
    models::{
        common::Platform,
        intent::{BuyOptions, PurchaseIntent, PurchaseIntentConfirmation},
        product::{base_sku, ActiveProduct, Product, Transaction},
    },
    services::api_service::ApiClient,
};

#[derive(Debug, Clone, PartialEq)]
enum IntentSlot {
    Idle,
    Creating,
    Open(PurchaseIntent),
}

pub struct PurchaseIntentService {
    api: Arc<ApiClient>,
    slot: Mutex<IntentSlot>,
}

impl PurchaseIntentService {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self {
            api,
            slot: Mutex::new(IntentSlot::Idle),
        }
    }

    fn lock(&self) -> MutexGuard<'_, IntentSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims the slot, failing with `buy_processing` when a purchase is
    /// already running
    pub fn reserve(&self) -> Result<IntentReservation<'_>> {
        let mut slot = self.lock();
        if *slot != IntentSlot::Idle {
            return Err(IapError::BuyProcessing);
        }
        *slot = IntentSlot::Creating;
        Ok(IntentReservation { service: self })
    }

    pub fn is_idle(&self) -> bool {
        *self.lock() == IntentSlot::Idle
    }

    /// Intent currently open, if any
    pub fn current(&self) -> Option<PurchaseIntent> {
        match &*self.lock() {
            IntentSlot::Open(intent) => Some(intent.clone()),
            _ => None,
        }
    }
}

/// Exclusive claim on the purchase slot
pub struct IntentReservation<'a> {
    service: &'a PurchaseIntentService,
}

impl IntentReservation<'_> {
    #[instrument(skip(self))]
    pub async fn create(&self, user_id: &str, sku: &str) -> Result<PurchaseIntent> {
        let intent = self.service.api.create_purchase_intent(user_id, sku).await?;
        info!("Purchase intent {} created for {}", intent.id, sku);
        *self.service.lock() = IntentSlot::Open(intent.clone());
        Ok(intent)
    }

    pub fn intent_id(&self) -> Option<String> {
        self.service.current().map(|intent| intent.id)
    }

    /// Reports the purchase outcome to the backend. Confirmation failures are
    /// logged, never returned.
    pub async fn confirm(self, outcome: &Result<Transaction>) {
        let Some(intent) = self.service.current() else {
            debug!("No open purchase intent to confirm");
            return;
        };

        let confirmation = match outcome {
            Ok(_) => PurchaseIntentConfirmation {
                status: "success",
                error_code: None,
                error_subcode: None,
            },
            Err(e) => PurchaseIntentConfirmation {
                status: "failed",
                error_code: Some(e.code().to_string()),
                error_subcode: e.subcode().map(str::to_string),
            },
        };

        let elapsed = OffsetDateTime::now_utc() - intent.created_at;
        match self
            .service
            .api
            .confirm_purchase_intent(&intent.id, &confirmation)
            .await
        {
            Ok(()) => info!(
                "Purchase intent {} confirmed as {} after {}s",
                intent.id,
                confirmation.status,
                elapsed.whole_seconds()
            ),
            Err(e) => warn!("Failed to confirm purchase intent {}: {}", intent.id, e),
        }
    }
}

impl Drop for IntentReservation<'_> {
    fn drop(&mut self) {
        *self.service.lock() = IntentSlot::Idle;
    }
}

/// Checks run before handing a purchase to the store
pub fn check_purchase_allowed(
    active_products: &[ActiveProduct],
    product: &Product,
    platform: Platform,
    options: &BuyOptions,
    now: OffsetDateTime,
) -> Result<()> {
    let sku = base_sku(&product.sku);

    let owned = active_products.iter().any(|active| {
        base_sku(active.sku()) == sku && (!active.is_subscription() || active.is_active_subscription(now))
    });
    if owned {
        return Err(IapError::ProductAlreadyPurchased(product.sku.clone()));
    }

    if product.product_type.is_subscription() && !options.allow_cross_platform_conflict {
        let conflict = active_products.iter().any(|active| {
            active.is_active_subscription(now)
                && active.platform.is_some_and(|p| p != platform)
                && (product.group.is_none() || active.product.group == product.group)
        });
        if conflict {
            return Err(IapError::CrossPlatformConflict(product.sku.clone()));
        }
    }

    let scheduled = active_products.iter().any(|active| {
        active
            .subscription_renewal_product_sku
            .as_deref()
            .is_some_and(|renewal| base_sku(renewal) == sku)
    });
    if scheduled {
        return Err(IapError::ProductChangeNextRenewal(product.sku.clone()));
    }

    Ok(())
}
