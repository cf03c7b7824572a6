use std::sync::Arc;

use iapsync::{
    models::common::Platform,
    services::{
        BillingClient, CacheStorage, FileStorage, MemoryStorage, MockBillingClient,
        ReqwestTransport,
    },
    Config, Engine, EngineDeps,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Fetches the catalog of a user against the configured backend.
///
/// Usage: `iapsync [user_id]`. Store metadata comes from the in-process mock
/// store, which resolves no product, so every product is reported as filtered
/// unless the backend returns details itself.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,iapsync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting iapsync");

    // Load configuration
    let config = Config::load()?;

    tracing::info!(
        "Loaded configuration - App: {}, API: {}",
        config.api.app_id,
        config.api.base_url
    );

    let storage: Arc<dyn CacheStorage> = match &config.cache.directory {
        Some(dir) => Arc::new(FileStorage::new(dir)),
        None => Arc::new(MemoryStorage::new()),
    };
    let transport = Arc::new(ReqwestTransport::new(config.api.timeouts().connect)?);
    let billing: Arc<dyn BillingClient> = Arc::new(MockBillingClient::new(Platform::Ios));

    let engine = Engine::new(config, EngineDeps::new(transport, billing, storage)).await?;
    engine.start().await;

    if let Some(user_id) = std::env::args().nth(1) {
        engine.login(&user_id).await?;
    }

    let products = engine.get_products(&[]).await?;
    println!("{}", serde_json::to_string_pretty(&products)?);

    engine.stop().await;
    Ok(())
}
