//! Versioned snapshot persistence of the reconciled user state

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::{error::Result, models::user::UserState};

/// Key/value persistence provided by the host
#[async_trait]
pub trait CacheStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// One JSON file per key
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl CacheStorage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        // Write then rename so a crash never leaves a truncated snapshot
        let path = self.path(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(key)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Reads and writes user snapshots, scoped by identity kind and app id
pub struct CacheService {
    storage: Arc<dyn CacheStorage>,
    app_id: String,
    cache_version: String,
}

impl CacheService {
    pub fn new(storage: Arc<dyn CacheStorage>, app_id: &str, cache_version: &str) -> Self {
        Self {
            storage,
            app_id: app_id.to_string(),
            cache_version: cache_version.to_string(),
        }
    }

    fn user_key(&self, anonymous: bool) -> String {
        if anonymous {
            format!("iaphub_user_a_{}", self.app_id)
        } else {
            format!("iaphub_user_{}", self.app_id)
        }
    }

    fn anonymous_id_key(&self) -> String {
        format!("iaphub_anonymous_id_{}", self.app_id)
    }

    pub async fn save(&self, state: &UserState) -> Result<()> {
        let value = serde_json::to_string(state)?;
        self.storage.set(&self.user_key(state.is_anonymous), value).await?;
        debug!("Saved snapshot for user {}", state.id);
        Ok(())
    }

    /// Returns the snapshot only when both the identity and the cache
    /// version match; anything else is discarded.
    pub async fn load(&self, user_id: &str, anonymous: bool) -> Option<UserState> {
        let key = self.user_key(anonymous);
        let raw = match self.storage.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read snapshot: {}", e);
                return None;
            }
        };

        let state: UserState = match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                info!("Discarding unreadable snapshot: {}", e);
                return None;
            }
        };

        if state.cache_version != self.cache_version {
            info!(
                "Discarding snapshot with cache version {} (running {})",
                state.cache_version, self.cache_version
            );
            return None;
        }
        if state.id != user_id || state.is_anonymous != anonymous {
            debug!("Discarding snapshot of another user");
            return None;
        }

        Some(state)
    }

    pub async fn clear(&self, anonymous: bool) -> Result<()> {
        self.storage.remove(&self.user_key(anonymous)).await
    }

    /// Anonymous id, generated once per install
    pub async fn anonymous_id(&self) -> Result<String> {
        let key = self.anonymous_id_key();
        if let Some(id) = self.storage.get(&key).await? {
            if !id.is_empty() {
                return Ok(id);
            }
        }

        let id = UserState::generate_anonymous_id();
        self.storage.set(&key, id.clone()).await?;
        info!("Generated anonymous id {}", id);
        Ok(id)
    }
}
