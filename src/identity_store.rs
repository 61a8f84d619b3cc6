//! Durable key-value storage for the device identity and the current affiliation.
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use crate::{Error, Result};

/// Keys under which the SDK persists its state.
pub(crate) mod keys {
    pub const COMPANY_CODE: &str = "companyCode";
    pub const USER_ID: &str = "userId";
    pub const REFERRER_LINK: &str = "referrerLink";
    pub const AFFILIATE_STORED_DATE: &str = "affiliateStoredDate";
    pub const ATTRIBUTION_ACTIVE_TIME: &str = "affiliateAttributionActiveTime";
    pub const USER_ACCOUNT_TOKEN: &str = "userAccountToken";
    pub const OFFER_CODE: &str = "offerCode";
}

/// A persistent string key-value store.
///
/// Values must survive process restarts for attribution to work across app launches. The SDK
/// only ever reads and overwrites keys; it never deletes them.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Get the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing the previous value.
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

#[async_trait]
impl<T: IdentityStore + ?Sized> IdentityStore for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value).await
    }
}

/// An in-memory [`IdentityStore`]. Useful in tests and for hosts that persist state elsewhere.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryIdentityStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        MemoryIdentityStore::default()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_owned()))?;
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_owned()))?;
        values.insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// An [`IdentityStore`] that keeps all values in a single JSON object on disk.
///
/// The file is read lazily on first access and rewritten on every `set()`. Writes go to a sibling
/// `.tmp` file that is then renamed over the store, so readers see either the old or the new
/// contents. A missing file is treated as an empty store.
pub struct JsonFileIdentityStore {
    path: PathBuf,
    values: tokio::sync::Mutex<Option<HashMap<String, String>>>,
}

impl JsonFileIdentityStore {
    /// Create a store backed by the file at `path`. The file is not touched until first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileIdentityStore {
            path: path.into(),
            values: tokio::sync::Mutex::new(None),
        }
    }

    async fn load(&self) -> Result<HashMap<String, String>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut file_name = self.path.file_name().unwrap_or_default().to_owned();
        file_name.push(".tmp");
        self.path.with_file_name(file_name)
    }
}

#[async_trait]
impl IdentityStore for JsonFileIdentityStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut values = self.values.lock().await;
        if values.is_none() {
            *values = Some(self.load().await?);
        }
        Ok(values.as_ref().and_then(|values| values.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut slot = self.values.lock().await;
        let mut values = match slot.take() {
            Some(values) => values,
            None => self.load().await?,
        };
        values.insert(key.to_owned(), value.to_owned());

        let bytes = serde_json::to_vec_pretty(&values)?;
        // Keep the in-memory copy even if the write fails, so the process stays consistent.
        *slot = Some(values);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let temp_path = self.temp_path();
        tokio::fs::write(&temp_path, bytes).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}
