//! Persistent tag -> hex key material store

use crate::error::{Error, Result};
use crate::storage::KeyValueStorage;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Keychain mapping tags to hex key material.
///
/// Tags are either a public key (the value is the matching private key)
/// or a topic (the value is the symmetric key). A tag maps to at most one
/// key. Entries are kept ordered so scans over them are deterministic.
pub struct KeyChain {
    storage: Arc<dyn KeyValueStorage>,
    storage_key: String,
    keys: RwLock<BTreeMap<String, String>>,
    write_lock: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
}

impl KeyChain {
    pub fn new(storage: Arc<dyn KeyValueStorage>, storage_key: impl Into<String>) -> Self {
        Self {
            storage,
            storage_key: storage_key.into(),
            keys: RwLock::new(BTreeMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Restore persisted keys. Idempotent.
    pub async fn init(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.keys.read().is_empty() {
            return Err(Error::RestoreWillOverride(self.storage_key.clone()));
        }

        let persisted: Option<BTreeMap<String, String>> =
            self.storage.get_item(&self.storage_key).await?;
        if let Some(keys) = persisted {
            debug!(count = keys.len(), "restored keychain");
            *self.keys.write() = keys;
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub fn has(&self, tag: &str) -> bool {
        self.keys.read().contains_key(tag)
    }

    pub fn get(&self, tag: &str) -> Result<String> {
        self.check_initialized()?;
        self.keys
            .read()
            .get(tag)
            .cloned()
            .ok_or_else(|| Error::NoMatchingKey(tag.to_string()))
    }

    pub async fn set(&self, tag: &str, key: &str) -> Result<()> {
        self.check_initialized()?;
        let _guard = self.write_lock.lock().await;
        let mut next = self.keys.read().clone();
        next.insert(tag.to_string(), key.to_string());
        self.commit(next).await
    }

    pub async fn delete(&self, tag: &str) -> Result<()> {
        self.check_initialized()?;
        let _guard = self.write_lock.lock().await;
        if !self.keys.read().contains_key(tag) {
            return Err(Error::NoMatchingKey(tag.to_string()));
        }
        let mut next = self.keys.read().clone();
        next.remove(tag);
        self.commit(next).await
    }

    /// All entries in ascending tag order
    pub fn entries(&self) -> Vec<(String, String)> {
        self.keys
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    async fn commit(&self, next: BTreeMap<String, String>) -> Result<()> {
        self.storage.set_item(&self.storage_key, &next).await?;
        *self.keys.write() = next;
        Ok(())
    }

    fn check_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotInitialized("keychain"))
        }
    }
}
