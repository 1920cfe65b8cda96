//! Key-value persistence consumed by the keychain, expirer, history,
//! subscriber and pairing stores.
//!
//! Backends implement [`KeyValueStorage`] over `serde_json::Value`; typed
//! access goes through the `get_item`/`set_item` helpers on
//! `dyn KeyValueStorage`. [`PersistentMap`] wraps a backend with the
//! restore-once, persist-on-every-mutation discipline every core module
//! follows.

use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Prefix shared by every core storage key
pub const CORE_STORAGE_PREFIX: &str = "wc@2:core:";
/// Layout version of the persisted core records
pub const CORE_STORAGE_VERSION: &str = "0.3";

/// Build a namespaced storage key: `wc@2:core:0.3//<name>`
pub fn storage_key(name: &str) -> String {
    format!("{CORE_STORAGE_PREFIX}{CORE_STORAGE_VERSION}//{name}")
}

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Async key-value backend
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    /// Prepare the backend for use
    async fn init(&self) -> std::result::Result<(), StorageError>;

    async fn get_keys(&self) -> std::result::Result<Vec<String>, StorageError>;

    async fn get(&self, key: &str) -> std::result::Result<Option<Value>, StorageError>;

    async fn set(&self, key: &str, value: Value) -> std::result::Result<(), StorageError>;

    async fn remove_item(&self, key: &str) -> std::result::Result<(), StorageError>;

    async fn has_item(&self, key: &str) -> std::result::Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Drop every key
    async fn clear(&self) -> std::result::Result<(), StorageError>;
}

impl dyn KeyValueStorage {
    /// Read and deserialize a value
    pub async fn get_item<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> std::result::Result<Option<T>, StorageError> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Serialize and write a value
    pub async fn set_item<T: Serialize + Sync + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> std::result::Result<(), StorageError> {
        let value = serde_json::to_value(value)?;
        self.set(key, value).await
    }
}

/// In-memory backend, used for tests and ephemeral clients
#[derive(Default)]
pub struct MemoryStorage {
    items: RwLock<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn init(&self) -> std::result::Result<(), StorageError> {
        Ok(())
    }

    async fn get_keys(&self) -> std::result::Result<Vec<String>, StorageError> {
        Ok(self.items.read().keys().cloned().collect())
    }

    async fn get(&self, key: &str) -> std::result::Result<Option<Value>, StorageError> {
        Ok(self.items.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> std::result::Result<(), StorageError> {
        self.items.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> std::result::Result<(), StorageError> {
        self.items.write().remove(key);
        Ok(())
    }

    async fn clear(&self) -> std::result::Result<(), StorageError> {
        self.items.write().clear();
        Ok(())
    }
}

/// A value stored in a [`PersistentMap`], addressed by its own key
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    type Key: Eq + Hash + Clone + Debug + Send + Sync + 'static;

    fn key(&self) -> Self::Key;
}

/// Coarse-locked map persisted as a JSON array of its values.
///
/// Mutations are serialized through an async write lock. Each one builds
/// the next snapshot, writes it to storage, and only then swaps it into
/// memory, so a failed write leaves the in-memory state untouched.
pub struct PersistentMap<V: Record> {
    storage: Arc<dyn KeyValueStorage>,
    storage_key: String,
    entries: RwLock<HashMap<V::Key, V>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl<V: Record> PersistentMap<V> {
    pub fn new(storage: Arc<dyn KeyValueStorage>, storage_key: impl Into<String>) -> Self {
        Self {
            storage,
            storage_key: storage_key.into(),
            entries: RwLock::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// Load persisted values. Fails if entries already exist in memory.
    pub async fn restore(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        if !self.entries.read().is_empty() {
            return Err(Error::RestoreWillOverride(self.storage_key.clone()));
        }

        let persisted: Option<Vec<V>> = self.storage.get_item(&self.storage_key).await?;
        let values = persisted.unwrap_or_default();
        let count = values.len();

        let mut entries = self.entries.write();
        for value in values {
            entries.insert(value.key(), value);
        }
        debug!(key = %self.storage_key, count, "restored records");
        Ok(count)
    }

    pub fn get(&self, key: &V::Key) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains(&self, key: &V::Key) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<V::Key> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.entries.read().values().cloned().collect()
    }

    /// Values matching a predicate
    pub fn filter(&self, predicate: impl Fn(&V) -> bool) -> Vec<V> {
        self.entries
            .read()
            .values()
            .filter(|v| predicate(v))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Insert or replace a value, returning the previous one
    pub async fn insert(&self, value: V) -> Result<Option<V>> {
        let _guard = self.write_lock.lock().await;
        let mut next = self.entries.read().clone();
        let previous = next.insert(value.key(), value);
        self.commit(next).await?;
        Ok(previous)
    }

    /// Insert only if the key is absent. Returns whether it was inserted.
    pub async fn insert_if_absent(&self, value: V) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        if self.entries.read().contains_key(&value.key()) {
            return Ok(false);
        }
        let mut next = self.entries.read().clone();
        next.insert(value.key(), value);
        self.commit(next).await?;
        Ok(true)
    }

    /// Apply `f` to an existing value. Returns the updated value, or
    /// `None` if the key is absent.
    pub async fn update(&self, key: &V::Key, f: impl FnOnce(&mut V)) -> Result<Option<V>> {
        let _guard = self.write_lock.lock().await;
        let mut next = self.entries.read().clone();
        let updated = match next.get_mut(key) {
            Some(value) => {
                f(value);
                value.clone()
            }
            None => return Ok(None),
        };
        self.commit(next).await?;
        Ok(Some(updated))
    }

    pub async fn remove(&self, key: &V::Key) -> Result<Option<V>> {
        let _guard = self.write_lock.lock().await;
        if !self.entries.read().contains_key(key) {
            return Ok(None);
        }
        let mut next = self.entries.read().clone();
        let removed = next.remove(key);
        self.commit(next).await?;
        Ok(removed)
    }

    /// Remove every value matching a predicate
    pub async fn remove_where(&self, predicate: impl Fn(&V) -> bool) -> Result<Vec<V>> {
        let _guard = self.write_lock.lock().await;
        let mut next = self.entries.read().clone();
        let doomed: Vec<V::Key> = next
            .iter()
            .filter(|(_, v)| predicate(v))
            .map(|(k, _)| k.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(Vec::new());
        }
        let removed = doomed.iter().filter_map(|k| next.remove(k)).collect();
        self.commit(next).await?;
        Ok(removed)
    }

    async fn commit(&self, next: HashMap<V::Key, V>) -> Result<()> {
        let values: Vec<&V> = next.values().collect();
        self.storage.set_item(&self.storage_key, &values).await?;
        *self.entries.write() = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: u32,
        text: String,
    }

    impl Record for Note {
        type Key = u32;

        fn key(&self) -> u32 {
            self.id
        }
    }

    struct FailingStorage;

    #[async_trait]
    impl KeyValueStorage for FailingStorage {
        async fn init(&self) -> std::result::Result<(), StorageError> {
            Ok(())
        }
        async fn get_keys(&self) -> std::result::Result<Vec<String>, StorageError> {
            Ok(vec![])
        }
        async fn get(&self, _key: &str) -> std::result::Result<Option<Value>, StorageError> {
            Ok(None)
        }
        async fn set(&self, _key: &str, _value: Value) -> std::result::Result<(), StorageError> {
            Err(StorageError::Backend("disk full".into()))
        }
        async fn remove_item(&self, _key: &str) -> std::result::Result<(), StorageError> {
            Ok(())
        }
        async fn clear(&self) -> std::result::Result<(), StorageError> {
            Ok(())
        }
    }

    fn note(id: u32, text: &str) -> Note {
        Note {
            id,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_storage_key_layout() {
        assert_eq!(storage_key("expirer"), "wc@2:core:0.3//expirer");
    }

    #[tokio::test]
    async fn test_typed_items() {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
        storage.set_item("k", &vec![1u8, 2, 3]).await.unwrap();
        let read: Option<Vec<u8>> = storage.get_item("k").await.unwrap();
        assert_eq!(read, Some(vec![1, 2, 3]));
        assert!(storage.has_item("k").await.unwrap());

        storage.remove_item("k").await.unwrap();
        assert!(!storage.has_item("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_map_persists_and_restores() {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
        let map = PersistentMap::<Note>::new(storage.clone(), "notes");
        map.insert(note(1, "a")).await.unwrap();
        map.insert(note(2, "b")).await.unwrap();
        map.remove(&1).await.unwrap();

        let restored = PersistentMap::<Note>::new(storage, "notes");
        assert_eq!(restored.restore().await.unwrap(), 1);
        assert_eq!(restored.get(&2), Some(note(2, "b")));
    }

    #[tokio::test]
    async fn test_restore_will_override() {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
        let map = PersistentMap::<Note>::new(storage, "notes");
        map.insert(note(1, "a")).await.unwrap();

        let result = map.restore().await;
        assert!(matches!(result, Err(Error::RestoreWillOverride(_))));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_memory_intact() {
        let map = PersistentMap::<Note>::new(Arc::new(FailingStorage), "notes");
        assert!(map.insert(note(1, "a")).await.is_err());
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_update_and_insert_if_absent() {
        let map = PersistentMap::<Note>::new(Arc::new(MemoryStorage::new()), "notes");
        assert!(map.insert_if_absent(note(1, "a")).await.unwrap());
        assert!(!map.insert_if_absent(note(1, "z")).await.unwrap());

        let updated = map.update(&1, |n| n.text.push('!')).await.unwrap();
        assert_eq!(updated.unwrap().text, "a!");
        assert!(map.update(&9, |_| {}).await.unwrap().is_none());
    }
}
