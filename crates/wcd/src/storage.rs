//! Persistent storage using sled

use async_trait::async_trait;
use serde_json::Value;
use sled::{Db, Tree};
use std::path::Path;
use wc_core::storage::{KeyValueStorage, StorageError};

const CORE_TREE: &str = "wc-core";

/// Sled-backed key-value store. Values are JSON-encoded.
pub struct SledStorage {
    db: Db,
    tree: Tree,
}

impl SledStorage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, sled::Error> {
        let db = sled::open(path)?;
        let tree = db.open_tree(CORE_TREE)?;
        Ok(Self { db, tree })
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<usize, sled::Error> {
        self.db.flush()
    }
}

fn backend(e: sled::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

#[async_trait]
impl KeyValueStorage for SledStorage {
    async fn init(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn get_keys(&self) -> Result<Vec<String>, StorageError> {
        self.tree
            .iter()
            .keys()
            .map(|key| {
                let key = key.map_err(backend)?;
                Ok(String::from_utf8_lossy(&key).into_owned())
            })
            .collect()
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        match self.tree.get(key).map_err(backend)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(&value)?;
        self.tree.insert(key, bytes).map_err(backend)?;
        self.tree.flush().map_err(backend)?;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.tree.remove(key).map_err(backend)?;
        self.tree.flush().map_err(backend)?;
        Ok(())
    }

    async fn has_item(&self, key: &str) -> Result<bool, StorageError> {
        self.tree.contains_key(key).map_err(backend)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.tree.clear().map_err(backend)?;
        self.tree.flush().map_err(backend)?;
        Ok(())
    }
}
