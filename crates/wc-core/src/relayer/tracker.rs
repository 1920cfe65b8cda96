//! Duplicate suppression for relay deliveries

use crate::error::{Error, Result};
use crate::storage::KeyValueStorage;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Content hash of a delivered message
pub fn message_hash(message: &str) -> String {
    blake3::hash(message.as_bytes()).to_hex().to_string()
}

/// Per-topic set of message hashes already delivered. Each topic is
/// persisted under its own key, `<storage_key>/<topic>`, so a delivery
/// rewrites only its own topic. Unsubscribing a topic drops its set.
pub struct MessageTracker {
    storage: Arc<dyn KeyValueStorage>,
    storage_key: String,
    messages: RwLock<HashMap<String, BTreeSet<String>>>,
    write_lock: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
}

impl MessageTracker {
    pub fn new(storage: Arc<dyn KeyValueStorage>, storage_key: impl Into<String>) -> Self {
        Self {
            storage,
            storage_key: storage_key.into(),
            messages: RwLock::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
            initialized: AtomicBool::new(false),
        }
    }

    pub async fn init(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.messages.read().is_empty() {
            return Err(Error::RestoreWillOverride(self.storage_key.clone()));
        }

        let prefix = self.topic_prefix();
        let mut restored = HashMap::new();
        for key in self.storage.get_keys().await? {
            let Some(topic) = key.strip_prefix(&prefix) else {
                continue;
            };
            let hashes: Option<BTreeSet<String>> = self.storage.get_item(&key).await?;
            if let Some(hashes) = hashes {
                restored.insert(topic.to_string(), hashes);
            }
        }
        debug!(topics = restored.len(), "restored message tracker");
        *self.messages.write() = restored;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Record a delivery. Returns `false` if this message was already seen
    /// on `topic`.
    pub async fn set(&self, topic: &str, message: &str) -> Result<bool> {
        self.check_initialized()?;
        let hash = message_hash(message);
        let _guard = self.write_lock.lock().await;
        if self.seen(topic, &hash) {
            return Ok(false);
        }
        let mut hashes = self.messages.read().get(topic).cloned().unwrap_or_default();
        hashes.insert(hash);
        self.storage.set_item(&self.topic_key(topic), &hashes).await?;
        self.messages.write().insert(topic.to_string(), hashes);
        Ok(true)
    }

    pub fn has(&self, topic: &str, message: &str) -> bool {
        self.seen(topic, &message_hash(message))
    }

    /// Forget every hash recorded for `topic`
    pub async fn delete(&self, topic: &str) -> Result<()> {
        self.check_initialized()?;
        let _guard = self.write_lock.lock().await;
        if !self.messages.read().contains_key(topic) {
            return Ok(());
        }
        self.storage.remove_item(&self.topic_key(topic)).await?;
        self.messages.write().remove(topic);
        Ok(())
    }

    /// Number of topics with recorded deliveries
    pub fn topics(&self) -> usize {
        self.messages.read().len()
    }

    fn seen(&self, topic: &str, hash: &str) -> bool {
        self.messages
            .read()
            .get(topic)
            .map(|hashes| hashes.contains(hash))
            .unwrap_or(false)
    }

    fn topic_prefix(&self) -> String {
        format!("{}/", self.storage_key)
    }

    fn topic_key(&self, topic: &str) -> String {
        format!("{}{topic}", self.topic_prefix())
    }

    fn check_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotInitialized("message tracker"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_duplicates_suppressed_per_topic() {
        let tracker = MessageTracker::new(Arc::new(MemoryStorage::new()), "messages");
        tracker.init().await.unwrap();

        assert!(tracker.set("a", "m1").await.unwrap());
        assert!(!tracker.set("a", "m1").await.unwrap());
        assert!(tracker.set("b", "m1").await.unwrap());
        assert!(tracker.has("a", "m1"));

        tracker.delete("a").await.unwrap();
        assert!(!tracker.has("a", "m1"));
        assert!(tracker.has("b", "m1"));
    }

    #[tokio::test]
    async fn test_seen_hashes_survive_restart() {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
        let tracker = MessageTracker::new(storage.clone(), "messages");
        tracker.init().await.unwrap();
        tracker.set("a", "m1").await.unwrap();

        let restored = MessageTracker::new(storage, "messages");
        restored.init().await.unwrap();
        assert!(!restored.set("a", "m1").await.unwrap());
    }

    #[tokio::test]
    async fn test_each_topic_persisted_separately() {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
        let tracker = MessageTracker::new(storage.clone(), "messages");
        tracker.init().await.unwrap();
        tracker.set("a", "m1").await.unwrap();
        tracker.set("b", "m2").await.unwrap();

        let mut keys = storage.get_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["messages/a".to_string(), "messages/b".to_string()]);
        let a: BTreeSet<String> = storage.get_item("messages/a").await.unwrap().unwrap();
        assert_eq!(a, BTreeSet::from([message_hash("m1")]));

        tracker.delete("a").await.unwrap();
        assert_eq!(storage.get_keys().await.unwrap(), vec!["messages/b".to_string()]);
        assert_eq!(tracker.topics(), 1);
    }
}
