//! Request/response ledger keyed by JSON-RPC id
//!
//! One history exists per request type. Outbound requests are recorded on
//! send, the first response for an id is attached on arrival and never
//! replaced. Records that still lack a response after a restart are how
//! the client keeps correlating replies it has not seen yet.

use crate::error::{Error, Result};
use crate::rpc::{ErrorData, JsonRpcRequest, JsonRpcResponse};
use crate::storage::{KeyValueStorage, PersistentMap, Record};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Outcome stored against a request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordResponse<R> {
    Result(R),
    Error(ErrorData),
}

impl<R: Clone> From<&JsonRpcResponse<R>> for RecordResponse<R> {
    fn from(response: &JsonRpcResponse<R>) -> Self {
        match response {
            JsonRpcResponse::Result(r) => RecordResponse::Result(r.result.clone()),
            JsonRpcResponse::Error(e) => RecordResponse::Error(e.error.clone()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRpcRecord<T, R> {
    pub id: i64,
    pub topic: String,
    pub request: JsonRpcRequest<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub response: Option<RecordResponse<R>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<i64>,
}

impl<T, R> JsonRpcRecord<T, R> {
    pub fn is_resolved(&self) -> bool {
        self.response.is_some()
    }
}

impl<T, R> Record for JsonRpcRecord<T, R>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    R: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    type Key = i64;

    fn key(&self) -> i64 {
        self.id
    }
}

#[derive(Clone, Debug)]
pub enum HistoryEvent<T, R> {
    Created(JsonRpcRecord<T, R>),
    Updated(JsonRpcRecord<T, R>),
    Deleted(JsonRpcRecord<T, R>),
    /// Emitted after every persisted mutation
    Sync,
}

pub struct JsonRpcHistory<T, R>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    R: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    records: PersistentMap<JsonRpcRecord<T, R>>,
    events: broadcast::Sender<HistoryEvent<T, R>>,
    initialized: AtomicBool,
}

impl<T, R> JsonRpcHistory<T, R>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    R: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(storage: Arc<dyn KeyValueStorage>, storage_key: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            records: PersistentMap::new(storage, storage_key),
            events,
            initialized: AtomicBool::new(false),
        }
    }

    /// Restore persisted records. Idempotent once initialized.
    pub async fn init(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let count = self.records.restore().await?;
        debug!(key = self.records.storage_key(), count, "history restored");
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent<T, R>> {
        self.events.subscribe()
    }

    /// Record an outbound request. A second set for the same id is a no-op;
    /// returns whether a record was created.
    pub async fn set(
        &self,
        topic: &str,
        request: JsonRpcRequest<T>,
        chain_id: Option<String>,
        expiry: Option<i64>,
    ) -> Result<bool> {
        self.check_initialized()?;
        let record = JsonRpcRecord {
            id: request.id,
            topic: topic.to_string(),
            request,
            chain_id,
            response: None,
            expiry,
        };
        if !self.records.insert_if_absent(record.clone()).await? {
            trace!(id = record.id, "history record already exists");
            return Ok(false);
        }
        let _ = self.events.send(HistoryEvent::Created(record));
        let _ = self.events.send(HistoryEvent::Sync);
        Ok(true)
    }

    /// Attach a response to its request. Unknown ids and records that
    /// already carry a response are left untouched.
    pub async fn resolve(&self, response: &JsonRpcResponse<R>) -> Result<Option<JsonRpcRecord<T, R>>> {
        self.check_initialized()?;
        let id = response.id();
        match self.records.get(&id) {
            Some(record) if !record.is_resolved() => {}
            Some(_) => {
                trace!(id, "history record already resolved");
                return Ok(None);
            }
            None => {
                trace!(id, "no history record to resolve");
                return Ok(None);
            }
        }

        let outcome = RecordResponse::from(response);
        let mut changed = false;
        let updated = self
            .records
            .update(&id, |record| {
                if record.response.is_none() {
                    record.response = Some(outcome);
                    changed = true;
                }
            })
            .await?;

        match updated {
            Some(record) if changed => {
                let _ = self.events.send(HistoryEvent::Updated(record.clone()));
                let _ = self.events.send(HistoryEvent::Sync);
                Ok(Some(record))
            }
            _ => Ok(None),
        }
    }

    /// Fetch a record, checking that it belongs to `topic`
    pub fn get(&self, topic: &str, id: i64) -> Result<JsonRpcRecord<T, R>> {
        self.check_initialized()?;
        let record = self.records.get(&id).ok_or(Error::NoMatchingId {
            context: "history",
            id,
        })?;
        if record.topic != topic {
            return Err(Error::MismatchedTopic {
                id,
                stored: record.topic,
                requested: topic.to_string(),
            });
        }
        Ok(record)
    }

    /// Remove one record, or every record on `topic` when `id` is `None`
    pub async fn delete(&self, topic: &str, id: Option<i64>) -> Result<Vec<JsonRpcRecord<T, R>>> {
        self.check_initialized()?;
        let removed = self
            .records
            .remove_where(|r| r.topic == topic && id.map_or(true, |id| r.id == id))
            .await?;
        if removed.is_empty() {
            return Ok(removed);
        }
        for record in &removed {
            let _ = self.events.send(HistoryEvent::Deleted(record.clone()));
        }
        let _ = self.events.send(HistoryEvent::Sync);
        Ok(removed)
    }

    pub fn exists(&self, topic: &str, id: i64) -> bool {
        self.records
            .get(&id)
            .map(|r| r.topic == topic)
            .unwrap_or(false)
    }

    /// Whether any record carries `id`, regardless of topic
    pub fn contains_id(&self, id: i64) -> bool {
        self.records.contains(&id)
    }

    /// Look up a record by id alone
    pub fn find(&self, id: i64) -> Option<JsonRpcRecord<T, R>> {
        self.records.get(&id)
    }

    /// Records still waiting for a response
    pub fn pending(&self) -> Vec<JsonRpcRecord<T, R>> {
        self.records.filter(|r| !r.is_resolved())
    }

    pub fn records(&self) -> Vec<JsonRpcRecord<T, R>> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotInitialized("history"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{JsonRpcError, JsonRpcResult};
    use crate::storage::MemoryStorage;
    use serde_json::{json, Value};

    type History = JsonRpcHistory<Value, bool>;

    async fn history(storage: Arc<dyn KeyValueStorage>) -> History {
        let history = History::new(storage, "history:test");
        history.init().await.unwrap();
        history
    }

    fn request(id: i64) -> JsonRpcRequest<Value> {
        JsonRpcRequest::with_id(id, "wc_test", json!({"n": id}))
    }

    #[tokio::test]
    async fn test_set_is_idempotent() {
        let history = history(Arc::new(MemoryStorage::new())).await;
        assert!(history.set("t", request(1), None, None).await.unwrap());

        let mut replacement = request(1);
        replacement.params = json!({"n": 99});
        assert!(!history.set("t", replacement, None, None).await.unwrap());
        assert_eq!(history.get("t", 1).unwrap().request.params, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_resolve_keeps_first_response() {
        let history = history(Arc::new(MemoryStorage::new())).await;
        history.set("t", request(1), None, None).await.unwrap();

        let first = JsonRpcResponse::Result(JsonRpcResult::new(1, true));
        let second = JsonRpcResponse::Result(JsonRpcResult::new(1, false));
        assert!(history.resolve(&first).await.unwrap().is_some());
        assert!(history.resolve(&second).await.unwrap().is_none());

        let record = history.get("t", 1).unwrap();
        assert_eq!(record.response, Some(RecordResponse::Result(true)));
        assert!(history.pending().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_unknown_id_is_noop() {
        let history = history(Arc::new(MemoryStorage::new())).await;
        let response = JsonRpcResponse::Error(JsonRpcError::new(5, ErrorData::internal("x")));
        assert!(history.resolve(&response).await.unwrap().is_none());
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_get_checks_topic() {
        let history = history(Arc::new(MemoryStorage::new())).await;
        history.set("a", request(1), Some("eip155:1".into()), None).await.unwrap();

        assert!(matches!(history.get("b", 1), Err(Error::MismatchedTopic { id: 1, .. })));
        assert!(matches!(history.get("a", 2), Err(Error::NoMatchingId { id: 2, .. })));
        assert_eq!(history.get("a", 1).unwrap().chain_id.as_deref(), Some("eip155:1"));
        assert!(history.exists("a", 1));
        assert!(!history.exists("b", 1));
    }

    #[tokio::test]
    async fn test_delete_by_topic_and_id() {
        let history = history(Arc::new(MemoryStorage::new())).await;
        history.set("a", request(1), None, None).await.unwrap();
        history.set("a", request(2), None, None).await.unwrap();
        history.set("b", request(3), None, None).await.unwrap();

        assert_eq!(history.delete("a", Some(2)).await.unwrap().len(), 1);
        assert_eq!(history.delete("a", None).await.unwrap().len(), 1);
        assert_eq!(history.len(), 1);
        assert!(history.contains_id(3));
    }

    #[tokio::test]
    async fn test_pending_survives_restart() {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
        let first = history(storage.clone()).await;
        first.set("t", request(1), None, Some(100)).await.unwrap();
        first.set("t", request(2), None, None).await.unwrap();
        first
            .resolve(&JsonRpcResponse::Result(JsonRpcResult::new(2, true)))
            .await
            .unwrap();

        let restored = history(storage).await;
        let pending = restored.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, 1);
        assert_eq!(pending[0].expiry, Some(100));
    }

    #[tokio::test]
    async fn test_mutations_emit_sync() {
        let history = history(Arc::new(MemoryStorage::new())).await;
        let mut events = history.subscribe();
        history.set("t", request(1), None, None).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), HistoryEvent::Created(r) if r.id == 1));
        assert!(matches!(events.recv().await.unwrap(), HistoryEvent::Sync));
    }

    #[tokio::test]
    async fn test_not_initialized() {
        let history = History::new(Arc::new(MemoryStorage::new()), "h");
        assert!(matches!(
            history.set("t", request(1), None, None).await,
            Err(Error::NotInitialized(_))
        ));
    }
}
