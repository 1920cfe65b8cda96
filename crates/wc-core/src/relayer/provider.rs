//! JSON-RPC request correlation over a single relay connection

use super::connection::{ConnectionEvent, RelayConnection};
use crate::error::{Error, Result};
use crate::rpc::{ErrorData, InboundMessage, JsonRpcPayload, JsonRpcRequest, JsonRpcResponse};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, Debug)]
pub enum ProviderEvent {
    Connect,
    Disconnect { reason: String },
    /// Server-pushed request
    Request(JsonRpcRequest<Value>),
    Error(String),
}

type Waiter = oneshot::Sender<JsonRpcResponse<Value>>;

pub struct JsonRpcProvider {
    connection: Arc<dyn RelayConnection>,
    state: RwLock<ConnectionState>,
    connect_lock: tokio::sync::Mutex<()>,
    url: RwLock<Option<String>>,
    /// Bumped on every open so events from a stale connection are ignored
    generation: AtomicU64,
    pending: Mutex<HashMap<i64, Waiter>>,
    events: broadcast::Sender<ProviderEvent>,
    default_timeout: Duration,
}

impl JsonRpcProvider {
    pub fn new(connection: Arc<dyn RelayConnection>, default_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            connection,
            state: RwLock::new(ConnectionState::Disconnected),
            connect_lock: tokio::sync::Mutex::new(()),
            url: RwLock::new(None),
            generation: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            events,
            default_timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn set_url(&self, url: impl Into<String>) {
        *self.url.write() = Some(url.into());
    }

    /// Open the connection unless it already is. Concurrent callers queue
    /// behind the attempt in flight and share its outcome.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        let url = self
            .url
            .read()
            .clone()
            .ok_or_else(|| Error::InvalidParams("relay url not set".into()))?;

        *self.state.write() = ConnectionState::Connecting;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (tx, rx) = mpsc::unbounded_channel();

        if let Err(e) = self.connection.open(&url, tx).await {
            *self.state.write() = ConnectionState::Disconnected;
            warn!("relay connect failed: {e}");
            return Err(e.into());
        }

        *self.state.write() = ConnectionState::Connected;
        debug!("relay connected");
        self.spawn_reader(generation, rx);
        let _ = self.events.send(ProviderEvent::Connect);
        Ok(())
    }

    /// Close the connection and fail every request in flight
    pub async fn disconnect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        self.generation.fetch_add(1, Ordering::AcqRel);
        let was_connected = self.is_connected();
        *self.state.write() = ConnectionState::Disconnected;
        self.fail_pending();
        self.connection.close().await?;
        if was_connected {
            let _ = self.events.send(ProviderEvent::Disconnect {
                reason: "closed by client".into(),
            });
        }
        Ok(())
    }

    /// Send a request and wait for its response
    pub async fn request<P, R>(self: &Arc<Self>, method: &str, params: P, timeout: Option<Duration>) -> Result<R>
    where
        P: Serialize + Send + Sync,
        R: DeserializeOwned,
    {
        if !self.is_connected() {
            self.connect().await?;
        }

        let request = JsonRpcRequest::new(method, params);
        let id = request.id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        trace!(id, method, "relay request");
        if let Err(e) = self.connection.send_request(&request).await {
            self.pending.lock().remove(&id);
            return Err(e.into());
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(Error::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(Error::Timeout(format!("{method} request {id}")));
            }
        };

        match response.into_result() {
            Ok(result) => Ok(serde_json::from_value(result)?),
            Err(ErrorData { code, message, .. }) => Err(Error::Rpc { code, message }),
        }
    }

    /// Reply to a server-pushed request
    pub async fn respond<R: Serialize + Sync>(&self, id: i64, result: R) -> Result<()> {
        Ok(self.connection.send_result(id, result).await?)
    }

    pub async fn respond_error(&self, id: i64, error: ErrorData) -> Result<()> {
        Ok(self.connection.send_error(id, error).await?)
    }

    fn spawn_reader(self: &Arc<Self>, generation: u64, mut rx: mpsc::UnboundedReceiver<ConnectionEvent>) {
        let provider = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if provider.generation.load(Ordering::Acquire) != generation {
                    break;
                }
                match event {
                    ConnectionEvent::Open => trace!("transport open"),
                    ConnectionEvent::Payload(text) => provider.on_payload(&text),
                    ConnectionEvent::Error(message) => {
                        warn!("transport error: {message}");
                        let _ = provider.events.send(ProviderEvent::Error(message));
                    }
                    ConnectionEvent::Close { reason } => {
                        provider.on_close(generation, reason);
                        break;
                    }
                }
            }
        });
    }

    fn on_payload(&self, text: &str) {
        let payload: JsonRpcPayload = match serde_json::from_str(text) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("dropping malformed relay payload: {e}");
                return;
            }
        };

        match payload.into_message() {
            InboundMessage::Request(request) => {
                let _ = self.events.send(ProviderEvent::Request(request));
            }
            InboundMessage::Response(response) => {
                let id = response.id();
                match self.pending.lock().remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => trace!(id, "ignoring response with no waiter"),
                }
            }
        }
    }

    fn on_close(&self, generation: u64, reason: String) {
        if self
            .generation
            .compare_exchange(generation, generation + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        *self.state.write() = ConnectionState::Disconnected;
        self.fail_pending();
        debug!(%reason, "relay connection closed");
        let _ = self.events.send(ProviderEvent::Disconnect { reason });
    }

    /// Dropping the waiters completes their requests with `ConnectionClosed`
    fn fail_pending(&self) {
        let dropped = std::mem::take(&mut *self.pending.lock());
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "failing in-flight requests");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relayer::connection::{ConnectionEvents, TransportError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct ScriptedConnection {
        events: Mutex<Option<ConnectionEvents>>,
        sent: Mutex<Vec<String>>,
        open: AtomicBool,
    }

    impl ScriptedConnection {
        fn push(&self, event: ConnectionEvent) {
            if let Some(events) = self.events.lock().as_ref() {
                events.send(event).unwrap();
            }
        }

        async fn next_sent_id(&self) -> i64 {
            loop {
                if let Some(last) = self.sent.lock().last() {
                    let value: Value = serde_json::from_str(last).unwrap();
                    return value["id"].as_i64().unwrap();
                }
                tokio::task::yield_now().await;
            }
        }
    }

    #[async_trait]
    impl RelayConnection for ScriptedConnection {
        async fn open(&self, _url: &str, events: ConnectionEvents) -> std::result::Result<(), TransportError> {
            *self.events.lock() = Some(events);
            self.open.store(true, Ordering::Release);
            Ok(())
        }

        async fn close(&self) -> std::result::Result<(), TransportError> {
            self.open.store(false, Ordering::Release);
            self.events.lock().take();
            Ok(())
        }

        async fn send(&self, payload: String) -> std::result::Result<(), TransportError> {
            self.sent.lock().push(payload);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::Acquire)
        }
    }

    fn provider() -> (Arc<ScriptedConnection>, Arc<JsonRpcProvider>) {
        let connection = Arc::new(ScriptedConnection::default());
        let provider = Arc::new(JsonRpcProvider::new(connection.clone(), Duration::from_secs(5)));
        provider.set_url("wss://relay.test");
        (connection, provider)
    }

    #[tokio::test]
    async fn test_request_connects_and_correlates() {
        let (connection, provider) = provider();
        let task = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.request::<_, bool>("irn_publish", json!({}), None).await })
        };

        let id = connection.next_sent_id().await;
        assert!(provider.is_connected());
        connection.push(ConnectionEvent::Payload(
            json!({"id": id, "jsonrpc": "2.0", "result": true}).to_string(),
        ));
        assert!(task.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_relay_error_is_typed() {
        let (connection, provider) = provider();
        let task = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.request::<_, bool>("irn_publish", json!({}), None).await })
        };

        let id = connection.next_sent_id().await;
        connection.push(ConnectionEvent::Payload(
            json!({"id": id, "jsonrpc": "2.0", "error": {"code": -32600, "message": "bad"}}).to_string(),
        ));
        assert!(matches!(
            task.await.unwrap(),
            Err(Error::Rpc { code: -32600, .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout_deregisters_listener() {
        let (connection, provider) = provider();
        let result = provider
            .request::<_, bool>("irn_subscribe", json!({}), Some(Duration::from_millis(20)))
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(provider.pending.lock().is_empty());

        // A late response is ignored
        let id = connection.next_sent_id().await;
        connection.push(ConnectionEvent::Payload(
            json!({"id": id, "jsonrpc": "2.0", "result": true}).to_string(),
        ));
        tokio::task::yield_now().await;
        assert!(provider.is_connected());
    }

    #[tokio::test]
    async fn test_close_fails_in_flight_requests() {
        let (connection, provider) = provider();
        let mut events = provider.subscribe();
        let task = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.request::<_, bool>("irn_publish", json!({}), None).await })
        };

        connection.next_sent_id().await;
        connection.push(ConnectionEvent::Close {
            reason: "gone".into(),
        });
        assert!(matches!(task.await.unwrap(), Err(Error::ConnectionClosed)));
        assert_eq!(provider.state(), ConnectionState::Disconnected);

        assert!(matches!(events.recv().await.unwrap(), ProviderEvent::Connect));
        assert!(matches!(
            events.recv().await.unwrap(),
            ProviderEvent::Disconnect { reason } if reason == "gone"
        ));
    }

    #[tokio::test]
    async fn test_server_requests_are_emitted() {
        let (connection, provider) = provider();
        let mut events = provider.subscribe();
        provider.connect().await.unwrap();
        connection.push(ConnectionEvent::Payload(
            json!({"id": 9, "jsonrpc": "2.0", "method": "irn_subscription", "params": {}}).to_string(),
        ));

        assert!(matches!(events.recv().await.unwrap(), ProviderEvent::Connect));
        assert!(matches!(
            events.recv().await.unwrap(),
            ProviderEvent::Request(r) if r.method == "irn_subscription" && r.id == 9
        ));
    }
}
