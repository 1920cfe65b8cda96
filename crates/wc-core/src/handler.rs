//! Typed JSON-RPC dispatch over encrypted topics
//!
//! Each request type is registered by its method name in a per-instance
//! route table. A route owns the history for its method and the callbacks
//! the application installed. Inbound relay messages are queued per topic
//! and processed in delivery order by one worker per topic, so a slow
//! handler only holds up its own topic.

use crate::crypto::envelope::TYPE_0;
use crate::crypto::{Crypto, DecodeOptions, EncodeOptions};
use crate::error::{Error, Result};
use crate::expirer::{Expirer, ExpirerEvent, ExpirerTarget};
use crate::history::JsonRpcHistory;
use crate::relayer::{PublishOptions, RelayMessage, RelayProtocolOptions, Relayer, RelayerEvent};
use crate::rpc::{
    ErrorData, InboundMessage, JsonRpcError, JsonRpcPayload, JsonRpcRequest, JsonRpcResponse, JsonRpcResult,
    PublishPolicy, RpcMethod, RpcMethodMetadata, UNREGISTERED_METHOD,
};
use crate::storage::{storage_key, KeyValueStorage};
use crate::time::calc_expiry;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// What a request callback wants sent back to the peer
#[derive(Clone, Debug, PartialEq)]
pub enum Reply<R> {
    Result(R),
    Error(ErrorData),
    /// The callback replies on its own, or not at all
    NoReply,
}

type RequestCallback<T> =
    Arc<dyn Fn(String, JsonRpcRequest<T>) -> BoxFuture<'static, Reply<<T as RpcMethod>::Response>> + Send + Sync>;
type ResponseCallback<T> =
    Arc<dyn Fn(String, JsonRpcResponse<<T as RpcMethod>::Response>) -> BoxFuture<'static, ()> + Send + Sync>;

enum Dispatch {
    /// No request callback is installed for the method
    Unhandled,
    /// The id was already recorded
    Duplicate,
    Handled(Reply<Value>),
}

#[async_trait]
trait MethodRoute: Send + Sync {
    fn metadata(&self) -> RpcMethodMetadata;

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Whether this route's history holds `id`
    fn owns(&self, id: i64) -> bool;

    /// Record an inbound request until its TTL passes, then run the callback
    async fn dispatch_request(&self, topic: &str, request: JsonRpcRequest<Value>, expirer: &Expirer) -> Result<Dispatch>;

    async fn dispatch_response(&self, topic: &str, response: JsonRpcResponse<Value>) -> Result<()>;

    /// Resolve history after our own reply went out
    async fn record_reply(&self, response: &JsonRpcResponse<Value>) -> Result<()>;

    async fn expire(&self, id: i64) -> Result<()>;

    /// Returns the ids of the removed records
    async fn delete_topic(&self, topic: &str) -> Result<Vec<i64>>;
}

struct TypedRoute<T: RpcMethod> {
    history: JsonRpcHistory<T, T::Response>,
    on_request: RwLock<Option<RequestCallback<T>>>,
    on_response: RwLock<Option<ResponseCallback<T>>>,
    waiters: Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse<T::Response>>>>,
}

impl<T: RpcMethod> TypedRoute<T> {
    fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            history: JsonRpcHistory::new(storage, storage_key(&format!("history:{}", T::method()))),
            on_request: RwLock::new(None),
            on_response: RwLock::new(None),
            waiters: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<T: RpcMethod> MethodRoute for TypedRoute<T> {
    fn metadata(&self) -> RpcMethodMetadata {
        T::METADATA
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn owns(&self, id: i64) -> bool {
        self.history.contains_id(id)
    }

    async fn dispatch_request(&self, topic: &str, request: JsonRpcRequest<Value>, expirer: &Expirer) -> Result<Dispatch> {
        let callback = self.on_request.read().clone();
        let Some(callback) = callback else {
            return Ok(Dispatch::Unhandled);
        };

        let request = JsonRpcRequest {
            id: request.id,
            jsonrpc: request.jsonrpc,
            method: request.method,
            params: serde_json::from_value::<T>(request.params)?,
        };
        let expires_at = calc_expiry(T::METADATA.request.ttl);
        if !self.history.set(topic, request.clone(), None, Some(expires_at)).await? {
            return Ok(Dispatch::Duplicate);
        }
        expirer.set(request.id, expires_at).await?;

        let reply = match callback(topic.to_string(), request).await {
            Reply::Result(result) => Reply::Result(serde_json::to_value(result)?),
            Reply::Error(error) => Reply::Error(error),
            Reply::NoReply => Reply::NoReply,
        };
        Ok(Dispatch::Handled(reply))
    }

    async fn dispatch_response(&self, topic: &str, response: JsonRpcResponse<Value>) -> Result<()> {
        let id = response.id();
        let response = response.typed::<T::Response>()?;
        self.history.get(topic, id)?;
        if self.history.resolve(&response).await?.is_none() {
            trace!(id, "response already recorded");
            return Ok(());
        }

        if let Some(waiter) = self.waiters.lock().remove(&id) {
            let _ = waiter.send(response.clone());
        }
        let callback = self.on_response.read().clone();
        if let Some(callback) = callback {
            callback(topic.to_string(), response).await;
        }
        Ok(())
    }

    async fn record_reply(&self, response: &JsonRpcResponse<Value>) -> Result<()> {
        let response = response.clone().typed::<T::Response>()?;
        self.history.resolve(&response).await?;
        Ok(())
    }

    async fn expire(&self, id: i64) -> Result<()> {
        self.waiters.lock().remove(&id);
        if let Some(record) = self.history.find(id) {
            self.history.delete(&record.topic, Some(id)).await?;
        }
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<Vec<i64>> {
        let removed = self.history.delete(topic, None).await?;
        let mut waiters = self.waiters.lock();
        Ok(removed
            .into_iter()
            .map(|record| {
                waiters.remove(&record.id);
                record.id
            })
            .collect())
    }
}

pub struct TypedMessageHandler {
    crypto: Arc<Crypto>,
    relayer: Arc<Relayer>,
    expirer: Arc<Expirer>,
    storage: Arc<dyn KeyValueStorage>,
    routes: RwLock<HashMap<&'static str, Arc<dyn MethodRoute>>>,
    route_lock: tokio::sync::Mutex<()>,
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    reject_unknown_methods: bool,
    cancel: CancellationToken,
}

impl TypedMessageHandler {
    pub fn new(
        crypto: Arc<Crypto>,
        relayer: Arc<Relayer>,
        expirer: Arc<Expirer>,
        storage: Arc<dyn KeyValueStorage>,
        reject_unknown_methods: bool,
    ) -> Self {
        Self {
            crypto,
            relayer,
            expirer,
            storage,
            routes: RwLock::new(HashMap::new()),
            route_lock: tokio::sync::Mutex::new(()),
            workers: Mutex::new(HashMap::new()),
            reject_unknown_methods,
            cancel: CancellationToken::new(),
        }
    }

    /// Start consuming relay deliveries and expirer events. Call before the
    /// relayer connects so no delivery is missed.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let mut relayer_events = self.relayer.subscribe_events();
        let mut expirer_events = self.expirer.subscribe();
        let handler = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = relayer_events.recv() => match event {
                        Ok(RelayerEvent::Message(message)) => handler.enqueue(message),
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => warn!(missed, "handler lagged behind relay deliveries"),
                        Err(RecvError::Closed) => break,
                    },
                    event = expirer_events.recv() => match event {
                        Ok(ExpirerEvent::Expired { target: ExpirerTarget::Id(id), .. }) => handler.on_expired_id(id).await,
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => warn!(missed, "handler lagged behind expirer events"),
                        Err(RecvError::Closed) => break,
                    },
                    _ = handler.cancel.cancelled() => break,
                }
            }
            debug!("message handler stopped");
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Install callbacks for requests of type `T` and for responses to the
    /// `T` requests this client sent. Registering again replaces them.
    pub async fn handle_message_type<T, OnRequest, RequestFut, OnResponse, ResponseFut>(
        &self,
        on_request: OnRequest,
        on_response: OnResponse,
    ) -> Result<()>
    where
        T: RpcMethod,
        OnRequest: Fn(String, JsonRpcRequest<T>) -> RequestFut + Send + Sync + 'static,
        RequestFut: Future<Output = Reply<T::Response>> + Send + 'static,
        OnResponse: Fn(String, JsonRpcResponse<T::Response>) -> ResponseFut + Send + Sync + 'static,
        ResponseFut: Future<Output = ()> + Send + 'static,
    {
        let route = self.route::<T>().await?;
        let on_request: RequestCallback<T> = Arc::new(move |topic, request| on_request(topic, request).boxed());
        let on_response: ResponseCallback<T> = Arc::new(move |topic, response| on_response(topic, response).boxed());
        *route.on_request.write() = Some(on_request);
        *route.on_response.write() = Some(on_response);
        debug!(method = T::method(), "registered message handler");
        Ok(())
    }

    /// Encrypt and publish a request, record it and schedule its expiry.
    /// `expiry` overrides the method's request TTL. Returns the request id.
    pub async fn send_request<T: RpcMethod>(&self, topic: &str, params: T, expiry: Option<u64>) -> Result<i64> {
        let request = JsonRpcRequest::new(T::method(), params);
        let id = request.id;
        let route = self.route::<T>().await?;
        self.publish_request(&route, topic, request, expiry).await?;
        Ok(id)
    }

    /// Send a request and wait for its response. Fails with `Timeout` once
    /// the TTL passes or the request id expires; the expiry entry and the
    /// history record are then removed.
    pub async fn request<T: RpcMethod>(&self, topic: &str, params: T, expiry: Option<u64>) -> Result<T::Response> {
        let request = JsonRpcRequest::new(T::method(), params);
        let id = request.id;
        let route = self.route::<T>().await?;

        let (tx, rx) = oneshot::channel();
        route.waiters.lock().insert(id, tx);
        if let Err(e) = self.publish_request(&route, topic, request, expiry).await {
            route.waiters.lock().remove(&id);
            return Err(e);
        }

        let ttl = expiry.unwrap_or(T::METADATA.request.ttl);
        match tokio::time::timeout(Duration::from_secs(ttl), rx).await {
            Ok(Ok(response)) => response
                .into_result()
                .map_err(|ErrorData { code, message, .. }| Error::Rpc { code, message }),
            Ok(Err(_)) | Err(_) => {
                route.waiters.lock().remove(&id);
                self.discard_request(route.as_ref(), topic, id).await;
                Err(Error::Timeout(format!("{} request {id} on {topic}", T::method())))
            }
        }
    }

    pub async fn send_result<T: RpcMethod>(&self, topic: &str, id: i64, result: T::Response) -> Result<()> {
        let route = self.route::<T>().await?;
        let response = JsonRpcResponse::Result(JsonRpcResult::new(id, serde_json::to_value(result)?));
        self.publish_response(route.as_ref(), topic, response).await
    }

    pub async fn send_error<T: RpcMethod>(&self, topic: &str, id: i64, error: ErrorData) -> Result<()> {
        let route = self.route::<T>().await?;
        let response = JsonRpcResponse::Error(JsonRpcError::new(id, error));
        self.publish_response(route.as_ref(), topic, response).await
    }

    /// History of requests of type `T`
    pub async fn history<T: RpcMethod>(&self) -> Result<Vec<crate::history::JsonRpcRecord<T, T::Response>>> {
        Ok(self.route::<T>().await?.history.records())
    }

    /// Forget everything tied to `topic`: history records, their expiry
    /// entries, waiters and its dispatch worker
    pub async fn delete_topic(&self, topic: &str) -> Result<()> {
        let routes: Vec<Arc<dyn MethodRoute>> = self.routes.read().values().cloned().collect();
        for route in routes {
            for id in route.delete_topic(topic).await? {
                self.expirer.delete(id).await?;
            }
        }
        self.workers.lock().remove(topic);
        Ok(())
    }

    async fn route<T: RpcMethod>(&self) -> Result<Arc<TypedRoute<T>>> {
        if let Some(route) = self.lookup::<T>()? {
            return Ok(route);
        }
        let _guard = self.route_lock.lock().await;
        if let Some(route) = self.lookup::<T>()? {
            return Ok(route);
        }

        let route = Arc::new(TypedRoute::<T>::new(self.storage.clone()));
        route.history.init().await?;
        let erased: Arc<dyn MethodRoute> = route.clone();
        self.routes.write().insert(T::method(), erased);
        Ok(route)
    }

    fn lookup<T: RpcMethod>(&self) -> Result<Option<Arc<TypedRoute<T>>>> {
        let route = self.routes.read().get(T::method()).cloned();
        match route {
            Some(route) => route
                .as_any()
                .downcast::<TypedRoute<T>>()
                .map(Some)
                .map_err(|_| Error::InvalidParams(format!("method {} bound to another type", T::method()))),
            None => Ok(None),
        }
    }

    fn publish_options(&self, policy: PublishPolicy) -> PublishOptions {
        PublishOptions {
            relay: RelayProtocolOptions {
                protocol: self.relayer.protocol(),
                data: None,
            },
            ttl: policy.ttl,
            tag: policy.tag,
            prompt: policy.prompt,
        }
    }

    async fn publish_request<T: RpcMethod>(
        &self,
        route: &TypedRoute<T>,
        topic: &str,
        request: JsonRpcRequest<T>,
        expiry: Option<u64>,
    ) -> Result<()> {
        let policy = T::METADATA.request;
        let ttl = expiry.unwrap_or(policy.ttl);
        let expires_at = calc_expiry(ttl);
        let id = request.id;

        let message = self.crypto.encode(topic, &request, &EncodeOptions::default()).await?;
        route.history.set(topic, request, None, Some(expires_at)).await?;
        self.expirer.set(id, expires_at).await?;

        let options = PublishOptions {
            ttl,
            ..self.publish_options(policy)
        };
        if let Err(e) = self.relayer.publish(topic, &message, &options).await {
            self.discard_request(route, topic, id).await;
            return Err(e);
        }
        debug!(topic, id, method = T::method(), "request sent");
        Ok(())
    }

    async fn publish_response(&self, route: &dyn MethodRoute, topic: &str, response: JsonRpcResponse<Value>) -> Result<()> {
        let message = self.crypto.encode(topic, &response, &EncodeOptions::default()).await?;
        let options = self.publish_options(route.metadata().response);
        self.relayer.publish(topic, &message, &options).await?;
        route.record_reply(&response).await?;
        trace!(topic, id = response.id(), "response sent");
        Ok(())
    }

    async fn discard_request(&self, route: &dyn MethodRoute, topic: &str, id: i64) {
        if let Err(e) = self.expirer.delete(id).await {
            warn!(id, "failed to drop request expiry: {e}");
        }
        if let Err(e) = route.expire(id).await {
            warn!(id, topic, "failed to drop request history: {e}");
        }
    }

    fn enqueue(self: &Arc<Self>, message: RelayMessage) {
        let RelayMessage { topic, message, .. } = message;
        let mut workers = self.workers.lock();
        let message = match workers.get(&topic) {
            Some(worker) => match worker.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let worker = self.spawn_worker(topic.clone());
        let _ = worker.send(message);
        workers.insert(topic, worker);
    }

    fn spawn_worker(self: &Arc<Self>, topic: String) -> mpsc::UnboundedSender<String> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = rx.recv() => match message {
                        Some(message) => handler.process(&topic, &message).await,
                        None => break,
                    },
                    _ = handler.cancel.cancelled() => break,
                }
            }
            trace!(%topic, "topic worker stopped");
        });
        tx
    }

    async fn process(&self, topic: &str, message: &str) {
        if self.crypto.has_keys(topic) && matches!(Crypto::payload_type(message), Ok(TYPE_0)) {
            warn!(topic, "dropping unencrypted message on a keyed topic");
            return;
        }
        let payload: JsonRpcPayload = match self.crypto.decode(topic, message, &DecodeOptions::default()).await {
            Ok(payload) => payload,
            Err(e) => {
                debug!(topic, "dropping undecodable message: {e}");
                return;
            }
        };

        match payload.into_message() {
            InboundMessage::Request(request) => self.on_request(topic, request).await,
            InboundMessage::Response(response) => self.on_response(topic, response).await,
        }
    }

    async fn on_request(&self, topic: &str, request: JsonRpcRequest<Value>) {
        let id = request.id;
        let method = request.method.clone();
        let route = self.routes.read().get(method.as_str()).cloned();
        let Some(route) = route else {
            self.on_unhandled(topic, id, &method).await;
            return;
        };

        let response = match route.dispatch_request(topic, request, &self.expirer).await {
            Ok(Dispatch::Handled(Reply::Result(result))) => JsonRpcResponse::Result(JsonRpcResult::new(id, result)),
            Ok(Dispatch::Handled(Reply::Error(error))) => JsonRpcResponse::Error(JsonRpcError::new(id, error)),
            Ok(Dispatch::Handled(Reply::NoReply)) => return,
            Ok(Dispatch::Duplicate) => {
                trace!(topic, id, "duplicate request dropped");
                return;
            }
            Ok(Dispatch::Unhandled) => {
                self.on_unhandled(topic, id, &method).await;
                return;
            }
            Err(e) => {
                debug!(topic, id, %method, "dropping request: {e}");
                return;
            }
        };

        if let Err(e) = self.publish_response(route.as_ref(), topic, response).await {
            warn!(topic, id, %method, "failed to reply: {e}");
        }
    }

    async fn on_unhandled(&self, topic: &str, id: i64, method: &str) {
        if !self.reject_unknown_methods {
            debug!(topic, id, method, "no handler for method, dropping");
            return;
        }

        let response = JsonRpcError::new(id, ErrorData::method_unsupported(method));
        let result = async {
            let message = self.crypto.encode(topic, &response, &EncodeOptions::default()).await?;
            self.relayer
                .publish(topic, &message, &self.publish_options(UNREGISTERED_METHOD.response))
                .await
        }
        .await;
        if let Err(e) = result {
            warn!(topic, id, method, "failed to reject unsupported method: {e}");
        }
    }

    async fn on_response(&self, topic: &str, response: JsonRpcResponse<Value>) {
        let id = response.id();
        let route = self.routes.read().values().find(|r| r.owns(id)).cloned();
        let Some(route) = route else {
            trace!(topic, id, "response for unknown request");
            return;
        };

        match route.dispatch_response(topic, response).await {
            Ok(()) => {
                if let Err(e) = self.expirer.delete(id).await {
                    warn!(id, "failed to drop request expiry: {e}");
                }
            }
            Err(e) => debug!(topic, id, "dropping response: {e}"),
        }
    }

    async fn on_expired_id(&self, id: i64) {
        let routes: Vec<Arc<dyn MethodRoute>> = self.routes.read().values().cloned().collect();
        for route in routes.into_iter().filter(|r| r.owns(id)) {
            if let Err(e) = route.expire(id).await {
                warn!(id, "failed to expire request: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Core, CoreOptions};
    use crate::history::RecordResponse;
    use crate::relayer::loopback::LoopbackRelay;
    use crate::storage::MemoryStorage;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct Echo {
        value: String,
    }

    impl RpcMethod for Echo {
        type Response = String;

        const METADATA: RpcMethodMetadata = RpcMethodMetadata {
            method: "wc_testEcho",
            request: PublishPolicy {
                ttl: 30,
                tag: 9000,
                prompt: false,
            },
            response: PublishPolicy {
                ttl: 30,
                tag: 9001,
                prompt: false,
            },
        };
    }

    /// Two started cores sharing a pairing topic
    async fn paired() -> (Arc<Core>, Arc<Core>, String) {
        let relay = LoopbackRelay::new();
        let alice = Core::new(CoreOptions::default(), Arc::new(MemoryStorage::new()), relay.connection());
        let bob = Core::new(CoreOptions::default(), Arc::new(MemoryStorage::new()), relay.connection());
        alice.start().await.unwrap();
        bob.start().await.unwrap();
        let created = alice.pairing().create(None).await.unwrap();
        bob.pairing().pair(&created.uri, false).await.unwrap();
        (alice, bob, created.topic)
    }

    #[tokio::test]
    async fn test_request_round_trip_records_history() {
        let (alice, bob, topic) = paired().await;
        alice
            .handler()
            .handle_message_type::<Echo, _, _, _, _>(
                |_topic, request: JsonRpcRequest<Echo>| async move { Reply::Result(request.params.value) },
                |_topic, _response| async {},
            )
            .await
            .unwrap();

        let echoed = bob
            .handler()
            .request(&topic, Echo { value: "hi".into() }, None)
            .await
            .unwrap();
        assert_eq!(echoed, "hi");

        let sent = bob.handler().history::<Echo>().await.unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, topic);
        assert_eq!(sent[0].response, Some(RecordResponse::Result("hi".to_string())));

        let received = alice.handler().history::<Echo>().await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, sent[0].id);
        assert_eq!(received[0].request.params.value, "hi");
    }

    #[tokio::test]
    async fn test_error_reply_surfaces_as_rpc_error() {
        let (alice, bob, topic) = paired().await;
        alice
            .handler()
            .handle_message_type::<Echo, _, _, _, _>(
                |_topic, _request| async { Reply::Error(ErrorData::new(5000, "rejected")) },
                |_topic, _response| async {},
            )
            .await
            .unwrap();

        let err = bob
            .handler()
            .request(&topic, Echo { value: "hi".into() }, None)
            .await
            .unwrap_err();
        match err {
            Error::Rpc { code, message } => {
                assert_eq!(code, 5000);
                assert_eq!(message, "rejected");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_response_callback_for_fire_and_forget() {
        let (alice, bob, topic) = paired().await;
        alice
            .handler()
            .handle_message_type::<Echo, _, _, _, _>(
                |_topic, request: JsonRpcRequest<Echo>| async move { Reply::Result(request.params.value) },
                |_topic, _response| async {},
            )
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        bob.handler()
            .handle_message_type::<Echo, _, _, _, _>(
                |_topic, _request| async { Reply::NoReply },
                move |topic, response: JsonRpcResponse<String>| {
                    let _ = tx.send((topic, response));
                    async {}
                },
            )
            .await
            .unwrap();

        let id = bob
            .handler()
            .send_request(&topic, Echo { value: "later".into() }, None)
            .await
            .unwrap();
        let (got_topic, response) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got_topic, topic);
        assert_eq!(response.id(), id);
        assert_eq!(response.into_result().unwrap(), "later");
    }

    #[tokio::test]
    async fn test_delete_topic_clears_history() {
        let (alice, bob, topic) = paired().await;
        alice
            .handler()
            .handle_message_type::<Echo, _, _, _, _>(
                |_topic, request: JsonRpcRequest<Echo>| async move { Reply::Result(request.params.value) },
                |_topic, _response| async {},
            )
            .await
            .unwrap();
        bob.handler()
            .request(&topic, Echo { value: "x".into() }, None)
            .await
            .unwrap();

        bob.handler().delete_topic(&topic).await.unwrap();
        assert!(bob.handler().history::<Echo>().await.unwrap().is_empty());
    }
}
