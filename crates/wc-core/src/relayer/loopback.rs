//! In-process relay for tests and local demos
//!
//! Implements the relay RPC surface (`_publish`, `_subscribe`,
//! `_batchSubscribe`, `_unsubscribe`) for any protocol prefix and pushes
//! `_subscription` deliveries to every other subscribed client. Published
//! messages are retained for their TTL and replayed to new subscribers,
//! the way a real relay mailbox behaves.

use super::connection::{ConnectionEvent, ConnectionEvents, RelayConnection, TransportError};
use crate::crypto::hash_message;
use crate::rpc::{ErrorData, InboundMessage, JsonRpcError, JsonRpcPayload, JsonRpcRequest, JsonRpcResult};
use crate::time::{unix_now, unix_now_millis};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

#[derive(Clone, Debug)]
struct StoredMessage {
    protocol: String,
    message: String,
    published_at: i64,
    expires_at: i64,
    publisher: u64,
}

#[derive(Default)]
struct Client {
    events: Option<ConnectionEvents>,
    /// topic -> subscription id
    subscriptions: HashMap<String, String>,
    urls: Vec<String>,
}

#[derive(Default)]
struct RelayState {
    clients: HashMap<u64, Client>,
    mailbox: HashMap<String, Vec<StoredMessage>>,
    next_client: u64,
    subscribe_requests: usize,
    publish_requests: usize,
}

#[derive(Deserialize)]
struct PublishParams {
    topic: String,
    message: String,
    ttl: i64,
}

#[derive(Deserialize)]
struct SubscribeParams {
    topic: String,
}

#[derive(Deserialize)]
struct BatchSubscribeParams {
    topics: Vec<String>,
}

#[derive(Deserialize)]
struct UnsubscribeParams {
    topic: String,
}

#[derive(Clone, Default)]
pub struct LoopbackRelay {
    state: Arc<Mutex<RelayState>>,
}

impl LoopbackRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh client connection to this relay
    pub fn connection(&self) -> Arc<LoopbackConnection> {
        let mut state = self.state.lock();
        state.next_client += 1;
        let client = state.next_client;
        state.clients.insert(client, Client::default());
        Arc::new(LoopbackConnection {
            state: self.state.clone(),
            client,
            open: AtomicBool::new(false),
        })
    }

    /// Number of subscribe and batch subscribe requests received
    pub fn subscribe_requests(&self) -> usize {
        self.state.lock().subscribe_requests
    }

    pub fn publish_requests(&self) -> usize {
        self.state.lock().publish_requests
    }

    /// Drop every client connection as if the relay went away. The relay
    /// forgets their subscriptions.
    pub fn disconnect_all(&self, reason: &str) {
        let mut state = self.state.lock();
        for client in state.clients.values_mut() {
            client.subscriptions.clear();
            if let Some(events) = client.events.take() {
                let _ = events.send(ConnectionEvent::Close {
                    reason: reason.to_string(),
                });
            }
        }
    }

    /// Deliver the retained messages on `topic` to its subscribers again
    pub fn redeliver(&self, topic: &str) {
        let state = self.state.lock();
        let Some(messages) = state.mailbox.get(topic) else {
            return;
        };
        for stored in messages {
            deliver(&state, topic, stored, None);
        }
    }

    /// Urls clients connected with, oldest first
    pub fn connected_urls(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut ids: Vec<&u64> = state.clients.keys().collect();
        ids.sort();
        ids.into_iter()
            .flat_map(|id| state.clients[id].urls.clone())
            .collect()
    }
}

fn protocol_of(method: &str) -> &str {
    method.split('_').next().unwrap_or_default()
}

fn subscription_id(client: u64, topic: &str) -> String {
    hash_message(&format!("{client}:{topic}"))
}

fn send_to(state: &RelayState, client: u64, payload: String) {
    if let Some(events) = state.clients.get(&client).and_then(|c| c.events.as_ref()) {
        let _ = events.send(ConnectionEvent::Payload(payload));
    }
}

/// Push `stored` to every subscriber of `topic`, or only to `only`
fn deliver(state: &RelayState, topic: &str, stored: &StoredMessage, only: Option<u64>) {
    for (client_id, client) in &state.clients {
        if *client_id == stored.publisher || only.is_some_and(|only| only != *client_id) {
            continue;
        }
        let Some(subscription) = client.subscriptions.get(topic) else {
            continue;
        };
        let push = JsonRpcRequest::new(
            format!("{}_subscription", stored.protocol),
            json!({
                "id": subscription,
                "data": {
                    "topic": topic,
                    "message": stored.message,
                    "publishedAt": stored.published_at,
                },
            }),
        );
        if let Ok(payload) = serde_json::to_string(&push) {
            send_to(state, *client_id, payload);
        }
    }
}

pub struct LoopbackConnection {
    state: Arc<Mutex<RelayState>>,
    client: u64,
    open: AtomicBool,
}

impl LoopbackConnection {
    fn handle_request(&self, state: &mut RelayState, request: JsonRpcRequest<Value>) -> Result<Value, ErrorData> {
        let protocol = protocol_of(&request.method).to_string();
        let action = request
            .method
            .strip_prefix(&format!("{protocol}_"))
            .unwrap_or_default()
            .to_string();
        let invalid = |e: serde_json::Error| ErrorData::new(-32602, e.to_string());

        match action.as_str() {
            "publish" => {
                let params: PublishParams = serde_json::from_value(request.params).map_err(invalid)?;
                state.publish_requests += 1;
                let now = unix_now();
                let stored = StoredMessage {
                    protocol,
                    message: params.message,
                    published_at: unix_now_millis(),
                    expires_at: now + params.ttl,
                    publisher: self.client,
                };
                let mailbox = state.mailbox.entry(params.topic.clone()).or_default();
                mailbox.retain(|m| m.expires_at > now);
                mailbox.push(stored.clone());
                deliver(state, &params.topic, &stored, None);
                Ok(json!(true))
            }
            "subscribe" => {
                let params: SubscribeParams = serde_json::from_value(request.params).map_err(invalid)?;
                state.subscribe_requests += 1;
                let id = self.add_subscription(state, &params.topic);
                Ok(json!(id))
            }
            "batchSubscribe" => {
                let params: BatchSubscribeParams = serde_json::from_value(request.params).map_err(invalid)?;
                state.subscribe_requests += 1;
                let ids: Vec<String> = params
                    .topics
                    .iter()
                    .map(|topic| self.add_subscription(state, topic))
                    .collect();
                Ok(json!(ids))
            }
            "unsubscribe" => {
                let params: UnsubscribeParams = serde_json::from_value(request.params).map_err(invalid)?;
                if let Some(client) = state.clients.get_mut(&self.client) {
                    client.subscriptions.remove(&params.topic);
                }
                Ok(json!(true))
            }
            _ => Err(ErrorData::new(-32601, format!("method not found: {}", request.method))),
        }
    }

    fn add_subscription(&self, state: &mut RelayState, topic: &str) -> String {
        let id = subscription_id(self.client, topic);
        if let Some(client) = state.clients.get_mut(&self.client) {
            client.subscriptions.insert(topic.to_string(), id.clone());
        }
        id
    }

    /// Replay retained messages for newly subscribed topics
    fn replay(&self, state: &RelayState, topics: &[String]) {
        let now = unix_now();
        for topic in topics {
            if let Some(messages) = state.mailbox.get(topic) {
                for stored in messages.iter().filter(|m| m.expires_at > now) {
                    deliver(state, topic, stored, Some(self.client));
                }
            }
        }
    }
}

#[async_trait]
impl RelayConnection for LoopbackConnection {
    async fn open(&self, url: &str, events: ConnectionEvents) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let client = state.clients.entry(self.client).or_default();
        client.urls.push(url.to_string());
        let _ = events.send(ConnectionEvent::Open);
        client.events = Some(events);
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if let Some(client) = state.clients.get_mut(&self.client) {
            client.events = None;
            client.subscriptions.clear();
        }
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    async fn send(&self, payload: String) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state
            .clients
            .get(&self.client)
            .map_or(true, |c| c.events.is_none())
        {
            return Err(TransportError::NotOpen);
        }

        let payload: JsonRpcPayload = serde_json::from_str(&payload)?;
        let request = match payload.into_message() {
            InboundMessage::Request(request) => request,
            InboundMessage::Response(response) => {
                trace!(id = response.id(), "loopback relay received ack");
                return Ok(());
            }
        };

        let id = request.id;
        let subscribed_topics = match request.method.as_str() {
            m if m.ends_with("_subscribe") => request.params.get("topic").and_then(Value::as_str).map(|t| vec![t.to_string()]),
            m if m.ends_with("_batchSubscribe") => request
                .params
                .get("topics")
                .and_then(|t| serde_json::from_value::<Vec<String>>(t.clone()).ok()),
            _ => None,
        };

        let reply = match self.handle_request(&mut state, request) {
            Ok(result) => serde_json::to_string(&JsonRpcResult::new(id, result))?,
            Err(error) => serde_json::to_string(&JsonRpcError::new(id, error))?,
        };
        send_to(&state, self.client, reply);

        if let Some(topics) = subscribed_topics {
            self.replay(&state, &topics);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}
