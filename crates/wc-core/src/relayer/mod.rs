//! Topic pub/sub over one multiplexed relay connection
//!
//! The [`Relayer`] owns the provider, publisher, subscriber and message
//! tracker. It acknowledges relay deliveries, drops duplicates, reconnects
//! with backoff after unexpected closes and restores subscriptions on
//! every connect.

pub mod connection;
pub mod loopback;
pub mod provider;
pub mod publisher;
pub mod subscriber;
pub mod tracker;

use crate::crypto::Crypto;
use crate::error::{Error, Result};
use crate::storage::{storage_key, KeyValueStorage};
use connection::RelayConnection;
use provider::{JsonRpcProvider, ProviderEvent};
use publisher::Publisher;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use subscriber::Subscriber;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracker::MessageTracker;
use tracing::{debug, info, trace, warn};
use url::Url;

pub const DEFAULT_RELAY_URL: &str = "wss://relay.walletconnect.com";
pub const DEFAULT_RELAY_PROTOCOL: &str = "irn";

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Relay protocol a topic is reachable through
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayProtocolOptions {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Default for RelayProtocolOptions {
    fn default() -> Self {
        Self {
            protocol: DEFAULT_RELAY_PROTOCOL.to_string(),
            data: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub relay: RelayProtocolOptions,
    pub ttl: u64,
    pub tag: u32,
    pub prompt: bool,
}

/// A message delivered on a subscribed topic
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayMessage {
    pub topic: String,
    pub message: String,
    pub published_at: i64,
}

#[derive(Clone, Debug)]
pub enum RelayerEvent {
    Connect,
    Disconnect,
    Message(RelayMessage),
}

#[derive(Clone, Debug)]
pub struct RelayerOptions {
    pub relay_url: String,
    pub project_id: Option<String>,
    pub protocol: String,
    pub user_agent: String,
    pub request_timeout: Duration,
}

impl Default for RelayerOptions {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            project_id: None,
            protocol: DEFAULT_RELAY_PROTOCOL.to_string(),
            user_agent: format!("wc-2/rust-{}", env!("CARGO_PKG_VERSION")),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Deserialize)]
struct SubscriptionParams {
    id: String,
    data: SubscriptionData,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionData {
    topic: String,
    message: String,
    #[serde(default)]
    published_at: i64,
}

/// Relay URL carrying auth, project and user agent query parameters
pub fn format_relay_url(relay_url: &str, auth: &str, project_id: Option<&str>, user_agent: &str) -> Result<String> {
    let mut url = Url::parse(relay_url).map_err(|e| Error::InvalidParams(format!("invalid relay url: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("auth", auth);
        if let Some(project_id) = project_id {
            query.append_pair("projectId", project_id);
        }
        query.append_pair("ua", user_agent);
    }
    Ok(url.to_string())
}

pub struct Relayer {
    options: parking_lot::RwLock<RelayerOptions>,
    crypto: Arc<Crypto>,
    provider: Arc<JsonRpcProvider>,
    publisher: Publisher,
    subscriber: Arc<Subscriber>,
    tracker: Arc<MessageTracker>,
    events: broadcast::Sender<RelayerEvent>,
    closed_by_client: AtomicBool,
    reconnecting: AtomicBool,
    cancel: CancellationToken,
}

impl Relayer {
    pub fn new(
        options: RelayerOptions,
        crypto: Arc<Crypto>,
        storage: Arc<dyn KeyValueStorage>,
        connection: Arc<dyn RelayConnection>,
    ) -> Self {
        let provider = Arc::new(JsonRpcProvider::new(connection, options.request_timeout));
        let (events, _) = broadcast::channel(1024);
        Self {
            publisher: Publisher::new(provider.clone()),
            subscriber: Arc::new(Subscriber::new(
                provider.clone(),
                storage.clone(),
                storage_key("subscription"),
            )),
            tracker: Arc::new(MessageTracker::new(storage, storage_key("messages"))),
            provider,
            options: parking_lot::RwLock::new(options),
            crypto,
            events,
            closed_by_client: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Restore subscriptions and seen messages. Does not connect.
    pub async fn init(&self) -> Result<()> {
        self.tracker.init().await?;
        self.subscriber.init(&self.crypto.client_id()?).await?;
        Ok(())
    }

    /// Start the event loop and open the connection
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.spawn_event_loop();
        self.transport_open(None).await
    }

    pub fn stop(&self) {
        self.closed_by_client.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayerEvent> {
        self.events.subscribe()
    }

    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    pub fn tracker(&self) -> &Arc<MessageTracker> {
        &self.tracker
    }

    pub fn provider(&self) -> &Arc<JsonRpcProvider> {
        &self.provider
    }

    pub fn protocol(&self) -> String {
        self.options.read().protocol.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.provider.is_connected()
    }

    pub async fn publish(&self, topic: &str, message: &str, options: &PublishOptions) -> Result<()> {
        self.publisher.publish(topic, message, options).await
    }

    pub async fn subscribe(&self, topic: &str, relay: Option<&RelayProtocolOptions>) -> Result<String> {
        let relay = relay.cloned().unwrap_or_else(|| self.relay_options());
        self.subscriber.subscribe(topic, &relay).await
    }

    pub async fn unsubscribe(&self, topic: &str, reason: &str) -> Result<()> {
        self.subscriber.unsubscribe(topic, reason).await?;
        self.tracker.delete(topic).await
    }

    /// Close the connection without scheduling a reconnect
    pub async fn transport_close(&self) -> Result<()> {
        self.closed_by_client.store(true, Ordering::Release);
        self.provider.disconnect().await
    }

    /// Open the connection, optionally against a new relay url. The auth
    /// token is reissued on every open.
    pub async fn transport_open(self: &Arc<Self>, relay_url: Option<&str>) -> Result<()> {
        if let Some(relay_url) = relay_url {
            self.options.write().relay_url = relay_url.to_string();
        }
        self.closed_by_client.store(false, Ordering::Release);
        self.provider.set_url(self.connection_url()?);
        self.provider.connect().await
    }

    pub async fn restart_transport(self: &Arc<Self>, relay_url: Option<&str>) -> Result<()> {
        self.transport_close().await?;
        self.transport_open(relay_url).await
    }

    fn relay_options(&self) -> RelayProtocolOptions {
        RelayProtocolOptions {
            protocol: self.protocol(),
            data: None,
        }
    }

    fn connection_url(&self) -> Result<String> {
        let options = self.options.read().clone();
        let auth = self.crypto.sign_jwt(&options.relay_url)?;
        format_relay_url(
            &options.relay_url,
            &auth,
            options.project_id.as_deref(),
            &options.user_agent,
        )
    }

    fn spawn_event_loop(self: &Arc<Self>) {
        let relayer = Arc::clone(self);
        let mut provider_events = self.provider.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = provider_events.recv() => match event {
                        Ok(event) => relayer.on_provider_event(event).await,
                        Err(RecvError::Lagged(missed)) => warn!(missed, "relayer lagged behind provider events"),
                        Err(RecvError::Closed) => break,
                    },
                    _ = relayer.cancel.cancelled() => break,
                }
            }
            debug!("relayer event loop stopped");
        });
    }

    async fn on_provider_event(self: &Arc<Self>, event: ProviderEvent) {
        match event {
            ProviderEvent::Connect => {
                let _ = self.events.send(RelayerEvent::Connect);
                let subscriber = self.subscriber.clone();
                tokio::spawn(async move {
                    if let Err(e) = subscriber.resubscribe().await {
                        warn!("resubscribe failed: {e}");
                    }
                });
            }
            ProviderEvent::Disconnect { reason } => {
                let _ = self.events.send(RelayerEvent::Disconnect);
                if !self.closed_by_client.load(Ordering::Acquire) {
                    info!(%reason, "relay connection lost, reconnecting");
                    self.spawn_reconnect();
                }
            }
            ProviderEvent::Request(request) => {
                if request.method == format!("{}_subscription", self.protocol()) {
                    self.on_subscription(request.id, request.params).await;
                } else {
                    debug!(method = %request.method, "ignoring relay request");
                }
            }
            ProviderEvent::Error(message) => debug!("relay transport error: {message}"),
        }
    }

    async fn on_subscription(&self, id: i64, params: Value) {
        if let Err(e) = self.provider.respond(id, true).await {
            warn!(id, "failed to ack relay delivery: {e}");
        }

        let params: SubscriptionParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                debug!("malformed subscription payload: {e}");
                return;
            }
        };
        let SubscriptionData {
            topic,
            message,
            published_at,
        } = params.data;

        match self.tracker.set(&topic, &message).await {
            Ok(true) => {
                trace!(%topic, subscription = %params.id, "relay message");
                let _ = self.events.send(RelayerEvent::Message(RelayMessage {
                    topic,
                    message,
                    published_at,
                }));
            }
            Ok(false) => trace!(%topic, "duplicate relay message dropped"),
            Err(e) => warn!(%topic, "failed to track relay message: {e}"),
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let relayer = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = relayer.cancel.cancelled() => break,
                }
                if relayer.closed_by_client.load(Ordering::Acquire) || relayer.is_connected() {
                    break;
                }
                match relayer.transport_open(None).await {
                    Ok(()) => {
                        info!("relay reconnected");
                        break;
                    }
                    Err(e) => {
                        warn!(backoff_secs = backoff.as_secs(), "reconnect failed: {e}");
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
            relayer.reconnecting.store(false, Ordering::Release);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_url_carries_auth() {
        let url = format_relay_url("wss://relay.example.com", "tok", Some("pid"), "wc-2/rust").unwrap();
        assert_eq!(url, "wss://relay.example.com/?auth=tok&projectId=pid&ua=wc-2%2Frust");

        let url = format_relay_url("wss://relay.example.com", "tok", None, "ua").unwrap();
        assert!(!url.contains("projectId"));
        assert!(format_relay_url("not a url", "tok", None, "ua").is_err());
    }
}
