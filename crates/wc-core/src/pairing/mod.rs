//! Pairing lifecycle
//!
//! A pairing starts inactive with a five minute TTL, becomes active (30
//! days) once the peer is known, and ends either when the expirer fires
//! or when one side sends `wc_pairingDelete`.

pub mod uri;

use crate::crypto::{generate_random_bytes32, Crypto};
use crate::error::{Error, Result};
use crate::expirer::{Expirer, ExpirerEvent, ExpirerTarget};
use crate::handler::{Reply, TypedMessageHandler};
use crate::relayer::{RelayProtocolOptions, Relayer};
use crate::rpc::{ErrorData, JsonRpcRequest, PairingDelete, PairingPing, RpcMethod};
use crate::storage::{storage_key, KeyValueStorage, PersistentMap, Record};
use crate::time::{calc_expiry, is_expired, FIVE_MINUTES, THIRTY_DAYS};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
pub use uri::PairingUri;

/// Application metadata a peer advertises
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub description: String,
    pub url: String,
    #[serde(default)]
    pub icons: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingStruct {
    pub topic: String,
    pub expiry: i64,
    pub relay: RelayProtocolOptions,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
}

impl Record for PairingStruct {
    type Key = String;

    fn key(&self) -> String {
        self.topic.clone()
    }
}

/// A freshly created pairing and the URI to hand to the peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedPairing {
    pub topic: String,
    pub uri: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PairingEvent {
    Created(PairingStruct),
    Activated(PairingStruct),
    Updated(PairingStruct),
    Ping { topic: String, id: i64 },
    Expired { topic: String },
    Deleted { topic: String, reason: ErrorData },
}

pub struct Pairing {
    crypto: Arc<Crypto>,
    relayer: Arc<Relayer>,
    expirer: Arc<Expirer>,
    handler: Arc<TypedMessageHandler>,
    pairings: PersistentMap<PairingStruct>,
    registered_methods: RwLock<BTreeSet<String>>,
    events: broadcast::Sender<PairingEvent>,
    initialized: AtomicBool,
}

impl Pairing {
    pub fn new(
        crypto: Arc<Crypto>,
        relayer: Arc<Relayer>,
        expirer: Arc<Expirer>,
        handler: Arc<TypedMessageHandler>,
        storage: Arc<dyn KeyValueStorage>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            crypto,
            relayer,
            expirer,
            handler,
            pairings: PersistentMap::new(storage, storage_key("pairing")),
            registered_methods: RwLock::new(BTreeSet::new()),
            events,
            initialized: AtomicBool::new(false),
        }
    }

    /// Restore pairings, drop the ones that expired while offline and
    /// register the pairing method handlers
    pub async fn init(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        self.pairings.restore().await?;
        self.initialized.store(true, Ordering::Release);

        for pairing in self.pairings.filter(|p| is_expired(p.expiry)) {
            debug!(topic = %pairing.topic, "pairing expired while offline");
            self.delete_pairing(&pairing.topic, ErrorData::new(6001, "Pairing expired.")).await?;
        }

        self.register_handlers().await?;
        Ok(self.spawn_expiry_listener())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PairingEvent> {
        self.events.subscribe()
    }

    /// Create an inactive pairing on a fresh topic
    pub async fn create(&self, methods: Option<Vec<String>>) -> Result<CreatedPairing> {
        self.check_initialized()?;
        let sym_key = generate_random_bytes32();
        let topic = self.crypto.set_sym_key(&sym_key, None).await?;
        let expiry = calc_expiry(FIVE_MINUTES);
        let relay = RelayProtocolOptions {
            protocol: self.relayer.protocol(),
            data: None,
        };

        let pairing = PairingStruct {
            topic: topic.clone(),
            expiry,
            relay: relay.clone(),
            active: false,
            peer_metadata: None,
            methods: methods.clone(),
        };
        self.subscribe_or_forget_key(&topic, &relay, false).await?;
        self.pairings.insert(pairing.clone()).await?;
        self.expirer.set(topic.as_str(), expiry).await?;

        let uri = PairingUri {
            expiry_timestamp: Some(expiry),
            methods,
            ..PairingUri::new(topic.clone(), sym_key, relay)
        };
        info!(%topic, "pairing created");
        let _ = self.events.send(PairingEvent::Created(pairing));
        Ok(CreatedPairing {
            topic,
            uri: uri.to_string(),
        })
    }

    /// Pair with a peer from its URI. The symmetric key is stored under the
    /// URI topic, the topic subscribed, and the pairing recorded inactive
    /// unless `activate` is set.
    pub async fn pair(&self, uri: &str, activate: bool) -> Result<PairingStruct> {
        self.check_initialized()?;
        let uri = PairingUri::parse(uri)?;
        if let Some(existing) = self.pairings.get(&uri.topic) {
            if existing.active {
                return Err(Error::InvalidParams(format!(
                    "pairing {} already exists and is active",
                    uri.topic
                )));
            }
        }
        let expiry = match uri.expiry_timestamp {
            Some(expiry) if is_expired(expiry) => {
                return Err(Error::Expired(format!("pairing uri for {}", uri.topic)))
            }
            Some(expiry) => expiry,
            None => calc_expiry(FIVE_MINUTES),
        };

        let had_key = self.crypto.has_keys(&uri.topic);
        self.crypto.set_sym_key(&uri.sym_key, Some(&uri.topic)).await?;
        self.subscribe_or_forget_key(&uri.topic, &uri.relay, had_key).await?;
        let pairing = PairingStruct {
            topic: uri.topic.clone(),
            expiry,
            relay: uri.relay.clone(),
            active: false,
            peer_metadata: None,
            methods: uri.methods.clone(),
        };
        self.pairings.insert(pairing.clone()).await?;
        self.expirer.set(uri.topic.as_str(), expiry).await?;
        debug!(topic = %uri.topic, "paired");
        let _ = self.events.send(PairingEvent::Created(pairing.clone()));

        if activate {
            return self.activate(&uri.topic).await;
        }
        Ok(pairing)
    }

    /// Mark a pairing active and extend it to thirty days
    pub async fn activate(&self, topic: &str) -> Result<PairingStruct> {
        self.check_initialized()?;
        let expiry = calc_expiry(THIRTY_DAYS);
        let pairing = self
            .pairings
            .update(&topic.to_string(), |p| {
                p.active = true;
                p.expiry = expiry;
            })
            .await?
            .ok_or_else(|| Self::miss(topic))?;
        self.expirer.set(topic, expiry).await?;
        info!(topic, "pairing activated");
        let _ = self.events.send(PairingEvent::Activated(pairing.clone()));
        Ok(pairing)
    }

    /// Round-trip `wc_pairingPing` to the peer
    pub async fn ping(&self, topic: &str) -> Result<()> {
        self.check_initialized()?;
        self.existing(topic)?;
        let alive = self.handler.request(topic, PairingPing {}, None).await?;
        debug!(topic, alive, "pairing ping answered");
        Ok(())
    }

    /// Tell the peer and delete the pairing locally
    pub async fn disconnect(&self, topic: &str) -> Result<()> {
        self.check_initialized()?;
        self.existing(topic)?;
        let reason = PairingDelete::default();
        if let Err(e) = self.handler.send_request(topic, reason.clone(), None).await {
            warn!(topic, "failed to notify peer of pairing delete: {e}");
        }
        self.delete_pairing(topic, ErrorData::new(reason.code, reason.message))
            .await
    }

    pub async fn update_metadata(&self, topic: &str, metadata: Metadata) -> Result<PairingStruct> {
        self.check_initialized()?;
        let pairing = self
            .pairings
            .update(&topic.to_string(), |p| p.peer_metadata = Some(metadata))
            .await?
            .ok_or_else(|| Self::miss(topic))?;
        let _ = self.events.send(PairingEvent::Updated(pairing.clone()));
        Ok(pairing)
    }

    pub async fn update_expiry(&self, topic: &str, expiry: i64) -> Result<PairingStruct> {
        self.check_initialized()?;
        if expiry > calc_expiry(THIRTY_DAYS) {
            return Err(Error::InvalidParams(format!(
                "expiry {expiry} is more than thirty days away"
            )));
        }
        let pairing = self
            .pairings
            .update(&topic.to_string(), |p| p.expiry = expiry)
            .await?
            .ok_or_else(|| Self::miss(topic))?;
        self.expirer.set(topic, expiry).await?;
        let _ = self.events.send(PairingEvent::Updated(pairing.clone()));
        Ok(pairing)
    }

    pub fn get_pairings(&self) -> Result<Vec<PairingStruct>> {
        self.check_initialized()?;
        let mut pairings = self.pairings.values();
        pairings.sort_by(|a, b| a.expiry.cmp(&b.expiry).then_with(|| a.topic.cmp(&b.topic)));
        Ok(pairings)
    }

    pub fn get_pairing(&self, topic: &str) -> Result<PairingStruct> {
        self.check_initialized()?;
        self.existing(topic)
    }

    /// Record methods the application handles over pairings
    pub fn register(&self, methods: &[&str]) {
        let mut registered = self.registered_methods.write();
        registered.extend(methods.iter().map(|m| m.to_string()));
    }

    pub fn registered_methods(&self) -> Vec<String> {
        self.registered_methods.read().iter().cloned().collect()
    }

    async fn register_handlers(self: &Arc<Self>) -> Result<()> {
        self.register(&[PairingPing::METADATA.method, PairingDelete::METADATA.method]);

        let events = self.events.clone();
        self.handler
            .handle_message_type::<PairingPing, _, _, _, _>(
                move |topic, request: JsonRpcRequest<PairingPing>| {
                    let _ = events.send(PairingEvent::Ping {
                        topic,
                        id: request.id,
                    });
                    async { Reply::Result(true) }
                },
                |topic, response| async move {
                    debug!(%topic, id = response.id(), "pairing ping response");
                },
            )
            .await?;

        let pairing: Weak<Pairing> = Arc::downgrade(self);
        self.handler
            .handle_message_type::<PairingDelete, _, _, _, _>(
                move |topic, request: JsonRpcRequest<PairingDelete>| {
                    let pairing = pairing.clone();
                    async move {
                        let Some(pairing) = pairing.upgrade() else {
                            return Reply::NoReply;
                        };
                        pairing.on_delete_request(topic, request).await;
                        Reply::NoReply
                    }
                },
                |topic, response| async move {
                    debug!(%topic, id = response.id(), "pairing delete acknowledged");
                },
            )
            .await
    }

    /// Acknowledge before tearing down, the reply needs the topic key
    async fn on_delete_request(&self, topic: String, request: JsonRpcRequest<PairingDelete>) {
        if !self.pairings.contains(&topic) {
            debug!(%topic, "delete for unknown pairing");
            return;
        }
        if let Err(e) = self
            .handler
            .send_result::<PairingDelete>(&topic, request.id, true)
            .await
        {
            warn!(%topic, "failed to acknowledge pairing delete: {e}");
        }
        let reason = ErrorData::new(request.params.code, request.params.message);
        if let Err(e) = self.delete_pairing(&topic, reason).await {
            warn!(%topic, "failed to delete pairing: {e}");
        }
    }

    fn spawn_expiry_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut expirations = self.expirer.subscribe();
        let pairing = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match expirations.recv().await {
                    Ok(ExpirerEvent::Expired {
                        target: ExpirerTarget::Topic(topic),
                        ..
                    }) => {
                        let Some(pairing) = pairing.upgrade() else { break };
                        pairing.on_topic_expired(&topic).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => warn!(missed, "pairing lagged behind expirer events"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn on_topic_expired(&self, topic: &str) {
        if !self.pairings.contains(&topic.to_string()) {
            return;
        }
        info!(topic, "pairing expired");
        if let Err(e) = self
            .delete_pairing(topic, ErrorData::new(6001, "Pairing expired."))
            .await
        {
            warn!(topic, "failed to clean up expired pairing: {e}");
            return;
        }
        let _ = self.events.send(PairingEvent::Expired {
            topic: topic.to_string(),
        });
    }

    /// Subscribe to a pairing topic. On failure a key stored just for this
    /// pairing is removed again.
    async fn subscribe_or_forget_key(&self, topic: &str, relay: &RelayProtocolOptions, had_key: bool) -> Result<()> {
        let Err(e) = self.relayer.subscribe(topic, Some(relay)).await else {
            return Ok(());
        };
        if !had_key {
            if let Err(cleanup) = self.crypto.delete_sym_key(topic).await {
                warn!(topic, "failed to drop pairing key: {cleanup}");
            }
        }
        Err(e)
    }

    async fn delete_pairing(&self, topic: &str, reason: ErrorData) -> Result<()> {
        self.relayer.unsubscribe(topic, &reason.message).await?;
        self.pairings.remove(&topic.to_string()).await?;
        match self.crypto.delete_sym_key(topic).await {
            Ok(()) | Err(Error::NoMatchingKey(_)) => {}
            Err(e) => return Err(e),
        }
        self.expirer.delete(topic).await?;
        self.handler.delete_topic(topic).await?;
        debug!(topic, "pairing deleted");
        let _ = self.events.send(PairingEvent::Deleted {
            topic: topic.to_string(),
            reason,
        });
        Ok(())
    }

    fn existing(&self, topic: &str) -> Result<PairingStruct> {
        self.pairings.get(&topic.to_string()).ok_or_else(|| Self::miss(topic))
    }

    fn miss(topic: &str) -> Error {
        Error::NoMatchingTopic {
            context: "pairing",
            topic: topic.to_string(),
        }
    }

    fn check_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotInitialized("pairing"))
        }
    }
}
