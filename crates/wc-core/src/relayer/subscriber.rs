//! Topic subscriptions on the relay
//!
//! Active subscriptions are persisted and restored at startup. While a
//! subscribe call is in flight the topic is tracked as pending under a
//! deterministic id, so concurrent callers share one relay request. After
//! every (re)connect all cached topics are re-issued in one batch call.

use super::provider::JsonRpcProvider;
use super::RelayProtocolOptions;
use crate::error::{Error, Result};
use crate::storage::{KeyValueStorage, PersistentMap, Record};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, trace, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSubscription {
    pub id: String,
    pub topic: String,
    pub relay: RelayProtocolOptions,
}

impl Record for ActiveSubscription {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Clone, Debug)]
pub enum SubscriberEvent {
    Created(ActiveSubscription),
    Deleted {
        subscription: ActiveSubscription,
        reason: String,
    },
    Resubscribed { count: usize },
}

#[derive(Serialize)]
struct SubscribeParams<'a> {
    topic: &'a str,
}

#[derive(Serialize)]
struct BatchSubscribeParams<'a> {
    topics: &'a [String],
}

#[derive(Serialize)]
struct UnsubscribeParams<'a> {
    topic: &'a str,
    id: &'a str,
}

/// In-flight subscribe: the optimistic id and the channel carrying the
/// relay-assigned one (`None` until confirmed or failed).
struct PendingSubscription {
    id: String,
    relay: RelayProtocolOptions,
    confirmed: watch::Receiver<Option<std::result::Result<String, String>>>,
}

/// Subscription id used before the relay confirms one
pub fn pending_subscription_id(topic: &str, client_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(topic.as_bytes());
    hasher.update(client_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Clears a pending entry however the leading subscribe ends, including
/// when its future is dropped mid-request
struct PendingGuard<'a> {
    pending: &'a RwLock<HashMap<String, PendingSubscription>>,
    topic: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.write().remove(self.topic);
    }
}

pub struct Subscriber {
    provider: Arc<JsonRpcProvider>,
    client_id: OnceLock<String>,
    active: PersistentMap<ActiveSubscription>,
    pending: RwLock<HashMap<String, PendingSubscription>>,
    events: broadcast::Sender<SubscriberEvent>,
    initialized: AtomicBool,
}

impl Subscriber {
    pub fn new(
        provider: Arc<JsonRpcProvider>,
        storage: Arc<dyn KeyValueStorage>,
        storage_key: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            provider,
            client_id: OnceLock::new(),
            active: PersistentMap::new(storage, storage_key),
            pending: RwLock::new(HashMap::new()),
            events,
            initialized: AtomicBool::new(false),
        }
    }

    /// Restore persisted subscriptions. `client_id` seeds pending ids.
    pub async fn init(&self, client_id: &str) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let _ = self.client_id.set(client_id.to_string());
        let count = self.active.restore().await?;
        debug!(count, "restored subscriptions");
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SubscriberEvent> {
        self.events.subscribe()
    }

    /// Subscribe to `topic`, returning its subscription id. Subscribing to
    /// a topic that is already active or pending reuses the existing
    /// subscription without another relay call.
    pub async fn subscribe(&self, topic: &str, relay: &RelayProtocolOptions) -> Result<String> {
        self.check_initialized()?;
        if let Some(id) = self.active_id(topic) {
            trace!(topic, "already subscribed");
            return Ok(id);
        }

        let existing = {
            let mut pending = self.pending.write();
            match pending.get(topic).map(|p| p.confirmed.clone()) {
                Some(confirmed) => Err(confirmed),
                None => {
                    let (tx, rx) = watch::channel(None);
                    pending.insert(
                        topic.to_string(),
                        PendingSubscription {
                            id: pending_subscription_id(
                                topic,
                                self.client_id.get().map(String::as_str).unwrap_or_default(),
                            ),
                            relay: relay.clone(),
                            confirmed: rx,
                        },
                    );
                    Ok(tx)
                }
            }
        };
        let tx = match existing {
            Ok(tx) => tx,
            Err(confirmed) => {
                trace!(topic, "joining pending subscribe");
                return Self::await_pending(topic, confirmed).await;
            }
        };
        let pending_guard = PendingGuard {
            pending: &self.pending,
            topic,
        };

        let method = format!("{}_subscribe", relay.protocol);
        let outcome = match self
            .provider
            .request::<_, String>(&method, SubscribeParams { topic }, None)
            .await
        {
            Ok(id) => self.confirm(topic, id, relay.clone()).await,
            Err(e) => Err(e),
        };

        drop(pending_guard);
        let _ = tx.send(Some(
            outcome.as_ref().map(|id| id.clone()).map_err(|e| e.to_string()),
        ));
        outcome
    }

    async fn await_pending(
        topic: &str,
        mut confirmed: watch::Receiver<Option<std::result::Result<String, String>>>,
    ) -> Result<String> {
        loop {
            let outcome = confirmed.borrow().clone();
            if let Some(outcome) = outcome {
                return outcome.map_err(|message| Error::Rpc { code: 0, message });
            }
            if confirmed.changed().await.is_err() {
                return Err(Error::Timeout(format!("subscribe to {topic} abandoned")));
            }
        }
    }

    async fn confirm(&self, topic: &str, id: String, relay: RelayProtocolOptions) -> Result<String> {
        let subscription = ActiveSubscription {
            id: id.clone(),
            topic: topic.to_string(),
            relay,
        };
        self.active.insert(subscription.clone()).await?;
        debug!(topic, %id, "subscribed");
        let _ = self.events.send(SubscriberEvent::Created(subscription));
        Ok(id)
    }

    /// Drop every subscription on `topic` and tell the relay
    pub async fn unsubscribe(&self, topic: &str, reason: &str) -> Result<()> {
        self.check_initialized()?;
        let subscriptions = self.active.filter(|s| s.topic == topic);
        if subscriptions.is_empty() {
            trace!(topic, "not subscribed");
            return Ok(());
        }

        // offline, dropping the local record is enough: resubscribe only
        // replays what is still cached
        let online = self.provider.is_connected();
        for subscription in subscriptions {
            if online {
                let method = format!("{}_unsubscribe", subscription.relay.protocol);
                let params = UnsubscribeParams {
                    topic,
                    id: &subscription.id,
                };
                let _: bool = self.provider.request(&method, params, None).await?;
            }
            self.active.remove(&subscription.id).await?;
            debug!(topic, id = %subscription.id, "unsubscribed");
            let _ = self.events.send(SubscriberEvent::Deleted {
                subscription,
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    /// Re-issue every cached subscription in one batch. Existing entries
    /// stay active until the relay returns their replacements.
    pub async fn resubscribe(&self) -> Result<usize> {
        self.check_initialized()?;
        let mut by_protocol: HashMap<RelayProtocolOptions, Vec<String>> = HashMap::new();
        for subscription in self.active.values() {
            let topics = by_protocol.entry(subscription.relay.clone()).or_default();
            if !topics.contains(&subscription.topic) {
                topics.push(subscription.topic);
            }
        }
        if by_protocol.is_empty() {
            return Ok(0);
        }

        let mut count = 0;
        for (relay, topics) in by_protocol {
            let method = format!("{}_batchSubscribe", relay.protocol);
            let ids: Vec<String> = self
                .provider
                .request(&method, BatchSubscribeParams { topics: &topics }, None)
                .await?;
            if ids.len() != topics.len() {
                warn!(expected = topics.len(), got = ids.len(), "batch subscribe id count mismatch");
            }

            for (topic, id) in topics.iter().zip(ids) {
                self.active
                    .remove_where(|s| s.topic == *topic && s.id != id)
                    .await?;
                self.active
                    .insert(ActiveSubscription {
                        id,
                        topic: topic.clone(),
                        relay: relay.clone(),
                    })
                    .await?;
                count += 1;
            }
        }

        info!(count, "resubscribed");
        let _ = self.events.send(SubscriberEvent::Resubscribed { count });
        Ok(count)
    }

    /// Confirmed subscription id for `topic`, or the pending id while the
    /// relay has not answered yet
    pub fn subscription_id(&self, topic: &str) -> Option<String> {
        self.active_id(topic)
            .or_else(|| self.pending.read().get(topic).map(|p| p.id.clone()))
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscription_id(topic).is_some()
    }

    pub fn is_pending(&self, topic: &str) -> bool {
        self.pending.read().contains_key(topic)
    }

    /// All topics, active and pending
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.active.values().into_iter().map(|s| s.topic).collect();
        topics.extend(self.pending.read().keys().cloned());
        topics.sort();
        topics.dedup();
        topics
    }

    /// Subscription ids held for `topic`
    pub fn ids(&self, topic: &str) -> Vec<String> {
        self.active
            .filter(|s| s.topic == topic)
            .into_iter()
            .map(|s| s.id)
            .collect()
    }

    /// Relay options of a pending subscription
    pub fn pending_relay(&self, topic: &str) -> Option<RelayProtocolOptions> {
        self.pending.read().get(topic).map(|p| p.relay.clone())
    }

    fn active_id(&self, topic: &str) -> Option<String> {
        self.active
            .filter(|s| s.topic == topic)
            .into_iter()
            .next()
            .map(|s| s.id)
    }

    fn check_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotInitialized("subscriber"))
        }
    }
}
