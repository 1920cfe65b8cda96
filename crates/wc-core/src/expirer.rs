//! TTL registry keyed by topic or request id
//!
//! Entries are checked on every heartbeat pulse; anything whose expiry is
//! at or before the wall clock fires [`ExpirerEvent::Expired`] and is
//! removed. Every change persists the full entry set.

use crate::error::{Error, Result};
use crate::storage::{KeyValueStorage, PersistentMap, Record};
use crate::time::unix_now;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

const TOPIC_PREFIX: &str = "topic:";
const ID_PREFIX: &str = "id:";

/// What an expiration is attached to
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExpirerTarget {
    Topic(String),
    Id(i64),
}

impl ExpirerTarget {
    /// Parse the normalized `topic:<x>` / `id:<n>` form
    pub fn parse(target: &str) -> Result<Self> {
        if let Some(topic) = target.strip_prefix(TOPIC_PREFIX) {
            return Ok(ExpirerTarget::Topic(topic.to_string()));
        }
        if let Some(id) = target.strip_prefix(ID_PREFIX) {
            let id = id
                .parse()
                .map_err(|_| Error::InvalidParams(format!("invalid expirer id target: {target}")))?;
            return Ok(ExpirerTarget::Id(id));
        }
        Err(Error::InvalidParams(format!("invalid expirer target: {target}")))
    }

    fn miss(&self) -> Error {
        match self {
            ExpirerTarget::Topic(topic) => Error::NoMatchingTopic {
                context: "expirer",
                topic: topic.clone(),
            },
            ExpirerTarget::Id(id) => Error::NoMatchingId {
                context: "expirer",
                id: *id,
            },
        }
    }
}

impl fmt::Display for ExpirerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpirerTarget::Topic(topic) => write!(f, "{TOPIC_PREFIX}{topic}"),
            ExpirerTarget::Id(id) => write!(f, "{ID_PREFIX}{id}"),
        }
    }
}

impl From<&str> for ExpirerTarget {
    fn from(topic: &str) -> Self {
        ExpirerTarget::Topic(topic.to_string())
    }
}

impl From<String> for ExpirerTarget {
    fn from(topic: String) -> Self {
        ExpirerTarget::Topic(topic)
    }
}

impl From<i64> for ExpirerTarget {
    fn from(id: i64) -> Self {
        ExpirerTarget::Id(id)
    }
}

/// A scheduled expiry, in unix seconds
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expiration {
    pub target: String,
    pub expiry: i64,
}

impl Expiration {
    pub fn target(&self) -> Result<ExpirerTarget> {
        ExpirerTarget::parse(&self.target)
    }
}

impl Record for Expiration {
    type Key = String;

    fn key(&self) -> String {
        self.target.clone()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExpirerEvent {
    Created {
        target: ExpirerTarget,
        expiration: Expiration,
    },
    Deleted {
        target: ExpirerTarget,
        expiration: Expiration,
    },
    Expired {
        target: ExpirerTarget,
        expiration: Expiration,
    },
}

pub struct Expirer {
    expirations: PersistentMap<Expiration>,
    events: broadcast::Sender<ExpirerEvent>,
    initialized: AtomicBool,
}

impl Expirer {
    pub fn new(storage: Arc<dyn KeyValueStorage>, storage_key: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            expirations: PersistentMap::new(storage, storage_key),
            events,
            initialized: AtomicBool::new(false),
        }
    }

    /// Restore persisted entries. A second init over live entries fails
    /// with `RestoreWillOverride`.
    pub async fn init(&self) -> Result<()> {
        self.expirations.restore().await?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExpirerEvent> {
        self.events.subscribe()
    }

    pub fn has(&self, target: impl Into<ExpirerTarget>) -> bool {
        self.expirations.contains(&target.into().to_string())
    }

    pub async fn set(&self, target: impl Into<ExpirerTarget>, expiry: i64) -> Result<()> {
        self.check_initialized()?;
        let target = target.into();
        let expiration = Expiration {
            target: target.to_string(),
            expiry,
        };
        self.expirations.insert(expiration.clone()).await?;
        debug!(%target, expiry, "expiration set");
        let _ = self.events.send(ExpirerEvent::Created { target, expiration });
        Ok(())
    }

    pub fn get(&self, target: impl Into<ExpirerTarget>) -> Result<Expiration> {
        self.check_initialized()?;
        let target = target.into();
        self.expirations
            .get(&target.to_string())
            .ok_or_else(|| target.miss())
    }

    /// Remove an entry. Returns whether one existed.
    pub async fn delete(&self, target: impl Into<ExpirerTarget>) -> Result<bool> {
        self.check_initialized()?;
        let target = target.into();
        match self.expirations.remove(&target.to_string()).await? {
            Some(expiration) => {
                let _ = self.events.send(ExpirerEvent::Deleted { target, expiration });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn values(&self) -> Vec<Expiration> {
        self.expirations.values()
    }

    pub fn len(&self) -> usize {
        self.expirations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expirations.is_empty()
    }

    /// Heartbeat handler: fire and drop every entry with `expiry <= now`
    pub async fn check_expirations(&self) -> Result<Vec<Expiration>> {
        self.check_expirations_at(unix_now()).await
    }

    pub async fn check_expirations_at(&self, now: i64) -> Result<Vec<Expiration>> {
        self.check_initialized()?;
        let expired = self.expirations.remove_where(|e| e.expiry <= now).await?;
        for expiration in &expired {
            match expiration.target() {
                Ok(target) => {
                    debug!(%target, "expired");
                    let _ = self.events.send(ExpirerEvent::Expired {
                        target,
                        expiration: expiration.clone(),
                    });
                }
                Err(e) => debug!(target = %expiration.target, "dropping unparseable expiration: {e}"),
            }
        }
        Ok(expired)
    }

    fn check_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotInitialized("expirer"))
        }
    }
}
