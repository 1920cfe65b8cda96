//! Core wiring
//!
//! Owns one instance of each component over a shared storage backend and
//! relay connection, and starts them in dependency order.

use crate::crypto::keychain::KeyChain;
use crate::crypto::Crypto;
use crate::error::Result;
use crate::expirer::Expirer;
use crate::handler::TypedMessageHandler;
use crate::heartbeat::{HeartBeat, HeartBeatEvent, DEFAULT_HEARTBEAT_INTERVAL};
use crate::pairing::Pairing;
use crate::relayer::connection::RelayConnection;
use crate::relayer::{Relayer, RelayerOptions, DEFAULT_RELAY_PROTOCOL, DEFAULT_RELAY_URL};
use crate::storage::{storage_key, KeyValueStorage};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct CoreOptions {
    pub project_id: Option<String>,
    pub relay_url: String,
    pub relay_protocol: String,
    pub user_agent: Option<String>,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    /// Answer requests for unregistered methods with an error instead of
    /// dropping them
    pub reject_unknown_methods: bool,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            project_id: None,
            relay_url: DEFAULT_RELAY_URL.to_string(),
            relay_protocol: DEFAULT_RELAY_PROTOCOL.to_string(),
            user_agent: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            request_timeout: Duration::from_secs(10),
            reject_unknown_methods: false,
        }
    }
}

pub struct Core {
    crypto: Arc<Crypto>,
    expirer: Arc<Expirer>,
    relayer: Arc<Relayer>,
    handler: Arc<TypedMessageHandler>,
    pairing: Arc<Pairing>,
    heartbeat: HeartBeat,
    storage: Arc<dyn KeyValueStorage>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Core {
    pub fn new(
        options: CoreOptions,
        storage: Arc<dyn KeyValueStorage>,
        connection: Arc<dyn RelayConnection>,
    ) -> Arc<Self> {
        let keychain = Arc::new(KeyChain::new(storage.clone(), storage_key("keychain")));
        let crypto = Arc::new(Crypto::new(keychain));
        let expirer = Arc::new(Expirer::new(storage.clone(), storage_key("expirer")));

        let mut relayer_options = RelayerOptions {
            relay_url: options.relay_url,
            project_id: options.project_id,
            protocol: options.relay_protocol,
            request_timeout: options.request_timeout,
            ..RelayerOptions::default()
        };
        if let Some(user_agent) = options.user_agent {
            relayer_options.user_agent = user_agent;
        }
        let relayer = Arc::new(Relayer::new(
            relayer_options,
            crypto.clone(),
            storage.clone(),
            connection,
        ));
        let handler = Arc::new(TypedMessageHandler::new(
            crypto.clone(),
            relayer.clone(),
            expirer.clone(),
            storage.clone(),
            options.reject_unknown_methods,
        ));
        let pairing = Arc::new(Pairing::new(
            crypto.clone(),
            relayer.clone(),
            expirer.clone(),
            handler.clone(),
            storage.clone(),
        ));

        Arc::new(Self {
            crypto,
            expirer,
            relayer,
            handler,
            pairing,
            heartbeat: HeartBeat::new(options.heartbeat_interval),
            storage,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Restore all persisted state, install handlers and connect
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.storage.init().await?;
        self.crypto.init().await?;
        self.expirer.init().await?;
        self.relayer.init().await?;

        let mut tasks = vec![self.handler.start()];
        tasks.push(self.pairing.init().await?);
        tasks.push(self.heartbeat.start());
        tasks.push(self.spawn_expiration_checks());
        self.tasks.lock().extend(tasks);

        self.relayer.start().await?;
        info!(client_id = %self.crypto.client_id()?, "core started");
        Ok(())
    }

    /// Stop background tasks and close the connection. Persisted state is
    /// left for the next start.
    pub async fn stop(&self) -> Result<()> {
        self.heartbeat.stop();
        self.handler.stop();
        self.relayer.stop();
        self.relayer.transport_close().await?;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!("core stopped");
        Ok(())
    }

    pub fn crypto(&self) -> &Arc<Crypto> {
        &self.crypto
    }

    pub fn expirer(&self) -> &Arc<Expirer> {
        &self.expirer
    }

    pub fn relayer(&self) -> &Arc<Relayer> {
        &self.relayer
    }

    pub fn handler(&self) -> &Arc<TypedMessageHandler> {
        &self.handler
    }

    pub fn pairing(&self) -> &Arc<Pairing> {
        &self.pairing
    }

    pub fn heartbeat(&self) -> &HeartBeat {
        &self.heartbeat
    }

    pub fn storage(&self) -> &Arc<dyn KeyValueStorage> {
        &self.storage
    }

    fn spawn_expiration_checks(&self) -> JoinHandle<()> {
        let mut pulses = self.heartbeat.subscribe();
        let expirer = self.expirer.clone();
        tokio::spawn(async move {
            loop {
                match pulses.recv().await {
                    Ok(HeartBeatEvent::Pulse) => {
                        if let Err(e) = expirer.check_expirations().await {
                            warn!("expiration check failed: {e}");
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
