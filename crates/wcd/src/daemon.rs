//! Command runner: one core per invocation over sled storage and the
//! websocket relay connection

use crate::config::{Command, Config};
use crate::storage::SledStorage;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use wc_core::{Core, KeyValueStorage, PairingEvent};
use wc_transport::WsConnection;

pub struct Daemon {
    config: Config,
    core: Arc<Core>,
    storage: Arc<SledStorage>,
}

impl Daemon {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let storage = Arc::new(
            SledStorage::open(&config.data_dir)
                .with_context(|| format!("opening storage at {}", config.data_dir.display()))?,
        );
        let backend: Arc<dyn KeyValueStorage> = storage.clone();
        let core = Core::new(config.core_options(), backend, Arc::new(WsConnection::new()));
        Ok(Self {
            config,
            core,
            storage,
        })
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Start the core, run the configured command and shut down
    pub async fn run(&self) -> anyhow::Result<()> {
        self.core.start().await.context("starting core")?;
        let result = self.execute(self.config.command.clone()).await;

        if let Err(e) = self.core.stop().await {
            warn!("shutdown error: {e}");
        }
        self.storage.flush().context("flushing storage")?;
        result
    }

    async fn execute(&self, command: Command) -> anyhow::Result<()> {
        let pairing = self.core.pairing();
        match command {
            Command::Create { methods, wait_secs } => {
                let methods = (!methods.is_empty()).then_some(methods);
                let mut events = pairing.subscribe();
                let created = pairing.create(methods).await?;
                println!("{}", created.uri);
                info!(topic = %created.topic, "waiting for peer");

                let wait = tokio::time::timeout(Duration::from_secs(wait_secs), async {
                    loop {
                        match events.recv().await {
                            Ok(PairingEvent::Ping { topic, .. }) if topic == created.topic => return true,
                            Ok(PairingEvent::Expired { topic } | PairingEvent::Deleted { topic, .. })
                                if topic == created.topic =>
                            {
                                return false
                            }
                            Ok(_) | Err(RecvError::Lagged(_)) => continue,
                            Err(RecvError::Closed) => return false,
                        }
                    }
                });
                tokio::select! {
                    outcome = wait => match outcome {
                        Ok(true) => {
                            pairing.activate(&created.topic).await?;
                            info!(topic = %created.topic, "peer connected");
                        }
                        Ok(false) => warn!(topic = %created.topic, "pairing ended before the peer pinged"),
                        Err(_) => warn!(topic = %created.topic, "no peer within {wait_secs}s"),
                    },
                    _ = tokio::signal::ctrl_c() => info!("interrupted"),
                }
            }
            Command::Pair { uri, activate } => {
                let paired = pairing.pair(&uri, activate).await?;
                println!("{}", serde_json::to_string_pretty(&paired)?);
            }
            Command::Ping { topic } => {
                pairing.ping(&topic).await?;
                println!("pong");
            }
            Command::Disconnect { topic } => {
                pairing.disconnect(&topic).await?;
                info!(%topic, "pairing deleted");
            }
            Command::List => {
                let pairings = pairing.get_pairings()?;
                println!("{}", serde_json::to_string_pretty(&pairings)?);
            }
            Command::Run => {
                let mut events = pairing.subscribe();
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Ok(event) => info!(?event, "pairing event"),
                            Err(RecvError::Lagged(missed)) => warn!(missed, "missed pairing events"),
                            Err(RecvError::Closed) => break,
                        },
                        _ = tokio::signal::ctrl_c() => {
                            info!("Received shutdown signal");
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
