//! Websocket connection to a WalletConnect relay
//!
//! One background task owns the socket. It forwards outbound frames,
//! pushes inbound text frames to the relayer and pings the server so a
//! dead connection is noticed without waiting on TCP.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, trace, warn};
use wc_core::relayer::connection::{ConnectionEvent, ConnectionEvents, RelayConnection, TransportError};

/// Interval between liveness pings
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

pub struct WsConnection {
    /// Feeds the socket task; closed once that task ends
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    ping_interval: Duration,
}

impl WsConnection {
    pub fn new() -> Self {
        Self::with_ping_interval(PING_INTERVAL)
    }

    pub fn with_ping_interval(ping_interval: Duration) -> Self {
        Self {
            outbound: Mutex::new(None),
            ping_interval,
        }
    }
}

impl Default for WsConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayConnection for WsConnection {
    async fn open(&self, url: &str, events: ConnectionEvents) -> Result<(), TransportError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        info!("websocket connection established");

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        // replacing the sender ends the previous socket task
        *self.outbound.lock() = Some(tx);
        let _ = events.send(ConnectionEvent::Open);

        let ping_period = self.ping_interval;
        tokio::spawn(async move {
            let (mut write, mut read) = stream.split();
            let mut ping = interval(ping_period);
            ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ping.tick().await;
            let mut awaiting_pong = false;

            let reason = 'conn: loop {
                tokio::select! {
                    outbound = rx.recv() => match outbound {
                        Some(message) => {
                            if let Err(e) = write.send(message).await {
                                let _ = events.send(ConnectionEvent::Error(e.to_string()));
                                break 'conn format!("send failed: {e}");
                            }
                        }
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            break 'conn "closed by client".to_string();
                        }
                    },
                    inbound = read.next() => match inbound {
                        Some(Ok(Message::Text(text))) => {
                            let _ = events.send(ConnectionEvent::Payload(text.as_str().to_string()));
                        }
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => {
                                let _ = events.send(ConnectionEvent::Payload(text));
                            }
                            Err(e) => debug!("dropping non utf-8 frame: {e}"),
                        },
                        Some(Ok(Message::Pong(_))) => {
                            trace!("pong from relay");
                            awaiting_pong = false;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break 'conn frame
                                .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                                .unwrap_or_else(|| "closed by relay".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = events.send(ConnectionEvent::Error(e.to_string()));
                            break 'conn e.to_string();
                        }
                        None => break 'conn "stream ended".to_string(),
                    },
                    _ = ping.tick() => {
                        if awaiting_pong {
                            warn!(timeout = ?ping_period, "no pong from relay");
                            break 'conn "pong timeout".to_string();
                        }
                        if let Err(e) = write.send(Message::Ping(Default::default())).await {
                            break 'conn format!("ping failed: {e}");
                        }
                        awaiting_pong = true;
                    }
                }
            };

            debug!(%reason, "websocket closed");
            let _ = events.send(ConnectionEvent::Close { reason });
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.outbound.lock().take();
        Ok(())
    }

    async fn send(&self, payload: String) -> Result<(), TransportError> {
        let sender = self.outbound.lock().clone().ok_or(TransportError::NotOpen)?;
        sender
            .send(Message::Text(payload.into()))
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.outbound
            .lock()
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }
}
