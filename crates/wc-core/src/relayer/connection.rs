//! Duplex JSON-RPC connection to the relay server
//!
//! The relayer only sees this interface; the websocket lives in its own
//! crate and tests run against the in-process loopback.

use crate::rpc::{ErrorData, JsonRpcError, JsonRpcRequest, JsonRpcResult};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connection is not open")]
    NotOpen,

    #[error("send failed: {0}")]
    Send(String),

    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Events pushed by an open connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Open,
    /// One inbound JSON text frame
    Payload(String),
    Close { reason: String },
    Error(String),
}

pub type ConnectionEvents = mpsc::UnboundedSender<ConnectionEvent>;

#[async_trait]
pub trait RelayConnection: Send + Sync {
    /// Connect to `url`. Inbound frames and lifecycle changes are pushed to
    /// `events` until the connection closes.
    async fn open(&self, url: &str, events: ConnectionEvents) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    /// Send one JSON text frame
    async fn send(&self, payload: String) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}

impl dyn RelayConnection {
    pub async fn send_request<T: Serialize + Sync>(
        &self,
        request: &JsonRpcRequest<T>,
    ) -> Result<(), TransportError> {
        self.send(serde_json::to_string(request)?).await
    }

    pub async fn send_result<R: Serialize + Sync>(&self, id: i64, result: R) -> Result<(), TransportError> {
        self.send(serde_json::to_string(&JsonRpcResult::new(id, result))?)
            .await
    }

    pub async fn send_error(&self, id: i64, error: ErrorData) -> Result<(), TransportError> {
        self.send(serde_json::to_string(&JsonRpcError::new(id, error))?)
            .await
    }
}
