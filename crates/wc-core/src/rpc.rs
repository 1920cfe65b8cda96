//! JSON-RPC 2.0 payloads and per-method publish metadata

use crate::time::{unix_now_millis, ONE_DAY, THIRTY_SECONDS};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};

pub const JSONRPC_VERSION: &str = "2.0";

static LAST_PAYLOAD_ID: AtomicI64 = AtomicI64::new(0);

/// Process-wide unique, strictly increasing payload id.
///
/// Ids look like `unix_millis * 1000 + random(0..1000)`, bumped past the
/// last issued id when two calls land in the same millisecond.
pub fn payload_id() -> i64 {
    let candidate = unix_now_millis() * 1000 + rand::thread_rng().gen_range(0..1000);
    let mut last = LAST_PAYLOAD_ID.load(Ordering::Relaxed);
    loop {
        let next = candidate.max(last + 1);
        match LAST_PAYLOAD_ID.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest<T> {
    pub id: i64,
    pub jsonrpc: String,
    pub method: String,
    pub params: T,
}

impl<T> JsonRpcRequest<T> {
    pub fn new(method: impl Into<String>, params: T) -> Self {
        Self::with_id(payload_id(), method, params)
    }

    pub fn with_id(id: i64, method: impl Into<String>, params: T) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResult<R> {
    pub id: i64,
    pub jsonrpc: String,
    pub result: R,
}

impl<R> JsonRpcResult<R> {
    pub fn new(id: i64, result: R) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            result,
        }
    }
}

/// Error object carried by a JSON-RPC error response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl ErrorData {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn user_disconnected() -> Self {
        Self::new(6000, "User disconnected.")
    }

    pub fn method_unsupported(method: &str) -> Self {
        Self::new(10001, format!("Unsupported wc_ method. {method}"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(-32603, message)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub id: i64,
    pub jsonrpc: String,
    pub error: ErrorData,
}

impl JsonRpcError {
    pub fn new(id: i64, error: ErrorData) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            error,
        }
    }
}

/// A response to a request: either a result or an error
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcResponse<R> {
    Error(JsonRpcError),
    Result(JsonRpcResult<R>),
}

impl<R> JsonRpcResponse<R> {
    pub fn id(&self) -> i64 {
        match self {
            JsonRpcResponse::Error(e) => e.id,
            JsonRpcResponse::Result(r) => r.id,
        }
    }

    pub fn into_result(self) -> Result<R, ErrorData> {
        match self {
            JsonRpcResponse::Result(r) => Ok(r.result),
            JsonRpcResponse::Error(e) => Err(e.error),
        }
    }
}

impl JsonRpcResponse<Value> {
    /// Re-type a response whose result is still raw JSON
    pub fn typed<R: DeserializeOwned>(self) -> serde_json::Result<JsonRpcResponse<R>> {
        Ok(match self {
            JsonRpcResponse::Error(e) => JsonRpcResponse::Error(e),
            JsonRpcResponse::Result(r) => JsonRpcResponse::Result(JsonRpcResult {
                id: r.id,
                jsonrpc: r.jsonrpc,
                result: serde_json::from_value(r.result)?,
            }),
        })
    }
}

/// Any inbound JSON-RPC payload, decoded once into its variant
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcPayload {
    Request(JsonRpcRequest<Value>),
    Error(JsonRpcError),
    Result(JsonRpcResult<Value>),
}

impl JsonRpcPayload {
    pub fn id(&self) -> i64 {
        match self {
            JsonRpcPayload::Request(r) => r.id,
            JsonRpcPayload::Error(e) => e.id,
            JsonRpcPayload::Result(r) => r.id,
        }
    }

    /// Split into request or response
    pub fn into_message(self) -> InboundMessage {
        match self {
            JsonRpcPayload::Request(r) => InboundMessage::Request(r),
            JsonRpcPayload::Error(e) => InboundMessage::Response(JsonRpcResponse::Error(e)),
            JsonRpcPayload::Result(r) => InboundMessage::Response(JsonRpcResponse::Result(r)),
        }
    }
}

/// Inbound payload classified for dispatch
#[derive(Clone, Debug, PartialEq)]
pub enum InboundMessage {
    Request(JsonRpcRequest<Value>),
    Response(JsonRpcResponse<Value>),
}

/// TTL, tag and prompt flag attached to one direction of a method
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishPolicy {
    pub ttl: u64,
    pub tag: u32,
    pub prompt: bool,
}

/// Static publish metadata for a request/response pair
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RpcMethodMetadata {
    pub method: &'static str,
    pub request: PublishPolicy,
    pub response: PublishPolicy,
}

/// Metadata used when replying to a method nobody registered
pub const UNREGISTERED_METHOD: RpcMethodMetadata = RpcMethodMetadata {
    method: "unregistered_method",
    request: PublishPolicy {
        ttl: ONE_DAY,
        tag: 0,
        prompt: false,
    },
    response: PublishPolicy {
        ttl: ONE_DAY,
        tag: 0,
        prompt: false,
    },
};

/// A typed request, bound at compile time to its response type and
/// publish metadata.
pub trait RpcMethod: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    type Response: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    const METADATA: RpcMethodMetadata;

    fn method() -> &'static str {
        Self::METADATA.method
    }
}

/// `wc_pairingPing`: liveness check on a pairing topic
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingPing {}

impl RpcMethod for PairingPing {
    type Response = bool;

    const METADATA: RpcMethodMetadata = RpcMethodMetadata {
        method: "wc_pairingPing",
        request: PublishPolicy {
            ttl: THIRTY_SECONDS,
            tag: 1002,
            prompt: false,
        },
        response: PublishPolicy {
            ttl: THIRTY_SECONDS,
            tag: 1003,
            prompt: false,
        },
    };
}

/// `wc_pairingDelete`: the peer is tearing the pairing down
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingDelete {
    pub code: i64,
    pub message: String,
}

impl Default for PairingDelete {
    fn default() -> Self {
        let reason = ErrorData::user_disconnected();
        Self {
            code: reason.code,
            message: reason.message,
        }
    }
}

impl RpcMethod for PairingDelete {
    type Response = bool;

    const METADATA: RpcMethodMetadata = RpcMethodMetadata {
        method: "wc_pairingDelete",
        request: PublishPolicy {
            ttl: ONE_DAY,
            tag: 1000,
            prompt: false,
        },
        response: PublishPolicy {
            ttl: ONE_DAY,
            tag: 1001,
            prompt: false,
        },
    };
}
