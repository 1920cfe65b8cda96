//! WalletConnect v2 Core
//!
//! Client-side protocol engine shared by sign and auth clients:
//!
//! - [`crypto`]: keychain, X25519 key agreement and sealed envelopes
//! - [`relayer`]: relay connection, publish, subscribe and message dedupe
//! - [`expirer`]: per-topic and per-request expiries
//! - [`history`]: JSON-RPC request/response records
//! - [`handler`]: typed request/response dispatch over encrypted topics
//! - [`pairing`]: pairing URIs and the pairing lifecycle
//! - [`core`]: wiring of all of the above

pub mod core;
pub mod crypto;
pub mod error;
pub mod expirer;
pub mod handler;
pub mod heartbeat;
pub mod history;
pub mod pairing;
pub mod relayer;
pub mod rpc;
pub mod storage;
pub mod time;

pub use crate::core::{Core, CoreOptions};
pub use crypto::Crypto;
pub use error::{Error, Result};
pub use expirer::{Expirer, ExpirerEvent, ExpirerTarget};
pub use handler::{Reply, TypedMessageHandler};
pub use history::JsonRpcHistory;
pub use pairing::{Metadata, Pairing, PairingEvent, PairingStruct, PairingUri};
pub use relayer::{Relayer, RelayerEvent};
pub use storage::{KeyValueStorage, MemoryStorage};
