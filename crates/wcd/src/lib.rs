//! wcd - WalletConnect v2 pairing daemon
//!
//! - [`config`]: command line and environment configuration
//! - [`storage`]: sled-backed key-value storage for the core
//! - [`daemon`]: runs one command against a started core

pub mod config;
pub mod daemon;
pub mod storage;

pub use config::{Command, Config};
pub use daemon::Daemon;
pub use storage::SledStorage;
