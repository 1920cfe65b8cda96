//! Configuration for wcd

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use wc_core::relayer::DEFAULT_RELAY_URL;
use wc_core::CoreOptions;

/// wcd - WalletConnect v2 pairing daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "wcd")]
#[command(about = "WalletConnect v2 pairing daemon")]
pub struct Config {
    /// Project id sent to the relay
    #[arg(long, env = "WC_PROJECT_ID")]
    pub project_id: Option<String>,

    /// Relay websocket url
    #[arg(long, env = "WC_RELAY_URL", default_value = DEFAULT_RELAY_URL)]
    pub relay_url: String,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/wcd")]
    pub data_dir: PathBuf,

    /// Expiry check interval in seconds
    #[arg(long, default_value = "5")]
    pub heartbeat_secs: u64,

    /// Relay request timeout in seconds
    #[arg(long, default_value = "10")]
    pub request_timeout_secs: u64,

    /// Reply to requests for unregistered methods with an error
    #[arg(long)]
    pub reject_unknown_methods: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create a pairing, print its URI and wait for the peer
    Create {
        /// Methods advertised in the URI (comma-separated)
        #[arg(long, value_delimiter = ',')]
        methods: Vec<String>,

        /// How long to wait for the peer before exiting
        #[arg(long, default_value = "300")]
        wait_secs: u64,
    },
    /// Pair with a peer from its wc: URI
    Pair {
        uri: String,

        /// Mark the pairing active right away
        #[arg(long)]
        activate: bool,
    },
    /// Ping the peer of a pairing
    Ping { topic: String },
    /// Tell the peer and delete a pairing
    Disconnect { topic: String },
    /// Print stored pairings
    List,
    /// Stay connected and log pairing events until interrupted
    Run,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.relay_url.starts_with("ws://") || self.relay_url.starts_with("wss://")) {
            anyhow::bail!("Relay url must be a ws:// or wss:// url");
        }
        if self.project_id.as_deref().is_some_and(str::is_empty) {
            anyhow::bail!("Project id cannot be empty");
        }
        if self.heartbeat_secs == 0 {
            anyhow::bail!("Heartbeat interval must be at least one second");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("Request timeout must be at least one second");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Log format must be json or pretty");
        }
        Ok(())
    }

    pub fn core_options(&self) -> CoreOptions {
        CoreOptions {
            project_id: self.project_id.clone(),
            relay_url: self.relay_url.clone(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            reject_unknown_methods: self.reject_unknown_methods,
            user_agent: Some(format!("wc-2/rust-wcd-{}", env!("CARGO_PKG_VERSION"))),
            ..CoreOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("wcd").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults_validate() {
        let config = parse(&["list"]);
        assert_eq!(config.command, Command::List);
        config.validate().unwrap();
        assert_eq!(config.core_options().heartbeat_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(parse(&["--relay-url", "https://relay.example", "list"]).validate().is_err());
        assert!(parse(&["--heartbeat-secs", "0", "list"]).validate().is_err());
        assert!(parse(&["--log-format", "xml", "list"]).validate().is_err());
        assert!(parse(&["--project-id", "", "list"]).validate().is_err());
    }

    #[test]
    fn test_create_methods_split() {
        let config = parse(&["create", "--methods", "wc_sessionPropose,wc_authRequest"]);
        match config.command {
            Command::Create { methods, wait_secs } => {
                assert_eq!(methods, vec!["wc_sessionPropose", "wc_authRequest"]);
                assert_eq!(wait_secs, 300);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
