//! Pairing URI codec
//!
//! `wc:<topic>@<version>?symKey=<hex>&relay-protocol=<name>[&relay-data=..]
//! [&expiryTimestamp=..][&methods=..]`. Parameters are always written in
//! that order, so parsing and re-formatting a URI yields the same string.

use crate::error::{Error, Result};
use crate::relayer::RelayProtocolOptions;
use std::fmt;
use std::str::FromStr;
use url::form_urlencoded;

pub const URI_PROTOCOL: &str = "wc";
pub const URI_VERSION: u32 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingUri {
    pub protocol: String,
    pub topic: String,
    pub version: u32,
    pub sym_key: String,
    pub relay: RelayProtocolOptions,
    pub expiry_timestamp: Option<i64>,
    pub methods: Option<Vec<String>>,
}

impl PairingUri {
    pub fn new(topic: impl Into<String>, sym_key: impl Into<String>, relay: RelayProtocolOptions) -> Self {
        Self {
            protocol: URI_PROTOCOL.to_string(),
            topic: topic.into(),
            version: URI_VERSION,
            sym_key: sym_key.into(),
            relay,
            expiry_timestamp: None,
            methods: None,
        }
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let (protocol, rest) = uri
            .split_once(':')
            .ok_or_else(|| Error::InvalidUri(format!("missing protocol in {uri}")))?;
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
        let (topic, version) = path
            .split_once('@')
            .ok_or_else(|| Error::InvalidUri("missing version".into()))?;
        if protocol.is_empty() || topic.is_empty() {
            return Err(Error::InvalidUri("empty protocol or topic".into()));
        }
        let version = version
            .parse()
            .map_err(|_| Error::InvalidUri(format!("invalid version {version}")))?;

        let mut sym_key = None;
        let mut relay_protocol = None;
        let mut relay_data = None;
        let mut expiry_timestamp = None;
        let mut methods = None;
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "symKey" => sym_key = Some(value.into_owned()),
                "relay-protocol" => relay_protocol = Some(value.into_owned()),
                "relay-data" => relay_data = Some(value.into_owned()),
                "expiryTimestamp" => {
                    expiry_timestamp = Some(
                        value
                            .parse()
                            .map_err(|_| Error::InvalidUri(format!("invalid expiryTimestamp {value}")))?,
                    )
                }
                "methods" => methods = Some(parse_methods(&value)?),
                _ => {}
            }
        }

        Ok(Self {
            protocol: protocol.to_string(),
            topic: topic.to_string(),
            version,
            sym_key: sym_key.ok_or_else(|| Error::InvalidUri("missing symKey".into()))?,
            relay: RelayProtocolOptions {
                protocol: relay_protocol.ok_or_else(|| Error::InvalidUri("missing relay-protocol".into()))?,
                data: relay_data,
            },
            expiry_timestamp,
            methods,
        })
    }
}

/// Comma separated method names. An empty value is an empty list; an empty
/// name inside a list is rejected.
fn parse_methods(value: &str) -> Result<Vec<String>> {
    if value.is_empty() {
        return Ok(Vec::new());
    }
    value
        .split(',')
        .map(|method| match method {
            "" => Err(Error::InvalidUri(format!("empty method name in methods={value}"))),
            method => Ok(method.to_string()),
        })
        .collect()
}

impl FromStr for PairingUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PairingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("symKey", &self.sym_key);
        query.append_pair("relay-protocol", &self.relay.protocol);
        if let Some(data) = &self.relay.data {
            query.append_pair("relay-data", data);
        }
        if let Some(expiry) = self.expiry_timestamp {
            query.append_pair("expiryTimestamp", &expiry.to_string());
        }
        if let Some(methods) = &self.methods {
            query.append_pair("methods", &methods.join(","));
        }
        write!(f, "{}:{}@{}?{}", self.protocol, self.topic, self.version, query.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_uri_round_trips() {
        let uri = "wc:abc123@2?symKey=deadbeef&relay-protocol=irn";
        let parsed = PairingUri::parse(uri).unwrap();
        assert_eq!(parsed.topic, "abc123");
        assert_eq!(parsed.version, 2);
        assert_eq!(parsed.sym_key, "deadbeef");
        assert_eq!(parsed.relay, RelayProtocolOptions::default());
        assert_eq!(parsed.to_string(), uri);
    }

    #[test]
    fn test_full_uri_round_trips() {
        let uri = "wc:7f6e@2?symKey=587d&relay-protocol=irn&relay-data=a%2Bb&expiryTimestamp=1705000000&methods=wc_sessionPropose%2Cwc_authRequest";
        let parsed: PairingUri = uri.parse().unwrap();
        assert_eq!(parsed.relay.data.as_deref(), Some("a+b"));
        assert_eq!(parsed.expiry_timestamp, Some(1705000000));
        assert_eq!(
            parsed.methods,
            Some(vec!["wc_sessionPropose".to_string(), "wc_authRequest".to_string()])
        );
        assert_eq!(parsed.to_string(), uri);
        assert_eq!(PairingUri::parse(&parsed.to_string()).unwrap(), parsed);
    }

    #[test]
    fn test_invalid_uris() {
        for uri in [
            "abc123@2?symKey=aa&relay-protocol=irn",
            "wc:abc123?symKey=aa&relay-protocol=irn",
            "wc:abc123@x?symKey=aa&relay-protocol=irn",
            "wc:abc123@2?relay-protocol=irn",
            "wc:abc123@2?symKey=aa",
            "wc:@2?symKey=aa&relay-protocol=irn",
            "wc:abc123@2?symKey=aa&relay-protocol=irn&methods=a%2C%2Cb",
            "wc:abc123@2?symKey=aa&relay-protocol=irn&methods=a%2C",
        ] {
            assert!(matches!(PairingUri::parse(uri), Err(Error::InvalidUri(_))), "{uri}");
        }
    }

    #[test]
    fn test_empty_methods_round_trip() {
        let uri = "wc:abc123@2?symKey=aa&relay-protocol=irn&methods=";
        let parsed = PairingUri::parse(uri).unwrap();
        assert_eq!(parsed.methods, Some(Vec::new()));
        assert_eq!(parsed.to_string(), uri);
    }
}
