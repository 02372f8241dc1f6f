use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::encoding::hex_array;

/// Ledger-assigned slot of a registered participant.
pub type PeerIndex = u16;

/// Raw ed25519 public key identifying a participant.
pub type PublicKey = [u8; 32];

/// Shortened hex rendering of a key for log lines.
pub fn short_key(key: &PublicKey) -> String {
    hex::encode(&key[..6])
}

/// Errors raised when parsing a `host:port` endpoint string.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EndpointParseError {
    #[error("endpoint {0:?} must be in host:port form")]
    MissingPort(String),
    #[error("endpoint {0:?} has an invalid port")]
    InvalidPort(String),
    #[error("endpoint host must not be empty")]
    EmptyHost,
}

/// Network location a peer advertises for its RPC server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Base URL used by the HTTP transport.
    pub fn base_url(&self) -> String {
        if self.host.contains(':') {
            format!("http://[{}]:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (host, port) = value
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| EndpointParseError::MissingPort(value.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost);
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointParseError::InvalidPort(value.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// A registered participant as seen in a network snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub index: PeerIndex,
    #[serde(with = "hex_array")]
    pub public_key: PublicKey,
    /// `None` when the peer is registered but not serving.
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    pub stake: u64,
    pub last_seen_block: u64,
}

impl Peer {
    pub fn new(index: PeerIndex, public_key: PublicKey, stake: u64) -> Self {
        Self {
            index,
            public_key,
            endpoint: None,
            stake,
            last_seen_block: 0,
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn is_serving(&self) -> bool {
        self.endpoint.is_some()
    }
}
