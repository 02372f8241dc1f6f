//! Signed request/response envelope exchanged between neurons.

use std::borrow::Cow;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::encoding::{base64_bytes, hex_array};
use crate::peer::PublicKey;

/// Domain separation tag mixed into every signed message.
pub const PROTOCOL_TAG: &[u8] = b"neuron/rpc/v1";

pub type Digest = [u8; 32];
pub type SignatureBytes = [u8; 64];

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as u64)
        .unwrap_or_default()
}

/// BLAKE3 digest of an opaque payload.
pub fn payload_hash(payload: &[u8]) -> Digest {
    *blake3::hash(payload).as_bytes()
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("invalid request kind {0:?}: expected 1-64 characters of [a-z0-9_.-]")]
pub struct InvalidRequestKind(pub String);

/// Tag selecting the handler an inbound request is dispatched to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKind(Cow<'static, str>);

impl RequestKind {
    /// Run the optimization pipeline on a generation request.
    pub const OPTIMIZE: RequestKind = RequestKind(Cow::Borrowed("optimize"));
    /// Fetch the miner's current checkpoint submission.
    pub const SUBMISSION: RequestKind = RequestKind(Cow::Borrowed("submission"));

    pub const MAX_LEN: usize = 64;

    pub fn new<S: Into<String>>(tag: S) -> Result<Self, InvalidRequestKind> {
        let tag = tag.into();
        let valid_char =
            |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-');
        if tag.is_empty() || tag.len() > Self::MAX_LEN || !tag.chars().all(valid_char) {
            return Err(InvalidRequestKind(tag));
        }
        Ok(Self(Cow::Owned(tag)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for RequestKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RequestKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        RequestKind::new(value).map_err(serde::de::Error::custom)
    }
}

/// Sender, ordering and freshness fields common to requests and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    #[serde(with = "hex_array")]
    pub sender: PublicKey,
    /// Strictly increasing per sender.
    pub nonce: u64,
    pub timestamp_ms: u64,
}

impl MessageHeader {
    fn write_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sender);
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
    }
}

/// Inbound RPC request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRequest {
    pub header: MessageHeader,
    pub kind: RequestKind,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    #[serde(with = "hex_array")]
    pub signature: SignatureBytes,
}

impl SignedRequest {
    /// Bytes covered by the request signature.
    pub fn signing_bytes(header: &MessageHeader, kind: &RequestKind, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(PROTOCOL_TAG.len() + 128);
        out.extend_from_slice(PROTOCOL_TAG);
        out.extend_from_slice(b"/request");
        out.push(kind.as_str().len() as u8);
        out.extend_from_slice(kind.as_str().as_bytes());
        header.write_into(&mut out);
        out.extend_from_slice(&payload_hash(payload));
        out
    }

    pub fn message(&self) -> Vec<u8> {
        Self::signing_bytes(&self.header, &self.kind, &self.payload)
    }

    /// Identifier a response uses to prove which request it answers.
    pub fn digest(&self) -> Digest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.message());
        hasher.update(&self.signature);
        *hasher.finalize().as_bytes()
    }
}

/// Machine readable rejection reason carried in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Authentication,
    Replay,
    RateLimited,
    UnknownKind,
    Timeout,
    HandlerFailed,
    Malformed,
    Unavailable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Authentication => "authentication",
            ErrorCode::Replay => "replay",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::UnknownKind => "unknown_kind",
            ErrorCode::Timeout => "timeout",
            ErrorCode::HandlerFailed => "handler_failed",
            ErrorCode::Malformed => "malformed",
            ErrorCode::Unavailable => "unavailable",
        }
    }

    /// Whether a caller may usefully try the same call again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited | ErrorCode::Timeout | ErrorCode::Unavailable
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    /// Backoff hint for rate limited callers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorBody {
    pub fn new<S: Into<String>>(code: ErrorCode, message: S) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResponseOutcome {
    Ok {
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },
    Error(ErrorBody),
}

impl ResponseOutcome {
    fn write_into(&self, out: &mut Vec<u8>) {
        let mut hasher = blake3::Hasher::new();
        match self {
            ResponseOutcome::Ok { payload } => {
                hasher.update(&[0]);
                hasher.update(payload);
            }
            ResponseOutcome::Error(body) => {
                hasher.update(&[1]);
                hasher.update(body.code.as_str().as_bytes());
                hasher.update(&[0]);
                hasher.update(&(body.message.len() as u32).to_be_bytes());
                hasher.update(body.message.as_bytes());
                match body.retry_after_ms {
                    Some(ms) => {
                        hasher.update(&[1]);
                        hasher.update(&ms.to_be_bytes());
                    }
                    None => {
                        hasher.update(&[0]);
                    }
                }
            }
        }
        out.extend_from_slice(hasher.finalize().as_bytes());
    }
}

/// Response to a [`SignedRequest`], signed by the responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedResponse {
    pub header: MessageHeader,
    #[serde(with = "hex_array")]
    pub in_reply_to: Digest,
    pub outcome: ResponseOutcome,
    #[serde(with = "hex_array")]
    pub signature: SignatureBytes,
}

impl SignedResponse {
    /// Bytes covered by the response signature.
    pub fn signing_bytes(
        header: &MessageHeader,
        in_reply_to: &Digest,
        outcome: &ResponseOutcome,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(PROTOCOL_TAG.len() + 128);
        out.extend_from_slice(PROTOCOL_TAG);
        out.extend_from_slice(b"/response");
        header.write_into(&mut out);
        out.extend_from_slice(in_reply_to);
        outcome.write_into(&mut out);
        out
    }

    pub fn message(&self) -> Vec<u8> {
        Self::signing_bytes(&self.header, &self.in_reply_to, &self.outcome)
    }
}
