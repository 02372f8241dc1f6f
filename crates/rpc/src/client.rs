use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use metrics::counter;
use neuron_crypto::{verify_signature, KeyError, Keystore};
use neuron_types::{
    short_key, unix_millis, ErrorBody, ErrorCode, MessageHeader, Peer, PeerIndex, RequestKind,
    ResponseOutcome, SignedRequest, SignedResponse,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::nonce::NonceSource;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-attempt timeout when the caller does not pass one
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Largest response body read before the exchange is abandoned
    pub max_response_bytes: usize,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            connect_timeout_ms: 3_000,
            max_response_bytes: 4 * 1024 * 1024, // 4MB
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request timed out")]
    Timeout,

    #[error("response failed authentication: {0}")]
    Authentication(String),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("peer rejected request: {0}")]
    Remote(ErrorBody),

    #[error("peer {0} advertises no endpoint")]
    NoEndpoint(PeerIndex),

    #[error("cannot sign request: {0}")]
    Signing(#[from] KeyError),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ClientError {
    /// Only transient transport faults and remote rate limiting are retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Timeout | ClientError::PeerUnreachable(_) => true,
            ClientError::Remote(body) => body.code == ErrorCode::RateLimited,
            _ => false,
        }
    }

    fn retry_hint(&self) -> Option<Duration> {
        match self {
            ClientError::Remote(body) => body.retry_after_ms.map(Duration::from_millis),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ClientError::Timeout => "timeout",
            ClientError::Authentication(_) => "authentication",
            ClientError::PeerUnreachable(_) => "unreachable",
            ClientError::Remote(body) => body.code.as_str(),
            ClientError::NoEndpoint(_) => "no_endpoint",
            ClientError::Signing(_) => "signing",
            ClientError::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// Outbound side of the transport.
///
/// Cheap to clone; clones share the HTTP connection pool and nonce counter.
#[derive(Clone)]
pub struct TransportClient {
    http: reqwest::Client,
    keystore: Arc<Keystore>,
    nonces: Arc<NonceSource>,
    config: ClientConfig,
}

impl TransportClient {
    pub fn new(keystore: Arc<Keystore>, config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|err| ClientError::PeerUnreachable(err.to_string()))?;
        Ok(Self {
            http,
            keystore,
            nonces: Arc::new(NonceSource::new()),
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send `payload` to `peer`, retrying per the configured policy. The
    /// timeout bounds each attempt.
    pub async fn call(
        &self,
        peer: &Peer,
        kind: &RequestKind,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, ClientError> {
        let policy = &self.config.retry;
        let attempts = policy.attempts();
        let mut attempt = 1;
        loop {
            let result = self.call_once(peer, kind, payload, timeout).await;
            let outcome = match &result {
                Ok(_) => "ok",
                Err(err) => err.label(),
            };
            counter!("neuron_rpc_client_calls_total", "kind" => kind.to_string(), "outcome" => outcome)
                .increment(1);

            match result {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let delay = policy.backoff(attempt, err.retry_hint());
                    debug!(
                        peer = peer.index,
                        kind = %kind,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying peer call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if attempt > 1 {
                        warn!(peer = peer.index, kind = %kind, attempts = attempt, error = %err, "peer call failed");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// One signed round trip without retries. Every attempt carries a fresh
    /// nonce.
    pub async fn call_once(
        &self,
        peer: &Peer,
        kind: &RequestKind,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, ClientError> {
        let endpoint = peer
            .endpoint
            .as_ref()
            .ok_or(ClientError::NoEndpoint(peer.index))?;
        let request = self.sign_request(kind, payload)?;
        let url = format!("{}/rpc", endpoint.base_url());

        let response = tokio::time::timeout(timeout, self.exchange(&url, &request))
            .await
            .map_err(|_| ClientError::Timeout)??;
        verify_response(peer, &request, response)
    }

    /// Call every peer concurrently; results keep the input order.
    pub async fn call_many(
        &self,
        peers: &[Peer],
        kind: &RequestKind,
        payload: &[u8],
        timeout: Duration,
    ) -> Vec<(PeerIndex, Result<Vec<u8>, ClientError>)> {
        let calls = peers.iter().map(|peer| async move {
            (peer.index, self.call(peer, kind, payload, timeout).await)
        });
        join_all(calls).await
    }

    fn sign_request(&self, kind: &RequestKind, payload: &[u8]) -> Result<SignedRequest, ClientError> {
        let signer = self.keystore.signer()?;
        let header = MessageHeader {
            sender: signer.public_key(),
            nonce: self.nonces.next(),
            timestamp_ms: unix_millis(),
        };
        let signature = signer.sign(&SignedRequest::signing_bytes(&header, kind, payload))?;
        Ok(SignedRequest {
            header,
            kind: kind.clone(),
            payload: payload.to_vec(),
            signature,
        })
    }

    async fn exchange(&self, url: &str, request: &SignedRequest) -> Result<SignedResponse, ClientError> {
        let response = self
            .http
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(classify)?;
        let status = response.status();
        let body = read_capped(response, self.config.max_response_bytes).await?;

        match serde_json::from_slice::<SignedResponse>(&body) {
            Ok(signed) => Ok(signed),
            // unsigned failures: the peer could not produce an envelope at all
            Err(_) if status.is_server_error() => Err(ClientError::PeerUnreachable(format!(
                "HTTP {status}: {}",
                String::from_utf8_lossy(&body)
            ))),
            Err(err) => Err(ClientError::InvalidResponse(format!("HTTP {status}: {err}"))),
        }
    }
}

async fn read_capped(mut response: reqwest::Response, limit: usize) -> Result<Vec<u8>, ClientError> {
    let too_large = || ClientError::InvalidResponse(format!("response body exceeds {limit} bytes"));
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Err(too_large());
    }
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(classify)? {
        if body.len() + chunk.len() > limit {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn classify(err: reqwest::Error) -> ClientError {
    if err.is_timeout() {
        ClientError::Timeout
    } else {
        ClientError::PeerUnreachable(err.to_string())
    }
}

fn verify_response(
    peer: &Peer,
    request: &SignedRequest,
    response: SignedResponse,
) -> Result<Vec<u8>, ClientError> {
    if response.header.sender != peer.public_key {
        return Err(ClientError::Authentication(format!(
            "response signed by {} instead of {}",
            short_key(&response.header.sender),
            short_key(&peer.public_key)
        )));
    }
    verify_signature(&peer.public_key, &response.message(), &response.signature)
        .map_err(|err| ClientError::Authentication(err.to_string()))?;
    if response.in_reply_to != request.digest() {
        return Err(ClientError::InvalidResponse(
            "response addressed to a different request".into(),
        ));
    }

    match response.outcome {
        ResponseOutcome::Ok { payload } => Ok(payload),
        ResponseOutcome::Error(body) => Err(ClientError::Remote(body)),
    }
}
