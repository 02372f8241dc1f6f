//! Ledger collaborators.
//!
//! The ledger itself is external. Neurons only read the registered peer set
//! from it and hand signed weight submissions to it.

use std::time::Duration;

use async_trait::async_trait;
use neuron_types::{Endpoint, Peer, PeerIndex, PublicKey, WeightSubmission};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Raw registry contents at a given block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerView {
    pub block: u64,
    pub peers: Vec<Peer>,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger unreachable: {0}")]
    Transport(String),

    #[error("ledger returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode ledger response: {0}")]
    Decode(String),

    #[error("ledger rejected submission: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait LedgerReader: Send + Sync {
    async fn fetch_view(&self) -> Result<LedgerView, LedgerError>;
}

#[async_trait]
pub trait LedgerWriter: Send + Sync {
    async fn submit_weights(&self, submission: &WeightSubmission) -> Result<(), LedgerError>;
}

/// JSON-over-HTTP ledger gateway.
///
/// `GET {base}/peers` returns a [`LedgerView`]; `POST {base}/weights` accepts
/// a [`WeightSubmission`].
#[derive(Debug, Clone)]
pub struct HttpLedger {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLedger {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| LedgerError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, LedgerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(LedgerError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl LedgerReader for HttpLedger {
    async fn fetch_view(&self) -> Result<LedgerView, LedgerError> {
        let url = format!("{}/peers", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| LedgerError::Transport(err.to_string()))?;
        let view = error_for_status(response)
            .await?
            .json::<LedgerView>()
            .await
            .map_err(|err| LedgerError::Decode(err.to_string()))?;
        debug!(block = view.block, peers = view.peers.len(), "fetched ledger view");
        Ok(view)
    }
}

#[async_trait]
impl LedgerWriter for HttpLedger {
    async fn submit_weights(&self, submission: &WeightSubmission) -> Result<(), LedgerError> {
        let url = format!("{}/weights", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(submission)
            .send()
            .await
            .map_err(|err| LedgerError::Transport(err.to_string()))?;
        match error_for_status(response).await {
            Ok(_) => Ok(()),
            Err(LedgerError::Status { status, body }) if (400..500).contains(&status) => {
                Err(LedgerError::Rejected(body))
            }
            Err(err) => Err(err),
        }
    }
}

#[derive(Default)]
struct MemoryLedgerState {
    view: LedgerView,
    submissions: Vec<WeightSubmission>,
    read_failure: Option<String>,
    write_failure: Option<String>,
}

/// In-process ledger for local development and tests.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryLedgerState>,
}

impl MemoryLedger {
    pub fn new(view: LedgerView) -> Self {
        Self {
            state: Mutex::new(MemoryLedgerState {
                view,
                ..Default::default()
            }),
        }
    }

    pub fn set_view(&self, view: LedgerView) {
        self.state.lock().view = view;
    }

    pub fn view(&self) -> LedgerView {
        self.state.lock().view.clone()
    }

    /// Register or replace the peer at `index` without advancing the block.
    pub fn register(
        &self,
        index: PeerIndex,
        public_key: PublicKey,
        stake: u64,
        endpoint: Option<Endpoint>,
    ) {
        let mut state = self.state.lock();
        let block = state.view.block;
        state.view.peers.retain(|peer| peer.index != index);
        state.view.peers.push(Peer {
            index,
            public_key,
            endpoint,
            stake,
            last_seen_block: block,
        });
    }

    pub fn advance_block(&self, blocks: u64) -> u64 {
        let mut state = self.state.lock();
        state.view.block += blocks;
        state.view.block
    }

    /// Make every read fail with `reason` until cleared with `None`.
    pub fn fail_reads(&self, reason: Option<&str>) {
        self.state.lock().read_failure = reason.map(str::to_string);
    }

    pub fn fail_writes(&self, reason: Option<&str>) {
        self.state.lock().write_failure = reason.map(str::to_string);
    }

    pub fn submissions(&self) -> Vec<WeightSubmission> {
        self.state.lock().submissions.clone()
    }
}

#[async_trait]
impl LedgerReader for MemoryLedger {
    async fn fetch_view(&self) -> Result<LedgerView, LedgerError> {
        let state = self.state.lock();
        match &state.read_failure {
            Some(reason) => Err(LedgerError::Transport(reason.clone())),
            None => Ok(state.view.clone()),
        }
    }
}

#[async_trait]
impl LedgerWriter for MemoryLedger {
    async fn submit_weights(&self, submission: &WeightSubmission) -> Result<(), LedgerError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.write_failure {
            return Err(LedgerError::Rejected(reason.clone()));
        }
        state.submissions.push(submission.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use neuron_types::WeightVector;

    #[tokio::test]
    async fn memory_ledger_registers_and_fails_on_demand() {
        let ledger = MemoryLedger::default();
        ledger.register(1, [1; 32], 10, None);
        ledger.register(1, [2; 32], 20, None);
        assert_eq!(ledger.advance_block(3), 3);

        let view = ledger.fetch_view().await.unwrap();
        assert_eq!(view.block, 3);
        assert_eq!(view.peers.len(), 1);
        assert_eq!(view.peers[0].public_key, [2; 32]);

        ledger.fail_reads(Some("offline"));
        assert!(matches!(
            ledger.fetch_view().await,
            Err(LedgerError::Transport(_))
        ));
    }

    async fn spawn_gateway(view: LedgerView) -> (SocketAddr, Arc<Mutex<Vec<WeightSubmission>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/peers",
                get(move || {
                    let view = view.clone();
                    async move { Json(view) }
                }),
            )
            .route(
                "/weights",
                post(
                    |State(store): State<Arc<Mutex<Vec<WeightSubmission>>>>,
                     Json(submission): Json<WeightSubmission>| async move {
                        if submission.block == 0 {
                            return StatusCode::BAD_REQUEST;
                        }
                        store.lock().push(submission);
                        StatusCode::OK
                    },
                ),
            )
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, received)
    }

    #[tokio::test]
    async fn http_ledger_reads_view_and_posts_weights() {
        let view = LedgerView {
            block: 42,
            peers: vec![Peer::new(1, [9; 32], 100)],
        };
        let (addr, received) = spawn_gateway(view.clone()).await;
        let ledger = HttpLedger::new(format!("http://{addr}/"), Duration::from_secs(5)).unwrap();

        assert_eq!(ledger.fetch_view().await.unwrap(), view);

        let submission = WeightSubmission {
            validator: [3; 32],
            block: 42,
            weights: WeightVector::normalize([(1, 1.0)]),
            signature: [0; 64],
        };
        ledger.submit_weights(&submission).await.unwrap();
        assert_eq!(received.lock().len(), 1);

        let rejected = WeightSubmission {
            block: 0,
            ..submission
        };
        assert!(matches!(
            ledger.submit_weights(&rejected).await,
            Err(LedgerError::Rejected(_))
        ));
    }
}
