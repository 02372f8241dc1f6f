//! Contest admission: a peer is challenged only if the checkpoint it
//! currently submits targets the running contest.

use std::time::Duration;

use neuron_rpc::ClientError;
use neuron_types::{CheckpointSubmission, ContestId, Peer, RequestKind, SubmissionCodecError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::challenge::{Challenge, PeerQuerier};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContestConfig {
    pub contest: ContestId,
    /// Repository of the reference checkpoint; resubmitting it is not a
    /// contest entry.
    pub baseline_repository: String,
}

#[derive(Debug, Error)]
pub enum Rejection {
    #[error("submission unavailable: {0}")]
    Unavailable(#[from] ClientError),

    #[error("submission could not be decoded: {0}")]
    Undecodable(#[from] SubmissionCodecError),

    #[error("{repository} (contest {contest}, format {spec_version}) is not eligible")]
    Ineligible {
        repository: String,
        contest: ContestId,
        spec_version: u32,
    },
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::Unavailable(_) => "unavailable",
            Rejection::Undecodable(_) => "undecodable",
            Rejection::Ineligible { .. } => "ineligible",
        }
    }
}

impl ContestConfig {
    /// Fetch `peer`'s current submission and check it against this contest.
    pub async fn admit(
        &self,
        querier: &dyn PeerQuerier,
        peer: &Peer,
        timeout: Duration,
    ) -> Result<CheckpointSubmission, Rejection> {
        let request = Challenge::new(RequestKind::SUBMISSION, Vec::new());
        let encoded = querier.query(peer, &request, timeout).await?;
        let submission = CheckpointSubmission::from_bytes(&encoded)?;
        if !submission.is_eligible(self.contest, &self.baseline_repository) {
            return Err(Rejection::Ineligible {
                repository: submission.repository,
                contest: submission.contest,
                spec_version: submission.spec_version,
            });
        }
        Ok(submission)
    }
}
