//! Neuron shared types
//!
//! Data model shared by every neuron crate: peer records and the immutable
//! network snapshot, the signed request/response envelope carried over the
//! RPC transport, weight vectors submitted to the ledger and the compact
//! checkpoint submission codec.

pub mod encoding;
pub mod envelope;
pub mod generation;
pub mod peer;
pub mod snapshot;
pub mod submission;
pub mod weights;

pub use envelope::{
    payload_hash, unix_millis, Digest, ErrorBody, ErrorCode, InvalidRequestKind, MessageHeader,
    RequestKind, ResponseOutcome, SignatureBytes, SignedRequest, SignedResponse,
};
pub use generation::{GenerationOutput, GenerationRequest};
pub use peer::{short_key, Endpoint, EndpointParseError, Peer, PeerIndex, PublicKey};
pub use snapshot::{NetworkSnapshot, SnapshotError};
pub use submission::{
    CheckpointSubmission, ContestId, SubmissionCodecError, MAX_SUBMISSION_BYTES,
    SUBMISSION_SPEC_VERSION,
};
pub use weights::{WeightSubmission, WeightVector};
