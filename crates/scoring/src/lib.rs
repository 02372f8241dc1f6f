//! Validator scoring and weight engine.
//!
//! Each epoch the validator challenges a sample of peers, scores their
//! answers with a [`Rubric`], folds the epoch scores into a per-peer
//! exponential moving average and commits the normalized weights to the
//! ledger. In contest mode only peers whose checkpoint submission is
//! eligible are challenged, and each submission is benchmarked against the
//! answers its peer gave.

pub mod benchmark;
pub mod book;
pub mod challenge;
pub mod contest;
pub mod epoch;
pub mod rubric;
pub mod sampling;

pub use benchmark::{compare_checkpoints, CheckpointBenchmark, SAMPLE_COUNT};
pub use book::{ScoreBook, ScoreRecord};
pub use challenge::{
    Answer, Challenge, ChallengeSource, GenerationChallenges, PeerQuerier, StaticChallenges,
};
pub use contest::{ContestConfig, Rejection};
pub use epoch::{EpochEngine, EpochError, EpochPhase, EpochReport, ScoringConfig};
pub use rubric::{
    cosine_similarity, output_similarity, CheckpointRubric, GenerationSource, Rubric, RubricError,
    SIMILARITY_THRESHOLD,
};
pub use sampling::SamplingPolicy;
