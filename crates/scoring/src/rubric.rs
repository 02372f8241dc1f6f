use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use neuron_rpc::{CommandPipeline, OptimizationPipeline};
use neuron_types::{CheckpointSubmission, GenerationOutput, GenerationRequest, Peer};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::benchmark::compare_checkpoints;
use crate::challenge::{Answer, Challenge};

#[derive(Debug, Error)]
pub enum RubricError {
    #[error("response could not be decoded: {0}")]
    Malformed(String),

    #[error("challenge could not be decoded: {0}")]
    BadChallenge(String),

    #[error("baseline unavailable: {0}")]
    Baseline(String),
}

/// Scores a peer's answer to a challenge. Scores outside `[0, 1]` are clamped
/// by the caller.
#[async_trait]
pub trait Rubric: Send + Sync {
    /// Called once per epoch before any challenge goes out.
    fn begin_epoch(&self) {}

    async fn score(
        &self,
        peer: &Peer,
        challenge: &Challenge,
        answer: &Answer,
    ) -> Result<f64, RubricError>;

    /// Whether `submission` holds up against the answers its peer gave this
    /// epoch. Asked only in contest mode, with the answers that were scored.
    async fn review(
        &self,
        _peer: &Peer,
        _submission: &CheckpointSubmission,
        _answers: &[(Challenge, Answer)],
    ) -> Result<bool, RubricError> {
        Ok(true)
    }
}

/// Runs a checkpoint on a generation request, e.g. the contest baseline.
#[async_trait]
pub trait GenerationSource: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, RubricError>;
}

/// A local command run as a checkpoint: the request JSON on stdin, the
/// [`GenerationOutput`] JSON on stdout.
#[async_trait]
impl GenerationSource for CommandPipeline {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, RubricError> {
        let input =
            serde_json::to_vec(request).map_err(|err| RubricError::BadChallenge(err.to_string()))?;
        let stdout = self
            .optimize(input)
            .await
            .map_err(|err| RubricError::Baseline(err.to_string()))?;
        serde_json::from_slice(&stdout).map_err(|err| RubricError::Malformed(err.to_string()))
    }
}

/// Minimum similarity to the baseline output for a generation to count.
pub const SIMILARITY_THRESHOLD: f64 = 0.85;

const COSINE_EPS: f64 = 1e-3;

/// Cosine similarity of two flattened latents. Norms are floored at a small
/// epsilon; mismatched lengths compare as orthogonal.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    dot / (norm_a.sqrt().max(COSINE_EPS) * norm_b.sqrt().max(COSINE_EPS))
}

/// Cosine mapped to `[0, 1]` and sharpened: `((cos / 2) + 0.5) ^ 4`.
pub fn output_similarity(baseline: &[f32], output: &[f32]) -> f64 {
    let cosine = cosine_similarity(baseline, output).clamp(-1.0, 1.0);
    (cosine * 0.5 + 0.5).powi(4)
}

/// Generation time credited to a peer: its own report, but never less than
/// the round trip the validator measured. Non-positive and non-finite reports
/// earn nothing.
fn credited_time(reported: f64, measured: Duration) -> Option<f64> {
    (reported.is_finite() && reported > 0.0).then(|| reported.max(measured.as_secs_f64()))
}

fn decode_request(challenge: &Challenge) -> Result<GenerationRequest, RubricError> {
    serde_json::from_slice(&challenge.payload).map_err(|err| RubricError::BadChallenge(err.to_string()))
}

fn decode_output(answer: &Answer) -> Result<GenerationOutput, RubricError> {
    serde_json::from_slice(&answer.payload).map_err(|err| RubricError::Malformed(err.to_string()))
}

/// Rewards checkpoints that reproduce the baseline output faster than the
/// baseline does.
///
/// The baseline runs at most once per distinct request per epoch; every peer
/// answering the same challenge is compared against the same output.
pub struct CheckpointRubric<B> {
    baseline: B,
    outputs: Mutex<HashMap<Vec<u8>, Arc<OnceCell<GenerationOutput>>>>,
}

impl<B: GenerationSource> CheckpointRubric<B> {
    pub fn new(baseline: B) -> Self {
        Self {
            baseline,
            outputs: Mutex::new(HashMap::new()),
        }
    }

    /// Score of one generation against its baseline, given the round trip
    /// measured for it.
    pub fn score_output(
        baseline: &GenerationOutput,
        output: &GenerationOutput,
        measured: Duration,
    ) -> f64 {
        let similarity = output_similarity(&baseline.output, &output.output);
        if similarity < SIMILARITY_THRESHOLD {
            return 0.0;
        }
        let Some(time) = credited_time(output.generation_time_secs, measured) else {
            return 0.0;
        };
        let speedup = (baseline.generation_time_secs / time).min(1.0);
        similarity * speedup.max(0.0)
    }

    /// Baseline output for `request`, generated on first use this epoch.
    pub async fn baseline_output(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutput, RubricError> {
        let key =
            serde_json::to_vec(request).map_err(|err| RubricError::BadChallenge(err.to_string()))?;
        let cell = Arc::clone(self.outputs.lock().entry(key).or_default());
        cell.get_or_try_init(|| self.baseline.generate(request))
            .await
            .cloned()
    }
}

#[async_trait]
impl<B: GenerationSource> Rubric for CheckpointRubric<B> {
    fn begin_epoch(&self) {
        self.outputs.lock().clear();
    }

    async fn score(
        &self,
        _peer: &Peer,
        challenge: &Challenge,
        answer: &Answer,
    ) -> Result<f64, RubricError> {
        let request = decode_request(challenge)?;
        let output = decode_output(answer)?;
        let baseline = self.baseline_output(&request).await?;
        Ok(Self::score_output(&baseline, &output, answer.latency))
    }

    /// Benchmarks the answers as the submitted checkpoint's generations,
    /// timed with their credited times, against the claimed average time.
    async fn review(
        &self,
        peer: &Peer,
        submission: &CheckpointSubmission,
        answers: &[(Challenge, Answer)],
    ) -> Result<bool, RubricError> {
        let mut generations = Vec::with_capacity(answers.len());
        for (challenge, answer) in answers {
            let (Ok(request), Ok(mut output)) = (decode_request(challenge), decode_output(answer)) else {
                continue;
            };
            let Some(time) = credited_time(output.generation_time_secs, answer.latency) else {
                continue;
            };
            output.generation_time_secs = time;
            generations.push((request, output));
        }
        if generations.is_empty() {
            return Ok(false);
        }

        let requests: Vec<GenerationRequest> =
            generations.iter().map(|(request, _)| request.clone()).collect();
        let result = compare_checkpoints(
            &EpochBaseline(self),
            &Replayed(generations),
            &requests,
            Some(submission.average_time as f64),
        )
        .await?;
        debug!(
            peer = peer.index,
            repository = %submission.repository,
            average_time = result.average_time,
            failed = result.failed,
            "submission reviewed"
        );
        Ok(!result.failed)
    }
}

/// The cached baseline of a [`CheckpointRubric`] as a generation source.
struct EpochBaseline<'a, B>(&'a CheckpointRubric<B>);

#[async_trait]
impl<'a, B: GenerationSource> GenerationSource for EpochBaseline<'a, B> {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, RubricError> {
        self.0.baseline_output(request).await
    }
}

/// Generations a peer already returned, replayed by request.
struct Replayed(Vec<(GenerationRequest, GenerationOutput)>);

#[async_trait]
impl GenerationSource for Replayed {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, RubricError> {
        self.0
            .iter()
            .find(|(answered, _)| answered == request)
            .map(|(_, output)| output.clone())
            .ok_or_else(|| RubricError::Malformed("no answer for benchmark request".into()))
    }
}
