//! Contest benchmark comparing a submitted checkpoint with the baseline.

use neuron_types::GenerationRequest;
use serde::Serialize;
use tracing::info;

use crate::rubric::{output_similarity, GenerationSource, RubricError, SIMILARITY_THRESHOLD};

/// Samples taken per benchmark.
pub const SAMPLE_COUNT: usize = 5;

/// Slack allowed on reported and baseline timings.
const TIME_TOLERANCE: f64 = 1.0625;

/// A checkpoint that would have to beat its current average by more than
/// this factor to reach the baseline is abandoned.
const REQUIRED_IMPROVEMENT: f64 = 0.75;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointBenchmark {
    pub baseline_average: f64,
    pub average_time: f64,
    pub average_similarity: f64,
    pub samples_tested: usize,
    pub failed: bool,
}

/// Run up to [`SAMPLE_COUNT`] requests through the baseline, then through the
/// candidate, stopping early once the candidate cannot win.
///
/// `reported_average_time` is the time the miner claimed in its submission;
/// running noticeably slower than that fails the benchmark immediately.
pub async fn compare_checkpoints<B, C>(
    baseline: &B,
    candidate: &C,
    requests: &[GenerationRequest],
    reported_average_time: Option<f64>,
) -> Result<CheckpointBenchmark, RubricError>
where
    B: GenerationSource + ?Sized,
    C: GenerationSource + ?Sized,
{
    let requests = &requests[..requests.len().min(SAMPLE_COUNT)];
    if requests.is_empty() {
        return Err(RubricError::BadChallenge("no benchmark samples".into()));
    }

    let mut baseline_outputs = Vec::with_capacity(requests.len());
    for request in requests {
        baseline_outputs.push(baseline.generate(request).await?);
    }
    let baseline_average = baseline_outputs
        .iter()
        .map(|output| output.generation_time_secs)
        .sum::<f64>()
        / baseline_outputs.len() as f64;

    let sample_count = requests.len();
    let mut average_time = f64::INFINITY;
    let mut average_similarity = 1.0;
    let mut samples_tested = 0;
    let mut failed = false;

    for (generated, (request, base)) in requests.iter().zip(&baseline_outputs).enumerate() {
        samples_tested = generated + 1;
        let remaining = sample_count - generated;

        let generation = match candidate.generate(request).await {
            Ok(generation) => generation,
            Err(err) => {
                info!(sample = generated, error = %err, "candidate failed to generate");
                failed = true;
                break;
            }
        };
        let similarity = output_similarity(&base.output, &generation.output);

        average_time = if generated == 0 {
            generation.generation_time_secs
        } else {
            (average_time * generated as f64 + generation.generation_time_secs)
                / (generated + 1) as f64
        };
        average_similarity =
            (average_similarity * generated as f64 + similarity) / (generated + 1) as f64;

        if let Some(reported) = reported_average_time {
            if average_time >= reported * TIME_TOLERANCE {
                failed = true;
                break;
            }
        }

        if average_time < baseline_average * TIME_TOLERANCE {
            continue;
        }

        let needed_time = (baseline_average * sample_count as f64
            - generated as f64 * average_time)
            / remaining as f64;
        if needed_time < average_time * REQUIRED_IMPROVEMENT {
            failed = true;
            break;
        }

        if average_similarity < SIMILARITY_THRESHOLD {
            failed = true;
            break;
        }
    }

    info!(
        samples_tested,
        average_similarity,
        average_time,
        baseline_average,
        failed,
        "checkpoint benchmark finished"
    );

    Ok(CheckpointBenchmark {
        baseline_average,
        average_time,
        average_similarity,
        samples_tested,
        failed,
    })
}
