use serde::{Deserialize, Serialize};

fn default_inference_steps() -> u32 {
    GenerationRequest::DEFAULT_INFERENCE_STEPS
}

/// Payload of an `optimize` request: a single generation challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub seed: u64,
    #[serde(default = "default_inference_steps")]
    pub inference_steps: u32,
}

impl GenerationRequest {
    pub const DEFAULT_INFERENCE_STEPS: u32 = 20;

    pub fn new<S: Into<String>>(prompt: S, seed: u64) -> Self {
        Self {
            prompt: prompt.into(),
            seed,
            inference_steps: Self::DEFAULT_INFERENCE_STEPS,
        }
    }
}

/// Latent produced by a checkpoint plus the time it took to produce it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub output: Vec<f32>,
    pub generation_time_secs: f64,
}
