use std::time::Duration;

use async_trait::async_trait;
use neuron_rpc::{ClientError, TransportClient};
use neuron_types::{GenerationRequest, Peer, RequestKind};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// One request a validator sends to every sampled peer in an epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub kind: RequestKind,
    pub payload: Vec<u8>,
}

impl Challenge {
    pub fn new(kind: RequestKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }
}

/// A peer's answer to one challenge and the round trip the validator
/// measured for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub payload: Vec<u8>,
    pub latency: Duration,
}

/// Produces the challenges for an epoch.
pub trait ChallengeSource: Send + Sync {
    fn challenges(&self, block: u64) -> Vec<Challenge>;
}

/// The same challenges every epoch.
#[derive(Debug, Clone, Default)]
pub struct StaticChallenges(pub Vec<Challenge>);

impl ChallengeSource for StaticChallenges {
    fn challenges(&self, _block: u64) -> Vec<Challenge> {
        self.0.clone()
    }
}

const PROMPT_WORDS: &[&str] = &[
    "amber", "ancient", "aurora", "canyon", "castle", "cathedral", "copper", "crimson", "crystal",
    "desert", "dragon", "dusk", "emerald", "forest", "fox", "glacier", "golden", "harbor",
    "horizon", "lantern", "lighthouse", "marble", "meadow", "misty", "moonlit", "mountain",
    "neon", "ocean", "orchid", "portrait", "quiet", "rain", "river", "rusty", "sapphire",
    "serene", "shadow", "silver", "skyline", "snowy", "storm", "sunset", "temple", "tiger",
    "twilight", "velvet", "village", "violet", "waterfall", "wild", "willow", "winter",
];

/// Random `optimize` challenges: short comma separated prompts with random
/// seeds, one [`GenerationRequest`] per challenge.
pub struct GenerationChallenges {
    per_epoch: usize,
    inference_steps: u32,
    rng: Mutex<StdRng>,
}

impl GenerationChallenges {
    pub fn new(per_epoch: usize) -> Self {
        Self::with_rng(per_epoch, StdRng::from_entropy())
    }

    pub fn with_rng(per_epoch: usize, rng: StdRng) -> Self {
        Self {
            per_epoch,
            inference_steps: GenerationRequest::DEFAULT_INFERENCE_STEPS,
            rng: Mutex::new(rng),
        }
    }

    pub fn with_inference_steps(mut self, steps: u32) -> Self {
        self.inference_steps = steps;
        self
    }

    fn random_prompt(rng: &mut StdRng) -> String {
        let count = rng.gen_range(0..=8usize);
        let mut words: Vec<&str> = PROMPT_WORDS.choose_multiple(rng, count).copied().collect();
        words.push("tao");
        words.shuffle(rng);
        words.join(", ")
    }
}

impl ChallengeSource for GenerationChallenges {
    fn challenges(&self, _block: u64) -> Vec<Challenge> {
        let mut rng = self.rng.lock();
        (0..self.per_epoch)
            .filter_map(|_| {
                let request = GenerationRequest {
                    prompt: Self::random_prompt(&mut rng),
                    seed: rng.gen::<u32>() as u64,
                    inference_steps: self.inference_steps,
                };
                serde_json::to_vec(&request)
                    .ok()
                    .map(|payload| Challenge::new(RequestKind::OPTIMIZE, payload))
            })
            .collect()
    }
}

/// Sends a challenge to a peer and returns the raw response payload.
///
/// `timeout` bounds the whole call; the engine additionally cancels queries
/// still running at the epoch deadline.
#[async_trait]
pub trait PeerQuerier: Send + Sync {
    async fn query(
        &self,
        peer: &Peer,
        challenge: &Challenge,
        timeout: Duration,
    ) -> Result<Vec<u8>, ClientError>;
}

#[async_trait]
impl PeerQuerier for TransportClient {
    async fn query(
        &self,
        peer: &Peer,
        challenge: &Challenge,
        timeout: Duration,
    ) -> Result<Vec<u8>, ClientError> {
        // single attempt: a retried challenge would be timed twice
        self.call_once(peer, &challenge.kind, &challenge.payload, timeout)
            .await
    }
}
