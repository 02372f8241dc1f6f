use neuron_types::{NetworkSnapshot, Peer, PublicKey};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Which peers a validator challenges in an epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SamplingPolicy {
    All,
    Random { sample_size: usize },
    /// Sampling probability proportional to stake, without replacement.
    StakeWeighted { sample_size: usize },
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        SamplingPolicy::All
    }
}

impl SamplingPolicy {
    /// Pick peers from `snapshot`, never including `self_key`. The result is
    /// ordered by peer index.
    pub fn select<R: Rng + ?Sized>(
        &self,
        snapshot: &NetworkSnapshot,
        self_key: &PublicKey,
        rng: &mut R,
    ) -> Vec<Peer> {
        let candidates: Vec<&Peer> = snapshot
            .peers()
            .iter()
            .filter(|peer| &peer.public_key != self_key)
            .collect();

        let mut selected: Vec<Peer> = match self {
            SamplingPolicy::All => candidates.into_iter().cloned().collect(),
            SamplingPolicy::Random { sample_size } => candidates
                .choose_multiple(rng, *sample_size)
                .map(|peer| (*peer).clone())
                .collect(),
            SamplingPolicy::StakeWeighted { sample_size } => {
                let size = (*sample_size).min(candidates.len());
                match candidates.choose_multiple_weighted(rng, size, |peer| peer.stake as f64) {
                    Ok(chosen) => chosen.map(|peer| (*peer).clone()).collect(),
                    // no stake anywhere: fall back to a uniform draw
                    Err(_) => candidates
                        .choose_multiple(rng, size)
                        .map(|peer| (*peer).clone())
                        .collect(),
                }
            }
        };
        selected.sort_by_key(|peer| peer.index);
        selected
    }
}
