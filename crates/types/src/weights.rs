use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::encoding::hex_array;
use crate::envelope::{SignatureBytes, PROTOCOL_TAG};
use crate::peer::{PeerIndex, PublicKey};

/// Normalized per-peer weights, ordered by peer index.
///
/// Either every weight lies in `[0, 1]` and the weights sum to 1, or every
/// weight is zero because no peer had a positive score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightVector {
    weights: BTreeMap<PeerIndex, f64>,
}

impl WeightVector {
    /// Normalize raw scores. Negative and non-finite scores count as zero.
    pub fn normalize<I>(scores: I) -> Self
    where
        I: IntoIterator<Item = (PeerIndex, f64)>,
    {
        let mut weights: BTreeMap<PeerIndex, f64> = scores
            .into_iter()
            .map(|(index, score)| {
                let score = if score.is_finite() && score > 0.0 { score } else { 0.0 };
                (index, score)
            })
            .collect();

        let total: f64 = weights.values().sum();
        if total > 0.0 {
            for weight in weights.values_mut() {
                *weight /= total;
            }
        } else {
            weights.values_mut().for_each(|weight| *weight = 0.0);
        }
        Self { weights }
    }

    pub fn get(&self, index: PeerIndex) -> f64 {
        self.weights.get(&index).copied().unwrap_or(0.0)
    }

    pub fn total(&self) -> f64 {
        self.weights.values().sum()
    }

    pub fn is_zero(&self) -> bool {
        self.weights.values().all(|weight| *weight == 0.0)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerIndex, f64)> + '_ {
        self.weights.iter().map(|(index, weight)| (*index, *weight))
    }
}

/// Weight vector signed by a validator for a given block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSubmission {
    #[serde(with = "hex_array")]
    pub validator: PublicKey,
    pub block: u64,
    pub weights: WeightVector,
    #[serde(with = "hex_array")]
    pub signature: SignatureBytes,
}

impl WeightSubmission {
    /// Bytes covered by the validator signature.
    pub fn signing_bytes(validator: &PublicKey, block: u64, weights: &WeightVector) -> Vec<u8> {
        let mut out = Vec::with_capacity(PROTOCOL_TAG.len() + 48 + weights.len() * 10);
        out.extend_from_slice(PROTOCOL_TAG);
        out.extend_from_slice(b"/weights");
        out.extend_from_slice(validator);
        out.extend_from_slice(&block.to_be_bytes());
        for (index, weight) in weights.iter() {
            out.extend_from_slice(&index.to_be_bytes());
            out.extend_from_slice(&weight.to_bits().to_be_bytes());
        }
        out
    }

    pub fn message(&self) -> Vec<u8> {
        Self::signing_bytes(&self.validator, self.block, &self.weights)
    }
}
