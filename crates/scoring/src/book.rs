//! Per-peer exponential moving average of epoch scores.

use std::collections::{BTreeMap, HashMap};

use neuron_types::{NetworkSnapshot, PeerIndex, PublicKey, WeightVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Smoothed score the validator keeps for one peer slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub ema_score: f64,
    pub last_updated_block: u64,
    pub public_key: PublicKey,
}

/// Score records keyed by peer index.
///
/// Only the epoch loop mutates the book, once per completed round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreBook {
    records: BTreeMap<PeerIndex, ScoreRecord>,
}

impl ScoreBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a prior record, e.g. when restoring state.
    pub fn seed(&mut self, index: PeerIndex, public_key: PublicKey, ema_score: f64, block: u64) {
        self.records.insert(
            index,
            ScoreRecord {
                ema_score: ema_score.clamp(0.0, 1.0),
                last_updated_block: block,
                public_key,
            },
        );
    }

    pub fn get(&self, index: PeerIndex) -> Option<&ScoreRecord> {
        self.records.get(&index)
    }

    pub fn ema(&self, index: PeerIndex) -> f64 {
        self.records.get(&index).map_or(0.0, |record| record.ema_score)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerIndex, &ScoreRecord)> {
        self.records.iter().map(|(index, record)| (*index, record))
    }

    /// Fold one epoch into the book.
    ///
    /// Records for indices missing from `snapshot` are dropped, records whose
    /// slot changed hands restart from zero, and peers without an epoch score
    /// keep their average.
    pub fn apply_epoch(
        &mut self,
        snapshot: &NetworkSnapshot,
        epoch_scores: &HashMap<PeerIndex, f64>,
        alpha: f64,
    ) {
        let block = snapshot.block();
        let before = self.records.len();
        self.records.retain(|index, _| snapshot.contains(*index));
        let pruned = before - self.records.len();

        for peer in snapshot.peers() {
            if let Some(record) = self.records.get_mut(&peer.index) {
                if record.public_key != peer.public_key {
                    debug!(peer = peer.index, "peer slot re-registered, resetting score");
                    *record = ScoreRecord {
                        ema_score: 0.0,
                        last_updated_block: block,
                        public_key: peer.public_key,
                    };
                }
            }

            let Some(score) = epoch_scores.get(&peer.index) else {
                continue;
            };
            let record = self.records.entry(peer.index).or_insert(ScoreRecord {
                ema_score: 0.0,
                last_updated_block: block,
                public_key: peer.public_key,
            });
            record.ema_score = (alpha * score.clamp(0.0, 1.0) + (1.0 - alpha) * record.ema_score)
                .clamp(0.0, 1.0);
            record.last_updated_block = block;
        }

        if pruned > 0 {
            debug!(pruned, "dropped scores of deregistered peers");
        }
    }

    /// Normalized weights over every tracked peer.
    pub fn weights(&self) -> WeightVector {
        WeightVector::normalize(
            self.records
                .iter()
                .map(|(index, record)| (*index, record.ema_score)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neuron_types::Peer;
    use proptest::prelude::*;

    fn snapshot(block: u64, peers: &[(PeerIndex, u8)]) -> NetworkSnapshot {
        NetworkSnapshot::new(
            block,
            peers
                .iter()
                .map(|(index, key)| Peer::new(*index, [*key; 32], 1))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn ema_update_rule() {
        let mut book = ScoreBook::new();
        book.seed(1, [1; 32], 0.6, 0);
        book.seed(2, [2; 32], 0.6, 0);
        let scores = HashMap::from([(1, 1.0), (2, 0.0)]);
        book.apply_epoch(&snapshot(10, &[(1, 1), (2, 2)]), &scores, 0.5);

        assert!((book.ema(1) - 0.8).abs() < 1e-12);
        assert!((book.ema(2) - 0.3).abs() < 1e-12);
        assert_eq!(book.get(1).unwrap().last_updated_block, 10);
    }

    #[test]
    fn unsampled_peers_keep_their_score_and_absent_ones_are_pruned() {
        let mut book = ScoreBook::new();
        book.seed(1, [1; 32], 0.4, 3);
        book.seed(2, [2; 32], 0.9, 3);
        book.seed(3, [3; 32], 0.5, 3);

        let scores = HashMap::from([(2, 1.0)]);
        book.apply_epoch(&snapshot(7, &[(1, 1), (2, 2)]), &scores, 0.25);

        assert_eq!(book.len(), 2);
        assert!(book.get(3).is_none());
        assert_eq!(book.ema(1), 0.4);
        assert_eq!(book.get(1).unwrap().last_updated_block, 3);
        assert!((book.ema(2) - 0.925).abs() < 1e-12);
    }

    #[test]
    fn re_registered_slot_starts_from_zero() {
        let mut book = ScoreBook::new();
        book.seed(1, [1; 32], 0.9, 0);
        book.apply_epoch(&snapshot(5, &[(1, 9)]), &HashMap::new(), 0.5);
        let record = book.get(1).unwrap();
        assert_eq!(record.ema_score, 0.0);
        assert_eq!(record.public_key, [9; 32]);

        book.apply_epoch(&snapshot(6, &[(1, 9)]), &HashMap::from([(1, 1.0)]), 0.5);
        assert_eq!(book.ema(1), 0.5);
    }

    #[test]
    fn new_peers_start_from_zero() {
        let mut book = ScoreBook::new();
        book.apply_epoch(&snapshot(1, &[(4, 4)]), &HashMap::from([(4, 1.0)]), 0.2);
        assert!((book.ema(4) - 0.2).abs() < 1e-12);
        assert!((book.weights().get(4) - 1.0).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn ema_stays_in_unit_interval(
            prior in 0.0f64..=1.0,
            scores in proptest::collection::vec(-1.0f64..2.0, 1..32),
            alpha in 0.01f64..=1.0,
        ) {
            let mut book = ScoreBook::new();
            book.seed(1, [1; 32], prior, 0);
            for (round, score) in scores.iter().enumerate() {
                book.apply_epoch(
                    &snapshot(round as u64 + 1, &[(1, 1)]),
                    &HashMap::from([(1, *score)]),
                    alpha,
                );
                let ema = book.ema(1);
                prop_assert!((0.0..=1.0).contains(&ema));
            }
            let weights = book.weights();
            prop_assert!(weights.is_zero() || (weights.total() - 1.0).abs() < 1e-9);
        }
    }
}
