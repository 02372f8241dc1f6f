use std::collections::HashMap;

use crate::peer::{Endpoint, Peer, PeerIndex, PublicKey};

/// Reasons a ledger view cannot become a snapshot.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("peer index {0} appears more than once")]
    DuplicateIndex(PeerIndex),
    #[error("public key registered at both index {first} and index {second}")]
    DuplicateKey { first: PeerIndex, second: PeerIndex },
}

/// Immutable, point-in-time view of the registered peer set.
///
/// Peers are ordered by index. Snapshots are built once and shared behind an
/// `Arc`; a newer ledger view produces a new snapshot instead of mutating this
/// one.
#[derive(Debug, Clone, Default)]
pub struct NetworkSnapshot {
    block: u64,
    peers: Vec<Peer>,
    by_index: HashMap<PeerIndex, usize>,
    by_key: HashMap<PublicKey, usize>,
    displaced: Vec<PeerIndex>,
}

impl NetworkSnapshot {
    /// Snapshot served before the first successful ledger fetch.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from a raw ledger view.
    ///
    /// When several peers advertise the same endpoint only one keeps it: the
    /// highest stake wins and equal stake favours the lowest index. The others
    /// stay registered without an endpoint and are reported by
    /// [`NetworkSnapshot::displaced`].
    pub fn new(block: u64, mut peers: Vec<Peer>) -> Result<Self, SnapshotError> {
        peers.sort_by_key(|peer| peer.index);

        let mut by_index = HashMap::with_capacity(peers.len());
        let mut by_key: HashMap<PublicKey, usize> = HashMap::with_capacity(peers.len());
        for (position, peer) in peers.iter().enumerate() {
            if by_index.insert(peer.index, position).is_some() {
                return Err(SnapshotError::DuplicateIndex(peer.index));
            }
            if let Some(existing) = by_key.insert(peer.public_key, position) {
                return Err(SnapshotError::DuplicateKey {
                    first: peers[existing].index,
                    second: peer.index,
                });
            }
        }

        let displaced = resolve_endpoint_claims(&mut peers);

        Ok(Self {
            block,
            peers,
            by_index,
            by_key,
            displaced,
        })
    }

    pub fn block(&self) -> u64 {
        self.block
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, index: PeerIndex) -> Option<&Peer> {
        self.by_index.get(&index).map(|&position| &self.peers[position])
    }

    pub fn by_key(&self, key: &PublicKey) -> Option<&Peer> {
        self.by_key.get(key).map(|&position| &self.peers[position])
    }

    pub fn contains(&self, index: PeerIndex) -> bool {
        self.by_index.contains_key(&index)
    }

    pub fn total_stake(&self) -> u128 {
        self.peers.iter().map(|peer| peer.stake as u128).sum()
    }

    /// Indices that lost an endpoint to a competing claim.
    pub fn displaced(&self) -> &[PeerIndex] {
        &self.displaced
    }
}

fn resolve_endpoint_claims(peers: &mut [Peer]) -> Vec<PeerIndex> {
    let mut winners: HashMap<&Endpoint, usize> = HashMap::new();
    for (position, peer) in peers.iter().enumerate() {
        let Some(endpoint) = peer.endpoint.as_ref() else {
            continue;
        };
        match winners.get(endpoint) {
            Some(&incumbent) if !outranks(peer, &peers[incumbent]) => {}
            _ => {
                winners.insert(endpoint, position);
            }
        }
    }

    let mut keep = vec![false; peers.len()];
    for position in winners.into_values() {
        keep[position] = true;
    }

    let mut displaced = Vec::new();
    for (position, peer) in peers.iter_mut().enumerate() {
        if peer.endpoint.is_some() && !keep[position] {
            peer.endpoint = None;
            displaced.push(peer.index);
        }
    }
    displaced
}

fn outranks(candidate: &Peer, incumbent: &Peer) -> bool {
    candidate.stake > incumbent.stake
        || (candidate.stake == incumbent.stake && candidate.index < incumbent.index)
}
