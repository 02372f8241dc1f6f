//! Per-sender nonce tracking.
//!
//! Each sender owns its own mutex inside a sharded map, so admitting a
//! request from one peer never waits on another peer's state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use neuron_types::PublicKey;
use parking_lot::Mutex;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    #[error("nonce {received} is not above last accepted nonce {last}")]
    StaleNonce { last: u64, received: u64 },
    #[error("timestamp is {skew_ms}ms away from local time")]
    ClockSkew { skew_ms: u64 },
}

#[derive(Debug)]
struct SenderState {
    last_nonce: u64,
    last_seen: Instant,
}

pub struct ReplayGuard {
    max_clock_skew: Duration,
    senders: DashMap<PublicKey, Arc<Mutex<SenderState>>>,
}

impl ReplayGuard {
    pub fn new(max_clock_skew: Duration) -> Self {
        Self {
            max_clock_skew,
            senders: DashMap::new(),
        }
    }

    /// Accept `nonce` from `sender` if it is strictly above the last accepted
    /// one and the timestamp is within the allowed skew of `now_ms`.
    pub fn check_and_record(
        &self,
        sender: &PublicKey,
        nonce: u64,
        timestamp_ms: u64,
        now_ms: u64,
    ) -> Result<(), ReplayError> {
        let skew_ms = now_ms.abs_diff(timestamp_ms);
        if skew_ms > self.max_clock_skew.as_millis() as u64 {
            return Err(ReplayError::ClockSkew { skew_ms });
        }

        loop {
            let state = self.state_for(sender);
            if let Some(result) = self.try_record(sender, &state, nonce) {
                return result;
            }
        }
    }

    fn state_for(&self, sender: &PublicKey) -> Arc<Mutex<SenderState>> {
        if let Some(entry) = self.senders.get(sender) {
            return Arc::clone(entry.value());
        }
        let entry = self.senders.entry(*sender).or_insert_with(|| {
            Arc::new(Mutex::new(SenderState {
                last_nonce: 0,
                last_seen: Instant::now(),
            }))
        });
        Arc::clone(entry.value())
    }

    /// Record `nonce` against `state`. Returns `None` when `state` was pruned
    /// after it was looked up; the caller retries with a fresh lookup.
    fn try_record(
        &self,
        sender: &PublicKey,
        state: &Arc<Mutex<SenderState>>,
        nonce: u64,
    ) -> Option<Result<(), ReplayError>> {
        let mut locked = state.lock();
        let current = self
            .senders
            .get(sender)
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), state));
        if !current {
            return None;
        }
        if nonce <= locked.last_nonce {
            return Some(Err(ReplayError::StaleNonce {
                last: locked.last_nonce,
                received: nonce,
            }));
        }
        locked.last_nonce = nonce;
        locked.last_seen = Instant::now();
        Some(Ok(()))
    }

    pub fn last_nonce(&self, sender: &PublicKey) -> Option<u64> {
        self.senders
            .get(sender)
            .map(|entry| entry.value().lock().last_nonce)
    }

    pub fn tracked_senders(&self) -> usize {
        self.senders.len()
    }

    /// Forget senders idle for longer than twice the allowed clock skew. Any
    /// request they signed before that point now fails the timestamp check, so
    /// forgetting the nonce cannot reopen a replay.
    ///
    /// A sender whose state is locked by an admission in flight is kept.
    pub fn prune_idle(&self) {
        let horizon = self.max_clock_skew * 2;
        self.senders.retain(|_, state| match state.try_lock() {
            Some(state) => state.last_seen.elapsed() <= horizon,
            None => true,
        });
    }
}
