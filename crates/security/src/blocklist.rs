//! Static sender blacklist plus temporary blocks earned by misbehaviour.

use std::collections::HashSet;
use std::hash::Hash;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use neuron_types::{short_key, PublicKey};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
struct Strikes {
    count: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
}

/// Counts failures per key and blocks the key for `block_duration` once
/// `threshold` failures land inside one `window`.
struct StrikeCounter<K: Eq + Hash> {
    threshold: u32,
    window: Duration,
    block_duration: Duration,
    strikes: DashMap<K, Strikes>,
}

impl<K: Eq + Hash + Copy> StrikeCounter<K> {
    fn new(threshold: u32, window: Duration, block_duration: Duration) -> Self {
        Self {
            threshold,
            window,
            block_duration,
            strikes: DashMap::new(),
        }
    }

    /// Returns the new block expiry when this strike triggered a block.
    fn strike(&self, key: K) -> Option<Instant> {
        if self.threshold == 0 {
            return None;
        }
        let now = Instant::now();
        let mut entry = self.strikes.entry(key).or_insert(Strikes {
            count: 0,
            window_start: now,
            blocked_until: None,
        });
        if now.duration_since(entry.window_start) > self.window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;
        if entry.count >= self.threshold && entry.blocked_until.map_or(true, |until| until <= now) {
            let until = now + self.block_duration;
            entry.blocked_until = Some(until);
            entry.count = 0;
            entry.window_start = now;
            return Some(until);
        }
        None
    }

    fn remaining_block(&self, key: &K) -> Option<Duration> {
        let entry = self.strikes.get(key)?;
        let until = entry.blocked_until?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    fn clear(&self, key: &K) {
        self.strikes.remove(key);
    }

    fn cleanup_expired(&self) {
        let now = Instant::now();
        let window = self.window;
        self.strikes.retain(|_, strikes| {
            strikes.blocked_until.is_some_and(|until| until > now)
                || now.duration_since(strikes.window_start) <= window
        });
    }

    fn len(&self) -> usize {
        self.strikes.len()
    }
}

/// Why a sender is currently refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Blacklisted,
    RepeatedReplays,
    RepeatedAuthFailures,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::Blacklisted => "blacklisted",
            BlockReason::RepeatedReplays => "repeated_replays",
            BlockReason::RepeatedAuthFailures => "repeated_auth_failures",
        }
    }
}

pub struct BlockList {
    blacklist: HashSet<PublicKey>,
    blacklist_retry_after: Duration,
    replays: StrikeCounter<PublicKey>,
    auth_failures: StrikeCounter<IpAddr>,
}

impl BlockList {
    pub fn new(
        blacklist: HashSet<PublicKey>,
        max_replay_violations: u32,
        max_failed_attempts: u32,
        window: Duration,
        block_duration: Duration,
    ) -> Self {
        Self {
            blacklist,
            blacklist_retry_after: block_duration,
            replays: StrikeCounter::new(max_replay_violations, window, block_duration),
            auth_failures: StrikeCounter::new(max_failed_attempts, window, block_duration),
        }
    }

    /// Remaining refusal for `sender`, if any.
    pub fn check_sender(&self, sender: &PublicKey) -> Option<(BlockReason, Duration)> {
        if self.blacklist.contains(sender) {
            return Some((BlockReason::Blacklisted, self.blacklist_retry_after));
        }
        self.replays
            .remaining_block(sender)
            .map(|remaining| (BlockReason::RepeatedReplays, remaining))
    }

    pub fn check_ip(&self, ip: &IpAddr) -> Option<(BlockReason, Duration)> {
        self.auth_failures
            .remaining_block(ip)
            .map(|remaining| (BlockReason::RepeatedAuthFailures, remaining))
    }

    pub fn record_replay(&self, sender: &PublicKey) {
        if let Some(until) = self.replays.strike(*sender) {
            warn!(
                sender = %short_key(sender),
                block_secs = until.saturating_duration_since(Instant::now()).as_secs(),
                "sender temporarily blocked after repeated replay violations"
            );
        }
    }

    pub fn record_auth_failure(&self, ip: IpAddr) {
        if let Some(until) = self.auth_failures.strike(ip) {
            warn!(
                %ip,
                block_secs = until.saturating_duration_since(Instant::now()).as_secs(),
                "address temporarily blocked after repeated authentication failures"
            );
        }
    }

    pub fn record_success(&self, ip: Option<IpAddr>) {
        if let Some(ip) = ip {
            self.auth_failures.clear(&ip);
        }
    }

    /// Clean up expired blocks and stale strike windows
    pub fn cleanup_expired_blocks(&self) {
        self.replays.cleanup_expired();
        self.auth_failures.cleanup_expired();
    }

    pub fn tracked_entries(&self) -> usize {
        self.replays.len() + self.auth_failures.len()
    }
}
