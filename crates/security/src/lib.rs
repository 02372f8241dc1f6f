//! Admission policy for inbound neuron requests.
//!
//! Signature checks live with the transport; this crate decides whether an
//! authenticated sender may be served right now: nonce freshness, rate
//! limits, the static blacklist and temporary blocks.

pub mod blocklist;
pub mod rate_limiter;
pub mod replay;

pub use blocklist::{BlockList, BlockReason};
pub use rate_limiter::{KindLimit, LimitScope, RateLimitConfig, RateLimitError, RateLimiter};
pub use replay::{ReplayError, ReplayGuard};

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use neuron_types::{short_key, PublicKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Security configuration for a neuron's RPC server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
    /// Largest accepted distance between a request timestamp and local time
    pub max_clock_skew_ms: u64,
    /// Replay violations within `strike_window_secs` before a sender is blocked
    pub max_replay_violations: u32,
    /// Authentication failures from one address before it is blocked
    pub max_failed_attempts: u32,
    /// Window over which violations are counted
    pub strike_window_secs: u64,
    /// Block duration in seconds
    pub block_duration_secs: u64,
    /// Hex public keys that are never served
    pub blacklist: Vec<String>,
    /// Upper bound on tracked per-sender rate limit buckets
    pub max_tracked_senders: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            max_clock_skew_ms: 30_000,
            max_replay_violations: 5,
            max_failed_attempts: 20,
            strike_window_secs: 60,
            block_duration_secs: 300, // 5 minutes
            blacklist: Vec::new(),
            max_tracked_senders: 10_000,
        }
    }
}

/// Reasons an authenticated request is refused.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("replayed request: {0}")]
    Replay(#[from] ReplayError),
    #[error("rate limited ({reason}), retry after {retry_after:?}")]
    RateLimited {
        reason: &'static str,
        retry_after: Duration,
    },
}

impl AdmissionError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdmissionError::RateLimited { retry_after, .. } => Some(*retry_after),
            AdmissionError::Replay(_) => None,
        }
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum SecurityError {
    #[error("invalid blacklist entry {0:?}: expected 32-byte hex public key")]
    InvalidBlacklistEntry(String),
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
}

/// Coordinates every admission check for the transport server.
pub struct AdmissionGuard {
    config: SecurityConfig,
    replay: ReplayGuard,
    rate_limiter: RateLimiter,
    blocks: BlockList,
}

impl AdmissionGuard {
    pub fn new(config: SecurityConfig) -> Result<Self, SecurityError> {
        let blacklist = config
            .blacklist
            .iter()
            .map(|entry| parse_key(entry))
            .collect::<Result<HashSet<_>, _>>()?;
        let rate_limiter = RateLimiter::new(config.rate_limit.clone())?;
        let replay = ReplayGuard::new(Duration::from_millis(config.max_clock_skew_ms));
        let blocks = BlockList::new(
            blacklist,
            config.max_replay_violations,
            config.max_failed_attempts,
            Duration::from_secs(config.strike_window_secs),
            Duration::from_secs(config.block_duration_secs),
        );

        Ok(Self {
            config,
            replay,
            rate_limiter,
            blocks,
        })
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Refuse addresses blocked after repeated authentication failures.
    pub fn check_ip(&self, ip: Option<IpAddr>) -> Result<(), AdmissionError> {
        match ip.and_then(|ip| self.blocks.check_ip(&ip)) {
            Some((reason, retry_after)) => Err(AdmissionError::RateLimited {
                reason: reason.as_str(),
                retry_after,
            }),
            None => Ok(()),
        }
    }

    pub fn record_auth_failure(&self, ip: Option<IpAddr>) {
        if let Some(ip) = ip {
            self.blocks.record_auth_failure(ip);
        }
    }

    pub fn record_auth_success(&self, ip: Option<IpAddr>) {
        self.blocks.record_success(ip);
    }

    /// Nonce and timestamp freshness for an authenticated sender.
    pub fn check_replay(
        &self,
        sender: &PublicKey,
        nonce: u64,
        timestamp_ms: u64,
        now_ms: u64,
    ) -> Result<(), AdmissionError> {
        self.replay
            .check_and_record(sender, nonce, timestamp_ms, now_ms)
            .map_err(|err| {
                debug!(sender = %short_key(sender), error = %err, "replay rejected");
                self.blocks.record_replay(sender);
                AdmissionError::Replay(err)
            })
    }

    /// Blacklist, temporary blocks and rate limits for an authenticated sender.
    pub fn check_rate(&self, sender: &PublicKey, kind: &str) -> Result<(), AdmissionError> {
        if let Some((reason, retry_after)) = self.blocks.check_sender(sender) {
            return Err(AdmissionError::RateLimited {
                reason: reason.as_str(),
                retry_after,
            });
        }
        self.rate_limiter
            .check_rate_limit(sender, kind)
            .map_err(|err| match err {
                RateLimitError::Exceeded { scope, retry_after } => AdmissionError::RateLimited {
                    reason: scope.as_str(),
                    retry_after,
                },
                // quotas are validated in `RateLimiter::new`
                RateLimitError::ConfigError(_) => AdmissionError::RateLimited {
                    reason: "config",
                    retry_after: Duration::ZERO,
                },
            })
    }

    /// Replay check followed by rate policy.
    pub fn admit(
        &self,
        sender: &PublicKey,
        kind: &str,
        nonce: u64,
        timestamp_ms: u64,
        now_ms: u64,
    ) -> Result<(), AdmissionError> {
        self.check_replay(sender, nonce, timestamp_ms, now_ms)?;
        self.check_rate(sender, kind)
    }

    /// Periodic housekeeping; cheap enough to run every few seconds.
    pub fn cleanup(&self) {
        self.blocks.cleanup_expired_blocks();
        self.replay.prune_idle();
        self.rate_limiter
            .cleanup_old_entries(self.config.max_tracked_senders);
    }

    pub fn get_stats(&self) -> SecurityStats {
        SecurityStats {
            tracked_senders: self.replay.tracked_senders(),
            rate_limited_senders: self.rate_limiter.tracked_senders(),
            block_entries: self.blocks.tracked_entries(),
        }
    }
}

fn parse_key(value: &str) -> Result<PublicKey, SecurityError> {
    let normalized = value.trim().trim_start_matches("0x");
    let mut key = [0u8; 32];
    hex::decode_to_slice(normalized, &mut key)
        .map_err(|_| SecurityError::InvalidBlacklistEntry(value.to_string()))?;
    Ok(key)
}

/// Security statistics
#[derive(Debug, Clone, Serialize)]
pub struct SecurityStats {
    pub tracked_senders: usize,
    pub rate_limited_senders: usize,
    pub block_entries: usize,
}
