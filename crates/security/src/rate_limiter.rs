use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorRateLimiter};
use neuron_types::PublicKey;
use serde::{Deserialize, Serialize};

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests per second per sender
    pub requests_per_second: u32,
    /// Burst capacity per sender
    pub burst_capacity: u32,
    /// Per-request-kind limits, applied per sender on top of the general one
    pub kind_limits: HashMap<String, KindLimit>,
    /// Global rate limit (requests per second for all senders combined)
    pub global_requests_per_second: Option<u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut kind_limits = HashMap::new();

        // Generation challenges are expensive for the miner
        kind_limits.insert(
            "optimize".to_string(),
            KindLimit {
                requests_per_second: 2,
                burst_capacity: 10,
            },
        );

        Self {
            requests_per_second: 20,
            burst_capacity: 40,
            kind_limits,
            global_requests_per_second: Some(1000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindLimit {
    pub requests_per_second: u32,
    pub burst_capacity: u32,
}

/// Which limit rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    Sender,
    Kind,
    Global,
}

impl LimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitScope::Sender => "sender",
            LimitScope::Kind => "kind",
            LimitScope::Global => "global",
        }
    }
}

/// Rate limiting errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("{} rate limit exceeded, retry after {retry_after:?}", scope.as_str())]
    Exceeded {
        scope: LimitScope,
        retry_after: Duration,
    },
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

fn quota(requests_per_second: u32, burst_capacity: u32, label: &str) -> Result<Quota, RateLimitError> {
    let rate = NonZeroU32::new(requests_per_second)
        .ok_or_else(|| RateLimitError::ConfigError(format!("{label}: requests_per_second must be > 0")))?;
    let burst = NonZeroU32::new(burst_capacity)
        .ok_or_else(|| RateLimitError::ConfigError(format!("{label}: burst_capacity must be > 0")))?;
    Ok(Quota::per_second(rate).allow_burst(burst))
}

fn check(limiter: &DefaultDirectRateLimiter, scope: LimitScope) -> Result<(), RateLimitError> {
    limiter.check().map_err(|not_until| RateLimitError::Exceeded {
        scope,
        retry_after: not_until.wait_time_from(DefaultClock::default().now()),
    })
}

/// Token-bucket limits keyed by sender public key.
pub struct RateLimiter {
    sender_quota: Quota,
    kind_quotas: HashMap<String, Quota>,
    sender_limiters: DashMap<PublicKey, Arc<DefaultDirectRateLimiter>>,
    kind_limiters: DashMap<(PublicKey, String), Arc<DefaultDirectRateLimiter>>,
    global_limiter: Option<DefaultDirectRateLimiter>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self, RateLimitError> {
        let sender_quota = quota(config.requests_per_second, config.burst_capacity, "sender")?;
        let kind_quotas = config
            .kind_limits
            .iter()
            .map(|(kind, limit)| {
                quota(limit.requests_per_second, limit.burst_capacity, kind)
                    .map(|quota| (kind.clone(), quota))
            })
            .collect::<Result<HashMap<_, _>, _>>()?;
        let global_limiter = match config.global_requests_per_second {
            Some(rps) => {
                let rate = NonZeroU32::new(rps).ok_or_else(|| {
                    RateLimitError::ConfigError("global_requests_per_second must be > 0".into())
                })?;
                Some(GovernorRateLimiter::direct(Quota::per_second(rate)))
            }
            None => None,
        };

        Ok(Self {
            sender_quota,
            kind_quotas,
            sender_limiters: DashMap::new(),
            kind_limiters: DashMap::new(),
            global_limiter,
        })
    }

    /// Consume one request from every limit that applies to `sender` and
    /// `kind`.
    pub fn check_rate_limit(&self, sender: &PublicKey, kind: &str) -> Result<(), RateLimitError> {
        // Check global rate limit first
        if let Some(global_limiter) = &self.global_limiter {
            check(global_limiter, LimitScope::Global)?;
        }

        if let Some(kind_quota) = self.kind_quotas.get(kind) {
            let limiter = self
                .kind_limiters
                .entry((*sender, kind.to_string()))
                .or_insert_with(|| Arc::new(GovernorRateLimiter::direct(*kind_quota)))
                .clone();
            check(&limiter, LimitScope::Kind)?;
        }

        let limiter = self
            .sender_limiters
            .entry(*sender)
            .or_insert_with(|| Arc::new(GovernorRateLimiter::direct(self.sender_quota)))
            .clone();
        check(&limiter, LimitScope::Sender)
    }

    pub fn tracked_senders(&self) -> usize {
        self.sender_limiters.len()
    }

    /// Drop per-sender buckets once more than `max_entries` are tracked. A
    /// dropped bucket restarts full, so this only ever loosens a limit.
    pub fn cleanup_old_entries(&self, max_entries: usize) {
        if self.sender_limiters.len() > max_entries {
            let excess = self.sender_limiters.len() - max_entries;
            let victims: Vec<PublicKey> = self
                .sender_limiters
                .iter()
                .take(excess)
                .map(|entry| *entry.key())
                .collect();
            for key in victims {
                self.sender_limiters.remove(&key);
                self.kind_limiters.retain(|(sender, _), _| sender != &key);
            }
        }
    }
}
