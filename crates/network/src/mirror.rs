//! Copy-on-write mirror of the ledger's peer registry.
//!
//! Readers get an `Arc<NetworkSnapshot>` with a single pointer clone and are
//! never blocked by a refresh in progress: the ledger round trip and snapshot
//! construction happen without any lock held, and publication is one pointer
//! swap under a short write lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use neuron_types::{NetworkSnapshot, SnapshotError};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::ledger::{LedgerError, LedgerReader};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("ledger view rejected: {0}")]
    Invalid(#[from] SnapshotError),

    #[error("ledger view at block {received} is older than current block {current}")]
    Regressed { current: u64, received: u64 },
}

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Interval between background refreshes
    pub sync_interval: Duration,
    /// Age after which the snapshot is reported stale
    pub stale_after: Duration,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(12),
            stale_after: Duration::from_secs(120),
        }
    }
}

/// Point-in-time view of the mirror's health.
#[derive(Debug, Clone)]
pub struct MirrorStatus {
    pub snapshot: Arc<NetworkSnapshot>,
    /// Time since the last successful refresh, `None` before the first one.
    pub age: Option<Duration>,
    pub stale: bool,
}

struct Published {
    snapshot: Arc<NetworkSnapshot>,
    fetched_at: Option<Instant>,
}

pub struct SnapshotMirror {
    reader: Arc<dyn LedgerReader>,
    config: MirrorConfig,
    published: RwLock<Published>,
}

impl SnapshotMirror {
    pub fn new(reader: Arc<dyn LedgerReader>, config: MirrorConfig) -> Self {
        Self {
            reader,
            config,
            published: RwLock::new(Published {
                snapshot: Arc::new(NetworkSnapshot::empty()),
                fetched_at: None,
            }),
        }
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    /// Last successfully fetched snapshot; empty at block 0 before the first
    /// successful refresh.
    pub fn current_snapshot(&self) -> Arc<NetworkSnapshot> {
        Arc::clone(&self.published.read().snapshot)
    }

    pub fn status(&self) -> MirrorStatus {
        let published = self.published.read();
        let age = published.fetched_at.map(|at| at.elapsed());
        MirrorStatus {
            snapshot: Arc::clone(&published.snapshot),
            age,
            stale: age.map_or(true, |age| age >= self.config.stale_after),
        }
    }

    pub fn is_stale(&self) -> bool {
        self.status().stale
    }

    /// Fetch and publish a new snapshot. On any failure the previous snapshot
    /// stays authoritative.
    pub async fn refresh(&self) -> Result<Arc<NetworkSnapshot>, SyncError> {
        let result = self.fetch_and_publish().await;
        match &result {
            Ok(snapshot) => {
                counter!("neuron_mirror_refresh_total", "outcome" => "ok").increment(1);
                gauge!("neuron_snapshot_block").set(snapshot.block() as f64);
                gauge!("neuron_snapshot_peers").set(snapshot.len() as f64);
            }
            Err(err) => {
                let outcome = match err {
                    SyncError::Ledger(_) => "ledger_error",
                    SyncError::Invalid(_) => "invalid",
                    SyncError::Regressed { .. } => "regressed",
                };
                counter!("neuron_mirror_refresh_total", "outcome" => outcome).increment(1);
            }
        }
        result
    }

    async fn fetch_and_publish(&self) -> Result<Arc<NetworkSnapshot>, SyncError> {
        let view = self.reader.fetch_view().await?;
        let snapshot = Arc::new(NetworkSnapshot::new(view.block, view.peers)?);

        let mut published = self.published.write();
        let current = published.snapshot.block();
        if snapshot.block() < current {
            return Err(SyncError::Regressed {
                current,
                received: snapshot.block(),
            });
        }
        published.snapshot = Arc::clone(&snapshot);
        published.fetched_at = Some(Instant::now());
        drop(published);

        if !snapshot.displaced().is_empty() {
            debug!(
                displaced = ?snapshot.displaced(),
                "peers lost a contested endpoint"
            );
        }
        debug!(
            block = snapshot.block(),
            peers = snapshot.len(),
            "network snapshot published"
        );
        Ok(snapshot)
    }

    /// Refresh on a fixed interval until `shutdown` flips to `true` or its
    /// sender is dropped.
    pub fn spawn_sync_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = self.config.sync_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = period.as_millis() as u64, "network sync loop started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.refresh().await {
                            let status = self.status();
                            warn!(
                                error = %err,
                                block = status.snapshot.block(),
                                stale = status.stale,
                                "network refresh failed; keeping previous snapshot"
                            );
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("network sync loop stopped");
        })
    }
}
