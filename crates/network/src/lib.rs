//! Neuron network state
//!
//! Keeps an eventually consistent view of the registered peer set.
//!
//! ## Modules
//! - `ledger`: collaborator traits for reading the peer registry and
//!   submitting weights, plus HTTP and in-memory implementations
//! - `mirror`: the periodically refreshed, copy-on-write snapshot

pub mod ledger;
pub mod mirror;

pub use ledger::{HttpLedger, LedgerError, LedgerReader, LedgerView, LedgerWriter, MemoryLedger};
pub use mirror::{MirrorConfig, MirrorStatus, SnapshotMirror, SyncError};
