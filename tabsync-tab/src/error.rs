use std::io;

use tabsync_core::{CoreError, Term, TabId, Version};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broadcast transport unavailable: {0}")]
    Unavailable(String),
    #[error("broadcast transport closed")]
    Closed,
    #[error(transparent)]
    Codec(#[from] CoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read flag {key}: {source}")]
    Read { key: String, source: io::Error },
    #[error("failed to write flag {key}: {source}")]
    Write { key: String, source: io::Error },
    #[error("failed to remove flag {key}: {source}")]
    Remove { key: String, source: io::Error },
    #[error("flag {key} is too large: {size} bytes (max {max})")]
    TooLarge { key: String, size: u64, max: u64 },
    #[error("flag {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("flag store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no master answered a snapshot request after {attempts} attempts")]
    SnapshotTimeout { attempts: u32 },
    #[error("claim for term {term} lost to {winner}")]
    ElectionConflict { term: Term, winner: TabId },
    #[error("delta out of sequence: expected version {expected}, got {got}")]
    StaleDelta { expected: Version, got: Version },
    #[error("tab is inactive; another tab is the active window")]
    TabInactive,
    #[error("no master is known yet")]
    NoMaster,
    #[error("coordinator is not running")]
    Closed,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
