//! Configuration for a CartaDB peer.

use serde::{Deserialize, Serialize};

use crate::error::{CartaError, Result};

/// Order in which a write-lock holder releases the per-peer locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnlockStrategy {
    /// Reverse of the lock acquisition order.
    Reverse,
    /// Same as the lock acquisition order. Requires `writelock_persist`.
    Forward,
    /// Randomized. Requires `writelock_persist`.
    Random,
}

/// Configuration for one peer process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartaConfig {
    /// TCP listen address, e.g. "127.0.0.1:7707". Port 0 binds an ephemeral
    /// port (used by tests).
    pub listen_addr: String,
    /// Path of the shared discovery file.
    pub discovery_file: String,
    /// Use the Raft coordination variant instead of the legacy lock.
    pub use_raft: bool,
    /// Lock-release ordering for the legacy coordination.
    pub unlock_strategy: UnlockStrategy,
    /// Retry declined peers individually instead of restarting the whole
    /// lock attempt.
    pub writelock_persist: bool,
    /// Number of hub worker threads serving peer requests.
    pub hub_workers: usize,
    /// Raft election timeout range in milliseconds.
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    /// Raft heartbeat / replication tick in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Chord stabilization interval in milliseconds.
    pub stabilize_interval_ms: u64,
    /// How long a pending multi-chunk hand-off may stay unresolved before a
    /// surviving chunk tries to complete or abort it.
    pub commit_resolve_timeout_ms: u64,
}

impl Default for CartaConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            discovery_file: "/tmp/cartadb-discovery.txt".to_string(),
            use_raft: false,
            unlock_strategy: UnlockStrategy::Reverse,
            writelock_persist: true,
            hub_workers: 4,
            election_timeout_min_ms: 50,
            election_timeout_max_ms: 150,
            heartbeat_interval_ms: 10,
            stabilize_interval_ms: 50,
            commit_resolve_timeout_ms: 5_000,
        }
    }
}

impl CartaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(CartaError::Config("listen_addr must not be empty".into()));
        }
        if self.hub_workers == 0 {
            return Err(CartaError::Config("hub_workers must be > 0".into()));
        }
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err(CartaError::Config(
                "election timeout range must be non-empty".into(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(CartaError::Config("heartbeat_interval_ms must be > 0".into()));
        }
        if !self.writelock_persist && self.unlock_strategy != UnlockStrategy::Reverse {
            return Err(CartaError::Config(
                "forward and random unlock require writelock_persist".into(),
            ));
        }
        Ok(())
    }
}
