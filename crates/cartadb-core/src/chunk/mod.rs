//! Chunks: replicated, coordinately written shards of a table.
//!
//! One chunk contract, two coordination protocols. `ChunkRef` dispatches
//! over the legacy distributed-lock variant and the Raft variant so that
//! tables and transactions stay agnostic of the protocol in use.

pub mod legacy;
pub mod lock;
pub mod raft;

use std::collections::BTreeSet;
use std::sync::Arc;

pub use legacy::{ChunkPolicy, LegacyChunk, TriggerCallback};
pub use lock::{DistributedRwLock, LockState};
pub use raft::{RaftChunk, RaftNode, RaftRole};

use crate::container::{HistoryMap, RevisionMap};
use crate::error::Result;
use crate::id::Id;
use crate::net::peer::PeerId;
use crate::revision::Revision;
use crate::time::LogicalTime;

/// Protocol-agnostic handle on one chunk.
#[derive(Clone)]
pub enum ChunkRef {
    Legacy(Arc<LegacyChunk>),
    Raft(Arc<RaftChunk>),
}

impl ChunkRef {
    pub fn id(&self) -> Id {
        match self {
            Self::Legacy(chunk) => chunk.id(),
            Self::Raft(chunk) => chunk.id(),
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Self::Legacy(chunk) => chunk.table(),
            Self::Raft(chunk) => chunk.table(),
        }
    }

    pub fn latest_commit_time(&self) -> LogicalTime {
        match self {
            Self::Legacy(chunk) => chunk.latest_commit_time(),
            Self::Raft(chunk) => chunk.latest_commit_time(),
        }
    }

    // ------------------------------------------------------------------
    // Locking
    // ------------------------------------------------------------------

    pub fn write_lock(&self) -> Result<()> {
        match self {
            Self::Legacy(chunk) => chunk.write_lock(),
            Self::Raft(chunk) => chunk.write_lock(),
        }
    }

    /// Release the write lock. `success` carries the multi-chunk commit
    /// verdict to the Raft hand-off; the legacy protocol ignores it.
    pub fn unlock(&self, success: bool) -> Result<()> {
        match self {
            Self::Legacy(chunk) => chunk.unlock(),
            Self::Raft(chunk) => chunk.unlock(success),
        }
    }

    pub fn is_write_locked(&self) -> bool {
        match self {
            Self::Legacy(chunk) => chunk.is_write_locked(),
            Self::Raft(chunk) => chunk.is_write_locked(),
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get_by_id(&self, id: Id, time: LogicalTime) -> Option<Arc<Revision>> {
        match self {
            Self::Legacy(chunk) => chunk.get_by_id(id, time),
            Self::Raft(chunk) => chunk.get_by_id(id, time),
        }
    }

    pub fn latest_at(&self, id: Id, time: LogicalTime) -> Option<Arc<Revision>> {
        match self {
            Self::Legacy(chunk) => chunk.latest_at(id, time),
            Self::Raft(chunk) => chunk.latest_at(id, time),
        }
    }

    pub fn dump(&self, time: LogicalTime) -> RevisionMap {
        match self {
            Self::Legacy(chunk) => chunk.dump(time),
            Self::Raft(chunk) => chunk.dump(time),
        }
    }

    pub fn get_available_ids(&self, time: LogicalTime) -> Vec<Id> {
        match self {
            Self::Legacy(chunk) => chunk.get_available_ids(time),
            Self::Raft(chunk) => chunk.get_available_ids(time),
        }
    }

    pub fn num_items(&self, time: LogicalTime) -> usize {
        match self {
            Self::Legacy(chunk) => chunk.num_items(time),
            Self::Raft(chunk) => chunk.num_items(time),
        }
    }

    pub fn chunk_history(&self, time: LogicalTime) -> HistoryMap {
        match self {
            Self::Legacy(chunk) => chunk.chunk_history(time),
            Self::Raft(chunk) => chunk.chunk_history(time),
        }
    }

    pub fn item_history(&self, id: Id, time: LogicalTime) -> Vec<Arc<Revision>> {
        match self {
            Self::Legacy(chunk) => chunk.item_history(id, time),
            Self::Raft(chunk) => chunk.item_history(id, time),
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Plain insert outside a transaction.
    pub fn insert(&self, time: LogicalTime, revision: Revision) -> Result<Arc<Revision>> {
        match self {
            Self::Legacy(chunk) => chunk.insert(time, revision),
            Self::Raft(chunk) => chunk.insert(time, revision),
        }
    }

    /// Insert while the caller holds the write lock (commit path).
    pub fn commit_insert(&self, time: LogicalTime, revision: Revision) -> Result<Arc<Revision>> {
        match self {
            Self::Legacy(chunk) => chunk.insert_locked(time, revision),
            Self::Raft(chunk) => chunk.insert(time, revision),
        }
    }

    /// Update while the caller holds the write lock.
    pub fn commit_update(&self, time: LogicalTime, revision: Revision) -> Result<Arc<Revision>> {
        match self {
            Self::Legacy(chunk) => chunk.update_locked(time, revision),
            Self::Raft(chunk) => chunk.update(time, revision),
        }
    }

    /// Remove (tombstone) while the caller holds the write lock.
    pub fn commit_remove(&self, time: LogicalTime, revision: Revision) -> Result<Arc<Revision>> {
        match self {
            Self::Legacy(chunk) => chunk.remove_locked(time, revision),
            Self::Raft(chunk) => chunk.remove(time, revision),
        }
    }

    // ------------------------------------------------------------------
    // Swarm
    // ------------------------------------------------------------------

    /// Offer participation to every candidate not yet in the swarm.
    /// Returns how many candidates ended up participating.
    pub fn request_participation(&self, candidates: &[PeerId]) -> Result<usize> {
        match self {
            Self::Legacy(chunk) => chunk.request_participation(candidates),
            Self::Raft(chunk) => {
                let mut joined = 0;
                for candidate in candidates {
                    if chunk.invite(candidate)? {
                        joined += 1;
                    }
                }
                Ok(joined)
            }
        }
    }

    pub fn leave(&self) -> Result<()> {
        match self {
            Self::Legacy(chunk) => chunk.leave(),
            Self::Raft(chunk) => chunk.leave(),
        }
    }

    pub fn attach_trigger(&self, callback: TriggerCallback) -> usize {
        match self {
            Self::Legacy(chunk) => chunk.attach_trigger(callback),
            Self::Raft(chunk) => chunk.attach_trigger(callback),
        }
    }

    /// The peers currently holding this chunk, self included.
    pub fn participants(&self) -> Vec<PeerId> {
        match self {
            Self::Legacy(chunk) => {
                let mut peers = chunk.peers();
                peers.push(chunk.own_peer().clone());
                peers
            }
            Self::Raft(chunk) => chunk.participants(),
        }
    }

    /// Install a multi-chunk hand-off record on every participant. The
    /// legacy protocol carries its atomicity through the locks alone.
    pub fn send_commit_info(&self, info: &crate::txn::transaction::MultiChunkTransactionInfo) -> bool {
        match self {
            Self::Legacy(_) => true,
            Self::Raft(chunk) => chunk.broadcast_commit_info(info),
        }
    }

    /// Every distinct commit time visible at `sample_time`.
    pub fn get_commit_times(&self, sample_time: LogicalTime) -> BTreeSet<LogicalTime> {
        match self {
            Self::Legacy(chunk) => chunk.get_commit_times(sample_time),
            Self::Raft(chunk) => {
                let mut times = BTreeSet::new();
                for history in chunk.chunk_history(sample_time).values() {
                    for revision in history {
                        times.insert(revision.modification_time());
                    }
                }
                times
            }
        }
    }
}
