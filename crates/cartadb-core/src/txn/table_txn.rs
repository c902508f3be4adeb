//! Per-table transaction bundles.
//!
//! Routes operations by record id to the right chunk transaction and runs
//! the commit protocol over all participating chunks. Deadlocks are
//! prevented by acquiring chunk write locks in ascending chunk-id order
//! (resource hierarchy).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::chunk::ChunkRef;
use crate::container::RevisionMap;
use crate::error::{CartaError, Result};
use crate::id::Id;
use crate::revision::{AutoMergePolicy, FieldValue, Revision};
use crate::table::net_table::NetTable;
use crate::time::LogicalTime;
use crate::txn::chunk_txn::ChunkTransaction;
use crate::txn::conflict::Conflicts;
use crate::txn::transaction::{MultiChunkParticipant, MultiChunkTransactionInfo};
use crate::txn::view::CommitHistoryView;
use crate::workspace::Workspace;

pub struct NetTableTransaction {
    begin_time: LogicalTime,
    table: Arc<NetTable>,
    workspace: Workspace,
    /// Keyed by chunk id; iteration order is the global lock order.
    chunk_txns: BTreeMap<Id, ChunkTransaction>,
    item_to_chunk: HashMap<Id, Id>,
    finalized: bool,
}

impl NetTableTransaction {
    pub fn new(
        begin_time: LogicalTime,
        table: Arc<NetTable>,
        workspace: Workspace,
        commit_futures: Option<BTreeMap<Id, CommitHistoryView>>,
    ) -> Self {
        let mut transaction = Self {
            begin_time,
            table,
            workspace,
            chunk_txns: BTreeMap::new(),
            item_to_chunk: HashMap::new(),
            finalized: false,
        };
        if let Some(futures) = commit_futures {
            for (chunk_id, future) in futures {
                if let Ok(chunk) = transaction.table.get_chunk(chunk_id) {
                    transaction.chunk_txns.insert(
                        chunk_id,
                        ChunkTransaction::new(
                            begin_time,
                            chunk,
                            transaction.table.template(),
                            Some(future),
                        ),
                    );
                }
            }
        }
        transaction.refresh_id_to_chunk_map();
        transaction
    }

    pub fn begin_time(&self) -> LogicalTime {
        self.begin_time
    }

    pub fn table(&self) -> &Arc<NetTable> {
        &self.table
    }

    pub fn num_changed_items(&self) -> usize {
        self.chunk_txns
            .values()
            .map(ChunkTransaction::num_changed_items)
            .sum()
    }

    pub fn finalize(&mut self) {
        self.finalized = true;
        for transaction in self.chunk_txns.values_mut() {
            transaction.finalize();
        }
    }

    /// Rebuild the item-to-chunk routing map from the workspace's chunks.
    pub fn refresh_id_to_chunk_map(&mut self) {
        assert!(!self.finalized);
        self.item_to_chunk.clear();
        let mut map = HashMap::new();
        let begin_time = self.begin_time;
        let workspace = self.workspace.clone();
        let table_name = self.table.name().to_string();
        self.table.for_each_chunk(|chunk| {
            if !workspace.contains_chunk(&table_name, chunk.id()) {
                return;
            }
            for item_id in chunk.get_available_ids(begin_time) {
                let previous = map.insert(item_id, chunk.id());
                assert!(
                    previous.is_none(),
                    "table {table_name} has redundant item id {item_id}"
                );
            }
        });
        self.item_to_chunk = map;
    }

    fn transaction_of(&mut self, chunk: &ChunkRef) -> &mut ChunkTransaction {
        let template = self.table.template();
        let begin_time = self.begin_time;
        let finalized = self.finalized;
        self.chunk_txns.entry(chunk.id()).or_insert_with(|| {
            assert!(!finalized, "new chunk transaction in finalized bundle");
            ChunkTransaction::new(begin_time, chunk.clone(), template, None)
        })
    }

    /// The chunk that holds `revision`, joining on demand through the ring
    /// when it is not active locally.
    fn chunk_of(&mut self, revision: &Revision) -> Result<ChunkRef> {
        if revision.chunk_id().is_valid() {
            return self.table.get_chunk(revision.chunk_id());
        }
        let chunk_id = self
            .item_to_chunk
            .get(&revision.id())
            .copied()
            .ok_or_else(|| CartaError::NotFound(format!("id {}", revision.id())))?;
        self.table.get_chunk(chunk_id)
    }

    // ==================================================================
    // Reads
    // ==================================================================

    pub fn get_by_id(&mut self, id: Id) -> Option<Arc<Revision>> {
        // Staged state first.
        for transaction in self.chunk_txns.values() {
            if let Some(revision) = transaction.get_by_id(id) {
                return Some(revision);
            }
        }
        let chunk_id = self.item_to_chunk.get(&id).copied()?;
        let chunk = self.table.get_chunk(chunk_id).ok()?;
        self.transaction_of(&chunk).get_by_id(id)
    }

    pub fn find_unique(&mut self, field: &str, value: &FieldValue) -> Option<Arc<Revision>> {
        self.dump_active_chunks()
            .into_values()
            .find(|revision| revision.verify_equal(field, value))
    }

    pub fn dump_chunk(&self, chunk: &ChunkRef) -> RevisionMap {
        if !self
            .workspace
            .contains_chunk(self.table.name(), chunk.id())
        {
            return RevisionMap::new();
        }
        match self.chunk_txns.get(&chunk.id()) {
            Some(transaction) => transaction.dump(),
            None => chunk.dump(self.begin_time),
        }
    }

    pub fn dump_active_chunks(&self) -> RevisionMap {
        let mut result = RevisionMap::new();
        let mut chunks: Vec<ChunkRef> = Vec::new();
        self.table.for_each_chunk(|chunk| chunks.push(chunk.clone()));
        for chunk in chunks {
            result.extend(self.dump_chunk(&chunk));
        }
        result
    }

    pub fn get_available_ids(&self) -> Vec<Id> {
        self.dump_active_chunks().into_keys().collect()
    }

    // ==================================================================
    // Writes
    // ==================================================================

    pub fn insert(&mut self, chunk: &ChunkRef, revision: Revision) -> Result<()> {
        assert!(!self.finalized);
        let id = revision.id();
        self.transaction_of(chunk).insert(revision)?;
        let previous = self.item_to_chunk.insert(id, chunk.id());
        if let Some(previous) = previous {
            if previous != chunk.id() {
                return Err(CartaError::Invariant(format!(
                    "id {id} inserted into chunk {} but already mapped to {previous}",
                    chunk.id()
                )));
            }
        }
        Ok(())
    }

    pub fn update(&mut self, revision: Revision) -> Result<()> {
        assert!(!self.finalized);
        if !revision.id().is_valid() {
            return Err(CartaError::Invariant("update with invalid id".into()));
        }
        let chunk = self.chunk_of(&revision)?;
        if revision.chunk_id().is_valid() && revision.chunk_id() != chunk.id() {
            return Err(CartaError::Invariant(format!(
                "revision {} bound to chunk {} routed to {}",
                revision.id(),
                revision.chunk_id(),
                chunk.id()
            )));
        }
        self.transaction_of(&chunk).update(revision)
    }

    pub fn remove(&mut self, revision: Revision) -> Result<()> {
        assert!(!self.finalized);
        let chunk = self.chunk_of(&revision)?;
        self.transaction_of(&chunk).remove(revision)
    }

    pub fn add_conflict_condition(
        &mut self,
        chunk: &ChunkRef,
        field: impl Into<String>,
        value: FieldValue,
    ) {
        self.transaction_of(chunk).add_conflict_condition(field, value);
    }

    // ==================================================================
    // Commit protocol
    // ==================================================================

    /// Acquire the write locks of every participating chunk, ascending by
    /// chunk id.
    pub fn lock(&self) -> Result<()> {
        for transaction in self.chunk_txns.values() {
            transaction.chunk().write_lock()?;
        }
        Ok(())
    }

    pub fn unlock(&self, success: bool) {
        for transaction in self.chunk_txns.values() {
            if let Err(e) = transaction.chunk().unlock(success) {
                debug!("unlock of chunk {} failed: {e}", transaction.chunk().id());
            }
        }
    }

    pub fn check(&self) -> Conflicts {
        let mut conflicts = Conflicts::new();
        for transaction in self.chunk_txns.values() {
            conflicts.extend(transaction.check());
        }
        conflicts
    }

    pub fn checked_commit(&mut self, commit_time: LogicalTime) -> Result<()> {
        for transaction in self.chunk_txns.values_mut() {
            transaction.checked_commit(commit_time)?;
        }
        self.finalized = true;
        Ok(())
    }

    /// Lock, check, apply, unlock over all chunks of this table. Any check
    /// failure rolls everything back.
    pub fn commit(&mut self) -> Result<LogicalTime> {
        self.lock()?;
        let conflicts = self.check();
        if !conflicts.is_empty() {
            self.unlock(false);
            return Err(CartaError::Conflict(
                conflicts.iter().map(|conflict| conflict.ours.id()).collect(),
            ));
        }
        let commit_time = LogicalTime::sample();
        let applied = self.checked_commit(commit_time);
        self.unlock(applied.is_ok());
        applied.map(|_| commit_time)
    }

    // ==================================================================
    // Pipelining, merging, tracking
    // ==================================================================

    /// Per-chunk commit futures seeding a follow-up transaction.
    pub fn build_commit_futures(&self) -> BTreeMap<Id, CommitHistoryView> {
        self.chunk_txns
            .iter()
            .map(|(chunk_id, transaction)| (*chunk_id, transaction.commit_future()))
            .collect()
    }

    pub fn merge(
        &self,
        target: &mut NetTableTransaction,
        policies: &[AutoMergePolicy],
        conflicts: &mut Conflicts,
    ) {
        for (chunk_id, transaction) in &self.chunk_txns {
            let Ok(chunk) = self.table.get_chunk(*chunk_id) else {
                continue;
            };
            let merge_target = target.transaction_of(&chunk);
            let mut sub_conflicts = Conflicts::new();
            transaction.merge(merge_target, policies, &mut sub_conflicts);
            conflicts.append(&mut sub_conflicts);
        }
        target
            .chunk_txns
            .retain(|_, transaction| transaction.num_changed_items() > 0);
    }

    /// `(tracker table, tracker id, written chunk id)` triples for the
    /// chunk-tracker push, derived from the table's registered determiners
    /// and the per-transaction overrides.
    pub fn collect_chunk_trackers(
        &self,
        overrides: &HashMap<String, Id>,
    ) -> Vec<(String, Id, Id)> {
        let determiners = self.table.chunk_trackers();
        if determiners.is_empty() && overrides.is_empty() {
            return Vec::new();
        }
        let mut triples = Vec::new();
        for (chunk_id, transaction) in &self.chunk_txns {
            if transaction.num_changed_items() == 0 {
                continue;
            }
            let staged: Vec<&Revision> = transaction
                .delta()
                .insertions()
                .values()
                .chain(transaction.delta().updates().values())
                .collect();
            for (tracker_table, determiner) in &determiners {
                let tracker_id = overrides.get(tracker_table).copied();
                for revision in &staged {
                    let tracker = tracker_id.unwrap_or_else(|| determiner(*revision));
                    if tracker.is_valid() {
                        triples.push((tracker_table.clone(), tracker, *chunk_id));
                    }
                }
            }
        }
        triples.sort();
        triples.dedup();
        triples
    }

    /// Register this table's participating chunks in the hand-off record.
    pub fn fill_commit_info(&self, info: &mut MultiChunkTransactionInfo) {
        for (chunk_id, transaction) in &self.chunk_txns {
            if transaction.num_changed_items() == 0 {
                continue;
            }
            info.participants.push(MultiChunkParticipant {
                table: self.table.name().to_string(),
                chunk_id: *chunk_id,
                peers: transaction.chunk().participants(),
            });
        }
    }

    /// Broadcast the hand-off record to every participating chunk's
    /// members. Must run under the locks.
    pub fn send_commit_info(&self, info: &MultiChunkTransactionInfo) -> bool {
        for transaction in self.chunk_txns.values() {
            if transaction.num_changed_items() == 0 {
                continue;
            }
            if !transaction.chunk().send_commit_info(info) {
                return false;
            }
        }
        true
    }
}
