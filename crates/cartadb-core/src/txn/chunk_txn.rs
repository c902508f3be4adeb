//! Single-chunk transactions.
//!
//! Stages inserts, updates and removes against one chunk, checks them for
//! optimistic-concurrency violations under the chunk's write lock, and
//! applies them through the chunk's coordination layer.

use std::collections::HashMap;
use std::sync::Arc;

use crate::chunk::ChunkRef;
use crate::container::RevisionMap;
use crate::error::{CartaError, Result};
use crate::id::Id;
use crate::revision::{AutoMergePolicy, FieldValue, Revision};
use crate::time::LogicalTime;
use crate::txn::conflict::{Conflict, Conflicts};
use crate::txn::view::{ChunkView, CommitHistoryView, DeltaEntry, DeltaView};

/// A conflict predicate: commit fails if a record matching `field == value`
/// appears in the chunk after the transaction began.
#[derive(Debug, Clone)]
pub struct ConflictCondition {
    pub field: String,
    pub value: FieldValue,
}

pub struct ChunkTransaction {
    begin_time: LogicalTime,
    chunk: ChunkRef,
    structure_reference: Revision,
    delta: DeltaView,
    commit_history: CommitHistoryView,
    chunk_view: ChunkView,
    conflict_conditions: Vec<ConflictCondition>,
    finalized: bool,
}

impl ChunkTransaction {
    /// `seed_history` carries commits of earlier transactions in the same
    /// pipeline that may not be observable in the chunk yet.
    pub fn new(
        begin_time: LogicalTime,
        chunk: ChunkRef,
        structure_reference: Revision,
        seed_history: Option<CommitHistoryView>,
    ) -> Self {
        let chunk_view = ChunkView::new(chunk.clone(), begin_time);
        Self {
            begin_time,
            chunk,
            structure_reference,
            delta: DeltaView::default(),
            commit_history: seed_history.unwrap_or_default(),
            chunk_view,
            conflict_conditions: Vec::new(),
            finalized: false,
        }
    }

    pub fn begin_time(&self) -> LogicalTime {
        self.begin_time
    }

    pub fn chunk(&self) -> &ChunkRef {
        &self.chunk
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    pub fn num_changed_items(&self) -> usize {
        self.delta.num_changes()
    }

    pub fn delta(&self) -> &DeltaView {
        &self.delta
    }

    /// Build the commit-history view a follow-up transaction should be
    /// seeded with: our history plus everything we are about to commit.
    pub fn commit_future(&self) -> CommitHistoryView {
        let mut future = self.commit_history.clone();
        for revision in self.delta.insertions().values() {
            future.record(Arc::new(revision.clone()));
        }
        for revision in self.delta.updates().values() {
            future.record(Arc::new(revision.clone()));
        }
        for revision in self.delta.removes().values() {
            let mut tombstone = revision.clone();
            tombstone.set_removed();
            future.record(Arc::new(tombstone));
        }
        future
    }

    // ==================================================================
    // Reads: delta, then commit history, then chunk
    // ==================================================================

    pub fn get_by_id(&self, id: Id) -> Option<Arc<Revision>> {
        match self.delta.lookup(id) {
            DeltaEntry::Removed => None,
            DeltaEntry::Inserted(revision) | DeltaEntry::Updated(revision) => {
                Some(Arc::new(revision.clone()))
            }
            DeltaEntry::Untouched => match self.commit_history.get(id) {
                Some(revision) if revision.is_removed() => None,
                Some(revision) => Some(Arc::clone(revision)),
                None => self.chunk_view.get(id),
            },
        }
    }

    /// First record whose `field` equals `value`, delta first.
    pub fn find_unique(&self, field: &str, value: &FieldValue) -> Option<Arc<Revision>> {
        self.dump()
            .into_values()
            .find(|revision| revision.verify_equal(field, value))
    }

    pub fn dump(&self) -> RevisionMap {
        let mut result = self.chunk_view.dump();
        for (id, revision) in self.commit_history.iter() {
            if revision.is_removed() {
                result.remove(id);
            } else {
                result.insert(*id, Arc::clone(revision));
            }
        }
        self.delta.apply_to(&mut result);
        result
    }

    pub fn get_available_ids(&self) -> Vec<Id> {
        self.dump().into_keys().collect()
    }

    // ==================================================================
    // Writes
    // ==================================================================

    pub fn insert(&mut self, mut revision: Revision) -> Result<()> {
        assert!(!self.finalized, "write into finalized transaction");
        if !revision.id().is_valid() {
            return Err(CartaError::Invariant("insert with invalid id".into()));
        }
        if revision.chunk_id().is_valid() && revision.chunk_id() != self.chunk.id() {
            return Err(CartaError::Invariant(format!(
                "insert of revision bound to chunk {} into chunk {}",
                revision.chunk_id(),
                self.chunk.id()
            )));
        }
        if !revision.structure_match(&self.structure_reference) {
            return Err(CartaError::Invariant(format!(
                "revision structure does not match table schema for {}",
                revision.id()
            )));
        }
        if self.get_by_id(revision.id()).is_some() {
            return Err(CartaError::Invariant(format!(
                "insert of existing id {}",
                revision.id()
            )));
        }
        revision.set_chunk_id(self.chunk.id());
        self.delta.stage_insert(revision);
        Ok(())
    }

    pub fn update(&mut self, mut revision: Revision) -> Result<()> {
        assert!(!self.finalized, "write into finalized transaction");
        if self.get_by_id(revision.id()).is_none() {
            return Err(CartaError::NotFound(format!(
                "update of unknown id {}",
                revision.id()
            )));
        }
        revision.set_chunk_id(self.chunk.id());
        self.delta.stage_update(revision);
        Ok(())
    }

    pub fn remove(&mut self, mut revision: Revision) -> Result<()> {
        assert!(!self.finalized, "write into finalized transaction");
        if self.get_by_id(revision.id()).is_none() {
            return Err(CartaError::NotFound(format!(
                "remove of unknown id {}",
                revision.id()
            )));
        }
        revision.set_chunk_id(self.chunk.id());
        self.delta.stage_remove(revision);
        Ok(())
    }

    pub fn add_conflict_condition(&mut self, field: impl Into<String>, value: FieldValue) {
        assert!(!self.finalized, "conflict condition on finalized transaction");
        self.conflict_conditions.push(ConflictCondition {
            field: field.into(),
            value,
        });
    }

    // ==================================================================
    // Commit
    // ==================================================================

    /// Verify under the chunk's write lock that no concurrent writer
    /// invalidated this transaction. Returns the offending records.
    pub fn check(&self) -> Conflicts {
        debug_assert!(self.chunk.is_write_locked(), "check without write lock");
        let mut conflicts = Conflicts::new();
        let now = LogicalTime::sample();
        let own_updates: HashMap<Id, LogicalTime> = self.commit_history.own_update_times();
        let foreign = self.chunk_view.get_potential_conflicts(&own_updates);

        for revision in self.delta.insertions().values() {
            // A fresh id must still be fresh at commit time.
            if self.chunk.latest_at(revision.id(), now).is_some() {
                conflicts.push(Conflict {
                    ours: revision.clone(),
                    theirs: self.chunk.latest_at(revision.id(), now),
                });
            }
        }
        for revision in self
            .delta
            .updates()
            .values()
            .chain(self.delta.removes().values())
        {
            if foreign.contains_key(&revision.id()) {
                conflicts.push(Conflict {
                    ours: revision.clone(),
                    theirs: self.chunk.latest_at(revision.id(), now),
                });
            }
        }
        for condition in &self.conflict_conditions {
            for (id, revision) in self.chunk.dump(now) {
                if !revision.verify_equal(&condition.field, &condition.value) {
                    continue;
                }
                // Matches that already existed at begin time are fine.
                let matched_before = self
                    .chunk
                    .get_by_id(id, self.begin_time)
                    .map(|earlier| earlier.verify_equal(&condition.field, &condition.value))
                    .unwrap_or(false);
                if !matched_before {
                    conflicts.push(Conflict {
                        ours: (*revision).clone(),
                        theirs: Some(revision),
                    });
                }
            }
        }
        conflicts
    }

    /// Apply the staged delta through the chunk at `commit_time`. The
    /// caller holds the write lock and has run `check`.
    pub fn checked_commit(&mut self, commit_time: LogicalTime) -> Result<()> {
        debug_assert!(self.chunk.is_write_locked(), "commit without write lock");
        for revision in self.delta.insertions().values() {
            self.chunk.commit_insert(commit_time, revision.clone())?;
        }
        for revision in self.delta.updates().values() {
            self.chunk.commit_update(commit_time, revision.clone())?;
        }
        for revision in self.delta.removes().values() {
            self.chunk.commit_remove(commit_time, revision.clone())?;
        }
        self.finalize();
        Ok(())
    }

    /// Single-chunk commit: lock, check, apply, unlock.
    pub fn commit(&mut self) -> Result<LogicalTime> {
        self.chunk.write_lock()?;
        let conflicts = self.check();
        if !conflicts.is_empty() {
            self.chunk.unlock(false)?;
            return Err(CartaError::Conflict(
                conflicts.iter().map(|conflict| conflict.ours.id()).collect(),
            ));
        }
        let commit_time = LogicalTime::sample();
        let applied = self.checked_commit(commit_time);
        self.chunk.unlock(applied.is_ok())?;
        applied.map(|_| commit_time)
    }

    // ==================================================================
    // Merge
    // ==================================================================

    /// Re-stage every non-conflicting change into `target` (a transaction
    /// begun at a later time); conflicting changes are auto-merged where
    /// the policies allow and reported otherwise. Incompatible with
    /// conflict conditions.
    pub fn merge(
        &self,
        target: &mut ChunkTransaction,
        policies: &[AutoMergePolicy],
        conflicts: &mut Conflicts,
    ) {
        assert!(
            self.conflict_conditions.is_empty(),
            "merge is incompatible with conflict conditions"
        );
        let now = LogicalTime::sample();
        for revision in self.delta.insertions().values() {
            // Insertions cannot conflict unless the id appeared meanwhile.
            if self.chunk.latest_at(revision.id(), now).is_none() {
                target.delta.stage_insert(revision.clone());
            } else {
                conflicts.push(Conflict {
                    ours: revision.clone(),
                    theirs: self.chunk.latest_at(revision.id(), now),
                });
            }
        }
        for (staged, remove) in self
            .delta
            .updates()
            .values()
            .map(|revision| (revision, false))
            .chain(self.delta.removes().values().map(|revision| (revision, true)))
        {
            let current = self.chunk.latest_at(staged.id(), now);
            let conflicting = current
                .as_ref()
                .map(|revision| revision.modification_time() > self.begin_time)
                .unwrap_or(false);
            if !conflicting {
                if remove {
                    target.delta.stage_remove(staged.clone());
                } else {
                    target.delta.stage_update(staged.clone());
                }
                continue;
            }
            let theirs = current.expect("conflicting implies present");
            let original = self.chunk_view.get(staged.id());
            let mut merged = staged.clone();
            let auto_merged = match (&original, remove) {
                (Some(original), false) => merged.try_auto_merge(&theirs, original, policies),
                _ => false,
            };
            if auto_merged {
                target.delta.stage_update(merged);
            } else {
                conflicts.push(Conflict {
                    ours: staged.clone(),
                    theirs: Some(theirs),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkPolicy, ChunkRef, LegacyChunk};
    use crate::config::UnlockStrategy;
    use crate::net::hub::PeerHub;
    use crate::schema::{FieldKind, TableDescriptor};

    fn descriptor() -> TableDescriptor {
        TableDescriptor::new("poses").add_field("n", FieldKind::Int)
    }

    fn chunk_fixture() -> (Arc<PeerHub>, ChunkRef) {
        let hub = PeerHub::bind("127.0.0.1:0", 1).unwrap();
        let chunk = LegacyChunk::new_bootstrap(
            Id::generate(),
            "poses",
            &descriptor(),
            Arc::clone(&hub),
            ChunkPolicy {
                unlock_strategy: UnlockStrategy::Reverse,
                writelock_persist: true,
            },
        )
        .unwrap();
        (hub, ChunkRef::Legacy(chunk))
    }

    fn txn(chunk: &ChunkRef) -> ChunkTransaction {
        ChunkTransaction::new(
            LogicalTime::sample(),
            chunk.clone(),
            descriptor().template(Id::default()),
            None,
        )
    }

    fn record(n: i64) -> Revision {
        let mut revision = Revision::new(Id::generate());
        revision.set("n", FieldValue::Int(n));
        revision
    }

    #[test]
    fn test_insert_commit_read() {
        let (hub, chunk) = chunk_fixture();
        let mut transaction = txn(&chunk);
        let staged = record(42);
        let id = staged.id();
        transaction.insert(staged).unwrap();
        assert_eq!(transaction.num_changed_items(), 1);
        transaction.commit().unwrap();

        let read = chunk.get_by_id(id, LogicalTime::sample()).unwrap();
        assert_eq!(read.get("n"), Some(&FieldValue::Int(42)));
        hub.shutdown();
    }

    #[test]
    fn test_delta_read_precedence() {
        let (hub, chunk) = chunk_fixture();
        let committed = chunk.insert(LogicalTime::sample(), record(1)).unwrap();

        let mut transaction = txn(&chunk);
        let mut staged = committed.copy_for_write();
        staged.set("n", FieldValue::Int(2));
        transaction.update(staged).unwrap();

        let read = transaction.get_by_id(committed.id()).unwrap();
        assert_eq!(read.get("n"), Some(&FieldValue::Int(2)));
        // The chunk itself still shows the committed value.
        let chunk_read = chunk.get_by_id(committed.id(), LogicalTime::sample()).unwrap();
        assert_eq!(chunk_read.get("n"), Some(&FieldValue::Int(1)));
        hub.shutdown();
    }

    #[test]
    fn test_concurrent_update_conflicts() {
        let (hub, chunk) = chunk_fixture();
        let committed = chunk.insert(LogicalTime::sample(), record(1)).unwrap();

        // Both transactions read the record at their begin time.
        let mut loser = txn(&chunk);
        let mut winner = txn(&chunk);

        let mut ours = committed.copy_for_write();
        ours.set("n", FieldValue::Int(8));
        winner.update(ours.clone()).unwrap();
        winner.commit().unwrap();

        ours.set("n", FieldValue::Int(9));
        loser.update(ours).unwrap();
        match loser.commit() {
            Err(CartaError::Conflict(ids)) => assert_eq!(ids, vec![committed.id()]),
            other => panic!("expected conflict, got {other:?}"),
        }
        hub.shutdown();
    }

    #[test]
    fn test_update_of_unknown_id_rejected() {
        let (hub, chunk) = chunk_fixture();
        let mut transaction = txn(&chunk);
        assert!(matches!(
            transaction.update(record(1)),
            Err(CartaError::NotFound(_))
        ));
        hub.shutdown();
    }

    #[test]
    fn test_conflict_condition_detects_new_match() {
        let (hub, chunk) = chunk_fixture();
        let mut transaction = txn(&chunk);
        transaction.insert(record(1)).unwrap();
        transaction.add_conflict_condition("n", FieldValue::Int(99));

        // Concurrent writer creates a matching record after begin time.
        chunk.insert(LogicalTime::sample(), record(99)).unwrap();

        assert!(matches!(transaction.commit(), Err(CartaError::Conflict(_))));
        hub.shutdown();
    }

    #[test]
    fn test_conflict_condition_ignores_preexisting_match() {
        let (hub, chunk) = chunk_fixture();
        chunk.insert(LogicalTime::sample(), record(99)).unwrap();

        let mut transaction = txn(&chunk);
        transaction.insert(record(1)).unwrap();
        transaction.add_conflict_condition("n", FieldValue::Int(99));
        assert!(transaction.commit().is_ok());
        hub.shutdown();
    }

    #[test]
    fn test_remove_produces_tombstone() {
        let (hub, chunk) = chunk_fixture();
        let committed = chunk.insert(LogicalTime::sample(), record(1)).unwrap();

        let mut transaction = txn(&chunk);
        transaction.remove((*committed).clone()).unwrap();
        transaction.commit().unwrap();

        assert!(chunk.get_by_id(committed.id(), LogicalTime::sample()).is_none());
        assert!(chunk
            .latest_at(committed.id(), LogicalTime::sample())
            .unwrap()
            .is_removed());
        hub.shutdown();
    }

    #[test]
    fn test_commit_future_seeds_pipelined_transaction() {
        let (hub, chunk) = chunk_fixture();
        let mut first = txn(&chunk);
        let staged = record(7);
        let id = staged.id();
        first.insert(staged).unwrap();
        let future = first.commit_future();

        let second = ChunkTransaction::new(
            LogicalTime::sample(),
            chunk.clone(),
            descriptor().template(Id::default()),
            Some(future),
        );
        // The second transaction sees the uncommitted insert of the first.
        assert!(second.get_by_id(id).is_some());
        hub.shutdown();
    }

    #[test]
    fn test_merge_restages_nonconflicting_changes() {
        let (hub, chunk) = chunk_fixture();
        let committed = chunk.insert(LogicalTime::sample(), record(1)).unwrap();

        let mut stale = txn(&chunk);
        let mut ours = committed.copy_for_write();
        ours.set("n", FieldValue::Int(5));
        stale.update(ours).unwrap();

        let mut fresh = txn(&chunk);
        let mut conflicts = Conflicts::new();
        stale.merge(&mut fresh, &[], &mut conflicts);
        assert!(conflicts.is_empty());
        assert_eq!(fresh.num_changed_items(), 1);
        assert!(fresh.commit().is_ok());
        hub.shutdown();
    }

    #[test]
    fn test_merge_reports_true_conflicts() {
        let (hub, chunk) = chunk_fixture();
        let committed = chunk.insert(LogicalTime::sample(), record(1)).unwrap();

        let mut stale = txn(&chunk);
        let mut ours = committed.copy_for_write();
        ours.set("n", FieldValue::Int(5));
        stale.update(ours).unwrap();

        // A concurrent writer changes the same field.
        let mut theirs = committed.copy_for_write();
        theirs.set("n", FieldValue::Int(6));
        chunk.write_lock().unwrap();
        chunk.commit_update(LogicalTime::sample(), theirs).unwrap();
        chunk.unlock(true).unwrap();

        let mut fresh = txn(&chunk);
        let mut conflicts = Conflicts::new();
        stale.merge(&mut fresh, &[], &mut conflicts);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(fresh.num_changed_items(), 0);
        assert_eq!(
            stale.num_changed_items(),
            fresh.num_changed_items() + conflicts.len()
        );
        hub.shutdown();
    }
}
