//! Stacked read views of a chunk transaction.
//!
//! Lookups cascade delta -> commit history -> chunk, with tombstone
//! filtering at the dump level. The views are an explicit pipeline rather
//! than an inheritance tree.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::chunk::ChunkRef;
use crate::container::RevisionMap;
use crate::id::Id;
use crate::revision::Revision;
use crate::time::LogicalTime;

/// The chunk's committed state as of the transaction's begin time.
pub struct ChunkView {
    chunk: ChunkRef,
    view_time: LogicalTime,
}

impl ChunkView {
    pub fn new(chunk: ChunkRef, view_time: LogicalTime) -> Self {
        Self { chunk, view_time }
    }

    pub fn has(&self, id: Id) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: Id) -> Option<Arc<Revision>> {
        self.chunk.get_by_id(id, self.view_time)
    }

    pub fn dump(&self) -> RevisionMap {
        self.chunk.dump(self.view_time)
    }

    pub fn available_ids(&self) -> Vec<Id> {
        self.chunk.get_available_ids(self.view_time)
    }

    /// Items updated after the view time, excluding updates this
    /// transaction tree committed itself. Input and output map id to the
    /// latest own/foreign update time respectively.
    pub fn get_potential_conflicts(
        &self,
        own_continuous_updates: &HashMap<Id, LogicalTime>,
    ) -> HashMap<Id, LogicalTime> {
        let mut result = HashMap::new();
        let now = LogicalTime::sample();
        for (id, history) in self.chunk.chunk_history(now) {
            let Some(latest) = history.last() else {
                continue;
            };
            let update_time = latest.modification_time();
            if update_time <= self.view_time {
                continue;
            }
            if let Some(own_time) = own_continuous_updates.get(&id) {
                if update_time <= *own_time {
                    continue;
                }
            }
            result.insert(id, update_time);
        }
        result
    }
}

/// Entries this transaction tree committed earlier but has not necessarily
/// observed in the chunk yet (pipelined commits).
#[derive(Default, Clone)]
pub struct CommitHistoryView {
    history: BTreeMap<Id, Arc<Revision>>,
}

impl CommitHistoryView {
    pub fn new(history: BTreeMap<Id, Arc<Revision>>) -> Self {
        Self { history }
    }

    pub fn has(&self, id: Id) -> bool {
        self.history.contains_key(&id)
    }

    /// Latest own commit for `id`, tombstones included.
    pub fn get(&self, id: Id) -> Option<&Arc<Revision>> {
        self.history.get(&id)
    }

    pub fn own_update_times(&self) -> HashMap<Id, LogicalTime> {
        self.history
            .iter()
            .map(|(id, revision)| (*id, revision.modification_time()))
            .collect()
    }

    pub fn record(&mut self, revision: Arc<Revision>) {
        self.history.insert(revision.id(), revision);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Id, &Arc<Revision>)> {
        self.history.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

/// This transaction's staged mutations, the topmost view.
#[derive(Default)]
pub struct DeltaView {
    insertions: BTreeMap<Id, Revision>,
    updates: BTreeMap<Id, Revision>,
    removes: BTreeMap<Id, Revision>,
}

/// What the delta says about one id.
pub enum DeltaEntry<'a> {
    Inserted(&'a Revision),
    Updated(&'a Revision),
    Removed,
    Untouched,
}

impl DeltaView {
    pub fn lookup(&self, id: Id) -> DeltaEntry<'_> {
        if self.removes.contains_key(&id) {
            return DeltaEntry::Removed;
        }
        if let Some(revision) = self.updates.get(&id) {
            return DeltaEntry::Updated(revision);
        }
        if let Some(revision) = self.insertions.get(&id) {
            return DeltaEntry::Inserted(revision);
        }
        DeltaEntry::Untouched
    }

    pub fn stage_insert(&mut self, revision: Revision) {
        self.insertions.insert(revision.id(), revision);
    }

    /// Updating a staged insertion folds into the insertion.
    pub fn stage_update(&mut self, revision: Revision) {
        let id = revision.id();
        if self.insertions.contains_key(&id) {
            self.insertions.insert(id, revision);
        } else {
            self.updates.insert(id, revision);
        }
    }

    /// Removing a staged insertion unstages it entirely.
    pub fn stage_remove(&mut self, revision: Revision) {
        let id = revision.id();
        if self.insertions.remove(&id).is_some() {
            self.updates.remove(&id);
            return;
        }
        self.updates.remove(&id);
        self.removes.insert(id, revision);
    }

    /// Overlay the staged mutations onto `base`.
    pub fn apply_to(&self, base: &mut RevisionMap) {
        for id in self.removes.keys() {
            base.remove(id);
        }
        for (id, revision) in &self.updates {
            base.insert(*id, Arc::new(revision.clone()));
        }
        for (id, revision) in &self.insertions {
            base.insert(*id, Arc::new(revision.clone()));
        }
    }

    pub fn insertions(&self) -> &BTreeMap<Id, Revision> {
        &self.insertions
    }

    pub fn updates(&self) -> &BTreeMap<Id, Revision> {
        &self.updates
    }

    pub fn removes(&self) -> &BTreeMap<Id, Revision> {
        &self.removes
    }

    pub fn updates_mut(&mut self) -> &mut BTreeMap<Id, Revision> {
        &mut self.updates
    }

    pub fn num_changes(&self) -> usize {
        self.insertions.len() + self.updates.len() + self.removes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_changes() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::FieldValue;

    fn rev(id: Id, n: i64) -> Revision {
        let mut revision = Revision::new(id);
        revision.set("n", FieldValue::Int(n));
        revision
    }

    #[test]
    fn test_delta_precedence() {
        let mut delta = DeltaView::default();
        let id = Id::generate();
        delta.stage_insert(rev(id, 1));
        assert!(matches!(delta.lookup(id), DeltaEntry::Inserted(_)));

        delta.stage_update(rev(id, 2));
        // Updates of staged insertions stay insertions.
        match delta.lookup(id) {
            DeltaEntry::Inserted(revision) => {
                assert_eq!(revision.get("n"), Some(&FieldValue::Int(2)))
            }
            _ => panic!("expected folded insertion"),
        }

        delta.stage_remove(rev(id, 2));
        assert!(matches!(delta.lookup(id), DeltaEntry::Untouched));
        assert!(delta.is_empty());
    }

    #[test]
    fn test_remove_of_committed_id_is_tombstone() {
        let mut delta = DeltaView::default();
        let id = Id::generate();
        delta.stage_update(rev(id, 5));
        delta.stage_remove(rev(id, 5));
        assert!(matches!(delta.lookup(id), DeltaEntry::Removed));
        assert_eq!(delta.num_changes(), 1);
    }

    #[test]
    fn test_apply_to_overlays() {
        let mut delta = DeltaView::default();
        let existing = Id::generate();
        let fresh = Id::generate();
        let gone = Id::generate();

        let mut base = RevisionMap::new();
        base.insert(existing, Arc::new(rev(existing, 1)));
        base.insert(gone, Arc::new(rev(gone, 9)));

        delta.stage_update(rev(existing, 2));
        delta.stage_insert(rev(fresh, 3));
        delta.stage_remove(rev(gone, 9));

        delta.apply_to(&mut base);
        assert_eq!(base.len(), 2);
        assert_eq!(base[&existing].get("n"), Some(&FieldValue::Int(2)));
        assert_eq!(base[&fresh].get("n"), Some(&FieldValue::Int(3)));
        assert!(!base.contains_key(&gone));
    }
}
