//! Chunk-local record containers.
//!
//! A container owns the ordered history of every record in one chunk and
//! answers point-in-time queries against it. The trait is the seam for
//! alternative storage back-ends; only the RAM container ships.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{CartaError, Result};
use crate::id::Id;
use crate::revision::Revision;
use crate::schema::TableDescriptor;
use crate::time::LogicalTime;

/// Latest visible revision per id.
pub type RevisionMap = BTreeMap<Id, Arc<Revision>>;
/// Full history per id, ordered by modification time.
pub type HistoryMap = BTreeMap<Id, Vec<Arc<Revision>>>;

/// Capability set of a chunk's record store.
pub trait ChunkDataContainer: Send + Sync {
    fn init(&mut self, descriptor: &TableDescriptor) -> Result<()>;

    /// Stamp `time` as insert time and store the first revision of a fresh
    /// id. Returns the stored revision for replication.
    fn insert(&mut self, time: LogicalTime, revision: Revision) -> Result<Arc<Revision>>;

    /// Stamp `time` as update time and append a new version of an existing
    /// id. Returns the stored revision for replication.
    fn update(&mut self, time: LogicalTime, revision: Revision) -> Result<Arc<Revision>>;

    /// Like `update`, but marks the new version as a tombstone.
    fn remove(&mut self, time: LogicalTime, revision: Revision) -> Result<Arc<Revision>>;

    /// Ingest a fully stamped revision from a peer, keeping the history
    /// ordered. Idempotent for a revision already present.
    fn patch(&mut self, revision: Revision) -> Result<Arc<Revision>>;

    /// Latest live revision of `id` visible at `time`; `None` when unknown
    /// or removed.
    fn get_by_id(&self, id: Id, time: LogicalTime) -> Option<Arc<Revision>>;

    /// Latest revision of `id` at `time`, tombstones included.
    fn latest_at(&self, id: Id, time: LogicalTime) -> Option<Arc<Revision>>;

    /// Latest live revision per id at `time`.
    fn dump(&self, time: LogicalTime) -> RevisionMap;

    fn get_available_ids(&self, time: LogicalTime) -> Vec<Id>;

    fn count_at(&self, time: LogicalTime) -> usize;

    /// Per-id history up to `time`.
    fn chunk_history(&self, time: LogicalTime) -> HistoryMap;

    fn item_history(&self, id: Id, time: LogicalTime) -> Vec<Arc<Revision>>;

    fn clear(&mut self);
}

/// In-memory container.
pub struct RamContainer {
    chunk_id: Id,
    descriptor: Option<TableDescriptor>,
    histories: BTreeMap<Id, Vec<Arc<Revision>>>,
}

impl RamContainer {
    pub fn new(chunk_id: Id) -> Self {
        Self {
            chunk_id,
            descriptor: None,
            histories: BTreeMap::new(),
        }
    }

    pub fn chunk_id(&self) -> Id {
        self.chunk_id
    }

    pub fn descriptor(&self) -> Option<&TableDescriptor> {
        self.descriptor.as_ref()
    }

    fn store(&mut self, revision: Revision) -> Result<Arc<Revision>> {
        if !revision.id().is_valid() {
            return Err(CartaError::Invariant("revision with invalid id".into()));
        }
        if revision.chunk_id() != self.chunk_id {
            return Err(CartaError::Invariant(format!(
                "revision for chunk {} patched into chunk {}",
                revision.chunk_id(),
                self.chunk_id
            )));
        }
        let history = self.histories.entry(revision.id()).or_default();
        let time = revision.modification_time();
        if let Some(last) = history.last() {
            if last.modification_time() == time {
                // Already ingested (re-broadcast or replayed restore).
                return Ok(Arc::clone(last));
            }
        }
        let stored = Arc::new(revision);
        let position = history
            .iter()
            .position(|existing| existing.modification_time() > time)
            .unwrap_or(history.len());
        history.insert(position, Arc::clone(&stored));
        Ok(stored)
    }

    fn latest_before(history: &[Arc<Revision>], time: LogicalTime) -> Option<&Arc<Revision>> {
        history
            .iter()
            .rev()
            .find(|revision| revision.modification_time() <= time)
    }
}

impl ChunkDataContainer for RamContainer {
    fn init(&mut self, descriptor: &TableDescriptor) -> Result<()> {
        self.descriptor = Some(descriptor.clone());
        Ok(())
    }

    fn insert(&mut self, time: LogicalTime, mut revision: Revision) -> Result<Arc<Revision>> {
        if self.histories.contains_key(&revision.id()) {
            return Err(CartaError::Invariant(format!(
                "insert of existing id {}",
                revision.id()
            )));
        }
        revision.set_chunk_id(self.chunk_id);
        revision.set_insert_time(time);
        self.store(revision)
    }

    fn update(&mut self, time: LogicalTime, mut revision: Revision) -> Result<Arc<Revision>> {
        let history = self
            .histories
            .get(&revision.id())
            .ok_or_else(|| CartaError::NotFound(format!("id {}", revision.id())))?;
        let previous = history.last().expect("histories are never empty");
        if previous.modification_time() >= time {
            return Err(CartaError::Invariant(format!(
                "non-monotonic update of {} ({} after {})",
                revision.id(),
                time,
                previous.modification_time()
            )));
        }
        revision.set_chunk_id(self.chunk_id);
        revision.set_insert_time(previous.insert_time());
        revision.set_update_time(time);
        self.store(revision)
    }

    fn remove(&mut self, time: LogicalTime, mut revision: Revision) -> Result<Arc<Revision>> {
        revision.set_removed();
        self.update(time, revision)
    }

    fn patch(&mut self, revision: Revision) -> Result<Arc<Revision>> {
        if !revision.insert_time().is_valid() {
            return Err(CartaError::Invariant("patch of unstamped revision".into()));
        }
        self.store(revision)
    }

    fn get_by_id(&self, id: Id, time: LogicalTime) -> Option<Arc<Revision>> {
        self.latest_at(id, time)
            .filter(|revision| !revision.is_removed())
    }

    fn latest_at(&self, id: Id, time: LogicalTime) -> Option<Arc<Revision>> {
        let history = self.histories.get(&id)?;
        Self::latest_before(history, time).cloned()
    }

    fn dump(&self, time: LogicalTime) -> RevisionMap {
        let mut result = RevisionMap::new();
        for (id, history) in &self.histories {
            if let Some(revision) = Self::latest_before(history, time) {
                if !revision.is_removed() {
                    result.insert(*id, Arc::clone(revision));
                }
            }
        }
        result
    }

    fn get_available_ids(&self, time: LogicalTime) -> Vec<Id> {
        self.histories
            .iter()
            .filter_map(|(id, history)| {
                Self::latest_before(history, time)
                    .filter(|revision| !revision.is_removed())
                    .map(|_| *id)
            })
            .collect()
    }

    fn count_at(&self, time: LogicalTime) -> usize {
        self.get_available_ids(time).len()
    }

    fn chunk_history(&self, time: LogicalTime) -> HistoryMap {
        let mut result = HistoryMap::new();
        for (id, history) in &self.histories {
            let upto: Vec<Arc<Revision>> = history
                .iter()
                .filter(|revision| revision.modification_time() <= time)
                .cloned()
                .collect();
            if !upto.is_empty() {
                result.insert(*id, upto);
            }
        }
        result
    }

    fn item_history(&self, id: Id, time: LogicalTime) -> Vec<Arc<Revision>> {
        self.histories
            .get(&id)
            .map(|history| {
                history
                    .iter()
                    .filter(|revision| revision.modification_time() <= time)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn clear(&mut self) {
        self.histories.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::FieldValue;

    fn fresh(id: Id, n: i64) -> Revision {
        let mut revision = Revision::new(id);
        revision.set("n", FieldValue::Int(n));
        revision
    }

    #[test]
    fn test_insert_then_get() {
        let chunk = Id::generate();
        let mut container = RamContainer::new(chunk);
        let id = Id::generate();
        let t = LogicalTime::sample();
        container.insert(t, fresh(id, 42)).unwrap();

        let read = container.get_by_id(id, LogicalTime::sample()).unwrap();
        assert_eq!(read.get("n"), Some(&FieldValue::Int(42)));
        assert_eq!(read.chunk_id(), chunk);
        assert_eq!(read.insert_time(), t);
    }

    #[test]
    fn test_double_insert_is_invariant_violation() {
        let mut container = RamContainer::new(Id::generate());
        let id = Id::generate();
        container.insert(LogicalTime::sample(), fresh(id, 1)).unwrap();
        let result = container.insert(LogicalTime::sample(), fresh(id, 2));
        assert!(matches!(result, Err(CartaError::Invariant(_))));
    }

    #[test]
    fn test_point_in_time_lookup() {
        let mut container = RamContainer::new(Id::generate());
        let id = Id::generate();
        let t1 = LogicalTime::sample();
        container.insert(t1, fresh(id, 1)).unwrap();
        let t2 = LogicalTime::sample();
        container.update(t2, fresh(id, 2)).unwrap();

        assert_eq!(
            container.get_by_id(id, t1).unwrap().get("n"),
            Some(&FieldValue::Int(1))
        );
        assert_eq!(
            container.get_by_id(id, t2).unwrap().get("n"),
            Some(&FieldValue::Int(2))
        );
    }

    #[test]
    fn test_remove_hides_from_dump_but_not_history() {
        let mut container = RamContainer::new(Id::generate());
        let id = Id::generate();
        container.insert(LogicalTime::sample(), fresh(id, 1)).unwrap();
        container.remove(LogicalTime::sample(), fresh(id, 1)).unwrap();

        let now = LogicalTime::sample();
        assert!(container.get_by_id(id, now).is_none());
        assert!(container.dump(now).is_empty());
        assert_eq!(container.count_at(now), 0);
        assert_eq!(container.item_history(id, now).len(), 2);
        assert!(container.latest_at(id, now).unwrap().is_removed());
    }

    #[test]
    fn test_update_times_strictly_monotonic() {
        let mut container = RamContainer::new(Id::generate());
        let id = Id::generate();
        let t = LogicalTime::sample();
        container.insert(t, fresh(id, 1)).unwrap();
        assert!(matches!(
            container.update(t, fresh(id, 2)),
            Err(CartaError::Invariant(_))
        ));
    }

    #[test]
    fn test_patch_is_idempotent() {
        let mut source = RamContainer::new(Id::generate());
        let id = Id::generate();
        let stored = source.insert(LogicalTime::sample(), fresh(id, 7)).unwrap();

        let mut replica = RamContainer::new(source.chunk_id());
        replica.patch((*stored).clone()).unwrap();
        replica.patch((*stored).clone()).unwrap();
        assert_eq!(replica.item_history(id, LogicalTime::sample()).len(), 1);
    }

    #[test]
    fn test_patch_rejects_foreign_chunk() {
        let mut source = RamContainer::new(Id::generate());
        let stored = source
            .insert(LogicalTime::sample(), fresh(Id::generate(), 7))
            .unwrap();
        let mut other = RamContainer::new(Id::generate());
        assert!(matches!(
            other.patch((*stored).clone()),
            Err(CartaError::Invariant(_))
        ));
    }

    #[test]
    fn test_update_of_unknown_id() {
        let mut container = RamContainer::new(Id::generate());
        assert!(matches!(
            container.update(LogicalTime::sample(), fresh(Id::generate(), 1)),
            Err(CartaError::NotFound(_))
        ));
    }
}
