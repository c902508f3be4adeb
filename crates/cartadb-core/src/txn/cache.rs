//! Per-table read-through caches for transactions.
//!
//! A cache serves repeated `get_by_id` reads without touching the chunk
//! views and collects dirty records for write-out at commit. A table is
//! accessed either through its cache or directly, never both; the
//! transaction enforces that dynamically.

use std::collections::HashMap;

use crate::id::Id;
use crate::revision::Revision;

#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub revision: Revision,
    /// Chunk the entry was (or will be) placed in.
    pub chunk_id: Id,
    pub dirty: bool,
    pub inserted: bool,
    pub removed: bool,
}

#[derive(Default)]
pub struct TableCache {
    entries: HashMap<Id, CacheEntry>,
    available_ids: Vec<Id>,
}

impl TableCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Id) -> Option<&Revision> {
        self.entries
            .get(&id)
            .filter(|entry| !entry.removed)
            .map(|entry| &entry.revision)
    }

    pub fn fill(&mut self, revision: Revision) {
        let entry = CacheEntry {
            chunk_id: revision.chunk_id(),
            revision,
            dirty: false,
            inserted: false,
            removed: false,
        };
        self.entries.insert(entry.revision.id(), entry);
    }

    pub fn insert(&mut self, chunk_id: Id, revision: Revision) -> bool {
        let id = revision.id();
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(
            id,
            CacheEntry {
                revision,
                chunk_id,
                dirty: true,
                inserted: true,
                removed: false,
            },
        );
        self.available_ids.push(id);
        true
    }

    pub fn update(&mut self, revision: Revision) -> bool {
        match self.entries.get_mut(&revision.id()) {
            Some(entry) if !entry.removed => {
                entry.revision = revision;
                entry.dirty = true;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, id: Id) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.removed = true;
                entry.dirty = true;
                self.available_ids.retain(|known| *known != id);
                true
            }
            None => false,
        }
    }

    pub fn has(&self, id: Id) -> bool {
        self.entries
            .get(&id)
            .map(|entry| !entry.removed)
            .unwrap_or(false)
    }

    /// Dirty entries in deterministic order for write-out at commit.
    pub(crate) fn dirty_entries(&self) -> Vec<CacheEntry> {
        let mut dirty: Vec<CacheEntry> = self
            .entries
            .values()
            .filter(|entry| entry.dirty)
            .cloned()
            .collect();
        dirty.sort_by_key(|entry| entry.revision.id());
        dirty
    }

    /// Drop insertion entries once they are staged into the transaction;
    /// their authoritative metadata only exists after the commit.
    pub fn discard_cached_insertions(&mut self) {
        self.entries.retain(|_, entry| !entry.inserted);
    }

    pub fn set_available_ids(&mut self, ids: Vec<Id>) {
        self.available_ids = ids;
    }

    pub fn available_ids(&self) -> &[Id] {
        &self.available_ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::FieldValue;

    fn record(n: i64) -> Revision {
        let mut revision = Revision::new(Id::generate());
        revision.set("n", FieldValue::Int(n));
        revision
    }

    #[test]
    fn test_fill_then_get_is_clean() {
        let mut cache = TableCache::new();
        let revision = record(1);
        let id = revision.id();
        cache.fill(revision);
        assert!(cache.get(id).is_some());
        assert!(cache.dirty_entries().is_empty());
    }

    #[test]
    fn test_insert_and_update_are_dirty() {
        let mut cache = TableCache::new();
        let chunk = Id::generate();
        let revision = record(1);
        let id = revision.id();
        assert!(cache.insert(chunk, revision.clone()));
        assert!(!cache.insert(chunk, revision));

        let mut changed = cache.get(id).unwrap().clone();
        changed.set("n", FieldValue::Int(2));
        assert!(cache.update(changed));

        let dirty = cache.dirty_entries();
        assert_eq!(dirty.len(), 1);
        assert!(dirty[0].inserted);
        assert_eq!(cache.available_ids(), &[id]);
    }

    #[test]
    fn test_remove_hides_entry() {
        let mut cache = TableCache::new();
        let revision = record(1);
        let id = revision.id();
        cache.fill(revision);
        assert!(cache.remove(id));
        assert!(cache.get(id).is_none());
        assert!(!cache.update(record(2)));
        assert_eq!(cache.dirty_entries().len(), 1);
    }

    #[test]
    fn test_discard_cached_insertions() {
        let mut cache = TableCache::new();
        cache.fill(record(1));
        cache.insert(Id::generate(), record(2));
        cache.discard_cached_insertions();
        assert_eq!(cache.dirty_entries().len(), 0);
        assert_eq!(cache.entries.len(), 1);
    }
}
