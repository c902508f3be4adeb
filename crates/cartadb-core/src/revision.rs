//! Versioned records.
//!
//! A revision is one versioned value of a row: the stable id, the owning
//! chunk, insert/update logical times, a tombstone flag, the schema-typed
//! payload, and the trackee back-references that let readers lazily fetch
//! dependent chunks.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::id::Id;
use crate::time::LogicalTime;

/// One typed payload field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Int(i64),
    Real(f64),
    Text(String),
    Bytes(Vec<u8>),
    Bool(bool),
    Ref(Id),
}

/// `other table -> chunk ids referenced by this record`.
pub type TrackeeMap = BTreeMap<String, BTreeSet<Id>>;

/// A versioned record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    id: Id,
    chunk_id: Id,
    insert_time: LogicalTime,
    update_time: Option<LogicalTime>,
    removed: bool,
    payload: BTreeMap<String, FieldValue>,
    trackees: TrackeeMap,
}

impl Revision {
    pub fn new(id: Id) -> Self {
        Self {
            id,
            chunk_id: Id::default(),
            insert_time: LogicalTime::default(),
            update_time: None,
            removed: false,
            payload: BTreeMap::new(),
            trackees: TrackeeMap::new(),
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn chunk_id(&self) -> Id {
        self.chunk_id
    }

    pub(crate) fn set_chunk_id(&mut self, chunk_id: Id) {
        self.chunk_id = chunk_id;
    }

    pub fn insert_time(&self) -> LogicalTime {
        self.insert_time
    }

    pub(crate) fn set_insert_time(&mut self, time: LogicalTime) {
        self.insert_time = time;
    }

    pub fn update_time(&self) -> Option<LogicalTime> {
        self.update_time
    }

    pub(crate) fn set_update_time(&mut self, time: LogicalTime) {
        self.update_time = Some(time);
    }

    /// Update time if present, insert time otherwise.
    pub fn modification_time(&self) -> LogicalTime {
        self.update_time.unwrap_or(self.insert_time)
    }

    pub fn has_been_updated(&self) -> bool {
        match self.update_time {
            Some(t) => t > self.insert_time,
            None => false,
        }
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub(crate) fn set_removed(&mut self) {
        self.removed = true;
    }

    // ------------------------------------------------------------------
    // Payload access
    // ------------------------------------------------------------------

    pub fn set(&mut self, key: impl Into<String>, value: FieldValue) {
        self.payload.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.payload.get(key)
    }

    pub fn payload(&self) -> &BTreeMap<String, FieldValue> {
        &self.payload
    }

    /// True if the value at `key` equals `expected`.
    pub fn verify_equal(&self, key: &str, expected: &FieldValue) -> bool {
        self.payload.get(key) == Some(expected)
    }

    /// True if both revisions carry the same field names.
    pub fn structure_match(&self, reference: &Revision) -> bool {
        self.payload.len() == reference.payload.len()
            && self
                .payload
                .keys()
                .zip(reference.payload.keys())
                .all(|(a, b)| a == b)
    }

    /// True if the value at `key` is the same in both revisions.
    pub fn field_match(&self, other: &Revision, key: &str) -> bool {
        self.payload.get(key) == other.payload.get(key)
    }

    pub fn all_fields_equal(&self, other: &Revision) -> bool {
        self.payload == other.payload
    }

    // ------------------------------------------------------------------
    // Trackees
    // ------------------------------------------------------------------

    pub fn trackees(&self) -> &TrackeeMap {
        &self.trackees
    }

    pub fn add_trackee(&mut self, table: impl Into<String>, chunk_id: Id) {
        self.trackees.entry(table.into()).or_default().insert(chunk_id);
    }

    /// Merge `incoming` into this revision's trackees. Returns true if the
    /// set actually changed.
    pub fn merge_trackees(&mut self, incoming: &TrackeeMap) -> bool {
        let mut changed = false;
        for (table, chunks) in incoming {
            let entry = self.trackees.entry(table.clone()).or_default();
            for chunk in chunks {
                changed |= entry.insert(*chunk);
            }
        }
        changed
    }

    // ------------------------------------------------------------------
    // Write staging
    // ------------------------------------------------------------------

    /// Clone for staging a new version: keeps id, chunk id and payload,
    /// clears the times which get stamped at commit.
    pub fn copy_for_write(&self) -> Revision {
        let mut copy = self.clone();
        copy.update_time = None;
        copy
    }

    /// The fields whose values differ from `other`.
    fn changed_fields<'a>(&'a self, other: &Revision) -> BTreeSet<&'a str> {
        self.payload
            .iter()
            .filter(|(key, value)| other.payload.get(*key) != Some(value))
            .map(|(key, _)| key.as_str())
            .collect()
    }

    /// Attempt to merge a concurrent update into this staged revision.
    ///
    /// The default policy succeeds when the concurrent revision and this one
    /// changed disjoint field sets relative to the common original: the
    /// concurrent changes are folded into this revision. Custom policies are
    /// tried afterwards; the first success wins. On failure this revision is
    /// unchanged.
    pub fn try_auto_merge(
        &mut self,
        conflicting: &Revision,
        original: &Revision,
        custom_policies: &[AutoMergePolicy],
    ) -> bool {
        let ours = self.changed_fields(original);
        let theirs = conflicting.changed_fields(original);
        if ours.is_disjoint(&theirs) {
            let stolen: Vec<(String, FieldValue)> = conflicting
                .payload
                .iter()
                .filter(|(key, _)| theirs.contains(key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            for (key, value) in stolen {
                self.payload.insert(key, value);
            }
            return true;
        }
        for policy in custom_policies {
            if policy(conflicting, original, self) {
                return true;
            }
        }
        false
    }
}

/// Application-supplied merge policy. Must leave the staged revision
/// unchanged when returning false.
pub type AutoMergePolicy = fn(&Revision, &Revision, &mut Revision) -> bool;

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(id: Id) -> Revision {
        let mut r = Revision::new(id);
        r.set("n", FieldValue::Int(42));
        r.set("label", FieldValue::Text("origin".into()));
        r
    }

    #[test]
    fn test_modification_time_prefers_update() {
        let mut r = rev(Id::generate());
        r.set_insert_time(LogicalTime(5));
        assert_eq!(r.modification_time(), LogicalTime(5));
        assert!(!r.has_been_updated());
        r.set_update_time(LogicalTime(9));
        assert_eq!(r.modification_time(), LogicalTime(9));
        assert!(r.has_been_updated());
    }

    #[test]
    fn test_structure_and_field_match() {
        let a = rev(Id::generate());
        let mut b = rev(Id::generate());
        assert!(a.structure_match(&b));
        assert!(a.field_match(&b, "n"));
        b.set("n", FieldValue::Int(7));
        assert!(!a.field_match(&b, "n"));
        b.set("extra", FieldValue::Bool(true));
        assert!(!a.structure_match(&b));
    }

    #[test]
    fn test_auto_merge_disjoint_fields() {
        let original = rev(Id::generate());
        let mut ours = original.copy_for_write();
        ours.set("n", FieldValue::Int(43));
        let mut theirs = original.copy_for_write();
        theirs.set("label", FieldValue::Text("remote".into()));

        assert!(ours.try_auto_merge(&theirs, &original, &[]));
        assert_eq!(ours.get("n"), Some(&FieldValue::Int(43)));
        assert_eq!(ours.get("label"), Some(&FieldValue::Text("remote".into())));
    }

    #[test]
    fn test_auto_merge_same_field_fails() {
        let original = rev(Id::generate());
        let mut ours = original.copy_for_write();
        ours.set("n", FieldValue::Int(43));
        let mut theirs = original.copy_for_write();
        theirs.set("n", FieldValue::Int(44));

        assert!(!ours.try_auto_merge(&theirs, &original, &[]));
        assert_eq!(ours.get("n"), Some(&FieldValue::Int(43)));
    }

    #[test]
    fn test_custom_merge_policy_applies() {
        fn take_max(conflicting: &Revision, _: &Revision, at_hand: &mut Revision) -> bool {
            match (conflicting.get("n"), at_hand.get("n")) {
                (Some(FieldValue::Int(a)), Some(FieldValue::Int(b))) => {
                    let max = (*a).max(*b);
                    at_hand.set("n", FieldValue::Int(max));
                    true
                }
                _ => false,
            }
        }
        let original = rev(Id::generate());
        let mut ours = original.copy_for_write();
        ours.set("n", FieldValue::Int(50));
        let mut theirs = original.copy_for_write();
        theirs.set("n", FieldValue::Int(60));

        assert!(ours.try_auto_merge(&theirs, &original, &[take_max]));
        assert_eq!(ours.get("n"), Some(&FieldValue::Int(60)));
    }

    #[test]
    fn test_trackee_merge_reports_change() {
        let mut r = rev(Id::generate());
        let chunk = Id::generate();
        r.add_trackee("poses", chunk);

        let mut incoming = TrackeeMap::new();
        incoming.entry("poses".into()).or_default().insert(chunk);
        assert!(!r.merge_trackees(&incoming));

        incoming
            .entry("landmarks".into())
            .or_default()
            .insert(Id::generate());
        assert!(r.merge_trackees(&incoming));
        assert_eq!(r.trackees().len(), 2);
    }
}
