//! Conflict carriers surfaced by failed commits and merges.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::revision::Revision;

/// One optimistic-concurrency violation: what we staged and what the chunk
/// holds instead.
#[derive(Debug, Clone)]
pub struct Conflict {
    pub ours: Revision,
    pub theirs: Option<Arc<Revision>>,
}

pub type Conflicts = Vec<Conflict>;

/// Conflicts per table, for multi-table merges.
pub type ConflictMap = BTreeMap<String, Conflicts>;
