//! Multi-table transactions.
//!
//! The same pattern as the per-table bundle, nested one level higher, plus
//! the per-table cache layer, the chunk-tracker push, and the multi-chunk
//! hand-off of the Raft commit path.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chunk::ChunkRef;
use crate::container::RevisionMap;
use crate::error::{CartaError, Result};
use crate::id::Id;
use crate::net::peer::PeerId;
use crate::revision::{AutoMergePolicy, FieldValue, Revision, TrackeeMap};
use crate::table::manager::TableManager;
use crate::time::LogicalTime;
use crate::txn::cache::TableCache;
use crate::txn::conflict::{ConflictMap, Conflicts};
use crate::txn::table_txn::NetTableTransaction;
use crate::workspace::Workspace;

/// One chunk participating in a multi-chunk commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiChunkParticipant {
    pub table: String,
    pub chunk_id: Id,
    pub peers: Vec<PeerId>,
}

/// Hand-off record broadcast to all participating chunks under lock. Once
/// every chunk has accepted it, any surviving chunk can complete the
/// commit by contacting the others.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiChunkTransactionInfo {
    pub transaction_id: Id,
    pub begin_time: LogicalTime,
    pub participants: Vec<MultiChunkParticipant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableAccessMode {
    Direct,
    Cache,
}

pub struct Transaction {
    manager: Arc<TableManager>,
    workspace: Workspace,
    begin_time: LogicalTime,
    table_txns: BTreeMap<String, NetTableTransaction>,
    caches: BTreeMap<String, TableCache>,
    access_mode: HashMap<String, TableAccessMode>,
    /// Non-zero while engine internals bypass the cache/direct split.
    direct_override: usize,
    tracker_overrides: HashMap<String, Id>,
    chunk_tracking_disabled: bool,
    commit_time: Option<LogicalTime>,
}

impl Transaction {
    pub fn begin(manager: &Arc<TableManager>) -> Self {
        Self::begin_with(manager, Workspace::full(), LogicalTime::sample())
    }

    pub fn begin_with(
        manager: &Arc<TableManager>,
        workspace: Workspace,
        begin_time: LogicalTime,
    ) -> Self {
        Self {
            manager: Arc::clone(manager),
            workspace,
            begin_time,
            table_txns: BTreeMap::new(),
            caches: BTreeMap::new(),
            access_mode: HashMap::new(),
            direct_override: 0,
            tracker_overrides: HashMap::new(),
            chunk_tracking_disabled: false,
            commit_time: None,
        }
    }

    pub fn begin_time(&self) -> LogicalTime {
        self.begin_time
    }

    pub fn commit_time(&self) -> Option<LogicalTime> {
        self.commit_time
    }

    pub fn num_changed_items(&self) -> usize {
        self.table_txns
            .values()
            .map(NetTableTransaction::num_changed_items)
            .sum()
    }

    pub fn disable_chunk_tracking(&mut self) {
        self.chunk_tracking_disabled = true;
    }

    /// Force all tracking in `tracker_table` onto one record.
    pub fn override_tracker(&mut self, tracker_table: impl Into<String>, tracker_id: Id) {
        self.tracker_overrides.insert(tracker_table.into(), tracker_id);
    }

    // ==================================================================
    // Access-mode discipline
    // ==================================================================

    fn ensure_access_direct(&mut self, table: &str) -> Result<()> {
        if self.direct_override > 0 {
            return Ok(());
        }
        match self.access_mode.get(table) {
            None => {
                self.access_mode
                    .insert(table.to_string(), TableAccessMode::Direct);
                Ok(())
            }
            Some(TableAccessMode::Direct) => Ok(()),
            Some(TableAccessMode::Cache) => Err(CartaError::Invariant(format!(
                "table {table} is accessed via its cache, direct access is forbidden"
            ))),
        }
    }

    fn ensure_access_cache(&mut self, table: &str) -> Result<()> {
        match self.access_mode.get(table) {
            None => {
                self.access_mode
                    .insert(table.to_string(), TableAccessMode::Cache);
                Ok(())
            }
            Some(TableAccessMode::Cache) => Ok(()),
            Some(TableAccessMode::Direct) => Err(CartaError::Invariant(format!(
                "table {table} is accessed directly, a cache may not be attached"
            ))),
        }
    }

    fn table_txn(&mut self, table: &str) -> Result<&mut NetTableTransaction> {
        self.ensure_access_direct(table)?;
        if !self.workspace.contains_table(table) {
            return Err(CartaError::NotFound(format!(
                "table {table} is outside the workspace"
            )));
        }
        if !self.table_txns.contains_key(table) {
            let net_table = self
                .manager
                .get_table(table)
                .ok_or_else(|| CartaError::NotFound(format!("table {table}")))?;
            self.table_txns.insert(
                table.to_string(),
                NetTableTransaction::new(
                    self.begin_time,
                    net_table,
                    self.workspace.clone(),
                    None,
                ),
            );
        }
        Ok(self.table_txns.get_mut(table).expect("just inserted"))
    }

    // ==================================================================
    // Direct reads & writes
    // ==================================================================

    pub fn insert(&mut self, table: &str, chunk: &ChunkRef, revision: Revision) -> Result<()> {
        self.table_txn(table)?.insert(chunk, revision)
    }

    pub fn update(&mut self, table: &str, revision: Revision) -> Result<()> {
        self.table_txn(table)?.update(revision)
    }

    pub fn remove(&mut self, table: &str, revision: Revision) -> Result<()> {
        self.table_txn(table)?.remove(revision)
    }

    pub fn add_conflict_condition(
        &mut self,
        table: &str,
        chunk: &ChunkRef,
        field: impl Into<String>,
        value: FieldValue,
    ) -> Result<()> {
        self.table_txn(table)?
            .add_conflict_condition(chunk, field, value);
        Ok(())
    }

    pub fn get_by_id(&mut self, table: &str, id: Id) -> Option<Arc<Revision>> {
        self.table_txn(table).ok()?.get_by_id(id)
    }

    pub fn find_unique(
        &mut self,
        table: &str,
        field: &str,
        value: &FieldValue,
    ) -> Option<Arc<Revision>> {
        self.table_txn(table).ok()?.find_unique(field, value)
    }

    pub fn dump_chunk(&mut self, table: &str, chunk: &ChunkRef) -> RevisionMap {
        match self.table_txn(table) {
            Ok(transaction) => transaction.dump_chunk(chunk),
            Err(_) => RevisionMap::new(),
        }
    }

    pub fn dump_active_chunks(&mut self, table: &str) -> RevisionMap {
        match self.table_txn(table) {
            Ok(transaction) => transaction.dump_active_chunks(),
            Err(_) => RevisionMap::new(),
        }
    }

    pub fn get_available_ids(&mut self, table: &str) -> Vec<Id> {
        match self.table_txn(table) {
            Ok(transaction) => transaction.get_available_ids(),
            Err(_) => Vec::new(),
        }
    }

    // ==================================================================
    // Cache layer
    // ==================================================================

    pub fn attach_cache(&mut self, table: &str) -> Result<()> {
        self.ensure_access_cache(table)?;
        if !self.caches.contains_key(table) {
            let mut cache = TableCache::new();
            self.direct_override += 1;
            let ids = self
                .table_txn(table)
                .map(|transaction| transaction.get_available_ids());
            self.direct_override -= 1;
            cache.set_available_ids(ids?);
            self.caches.insert(table.to_string(), cache);
        }
        Ok(())
    }

    /// Read-through get: serve from the cache, fill on miss.
    pub fn cached_get(&mut self, table: &str, id: Id) -> Result<Revision> {
        self.ensure_access_cache(table)?;
        if let Some(revision) = self.caches.get(table).and_then(|cache| cache.get(id)) {
            return Ok(revision.clone());
        }
        self.direct_override += 1;
        let fetched = self.table_txn(table).ok().and_then(|txn| txn.get_by_id(id));
        self.direct_override -= 1;
        let revision = fetched.ok_or_else(|| CartaError::NotFound(format!("id {id}")))?;
        let cache = self
            .caches
            .get_mut(table)
            .ok_or_else(|| CartaError::Invariant(format!("no cache attached for {table}")))?;
        cache.fill((*revision).clone());
        Ok((*revision).clone())
    }

    pub fn cached_insert(&mut self, table: &str, chunk: &ChunkRef, revision: Revision) -> Result<()> {
        self.ensure_access_cache(table)?;
        let cache = self
            .caches
            .get_mut(table)
            .ok_or_else(|| CartaError::Invariant(format!("no cache attached for {table}")))?;
        if !cache.insert(chunk.id(), revision) {
            return Err(CartaError::Invariant("cached insert of existing id".into()));
        }
        Ok(())
    }

    pub fn cached_update(&mut self, table: &str, revision: Revision) -> Result<()> {
        self.ensure_access_cache(table)?;
        let cache = self
            .caches
            .get_mut(table)
            .ok_or_else(|| CartaError::Invariant(format!("no cache attached for {table}")))?;
        if !cache.update(revision) {
            return Err(CartaError::NotFound("cached update of unknown id".into()));
        }
        Ok(())
    }

    pub fn cached_remove(&mut self, table: &str, id: Id) -> Result<()> {
        self.ensure_access_cache(table)?;
        let cache = self
            .caches
            .get_mut(table)
            .ok_or_else(|| CartaError::Invariant(format!("no cache attached for {table}")))?;
        if !cache.remove(id) {
            return Err(CartaError::NotFound("cached remove of unknown id".into()));
        }
        Ok(())
    }

    pub fn cached_available_ids(&mut self, table: &str) -> Result<Vec<Id>> {
        self.ensure_access_cache(table)?;
        Ok(self
            .caches
            .get(table)
            .map(|cache| cache.available_ids().to_vec())
            .unwrap_or_default())
    }

    /// Stage every dirty cache entry into the table transactions.
    fn flush_caches(&mut self) -> Result<()> {
        let names: Vec<String> = self.caches.keys().cloned().collect();
        for name in names {
            let dirty = self
                .caches
                .get(&name)
                .map(|cache| cache.dirty_entries())
                .unwrap_or_default();
            if dirty.is_empty() {
                continue;
            }
            self.direct_override += 1;
            let result = (|| -> Result<()> {
                for entry in dirty {
                    if entry.inserted {
                        let table = self
                            .manager
                            .get_table(&name)
                            .ok_or_else(|| CartaError::NotFound(format!("table {name}")))?;
                        let chunk = table.get_chunk(entry.chunk_id)?;
                        self.table_txn(&name)?.insert(&chunk, entry.revision)?;
                    } else if entry.removed {
                        self.table_txn(&name)?.remove(entry.revision)?;
                    } else {
                        self.table_txn(&name)?.update(entry.revision)?;
                    }
                }
                Ok(())
            })();
            self.direct_override -= 1;
            result?;
        }
        Ok(())
    }

    // ==================================================================
    // Chunk tracking
    // ==================================================================

    /// Stage updates on tracker records so that they reference every chunk
    /// this transaction writes.
    fn push_new_chunk_ids_to_trackers(&mut self) -> Result<()> {
        if self.chunk_tracking_disabled {
            return Ok(());
        }
        // (tracker table, tracker id) -> trackee table -> chunks.
        let mut to_push: BTreeMap<(String, Id), TrackeeMap> = BTreeMap::new();
        for (table_name, transaction) in &self.table_txns {
            for (tracker_table, tracker_id, chunk_id) in
                transaction.collect_chunk_trackers(&self.tracker_overrides)
            {
                to_push
                    .entry((tracker_table, tracker_id))
                    .or_default()
                    .entry(table_name.clone())
                    .or_default()
                    .insert(chunk_id);
            }
        }
        if to_push.is_empty() {
            return Ok(());
        }
        self.direct_override += 1;
        let result = (|| -> Result<()> {
            for ((tracker_table, tracker_id), trackees) in to_push {
                let original = self.get_by_id(&tracker_table, tracker_id).ok_or_else(|| {
                    CartaError::NotFound(format!(
                        "tracker record {tracker_id} in {tracker_table}"
                    ))
                })?;
                let mut updated = original.copy_for_write();
                // Update only when the trackee set actually grew.
                if updated.merge_trackees(&trackees) {
                    self.update(&tracker_table, updated)?;
                }
            }
            Ok(())
        })();
        self.direct_override -= 1;
        result
    }

    /// Connect to every chunk referenced by trackees of items in `table`.
    pub fn fetch_all_chunks_tracked_by_items_in_table(&mut self, table: &str) -> Result<bool> {
        self.direct_override += 1;
        let result = (|| -> Result<bool> {
            let ids = self
                .table_txn(table)
                .map(|transaction| transaction.get_available_ids())?;
            let mut complete = true;
            for id in ids {
                let Some(revision) = self.get_by_id(table, id) else {
                    continue;
                };
                for (trackee_table, chunks) in revision.trackees().clone() {
                    let Some(net_table) = self.manager.get_table(&trackee_table) else {
                        complete = false;
                        continue;
                    };
                    for chunk_id in chunks {
                        if net_table.get_chunk(chunk_id).is_err() {
                            complete = false;
                        }
                    }
                }
            }
            Ok(complete)
        })();
        self.direct_override -= 1;
        let complete = result?;
        for transaction in self.table_txns.values_mut() {
            transaction.refresh_id_to_chunk_map();
        }
        Ok(complete)
    }

    // ==================================================================
    // Commit
    // ==================================================================

    fn prepare_for_commit(&mut self) -> Result<()> {
        self.flush_caches()?;
        self.push_new_chunk_ids_to_trackers()
    }

    fn unlock_all(&self, success: bool, names: &[String]) {
        for name in names {
            if let Some(transaction) = self.table_txns.get(name) {
                transaction.unlock(success);
            }
        }
    }

    /// Commit across all tables: either every staged change becomes
    /// visible at `commit_time`, or none does.
    pub fn commit(&mut self) -> Result<LogicalTime> {
        if self.manager.use_raft() {
            self.commit_raft()
        } else {
            self.commit_legacy()
        }
    }

    fn commit_legacy(&mut self) -> Result<LogicalTime> {
        self.prepare_for_commit()?;
        // Insertions have to be refetched after commit for authoritative
        // metadata, so their cache entries go now.
        for cache in self.caches.values_mut() {
            cache.discard_cached_insertions();
        }
        let names: Vec<String> = self.table_txns.keys().cloned().collect();
        let mut locked: Vec<String> = Vec::new();
        for name in &names {
            if let Err(e) = self.table_txns[name].lock() {
                self.unlock_all(false, &locked);
                return Err(e);
            }
            locked.push(name.clone());
        }
        let mut conflicts = Vec::new();
        for name in &names {
            conflicts.extend(self.table_txns[name].check());
        }
        if !conflicts.is_empty() {
            self.unlock_all(false, &names);
            return Err(CartaError::Conflict(
                conflicts.iter().map(|conflict| conflict.ours.id()).collect(),
            ));
        }
        let commit_time = LogicalTime::sample();
        debug!("commit from {} to {commit_time}", self.begin_time);
        for name in &names {
            if let Err(e) = self
                .table_txns
                .get_mut(name)
                .expect("known name")
                .checked_commit(commit_time)
            {
                warn!("commit of table {name} failed mid-flight: {e}");
                self.unlock_all(false, &names);
                return Err(e);
            }
        }
        self.unlock_all(true, &names);
        self.commit_time = Some(commit_time);
        Ok(commit_time)
    }

    fn commit_raft(&mut self) -> Result<LogicalTime> {
        self.prepare_for_commit()?;

        let mut info = MultiChunkTransactionInfo {
            transaction_id: Id::generate(),
            begin_time: self.begin_time,
            participants: Vec::new(),
        };
        for transaction in self.table_txns.values() {
            transaction.fill_commit_info(&mut info);
        }

        let names: Vec<String> = self.table_txns.keys().cloned().collect();
        let mut locked: Vec<String> = Vec::new();
        for name in &names {
            if let Err(e) = self.table_txns[name].lock() {
                self.unlock_all(false, &locked);
                return Err(e);
            }
            locked.push(name.clone());
            if !self.table_txns[name].send_commit_info(&info) {
                warn!("aborting multi-chunk commit: hand-off rejected");
                self.unlock_all(false, &locked);
                return Err(CartaError::Decline("commit hand-off rejected".into()));
            }
        }

        for cache in self.caches.values_mut() {
            cache.discard_cached_insertions();
        }

        let mut conflicts = Vec::new();
        for name in &names {
            conflicts.extend(self.table_txns[name].check());
        }
        if !conflicts.is_empty() {
            self.unlock_all(false, &names);
            return Err(CartaError::Conflict(
                conflicts.iter().map(|conflict| conflict.ours.id()).collect(),
            ));
        }

        let commit_time = LogicalTime::sample();
        for name in &names {
            if let Err(e) = self
                .table_txns
                .get_mut(name)
                .expect("known name")
                .checked_commit(commit_time)
            {
                warn!("aborting multi-chunk commit: revisions failed: {e}");
                self.unlock_all(false, &names);
                return Err(e);
            }
        }
        // Every chunk holds the full transaction now; any peer receiving
        // this unlock may conclude that all other chunks are ready.
        self.unlock_all(true, &names);
        self.commit_time = Some(commit_time);
        Ok(commit_time)
    }

    // ==================================================================
    // Merge
    // ==================================================================

    /// Re-stage non-conflicting changes into `target`; report the rest per
    /// table.
    pub fn merge(
        &self,
        target: &mut Transaction,
        policies: &[AutoMergePolicy],
        conflicts: &mut ConflictMap,
    ) {
        conflicts.clear();
        for (name, transaction) in &self.table_txns {
            let Ok(target_txn) = target.table_txn(name) else {
                continue;
            };
            let mut sub_conflicts = Conflicts::new();
            transaction.merge(target_txn, policies, &mut sub_conflicts);
            if !sub_conflicts.is_empty() {
                conflicts.insert(name.clone(), sub_conflicts);
            }
        }
    }
}
