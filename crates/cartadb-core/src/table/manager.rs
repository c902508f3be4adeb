//! The process-wide table registry and metatable bootstrap.
//!
//! The first peer to define a table creates its chord ring and records the
//! schema in the metatable; later definers verify schema equality and join
//! the ring through the recorded entry point. A fixed chunk id names the
//! metatable chunk so every peer bootstraps to the same row.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::chunk::ChunkRef;
use crate::config::CartaConfig;
use crate::discovery::Discovery;
use crate::error::{CartaError, Result};
use crate::id::Id;
use crate::net::hub::PeerHub;
use crate::net::message::{Request, Response};
use crate::net::peer::PeerId;
use crate::revision::{FieldValue, Revision};
use crate::schema::{FieldKind, TableDescriptor};
use crate::table::net_table::NetTable;
use crate::time::LogicalTime;
use crate::txn::chunk_txn::ChunkTransaction;

pub const METATABLE_NAME: &str = "carta_metatable";
/// Fixed id of the metatable chunk; the shared bootstrap point.
pub const METATABLE_CHUNK_ID: Id = Id(0x3E1A1AB7E);

const FIELD_NAME: &str = "name";
const FIELD_STRUCTURE: &str = "structure";
const FIELD_PARTICIPANTS: &str = "participants";
const FIELD_LISTENERS: &str = "listeners";

fn metatable_descriptor() -> TableDescriptor {
    TableDescriptor::new(METATABLE_NAME)
        .add_field(FIELD_NAME, FieldKind::Text)
        .add_field(FIELD_STRUCTURE, FieldKind::Bytes)
        .add_field(FIELD_PARTICIPANTS, FieldKind::Bytes)
        .add_field(FIELD_LISTENERS, FieldKind::Bytes)
}

fn encode_peers(peers: &[PeerId]) -> FieldValue {
    FieldValue::Bytes(serde_json::to_vec(peers).expect("peer list encodes"))
}

fn decode_peers(value: Option<&FieldValue>) -> Vec<PeerId> {
    match value {
        Some(FieldValue::Bytes(bytes)) => serde_json::from_slice(bytes).unwrap_or_default(),
        _ => Vec::new(),
    }
}

pub struct TableManager {
    hub: Arc<PeerHub>,
    config: CartaConfig,
    discovery: Arc<dyn Discovery>,
    tables: RwLock<HashMap<String, Arc<NetTable>>>,
    metatable_chunk: Mutex<Option<ChunkRef>>,
}

impl TableManager {
    /// Build the manager and install it as the hub's request dispatcher.
    pub fn new(
        hub: Arc<PeerHub>,
        discovery: Arc<dyn Discovery>,
        config: CartaConfig,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            hub: Arc::clone(&hub),
            config,
            discovery,
            tables: RwLock::new(HashMap::new()),
            metatable_chunk: Mutex::new(None),
        });
        let weak: Weak<TableManager> = Arc::downgrade(&manager);
        hub.register_handler(Arc::new(move |sender, request| match weak.upgrade() {
            Some(manager) => manager.dispatch(sender, request),
            None => Response::Decline,
        }));
        manager
    }

    pub fn hub(&self) -> &Arc<PeerHub> {
        &self.hub
    }

    pub fn config(&self) -> &CartaConfig {
        &self.config
    }

    pub fn use_raft(&self) -> bool {
        self.config.use_raft
    }

    /// Bring up the metatable. The founding peer creates the ring and the
    /// fixed chunk; everyone else joins through a discovered peer.
    pub fn init(&self, create_metatable_chunk: bool) -> Result<()> {
        let metatable = NetTable::new(
            metatable_descriptor(),
            Arc::clone(&self.hub),
            self.config.clone(),
        );
        self.tables
            .write()
            .insert(METATABLE_NAME.to_string(), Arc::clone(&metatable));

        if create_metatable_chunk {
            metatable.create_index();
            let chunk = metatable.new_chunk_with_id(METATABLE_CHUNK_ID)?;
            *self.metatable_chunk.lock() = Some(chunk);
        } else {
            let entry_point = self.await_ready_peer()?;
            metatable.join_index(&entry_point)?;
            let chunk = metatable.get_chunk(METATABLE_CHUNK_ID)?;
            *self.metatable_chunk.lock() = Some(chunk);
        }
        self.discovery.announce()?;
        info!(
            "table manager up at {} ({})",
            self.hub.own_id(),
            if create_metatable_chunk {
                "founder"
            } else {
                "joiner"
            }
        );
        Ok(())
    }

    /// A peer from discovery that actually answers.
    fn await_ready_peer(&self) -> Result<PeerId> {
        for _ in 0..500 {
            for peer in self.discovery.get_peers()? {
                if self.hub.has_peer(&peer) {
                    return Ok(peer);
                }
            }
            thread::sleep(Duration::from_millis(10));
        }
        Err(CartaError::NotFound("no ready peer in discovery".into()))
    }

    pub fn metatable_chunk(&self) -> Option<ChunkRef> {
        self.metatable_chunk.lock().clone()
    }

    pub fn get_table(&self, name: &str) -> Option<Arc<NetTable>> {
        self.tables.read().get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    /// Define or join a table. First definer wins the schema; later
    /// definers must match it byte for byte.
    pub fn add_table(&self, descriptor: TableDescriptor) -> Result<Arc<NetTable>> {
        let name = descriptor.name().to_string();
        if name == METATABLE_NAME {
            return Err(CartaError::Invariant("the metatable is reserved".into()));
        }
        let table = {
            let mut tables = self.tables.write();
            if let Some(existing) = tables.get(&name) {
                if !existing.descriptor().structure_match(&descriptor) {
                    return Err(CartaError::Invariant(format!(
                        "table {name} already defined with a different schema"
                    )));
                }
                return Ok(Arc::clone(existing));
            }
            let table = NetTable::new(descriptor.clone(), Arc::clone(&self.hub), self.config.clone());
            tables.insert(name.clone(), Arc::clone(&table));
            table
        };

        let (first, entry_point, listeners) = self.sync_table_definition(&descriptor)?;
        if first {
            table.create_index();
        } else {
            table.join_index(&entry_point)?;
        }
        for listener in listeners {
            table.add_listener(listener);
        }
        info!(
            "table {name} {} (entry point {entry_point})",
            if first { "created" } else { "joined" }
        );
        Ok(table)
    }

    /// Record the table in the metatable, or verify against the existing
    /// row and register as participant. Retried on commit conflicts.
    fn sync_table_definition(
        &self,
        descriptor: &TableDescriptor,
    ) -> Result<(bool, PeerId, Vec<PeerId>)> {
        let chunk = self
            .metatable_chunk()
            .ok_or_else(|| CartaError::Invariant("table manager not initialized".into()))?;
        let own = self.hub.own_id().clone();
        let name_value = FieldValue::Text(descriptor.name().to_string());
        let structure = descriptor.canonical_bytes();

        loop {
            let mut transaction = ChunkTransaction::new(
                LogicalTime::sample(),
                chunk.clone(),
                metatable_descriptor().template(Id::default()),
                None,
            );
            match transaction.find_unique(FIELD_NAME, &name_value) {
                None => {
                    let mut row = Revision::new(Id::generate());
                    row.set(FIELD_NAME, name_value.clone());
                    row.set(FIELD_STRUCTURE, FieldValue::Bytes(structure.clone()));
                    row.set(FIELD_PARTICIPANTS, encode_peers(&[own.clone()]));
                    row.set(FIELD_LISTENERS, encode_peers(&[]));
                    transaction.insert(row)?;
                    match transaction.commit() {
                        Ok(_) => return Ok((true, own, Vec::new())),
                        Err(CartaError::Conflict(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Some(row) => {
                    match row.get(FIELD_STRUCTURE) {
                        Some(FieldValue::Bytes(recorded)) if *recorded == structure => {}
                        _ => {
                            return Err(CartaError::Invariant(format!(
                                "schema mismatch for table {}",
                                descriptor.name()
                            )))
                        }
                    }
                    let mut participants = decode_peers(row.get(FIELD_PARTICIPANTS));
                    let listeners = decode_peers(row.get(FIELD_LISTENERS));
                    let entry_point = participants
                        .first()
                        .cloned()
                        .ok_or_else(|| {
                            CartaError::Invariant("table row without participants".into())
                        })?;
                    if participants.contains(&own) {
                        return Ok((false, entry_point, listeners));
                    }
                    participants.push(own.clone());
                    let mut updated = row.copy_for_write();
                    updated.set(FIELD_PARTICIPANTS, encode_peers(&participants));
                    transaction.update(updated)?;
                    match transaction.commit() {
                        Ok(_) => return Ok((false, entry_point, listeners)),
                        Err(CartaError::Conflict(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Register this peer as a listener for new chunks of `table_name`.
    pub fn register_listener(&self, table_name: &str) -> Result<()> {
        let chunk = self
            .metatable_chunk()
            .ok_or_else(|| CartaError::Invariant("table manager not initialized".into()))?;
        let own = self.hub.own_id().clone();
        let name_value = FieldValue::Text(table_name.to_string());
        loop {
            let mut transaction = ChunkTransaction::new(
                LogicalTime::sample(),
                chunk.clone(),
                metatable_descriptor().template(Id::default()),
                None,
            );
            let row = transaction
                .find_unique(FIELD_NAME, &name_value)
                .ok_or_else(|| CartaError::NotFound(format!("table {table_name}")))?;
            let mut listeners = decode_peers(row.get(FIELD_LISTENERS));
            if listeners.contains(&own) {
                return Ok(());
            }
            listeners.push(own.clone());
            let mut updated = row.copy_for_write();
            updated.set(FIELD_LISTENERS, encode_peers(&listeners));
            transaction.update(updated)?;
            match transaction.commit() {
                Ok(_) => return Ok(()),
                Err(CartaError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Leave every chunk and ring, then withdraw from discovery.
    pub fn kill(&self) {
        let tables: Vec<Arc<NetTable>> = self.tables.read().values().cloned().collect();
        for table in tables {
            table.kill();
        }
        self.tables.write().clear();
        if let Err(e) = self.discovery.leave() {
            warn!("discovery leave failed: {e}");
        }
    }

    // ==================================================================
    // Request dispatch
    // ==================================================================

    fn with_table(&self, name: &str, job: impl FnOnce(&Arc<NetTable>) -> Response) -> Response {
        match self.get_table(name) {
            Some(table) => job(&table),
            None => {
                warn!("request for unknown table {name}");
                Response::NotFound
            }
        }
    }

    fn dispatch(&self, sender: &PeerId, request: Request) -> Response {
        match request {
            Request::Ping => Response::Ack,
            Request::ChunkConnect { table, chunk_id } => {
                self.with_table(&table, |t| t.handle_connect(chunk_id, sender))
            }
            Request::ChunkInit {
                table,
                chunk_id,
                peers,
                history,
            } => self.with_table(&table, |t| t.handle_init(chunk_id, peers, history, sender)),
            Request::ChunkInsert {
                table,
                chunk_id,
                revision,
            } => self.with_table(&table, |t| t.handle_insert(chunk_id, revision)),
            Request::ChunkUpdate {
                table,
                chunk_id,
                revision,
            } => self.with_table(&table, |t| t.handle_update(chunk_id, revision, sender)),
            Request::ChunkLock { table, chunk_id } => {
                self.with_table(&table, |t| t.handle_lock(chunk_id, sender))
            }
            Request::ChunkUnlock { table, chunk_id } => {
                self.with_table(&table, |t| t.handle_unlock(chunk_id, sender))
            }
            Request::ChunkNewPeer {
                table,
                chunk_id,
                peer,
            } => self.with_table(&table, |t| t.handle_new_peer(chunk_id, &peer, sender)),
            Request::ChunkLeave { table, chunk_id } => {
                self.with_table(&table, |t| t.handle_leave(chunk_id, sender))
            }
            Request::RaftInit {
                ref table,
                chunk_id,
                ref peers,
                ref entries,
            } => self.with_table(table, |t| {
                t.handle_raft_init(chunk_id, peers.clone(), entries.clone(), sender)
            }),
            Request::RaftAppendEntries { ref table, chunk_id, .. }
            | Request::RaftRequestVote { ref table, chunk_id, .. }
            | Request::RaftClientInsert { ref table, chunk_id, .. }
            | Request::RaftClientUpdate { ref table, chunk_id, .. }
            | Request::RaftJoinQuit { ref table, chunk_id, .. }
            | Request::RaftQueryState { ref table, chunk_id } => {
                let table_name = table.clone();
                self.with_table(&table_name, |t| t.handle_raft_request(chunk_id, request))
            }
            Request::CommitInfo {
                table,
                chunk_id,
                info,
            } => self.with_table(&table, |t| t.handle_commit_info(chunk_id, info)),
            Request::CommitUnlock {
                table,
                chunk_id,
                transaction_id,
                success,
            } => self.with_table(&table, |t| {
                t.handle_commit_unlock(chunk_id, transaction_id, success)
            }),
            Request::QueryCommitState {
                table,
                chunk_id,
                transaction_id,
            } => self.with_table(&table, |t| {
                t.handle_query_commit_state(chunk_id, transaction_id)
            }),
            Request::ChordRouted { table, rpc } => {
                self.with_table(&table, |t| t.handle_routed_chord_request(rpc))
            }
            Request::AnnounceToListeners { table, chunks } => {
                self.with_table(&table, |t| t.handle_chunk_announcement(chunks))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::FileDiscovery;

    fn manager(dir: &std::path::Path) -> Arc<TableManager> {
        let hub = PeerHub::bind("127.0.0.1:0", 2).unwrap();
        let discovery = Arc::new(FileDiscovery::new(
            hub.own_id().clone(),
            dir.join("discovery.txt"),
        ));
        TableManager::new(hub, discovery, CartaConfig::default())
    }

    #[test]
    fn test_founder_bootstraps_metatable() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.init(true).unwrap();
        let chunk = manager.metatable_chunk().unwrap();
        assert_eq!(chunk.id(), METATABLE_CHUNK_ID);
        assert!(manager.get_table(METATABLE_NAME).is_some());
        manager.kill();
        manager.hub().shutdown();
    }

    #[test]
    fn test_add_table_first_definer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.init(true).unwrap();

        let descriptor = TableDescriptor::new("poses").add_field("n", FieldKind::Int);
        let table = manager.add_table(descriptor.clone()).unwrap();
        assert_eq!(table.name(), "poses");

        // Re-adding with the same schema returns the same table.
        let again = manager.add_table(descriptor).unwrap();
        assert!(Arc::ptr_eq(&table, &again));

        // A different schema under the same name is rejected.
        let other = TableDescriptor::new("poses").add_field("n", FieldKind::Text);
        assert!(matches!(
            manager.add_table(other),
            Err(CartaError::Invariant(_))
        ));
        manager.kill();
        manager.hub().shutdown();
    }

    #[test]
    fn test_metatable_row_written() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.init(true).unwrap();
        let descriptor = TableDescriptor::new("poses").add_field("n", FieldKind::Int);
        manager.add_table(descriptor).unwrap();

        let chunk = manager.metatable_chunk().unwrap();
        let rows = chunk.dump(LogicalTime::sample());
        assert_eq!(rows.len(), 1);
        let row = rows.values().next().unwrap();
        assert_eq!(
            row.get(FIELD_NAME),
            Some(&FieldValue::Text("poses".to_string()))
        );
        let participants = decode_peers(row.get(FIELD_PARTICIPANTS));
        assert_eq!(participants, vec![manager.hub().own_id().clone()]);
        manager.kill();
        manager.hub().shutdown();
    }

    #[test]
    fn test_register_listener() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.init(true).unwrap();
        let descriptor = TableDescriptor::new("poses").add_field("n", FieldKind::Int);
        manager.add_table(descriptor).unwrap();
        manager.register_listener("poses").unwrap();

        let chunk = manager.metatable_chunk().unwrap();
        let rows = chunk.dump(LogicalTime::sample());
        let row = rows.values().next().unwrap();
        let listeners = decode_peers(row.get(FIELD_LISTENERS));
        assert_eq!(listeners, vec![manager.hub().own_id().clone()]);
        manager.kill();
        manager.hub().shutdown();
    }

    #[test]
    fn test_reserved_metatable_name() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.init(true).unwrap();
        assert!(manager.add_table(metatable_descriptor()).is_err());
        manager.kill();
        manager.hub().shutdown();
    }
}
