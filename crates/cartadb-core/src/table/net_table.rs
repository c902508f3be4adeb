//! Networked tables.
//!
//! A table owns its active chunks and its chord ring. Unknown chunks are
//! resolved through the ring and joined on demand; incoming chunk requests
//! are routed to the right chunk or declined.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::chord::{ChordIndex, ChordRpc};
use crate::chunk::raft::LogEntry;
use crate::chunk::{ChunkPolicy, ChunkRef, LegacyChunk, RaftChunk};
use crate::config::CartaConfig;
use crate::container::RevisionMap;
use crate::error::{CartaError, Result};
use crate::id::Id;
use crate::net::hub::PeerHub;
use crate::net::message::{Request, Response};
use crate::net::peer::PeerId;
use crate::revision::Revision;
use crate::schema::TableDescriptor;
use crate::time::LogicalTime;

const CONNECT_SPIN: Duration = Duration::from_millis(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maps a staged revision to the id of the record that should track the
/// chunks written for it, in the tracker table.
pub type TrackerDeterminer = Arc<dyn Fn(&Revision) -> Id + Send + Sync>;

pub struct NetTable {
    descriptor: TableDescriptor,
    hub: Arc<PeerHub>,
    config: CartaConfig,
    active_chunks: RwLock<HashMap<Id, ChunkRef>>,
    index: RwLock<Option<Arc<ChordIndex>>>,
    listeners: Mutex<BTreeSet<PeerId>>,
    /// tracker table name -> determiner for chunk tracking.
    new_chunk_trackers: RwLock<HashMap<String, TrackerDeterminer>>,
}

impl NetTable {
    pub fn new(descriptor: TableDescriptor, hub: Arc<PeerHub>, config: CartaConfig) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            hub,
            config,
            active_chunks: RwLock::new(HashMap::new()),
            index: RwLock::new(None),
            listeners: Mutex::new(BTreeSet::new()),
            new_chunk_trackers: RwLock::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    pub fn template(&self) -> Revision {
        self.descriptor.template(Id::default())
    }

    // ==================================================================
    // Chord ring
    // ==================================================================

    /// Found this table's ring (first definer).
    pub fn create_index(&self) {
        let mut index = self.index.write();
        assert!(index.is_none(), "index created twice for {}", self.name());
        let ring = ChordIndex::new(self.name(), Arc::clone(&self.hub));
        ring.create(Duration::from_millis(self.config.stabilize_interval_ms));
        *index = Some(ring);
    }

    /// Join the ring through a peer already in it.
    pub fn join_index(&self, entry_point: &PeerId) -> Result<()> {
        let mut index = self.index.write();
        assert!(index.is_none(), "index joined twice for {}", self.name());
        let ring = ChordIndex::new(self.name(), Arc::clone(&self.hub));
        ring.join(
            entry_point,
            Duration::from_millis(self.config.stabilize_interval_ms),
        )?;
        *index = Some(ring);
        Ok(())
    }

    fn with_index<T>(&self, job: impl FnOnce(&Arc<ChordIndex>) -> T) -> Result<T> {
        let index = self.index.read();
        match index.as_ref() {
            Some(ring) => Ok(job(ring)),
            None => Err(CartaError::Invariant(format!(
                "table {} has no chord index",
                self.name()
            ))),
        }
    }

    // ==================================================================
    // Chunks
    // ==================================================================

    pub fn new_chunk(&self) -> Result<ChunkRef> {
        self.new_chunk_with_id(Id::generate())
    }

    pub fn new_chunk_with_id(&self, chunk_id: Id) -> Result<ChunkRef> {
        let chunk = if self.config.use_raft {
            ChunkRef::Raft(RaftChunk::new_bootstrap(
                chunk_id,
                self.name(),
                &self.descriptor,
                Arc::clone(&self.hub),
                &self.config,
            )?)
        } else {
            ChunkRef::Legacy(LegacyChunk::new_bootstrap(
                chunk_id,
                self.name(),
                &self.descriptor,
                Arc::clone(&self.hub),
                ChunkPolicy::from(&self.config),
            )?)
        };
        {
            let mut chunks = self.active_chunks.write();
            if chunks.contains_key(&chunk_id) {
                return Err(CartaError::Invariant(format!(
                    "chunk {chunk_id} created twice"
                )));
            }
            chunks.insert(chunk_id, chunk.clone());
        }
        self.with_index(|index| index.announce_possession(chunk_id))??;
        self.announce_new_chunks_to_listeners(&[chunk_id]);
        Ok(chunk)
    }

    pub fn has_chunk(&self, chunk_id: Id) -> bool {
        self.active_chunks.read().contains_key(&chunk_id)
    }

    pub fn active_chunk_ids(&self) -> Vec<Id> {
        self.active_chunks.read().keys().copied().collect()
    }

    pub fn for_each_chunk(&self, mut job: impl FnMut(&ChunkRef)) {
        let chunks = self.active_chunks.read();
        for chunk in chunks.values() {
            job(chunk);
        }
    }

    /// Get a chunk, resolving holders through the ring and joining on
    /// demand when it is not active locally. Holder lookups are retried
    /// briefly: right after ring churn the responsible node may not have
    /// received the possession records yet.
    pub fn get_chunk(&self, chunk_id: Id) -> Result<ChunkRef> {
        if let Some(chunk) = self.active_chunks.read().get(&chunk_id) {
            return Ok(chunk.clone());
        }
        let own = self.hub.own_id();
        let mut last_error =
            CartaError::NotFound(format!("no holder for chunk {chunk_id} of {}", self.name()));
        for attempt in 0..50 {
            let holders = self.with_index(|index| index.seek_peers(chunk_id))??;
            for holder in holders.iter().filter(|peer| *peer != own) {
                match self.connect_to(chunk_id, holder) {
                    Ok(chunk) => return Ok(chunk),
                    Err(e) => {
                        debug!("connect to {holder} for chunk {chunk_id} failed: {e}");
                        last_error = e;
                    }
                }
            }
            if attempt < 49 {
                thread::sleep(Duration::from_millis(20));
            }
        }
        Err(last_error)
    }

    /// Ask `holder` to take us into the chunk's swarm, then wait for the
    /// init handshake to install the chunk locally.
    fn connect_to(&self, chunk_id: Id, holder: &PeerId) -> Result<ChunkRef> {
        if self.config.use_raft {
            self.raft_join(chunk_id, holder)?;
        } else {
            let request = Request::ChunkConnect {
                table: self.name().to_string(),
                chunk_id,
            };
            match self.hub.request(holder, &request)? {
                Response::Ack => {}
                Response::Relinquished => return Err(CartaError::Relinquished),
                other => {
                    return Err(CartaError::Decline(format!(
                        "connect to {holder} answered {other:?}"
                    )))
                }
            }
        }
        // The holder's handler adds us asynchronously; wait for the init
        // to land.
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        loop {
            if let Some(chunk) = self.active_chunks.read().get(&chunk_id) {
                return Ok(chunk.clone());
            }
            if Instant::now() > deadline {
                return Err(CartaError::Transport(format!(
                    "{holder} never delivered chunk {chunk_id}"
                )));
            }
            thread::sleep(CONNECT_SPIN);
        }
    }

    fn raft_join(&self, chunk_id: Id, holder: &PeerId) -> Result<()> {
        let mut target = holder.clone();
        for _ in 0..32 {
            let request = Request::RaftJoinQuit {
                table: self.name().to_string(),
                chunk_id,
                peer: self.hub.own_id().clone(),
                join: true,
            };
            match self.hub.request(&target, &request)? {
                Response::EntryIndex(_) => return Ok(()),
                Response::NotLeader { hint: Some(hint) } => target = hint,
                Response::NotLeader { hint: None } | Response::Decline => {
                    thread::sleep(Duration::from_millis(20));
                }
                other => {
                    return Err(CartaError::Decline(format!(
                        "raft join answered {other:?}"
                    )))
                }
            }
        }
        Err(CartaError::Decline("raft join never reached the leader".into()))
    }

    // ==================================================================
    // Data access
    // ==================================================================

    pub fn insert(&self, chunk: &ChunkRef, revision: Revision) -> Result<Arc<Revision>> {
        chunk.insert(LogicalTime::sample(), revision)
    }

    /// Route an update by the revision's chunk id.
    pub fn update(&self, revision: Revision) -> Result<Arc<Revision>> {
        let chunk = self.get_chunk(revision.chunk_id())?;
        chunk.write_lock()?;
        let result = chunk.commit_update(LogicalTime::sample(), revision);
        chunk.unlock(result.is_ok())?;
        result
    }

    pub fn get_by_id(&self, id: Id, time: LogicalTime) -> Option<Arc<Revision>> {
        let chunks = self.active_chunks.read();
        chunks.values().find_map(|chunk| chunk.get_by_id(id, time))
    }

    pub fn dump_active_chunks(&self, time: LogicalTime) -> RevisionMap {
        let mut result = RevisionMap::new();
        self.for_each_chunk(|chunk| {
            result.extend(chunk.dump(time));
        });
        result
    }

    pub fn num_items(&self, time: LogicalTime) -> usize {
        let mut count = 0;
        self.for_each_chunk(|chunk| count += chunk.num_items(time));
        count
    }

    // ==================================================================
    // Sharing & lifecycle
    // ==================================================================

    /// Offer every active chunk to `candidates`.
    pub fn share_all_chunks(&self, candidates: &[PeerId]) -> Result<usize> {
        let chunks: Vec<ChunkRef> = self.active_chunks.read().values().cloned().collect();
        let mut shared = 0;
        for chunk in chunks {
            shared += chunk.request_participation(candidates)?;
        }
        Ok(shared)
    }

    pub fn leave_all_chunks(&self) {
        let chunks: Vec<ChunkRef> = self.active_chunks.read().values().cloned().collect();
        for chunk in chunks {
            if let Err(e) = chunk.leave() {
                warn!("leaving chunk {} failed: {e}", chunk.id());
            }
            if let Ok(Err(e)) = self.with_index(|index| index.renounce_possession(chunk.id())) {
                debug!("renouncing chunk {} failed: {e}", chunk.id());
            }
        }
        self.active_chunks.write().clear();
    }

    pub fn kill(&self) {
        self.leave_all_chunks();
        let index = self.index.write().take();
        if let Some(ring) = index {
            ring.leave();
        }
    }

    pub fn statistics(&self) -> String {
        let now = LogicalTime::sample();
        format!(
            "{}: {} chunk(s), {} item(s)",
            self.name(),
            self.active_chunks.read().len(),
            self.num_items(now)
        )
    }

    // ==================================================================
    // Listeners & chunk tracking
    // ==================================================================

    pub fn add_listener(&self, peer: PeerId) {
        self.listeners.lock().insert(peer);
    }

    pub fn listeners(&self) -> Vec<PeerId> {
        self.listeners.lock().iter().cloned().collect()
    }

    fn announce_new_chunks_to_listeners(&self, chunk_ids: &[Id]) {
        let listeners = self.listeners();
        if listeners.is_empty() {
            return;
        }
        let request = Request::AnnounceToListeners {
            table: self.name().to_string(),
            chunks: chunk_ids.to_vec(),
        };
        for listener in listeners {
            if self.hub.try_request(&listener, &request).is_none() {
                debug!("listener {listener} unreachable for chunk announcement");
            }
        }
    }

    /// Register chunk tracking: items of this table get tracked by the
    /// record that `determiner` names in `tracker_table`.
    pub fn attach_new_chunk_tracker(
        &self,
        tracker_table: impl Into<String>,
        determiner: TrackerDeterminer,
    ) {
        self.new_chunk_trackers
            .write()
            .insert(tracker_table.into(), determiner);
    }

    pub fn chunk_trackers(&self) -> HashMap<String, TrackerDeterminer> {
        self.new_chunk_trackers.read().clone()
    }

    // ==================================================================
    // Request routing
    // ==================================================================

    fn route(&self, chunk_id: Id) -> Option<ChunkRef> {
        let found = self.active_chunks.read().get(&chunk_id).cloned();
        if found.is_none() {
            warn!(
                "table {}: request for unknown chunk {chunk_id}",
                self.name()
            );
        }
        found
    }

    pub fn handle_connect(&self, chunk_id: Id, sender: &PeerId) -> Response {
        match self.route(chunk_id) {
            Some(ChunkRef::Legacy(chunk)) => chunk.handle_connect(sender),
            Some(ChunkRef::Raft(_)) => Response::Decline,
            None => Response::NotFound,
        }
    }

    pub fn handle_init(
        &self,
        chunk_id: Id,
        peers: Vec<PeerId>,
        history: Vec<Revision>,
        sender: &PeerId,
    ) -> Response {
        if self.has_chunk(chunk_id) {
            warn!("duplicate init for chunk {chunk_id} of {}", self.name());
            return Response::Ack;
        }
        let chunk = match LegacyChunk::new_from_init(
            chunk_id,
            self.name(),
            &self.descriptor,
            Arc::clone(&self.hub),
            ChunkPolicy::from(&self.config),
            peers,
            history,
            sender,
        ) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("init of chunk {chunk_id} failed: {e}");
                return Response::Decline;
            }
        };
        self.active_chunks
            .write()
            .insert(chunk_id, ChunkRef::Legacy(chunk));
        if let Ok(Err(e)) = self.with_index(|index| index.announce_possession(chunk_id)) {
            debug!("announcing chunk {chunk_id} failed: {e}");
        }
        info!("joined chunk {chunk_id} of table {}", self.name());
        Response::Ack
    }

    pub fn handle_raft_init(
        &self,
        chunk_id: Id,
        members: Vec<PeerId>,
        entries: Vec<LogEntry>,
        sender: &PeerId,
    ) -> Response {
        if let Some(ChunkRef::Raft(chunk)) = self.active_chunks.read().get(&chunk_id) {
            chunk.node().handle_init(members, entries, sender);
            return Response::Ack;
        }
        let chunk = match RaftChunk::new_from_init(
            chunk_id,
            self.name(),
            &self.descriptor,
            Arc::clone(&self.hub),
            &self.config,
            members,
            entries,
            sender,
        ) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("raft init of chunk {chunk_id} failed: {e}");
                return Response::Decline;
            }
        };
        self.active_chunks
            .write()
            .insert(chunk_id, ChunkRef::Raft(chunk));
        if let Ok(Err(e)) = self.with_index(|index| index.announce_possession(chunk_id)) {
            debug!("announcing chunk {chunk_id} failed: {e}");
        }
        info!("joined raft chunk {chunk_id} of table {}", self.name());
        Response::Ack
    }

    pub fn handle_insert(&self, chunk_id: Id, revision: Revision) -> Response {
        match self.route(chunk_id) {
            Some(ChunkRef::Legacy(chunk)) => chunk.handle_insert(revision),
            Some(ChunkRef::Raft(_)) => Response::Decline,
            None => Response::NotFound,
        }
    }

    pub fn handle_update(&self, chunk_id: Id, revision: Revision, sender: &PeerId) -> Response {
        match self.route(chunk_id) {
            Some(ChunkRef::Legacy(chunk)) => chunk.handle_update(revision, sender),
            Some(ChunkRef::Raft(_)) => Response::Decline,
            None => Response::NotFound,
        }
    }

    pub fn handle_lock(&self, chunk_id: Id, sender: &PeerId) -> Response {
        match self.route(chunk_id) {
            Some(ChunkRef::Legacy(chunk)) => chunk.handle_lock(sender),
            Some(ChunkRef::Raft(chunk)) => chunk.node().handle_lease_request(sender),
            None => Response::NotFound,
        }
    }

    pub fn handle_unlock(&self, chunk_id: Id, sender: &PeerId) -> Response {
        match self.route(chunk_id) {
            Some(ChunkRef::Legacy(chunk)) => chunk.handle_unlock(sender),
            Some(ChunkRef::Raft(chunk)) => chunk.node().handle_lease_release(sender),
            None => Response::NotFound,
        }
    }

    pub fn handle_new_peer(&self, chunk_id: Id, peer: &PeerId, sender: &PeerId) -> Response {
        match self.route(chunk_id) {
            Some(ChunkRef::Legacy(chunk)) => chunk.handle_new_peer(peer, sender),
            Some(ChunkRef::Raft(_)) => Response::Decline,
            None => Response::NotFound,
        }
    }

    pub fn handle_leave(&self, chunk_id: Id, sender: &PeerId) -> Response {
        match self.route(chunk_id) {
            Some(ChunkRef::Legacy(chunk)) => chunk.handle_leave(sender),
            Some(ChunkRef::Raft(_)) => Response::Decline,
            None => Response::NotFound,
        }
    }

    pub fn handle_raft_request(&self, chunk_id: Id, request: Request) -> Response {
        let Some(ChunkRef::Raft(chunk)) = self.route(chunk_id) else {
            return Response::NotFound;
        };
        match request {
            Request::RaftAppendEntries { request, .. } => chunk.handle_append_entries(request),
            Request::RaftRequestVote { request, .. } => chunk.handle_request_vote(request),
            Request::RaftClientInsert { revision, .. } => chunk.handle_client_insert(revision),
            Request::RaftClientUpdate { revision, .. } => chunk.handle_client_update(revision),
            Request::RaftJoinQuit { peer, join, .. } => chunk.handle_join_quit(peer, join),
            Request::RaftQueryState { .. } => chunk.handle_query_state(),
            _ => Response::Decline,
        }
    }

    pub fn handle_commit_info(
        &self,
        chunk_id: Id,
        info: crate::txn::transaction::MultiChunkTransactionInfo,
    ) -> Response {
        match self.route(chunk_id) {
            Some(ChunkRef::Raft(chunk)) => chunk.handle_commit_info(info),
            Some(ChunkRef::Legacy(_)) => Response::Ack,
            None => Response::NotFound,
        }
    }

    pub fn handle_commit_unlock(&self, chunk_id: Id, transaction_id: Id, success: bool) -> Response {
        match self.route(chunk_id) {
            Some(ChunkRef::Raft(chunk)) => chunk.handle_commit_unlock(transaction_id, success),
            Some(ChunkRef::Legacy(_)) => Response::Ack,
            None => Response::NotFound,
        }
    }

    pub fn handle_query_commit_state(&self, chunk_id: Id, transaction_id: Id) -> Response {
        match self.route(chunk_id) {
            Some(ChunkRef::Raft(chunk)) => chunk.handle_query_commit_state(transaction_id),
            _ => Response::NotFound,
        }
    }

    pub fn handle_routed_chord_request(&self, rpc: ChordRpc) -> Response {
        match self.with_index(|index| index.handle_routed(rpc)) {
            Ok(response) => response,
            Err(_) => Response::Decline,
        }
    }

    /// A listener learned of new chunks: fetch them in the background.
    pub fn handle_chunk_announcement(self: &Arc<Self>, chunks: Vec<Id>) -> Response {
        let table = Arc::clone(self);
        thread::spawn(move || {
            for chunk_id in chunks {
                if let Err(e) = table.get_chunk(chunk_id) {
                    warn!(
                        "fetching announced chunk {chunk_id} of {} failed: {e}",
                        table.name()
                    );
                }
            }
        });
        Response::Ack
    }
}
