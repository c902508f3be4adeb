//! Legacy chunk coordination: a distributed read/write lock with
//! peer-quorum acquisition, ordered release and broadcast-patch replication.
//!
//! Only the write-lock holder may insert, update, remove or change the peer
//! set. Locks are requested from peers in ascending peer-id order; ties are
//! broken deterministically by id so that exactly one contender wins.
//!
//! Internal lock order: leave_lock -> lock state -> add_peer -> peers ->
//! triggers. Trigger callbacks and peer-add handling run on detached
//! threads, never on an RPC handler.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::chunk::lock::{DistributedRwLock, LockState};
use crate::config::{CartaConfig, UnlockStrategy};
use crate::container::{ChunkDataContainer, HistoryMap, RamContainer, RevisionMap};
use crate::error::{CartaError, Result};
use crate::id::Id;
use crate::net::hub::PeerHub;
use crate::net::message::{Request, Response};
use crate::net::peer::PeerId;
use crate::revision::Revision;
use crate::schema::TableDescriptor;
use crate::time::LogicalTime;

const DECLINE_RETRY: Duration = Duration::from_millis(5);
const ATTEMPT_BACKOFF: Duration = Duration::from_millis(1);

/// Coordination policy carved out of the peer config.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPolicy {
    pub unlock_strategy: UnlockStrategy,
    pub writelock_persist: bool,
}

impl From<&CartaConfig> for ChunkPolicy {
    fn from(config: &CartaConfig) -> Self {
        Self {
            unlock_strategy: config.unlock_strategy,
            writelock_persist: config.writelock_persist,
        }
    }
}

/// Invoked with the inserted and updated ids accumulated during the last
/// write session, after the lock is fully released.
pub type TriggerCallback = Box<dyn Fn(&HashSet<Id>, &HashSet<Id>) + Send + Sync>;

pub struct LegacyChunk {
    id: Id,
    table: String,
    hub: Arc<PeerHub>,
    policy: ChunkPolicy,
    data: RwLock<RamContainer>,
    /// The other peers of the swarm, ascending. Never contains self.
    peers: Mutex<BTreeSet<PeerId>>,
    lock: DistributedRwLock,
    leave_lock: RwLock<()>,
    add_peer_mutex: Mutex<()>,
    relinquished: AtomicBool,
    latest_commit_time: Mutex<LogicalTime>,
    triggers: Mutex<Vec<TriggerCallback>>,
    /// Read-held while trigger callbacks run; write = wait for completion.
    triggers_active: RwLock<()>,
    trigger_insertions: Mutex<HashSet<Id>>,
    trigger_updates: Mutex<HashSet<Id>>,
}

impl LegacyChunk {
    /// Bootstrap a fresh chunk on its first peer.
    pub fn new_bootstrap(
        id: Id,
        table: impl Into<String>,
        descriptor: &TableDescriptor,
        hub: Arc<PeerHub>,
        policy: ChunkPolicy,
    ) -> Result<Arc<Self>> {
        let mut container = RamContainer::new(id);
        container.init(descriptor)?;
        Ok(Arc::new(Self {
            id,
            table: table.into(),
            hub,
            policy,
            data: RwLock::new(container),
            peers: Mutex::new(BTreeSet::new()),
            lock: DistributedRwLock::new(),
            leave_lock: RwLock::new(()),
            add_peer_mutex: Mutex::new(()),
            relinquished: AtomicBool::new(false),
            latest_commit_time: Mutex::new(LogicalTime::default()),
            triggers: Mutex::new(Vec::new()),
            triggers_active: RwLock::new(()),
            trigger_insertions: Mutex::new(HashSet::new()),
            trigger_updates: Mutex::new(HashSet::new()),
        }))
    }

    /// Build a replica from an init snapshot sent by the current write-lock
    /// holder. The swarm list carries every holder including the sender;
    /// self is filtered out.
    pub fn new_from_init(
        id: Id,
        table: impl Into<String>,
        descriptor: &TableDescriptor,
        hub: Arc<PeerHub>,
        policy: ChunkPolicy,
        swarm: Vec<PeerId>,
        history: Vec<Revision>,
        sender: &PeerId,
    ) -> Result<Arc<Self>> {
        let mut container = RamContainer::new(id);
        container.init(descriptor)?;
        let mut latest = LogicalTime::default();
        for revision in history {
            latest = latest.max(revision.modification_time());
            container.patch(revision)?;
        }
        let own_id = hub.own_id().clone();
        let peers: BTreeSet<PeerId> = swarm.into_iter().filter(|peer| *peer != own_id).collect();
        Ok(Arc::new(Self {
            id,
            table: table.into(),
            hub,
            policy,
            data: RwLock::new(container),
            peers: Mutex::new(peers),
            lock: DistributedRwLock::new_write_locked_by(sender.clone()),
            leave_lock: RwLock::new(()),
            add_peer_mutex: Mutex::new(()),
            relinquished: AtomicBool::new(false),
            latest_commit_time: Mutex::new(latest),
            triggers: Mutex::new(Vec::new()),
            triggers_active: RwLock::new(()),
            trigger_insertions: Mutex::new(HashSet::new()),
            trigger_updates: Mutex::new(HashSet::new()),
        }))
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.lock().iter().cloned().collect()
    }

    pub fn own_peer(&self) -> &PeerId {
        self.hub.own_id()
    }

    pub fn is_relinquished(&self) -> bool {
        self.relinquished.load(Ordering::Acquire)
    }

    pub fn latest_commit_time(&self) -> LogicalTime {
        *self.latest_commit_time.lock()
    }

    fn sync_latest_commit_time(&self, revision: &Revision) {
        let mut latest = self.latest_commit_time.lock();
        let time = revision.modification_time();
        if time > *latest {
            *latest = time;
        }
    }

    fn message(&self, build: impl FnOnce(String, Id) -> Request) -> Request {
        build(self.table.clone(), self.id)
    }

    // ==================================================================
    // Distributed lock
    // ==================================================================

    pub fn read_lock(&self) {
        let me = self.hub.own_id().clone();
        let tid = thread::current().id();
        let mut inner = self.lock.inner.lock();
        if DistributedRwLock::is_writer(&inner, &me) && inner.thread == Some(tid) {
            // Reentrant case, e.g. reads while committing a transaction.
            inner.write_recursion_depth += 1;
            return;
        }
        while inner.state != LockState::Unlocked && inner.state != LockState::ReadLocked {
            self.lock.cv.wait(&mut inner);
        }
        assert!(!self.is_relinquished(), "read lock on relinquished chunk");
        inner.state = LockState::ReadLocked;
        inner.n_readers += 1;
    }

    /// Acquire the distributed write lock: collect a grant from every peer
    /// of the swarm in ascending id order.
    pub fn write_lock(&self) -> Result<()> {
        let me = self.hub.own_id().clone();
        let tid = thread::current().id();
        let mut inner = self.lock.inner.lock();
        if DistributedRwLock::is_writer(&inner, &me) && inner.thread == Some(tid) {
            inner.write_recursion_depth += 1;
            return Ok(());
        }
        // Self holds the lock on another thread: wait it out.
        while DistributedRwLock::is_writer(&inner, &me) && inner.thread != Some(tid) {
            self.lock.cv.wait(&mut inner);
        }
        loop {
            while !(inner.state == LockState::Unlocked
                || (inner.state == LockState::Attempting && inner.thread == Some(tid)))
            {
                self.lock.cv.wait(&mut inner);
            }
            assert!(!self.is_relinquished(), "write lock on relinquished chunk");
            inner.state = LockState::Attempting;
            inner.thread = Some(tid);
            // Release the local mutex while talking to peers, otherwise two
            // contending peers deadlock on each other's handlers.
            drop(inner);

            match self.acquire_peer_grants()? {
                true => break,
                false => {
                    thread::sleep(ATTEMPT_BACKOFF);
                    inner = self.lock.inner.lock();
                    continue;
                }
            }
        }
        let mut inner = self.lock.inner.lock();
        assert_eq!(inner.state, LockState::Attempting);
        inner.state = LockState::WriteLocked;
        inner.holder = Some(me);
        inner.thread = Some(tid);
        inner.write_recursion_depth += 1;
        Ok(())
    }

    /// One pass over the swarm. Ok(true) = all granted, Ok(false) =
    /// declined (caller restarts). Transport failures release the grants
    /// already collected and surface the error.
    fn acquire_peer_grants(&self) -> Result<bool> {
        let peers: Vec<PeerId> = self.peers.lock().iter().cloned().collect();
        let request = self.message(|table, chunk_id| Request::ChunkLock { table, chunk_id });
        let mut granted: Vec<PeerId> = Vec::with_capacity(peers.len());

        let outcome = (|| -> Result<bool> {
            if self.policy.writelock_persist {
                let Some(first) = peers.first() else {
                    return Ok(true);
                };
                match self.hub.request(first, &request)? {
                    Response::Ack => granted.push(first.clone()),
                    Response::Decline => return Ok(false),
                    other => {
                        return Err(CartaError::Transport(format!(
                            "lock request to {first} answered {other:?}"
                        )))
                    }
                }
                for peer in &peers[1..] {
                    loop {
                        match self.hub.request(peer, &request)? {
                            Response::Ack => {
                                granted.push(peer.clone());
                                break;
                            }
                            // Assuming no connection loss, only the lowest
                            // peer may decline; everyone else is retried
                            // until the contender ahead of us unlocks.
                            Response::Decline => thread::sleep(DECLINE_RETRY),
                            other => {
                                return Err(CartaError::Transport(format!(
                                    "lock request to {peer} answered {other:?}"
                                )))
                            }
                        }
                    }
                }
            } else {
                for peer in &peers {
                    match self.hub.request(peer, &request)? {
                        Response::Ack => granted.push(peer.clone()),
                        Response::Decline => return Ok(false),
                        other => {
                            return Err(CartaError::Transport(format!(
                                "lock request to {peer} answered {other:?}"
                            )))
                        }
                    }
                }
            }
            Ok(true)
        })();

        match outcome {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.release_grants(&granted);
                Ok(false)
            }
            Err(e) => {
                self.release_grants(&granted);
                let mut inner = self.lock.inner.lock();
                inner.state = LockState::Unlocked;
                inner.thread = None;
                drop(inner);
                self.lock.cv.notify_all();
                Err(e)
            }
        }
    }

    fn release_grants(&self, granted: &[PeerId]) {
        let request = self.message(|table, chunk_id| Request::ChunkUnlock { table, chunk_id });
        for peer in granted.iter().rev() {
            if self.hub.try_request(peer, &request).is_none() {
                warn!("failed to release declined lock at {peer}");
            }
        }
    }

    pub fn unlock(&self) -> Result<()> {
        let me = self.hub.own_id().clone();
        let tid = thread::current().id();
        let mut inner = self.lock.inner.lock();
        match inner.state {
            LockState::Unlocked => panic!("unlock of unlocked chunk {}", self.id),
            LockState::Attempting => panic!("cannot abort a lock attempt"),
            LockState::ReadLocked => {
                inner.n_readers -= 1;
                if inner.n_readers == 0 {
                    inner.state = LockState::Unlocked;
                    drop(inner);
                    self.lock.cv.notify_all();
                }
                Ok(())
            }
            LockState::WriteLocked => {
                assert_eq!(inner.holder.as_ref(), Some(&me));
                assert_eq!(inner.thread, Some(tid));
                inner.write_recursion_depth -= 1;
                if inner.write_recursion_depth > 0 {
                    return Ok(());
                }
                let _add_peer = self.add_peer_mutex.lock();
                // Peers can only change while someone else holds the lock,
                // so this snapshot is stable for the whole release.
                let peers: Vec<PeerId> = self.peers.lock().iter().cloned().collect();
                let request =
                    self.message(|table, chunk_id| Request::ChunkUnlock { table, chunk_id });
                let mut result = Ok(());
                if peers.is_empty() {
                    inner.state = LockState::Unlocked;
                    inner.holder = None;
                } else {
                    let mut self_unlocked = false;
                    match self.policy.unlock_strategy {
                        UnlockStrategy::Reverse => {
                            for peer in peers.iter().rev() {
                                if !self_unlocked && *peer < me {
                                    inner.state = LockState::Unlocked;
                                    inner.holder = None;
                                    self_unlocked = true;
                                }
                                result = result.and(self.send_unlock(peer, &request));
                            }
                        }
                        UnlockStrategy::Forward => {
                            for peer in &peers {
                                if !self_unlocked && me < *peer {
                                    inner.state = LockState::Unlocked;
                                    inner.holder = None;
                                    self_unlocked = true;
                                }
                                result = result.and(self.send_unlock(peer, &request));
                            }
                        }
                        UnlockStrategy::Random => {
                            let mut mixed = peers.clone();
                            fastrand::shuffle(&mut mixed);
                            for peer in &mixed {
                                result = result.and(self.send_unlock(peer, &request));
                            }
                        }
                    }
                    if !self_unlocked {
                        // Case we had the lowest id (or randomized release).
                        inner.state = LockState::Unlocked;
                        inner.holder = None;
                    }
                }
                drop(inner);
                self.lock.cv.notify_all();
                result
            }
        }
    }

    fn send_unlock(&self, peer: &PeerId, request: &Request) -> Result<()> {
        match self.hub.request(peer, request)? {
            Response::Ack => Ok(()),
            other => Err(CartaError::Transport(format!(
                "unlock at {peer} answered {other:?}"
            ))),
        }
    }

    /// True if the calling thread holds the distributed write lock.
    pub fn is_write_locked(&self) -> bool {
        self.lock.is_held_by_current_thread(self.hub.own_id())
    }

    // ==================================================================
    // Reads
    // ==================================================================

    pub fn get_by_id(&self, id: Id, time: LogicalTime) -> Option<Arc<Revision>> {
        self.read_lock();
        let result = self.data.read().get_by_id(id, time);
        self.unlock().ok();
        result
    }

    pub fn latest_at(&self, id: Id, time: LogicalTime) -> Option<Arc<Revision>> {
        self.read_lock();
        let result = self.data.read().latest_at(id, time);
        self.unlock().ok();
        result
    }

    pub fn dump(&self, time: LogicalTime) -> RevisionMap {
        self.read_lock();
        let result = self.data.read().dump(time);
        self.unlock().ok();
        result
    }

    pub fn get_available_ids(&self, time: LogicalTime) -> Vec<Id> {
        self.read_lock();
        let result = self.data.read().get_available_ids(time);
        self.unlock().ok();
        result
    }

    pub fn num_items(&self, time: LogicalTime) -> usize {
        self.read_lock();
        let result = self.data.read().count_at(time);
        self.unlock().ok();
        result
    }

    pub fn chunk_history(&self, time: LogicalTime) -> HistoryMap {
        self.read_lock();
        let result = self.data.read().chunk_history(time);
        self.unlock().ok();
        result
    }

    pub fn item_history(&self, id: Id, time: LogicalTime) -> Vec<Arc<Revision>> {
        self.read_lock();
        let result = self.data.read().item_history(id, time);
        self.unlock().ok();
        result
    }

    /// Every distinct commit time present in the chunk at `sample_time`.
    pub fn get_commit_times(&self, sample_time: LogicalTime) -> BTreeSet<LogicalTime> {
        let histories = self.chunk_history(sample_time);
        let mut times = BTreeSet::new();
        for history in histories.values() {
            for revision in history {
                times.insert(revision.modification_time());
            }
        }
        times
    }

    // ==================================================================
    // Writes
    // ==================================================================

    /// Insert a fresh record and replicate it to the swarm. Takes the read
    /// lock so that the peer set cannot change mid-broadcast.
    pub fn insert(&self, time: LogicalTime, revision: Revision) -> Result<Arc<Revision>> {
        self.read_lock();
        let result = (|| {
            let stored = self.data.write().insert(time, revision)?;
            self.broadcast_patch(&stored, true)?;
            self.sync_latest_commit_time(&stored);
            Ok(stored)
        })();
        self.unlock()?;
        result
    }

    /// Insert while the caller already holds the write lock.
    pub fn insert_locked(&self, time: LogicalTime, revision: Revision) -> Result<Arc<Revision>> {
        assert!(self.is_write_locked(), "insert_locked without write lock");
        let stored = self.data.write().insert(time, revision)?;
        self.broadcast_patch(&stored, true)?;
        self.sync_latest_commit_time(&stored);
        Ok(stored)
    }

    pub fn bulk_insert_locked(
        &self,
        time: LogicalTime,
        revisions: Vec<Revision>,
    ) -> Result<Vec<Arc<Revision>>> {
        revisions
            .into_iter()
            .map(|revision| self.insert_locked(time, revision))
            .collect()
    }

    /// Update under an externally held write lock.
    pub fn update_locked(&self, time: LogicalTime, revision: Revision) -> Result<Arc<Revision>> {
        assert!(self.is_write_locked(), "update without write lock");
        assert_eq!(revision.chunk_id(), self.id, "update of foreign revision");
        let stored = self.data.write().update(time, revision)?;
        self.broadcast_patch(&stored, false)?;
        self.sync_latest_commit_time(&stored);
        Ok(stored)
    }

    /// Remove (tombstone) under an externally held write lock.
    pub fn remove_locked(&self, time: LogicalTime, revision: Revision) -> Result<Arc<Revision>> {
        assert!(self.is_write_locked(), "remove without write lock");
        assert_eq!(revision.chunk_id(), self.id, "remove of foreign revision");
        let stored = self.data.write().remove(time, revision)?;
        self.broadcast_patch(&stored, false)?;
        self.sync_latest_commit_time(&stored);
        Ok(stored)
    }

    /// Convenience single-record update: lock, update, unlock.
    pub fn update(&self, revision: Revision) -> Result<Arc<Revision>> {
        self.write_lock()?;
        let result = self.update_locked(LogicalTime::sample(), revision);
        self.unlock()?;
        result
    }

    fn broadcast_patch(&self, stored: &Arc<Revision>, insert: bool) -> Result<()> {
        let peers: Vec<PeerId> = self.peers.lock().iter().cloned().collect();
        if peers.is_empty() {
            return Ok(());
        }
        let revision = (**stored).clone();
        let request = if insert {
            self.message(|table, chunk_id| Request::ChunkInsert {
                table,
                chunk_id,
                revision,
            })
        } else {
            self.message(|table, chunk_id| Request::ChunkUpdate {
                table,
                chunk_id,
                revision,
            })
        };
        self.hub.undisputable_broadcast(&peers, &request)
    }

    // ==================================================================
    // Swarm membership
    // ==================================================================

    /// Offer participation to every candidate not yet in the swarm.
    pub fn request_participation(self: &Arc<Self>, candidates: &[PeerId]) -> Result<usize> {
        self.write_lock()?;
        let result = (|| {
            let mut added = 0;
            for candidate in candidates {
                if candidate == self.hub.own_id() {
                    continue;
                }
                if self.peers.lock().contains(candidate) {
                    added += 1;
                    continue;
                }
                if self.add_peer(candidate)? {
                    added += 1;
                }
            }
            Ok(added)
        })();
        self.unlock()?;
        result
    }

    /// Hand the full state to `peer` and announce it to the old swarm.
    /// Requires the write lock.
    pub fn add_peer(&self, peer: &PeerId) -> Result<bool> {
        let _add_peer = self.add_peer_mutex.lock();
        assert!(self.is_write_locked(), "add_peer without write lock");
        if self.peers.lock().contains(peer) {
            return Ok(false);
        }
        let init = self.init_request();
        match self.hub.request(peer, &init) {
            Ok(Response::Ack) => {}
            Ok(other) => {
                warn!("{peer} did not accept init request: {other:?}");
                return Ok(false);
            }
            Err(e) => {
                warn!("{peer} unreachable for init request: {e}");
                return Ok(false);
            }
        }
        // One last message to the old swarm announcing the new
        // configuration.
        let old_swarm: Vec<PeerId> = self.peers.lock().iter().cloned().collect();
        let announce = self.message(|table, chunk_id| Request::ChunkNewPeer {
            table,
            chunk_id,
            peer: peer.clone(),
        });
        self.hub.undisputable_broadcast(&old_swarm, &announce)?;
        self.peers.lock().insert(peer.clone());
        Ok(true)
    }

    fn init_request(&self) -> Request {
        let mut swarm: Vec<PeerId> = self.peers.lock().iter().cloned().collect();
        swarm.push(self.hub.own_id().clone());
        let mut history = Vec::new();
        for item in self.data.read().chunk_history(LogicalTime::sample()).values() {
            for revision in item {
                history.push((**revision).clone());
            }
        }
        self.message(|table, chunk_id| Request::ChunkInit {
            table,
            chunk_id,
            peers: swarm,
            history,
        })
    }

    /// Leave the swarm: announce under the write lock, mark relinquished,
    /// release. Trigger callbacks are dropped first so none can fire into a
    /// dead chunk.
    pub fn leave(&self) -> Result<()> {
        {
            let mut triggers = self.triggers.lock();
            triggers.clear();
        }
        self.wait_for_trigger_completion();

        self.write_lock()?;
        {
            let _leave = self.leave_lock.write();
            let peers: Vec<PeerId> = self.peers.lock().iter().cloned().collect();
            let request = self.message(|table, chunk_id| Request::ChunkLeave { table, chunk_id });
            self.hub.undisputable_broadcast(&peers, &request)?;
            self.relinquished.store(true, Ordering::Release);
        }
        // Peers must accept this unlock from outside the swarm.
        self.unlock()
    }

    // ==================================================================
    // Triggers
    // ==================================================================

    pub fn attach_trigger(&self, callback: TriggerCallback) -> usize {
        let mut triggers = self.triggers.lock();
        triggers.push(callback);
        triggers.len() - 1
    }

    pub fn wait_for_trigger_completion(&self) {
        let _exclusive = self.triggers_active.write();
    }

    fn fire_triggers(self: &Arc<Self>, insertions: HashSet<Id>, updates: HashSet<Id>) {
        if self.triggers.lock().is_empty() {
            return;
        }
        let chunk = Arc::clone(self);
        thread::spawn(move || {
            let triggers = chunk.triggers.lock();
            let _active = chunk.triggers_active.read();
            debug!("{} trigger(s) called in chunk {}", triggers.len(), chunk.id);
            for trigger in triggers.iter() {
                trigger(&insertions, &updates);
            }
        });
    }

    // ==================================================================
    // Handlers
    // ==================================================================

    /// Connect requests lead to adding a peer, which requires the write
    /// lock; that must never run on an RPC handler thread, otherwise a
    /// locked chunk could never be unlocked through the busy handler pool.
    pub fn handle_connect(self: &Arc<Self>, requester: &PeerId) -> Response {
        let _leave = self.leave_lock.read();
        if self.is_relinquished() {
            return Response::Relinquished;
        }
        let chunk = Arc::clone(self);
        let requester = requester.clone();
        thread::spawn(move || {
            let _leave = chunk.leave_lock.read();
            if chunk.is_relinquished() {
                warn!("chunk {} left before handling a connect request", chunk.id);
                return;
            }
            if let Err(e) = chunk.write_lock() {
                warn!("connect handling failed to lock chunk {}: {e}", chunk.id);
                return;
            }
            if !chunk.peers.lock().contains(&requester) {
                if let Err(e) = chunk.add_peer(&requester) {
                    warn!("adding {requester} to chunk {} failed: {e}", chunk.id);
                }
            } else {
                debug!("peer {requester} already in swarm of chunk {}", chunk.id);
            }
            let _ = chunk.unlock();
        });
        Response::Ack
    }

    pub fn handle_insert(&self, revision: Revision) -> Response {
        let _leave = self.leave_lock.read();
        if self.is_relinquished() {
            return Response::Decline;
        }
        // An insert may not arrive while we ourselves hold the write lock;
        // inserts are replicated under the read lock only.
        {
            let inner = self.lock.inner.lock();
            assert!(
                !DistributedRwLock::is_writer(&inner, self.hub.own_id()),
                "replicated insert while write-locked locally"
            );
        }
        let id = revision.id();
        match self.data.write().patch(revision) {
            Ok(stored) => {
                self.sync_latest_commit_time(&stored);
                self.trigger_insertions.lock().insert(id);
                Response::Ack
            }
            Err(e) => {
                warn!("insert patch failed on chunk {}: {e}", self.id);
                Response::Decline
            }
        }
    }

    pub fn handle_update(&self, revision: Revision, sender: &PeerId) -> Response {
        let _leave = self.leave_lock.read();
        {
            let inner = self.lock.inner.lock();
            if !DistributedRwLock::is_writer(&inner, sender) {
                warn!("update from {sender} who is not the writer of {}", self.id);
                return Response::Decline;
            }
        }
        let id = revision.id();
        match self.data.write().patch(revision) {
            Ok(stored) => {
                self.sync_latest_commit_time(&stored);
                self.trigger_updates.lock().insert(id);
                Response::Ack
            }
            Err(e) => {
                warn!("update patch failed on chunk {}: {e}", self.id);
                Response::Decline
            }
        }
    }

    pub fn handle_lock(&self, locker: &PeerId) -> Response {
        let _leave = self.leave_lock.read();
        if self.is_relinquished() {
            // Possible when two peers lock for leaving at the same time.
            return Response::Decline;
        }
        let mut inner = self.lock.inner.lock();
        while inner.state == LockState::ReadLocked {
            self.lock.cv.wait(&mut inner);
        }
        // preempted_state must only be recorded on the actual grant, else
        // two contenders racing for the lock would corrupt it.
        match inner.state {
            LockState::Unlocked => {
                inner.preempted_state = LockState::Unlocked;
                inner.state = LockState::WriteLocked;
                inner.holder = Some(locker.clone());
                self.trigger_insertions.lock().clear();
                self.trigger_updates.lock().clear();
                Response::Ack
            }
            LockState::ReadLocked => unreachable!("waited out above"),
            LockState::Attempting => {
                // Two peers race for the lock and the loser does not know
                // yet. Grant to the requester unless we are the lowest
                // peer of the swarm, in which case the requester yields.
                let lowest = self.peers.lock().iter().next().cloned();
                let me = self.hub.own_id();
                if lowest.as_ref().map_or(true, |l| me < l) {
                    Response::Decline
                } else {
                    // No rollback of our own past requests needed: the
                    // requester can only be here having been granted by
                    // every peer below us.
                    inner.preempted_state = LockState::Attempting;
                    inner.state = LockState::WriteLocked;
                    inner.holder = Some(locker.clone());
                    self.trigger_insertions.lock().clear();
                    self.trigger_updates.lock().clear();
                    Response::Ack
                }
            }
            LockState::WriteLocked => Response::Decline,
        }
    }

    pub fn handle_unlock(self: &Arc<Self>, locker: &PeerId) -> Response {
        let _leave = self.leave_lock.read();
        let mut inner = self.lock.inner.lock();
        if inner.state != LockState::WriteLocked || inner.holder.as_ref() != Some(locker) {
            warn!("unlock from {locker} who does not hold chunk {}", self.id);
            return Response::Decline;
        }
        assert!(
            inner.preempted_state == LockState::Unlocked
                || inner.preempted_state == LockState::Attempting
        );
        inner.state = inner.preempted_state;
        inner.preempted_state = LockState::Unlocked;
        inner.holder = None;
        drop(inner);
        self.lock.cv.notify_all();

        let insertions = std::mem::take(&mut *self.trigger_insertions.lock());
        let updates = std::mem::take(&mut *self.trigger_updates.lock());
        self.fire_triggers(insertions, updates);
        Response::Ack
    }

    pub fn handle_new_peer(&self, peer: &PeerId, sender: &PeerId) -> Response {
        let _leave = self.leave_lock.read();
        let inner = self.lock.inner.lock();
        if !DistributedRwLock::is_writer(&inner, sender) {
            warn!("new-peer notice from non-writer {sender} for chunk {}", self.id);
            return Response::Decline;
        }
        self.peers.lock().insert(peer.clone());
        Response::Ack
    }

    pub fn handle_leave(&self, leaver: &PeerId) -> Response {
        let _leave = self.leave_lock.read();
        let inner = self.lock.inner.lock();
        if !DistributedRwLock::is_writer(&inner, leaver) {
            warn!("leave notice from non-writer {leaver} for chunk {}", self.id);
            return Response::Decline;
        }
        self.peers.lock().remove(leaver);
        Response::Ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::FieldValue;
    use crate::schema::{FieldKind, TableDescriptor};

    fn descriptor() -> TableDescriptor {
        TableDescriptor::new("poses").add_field("n", FieldKind::Int)
    }

    fn policy() -> ChunkPolicy {
        ChunkPolicy {
            unlock_strategy: UnlockStrategy::Reverse,
            writelock_persist: true,
        }
    }

    fn lone_chunk() -> (Arc<PeerHub>, Arc<LegacyChunk>) {
        let hub = PeerHub::bind("127.0.0.1:0", 1).unwrap();
        let chunk = LegacyChunk::new_bootstrap(
            Id::generate(),
            "poses",
            &descriptor(),
            Arc::clone(&hub),
            policy(),
        )
        .unwrap();
        (hub, chunk)
    }

    fn record(n: i64) -> Revision {
        let mut revision = Revision::new(Id::generate());
        revision.set("n", FieldValue::Int(n));
        revision
    }

    #[test]
    fn test_single_peer_insert_read() {
        let (hub, chunk) = lone_chunk();
        let stored = chunk.insert(LogicalTime::sample(), record(42)).unwrap();
        let read = chunk.get_by_id(stored.id(), LogicalTime::sample()).unwrap();
        assert_eq!(read.get("n"), Some(&FieldValue::Int(42)));
        assert_eq!(chunk.dump(LogicalTime::sample()).len(), 1);
        assert_eq!(chunk.latest_commit_time(), stored.modification_time());
        hub.shutdown();
    }

    #[test]
    fn test_write_lock_is_reentrant() {
        let (hub, chunk) = lone_chunk();
        chunk.write_lock().unwrap();
        chunk.write_lock().unwrap();
        assert!(chunk.is_write_locked());
        chunk.unlock().unwrap();
        assert!(chunk.is_write_locked());
        chunk.unlock().unwrap();
        assert!(!chunk.is_write_locked());
        hub.shutdown();
    }

    #[test]
    fn test_read_lock_inside_write_lock() {
        let (hub, chunk) = lone_chunk();
        chunk.write_lock().unwrap();
        let stored = chunk
            .insert_locked(LogicalTime::sample(), record(1))
            .unwrap();
        // Reads under the held write lock reenter instead of deadlocking.
        assert!(chunk.get_by_id(stored.id(), LogicalTime::sample()).is_some());
        chunk.unlock().unwrap();
        hub.shutdown();
    }

    #[test]
    fn test_update_requires_write_lock() {
        let (hub, chunk) = lone_chunk();
        let stored = chunk.insert(LogicalTime::sample(), record(1)).unwrap();
        chunk.write_lock().unwrap();
        let mut next = stored.copy_for_write();
        next.set("n", FieldValue::Int(2));
        chunk.update_locked(LogicalTime::sample(), next).unwrap();
        chunk.unlock().unwrap();

        let read = chunk.get_by_id(stored.id(), LogicalTime::sample()).unwrap();
        assert_eq!(read.get("n"), Some(&FieldValue::Int(2)));
        hub.shutdown();
    }

    #[test]
    fn test_remote_lock_grant_and_unlock() {
        let (hub, chunk) = lone_chunk();
        let locker = PeerId::new("10.0.0.9:1");
        assert!(chunk.handle_lock(&locker).is_ack());
        assert_eq!(chunk.lock.state(), LockState::WriteLocked);
        // Second writer is declined.
        let other = PeerId::new("10.0.0.9:2");
        assert!(chunk.handle_lock(&other).is_decline());
        // Only the holder may unlock.
        assert!(chunk.handle_unlock(&other).is_decline());
        assert!(chunk.handle_unlock(&locker).is_ack());
        assert_eq!(chunk.lock.state(), LockState::Unlocked);
        hub.shutdown();
    }

    #[test]
    fn test_tie_break_lowest_peer_declines() {
        let (hub, chunk) = lone_chunk();
        // Simulate a local attempt in flight.
        {
            let mut inner = chunk.lock.inner.lock();
            inner.state = LockState::Attempting;
            inner.thread = Some(thread::current().id());
        }
        // Swarm where we are the lowest peer: the requester must yield.
        chunk.peers.lock().insert(PeerId::new("zzz:1"));
        assert!(chunk.handle_lock(&PeerId::new("yyy:1")).is_decline());

        // Swarm with a peer below us: we yield to the requester.
        chunk.peers.lock().insert(PeerId::new("0.0.0.0:1"));
        let winner = PeerId::new("yyy:1");
        assert!(chunk.handle_lock(&winner).is_ack());
        {
            let inner = chunk.lock.inner.lock();
            assert_eq!(inner.state, LockState::WriteLocked);
            assert_eq!(inner.preempted_state, LockState::Attempting);
            assert_eq!(inner.holder.as_ref(), Some(&winner));
        }
        // The winner's unlock restores our attempt.
        assert!(chunk.handle_unlock(&winner).is_ack());
        assert_eq!(chunk.lock.state(), LockState::Attempting);
        hub.shutdown();
    }

    #[test]
    fn test_triggers_fire_after_remote_unlock() {
        let (hub, chunk) = lone_chunk();
        let (tx, rx) = crossbeam_channel::bounded(1);
        chunk.attach_trigger(Box::new(move |insertions, updates| {
            tx.send((insertions.len(), updates.len())).unwrap();
        }));

        let locker = PeerId::new("10.0.0.9:1");
        assert!(chunk.handle_lock(&locker).is_ack());

        // Build a fully stamped revision as the remote writer would; the
        // write lock is held by the remote peer, not us, so the replicated
        // patch path applies.
        let mut remote = RamContainer::new(chunk.id());
        let stored = remote.insert(LogicalTime::sample(), record(5)).unwrap();
        assert!(chunk.handle_insert((*stored).clone()).is_ack());

        assert!(chunk.handle_unlock(&locker).is_ack());
        let (insertions, updates) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((insertions, updates), (1, 0));
        chunk.wait_for_trigger_completion();
        hub.shutdown();
    }

    #[test]
    fn test_relinquished_chunk_declines() {
        let (hub, chunk) = lone_chunk();
        chunk.leave().unwrap();
        assert!(chunk.is_relinquished());
        assert!(matches!(
            chunk.handle_connect(&PeerId::new("x:1")),
            Response::Relinquished
        ));
        assert!(chunk.handle_lock(&PeerId::new("x:1")).is_decline());
        hub.shutdown();
    }

    #[test]
    fn test_init_snapshot_replica() {
        let (hub, chunk) = lone_chunk();
        let stored = chunk.insert(LogicalTime::sample(), record(7)).unwrap();

        let replica_hub = PeerHub::bind("127.0.0.1:0", 1).unwrap();
        let sender = hub.own_id().clone();
        let swarm = vec![sender.clone(), replica_hub.own_id().clone()];
        let history = vec![(*stored).clone()];
        let replica = LegacyChunk::new_from_init(
            chunk.id(),
            "poses",
            &descriptor(),
            Arc::clone(&replica_hub),
            policy(),
            swarm,
            history,
            &sender,
        )
        .unwrap();

        // Replica starts write-locked by the sender and already has the data.
        assert_eq!(replica.lock.state(), LockState::WriteLocked);
        assert_eq!(replica.peers(), vec![sender.clone()]);
        assert!(replica.handle_unlock(&sender).is_ack());
        let read = replica.get_by_id(stored.id(), LogicalTime::sample()).unwrap();
        assert_eq!(read.get("n"), Some(&FieldValue::Int(7)));
        replica_hub.shutdown();
        hub.shutdown();
    }
}
