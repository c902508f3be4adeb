//! Raft chunk coordination.
//!
//! The same chunk contract as the legacy lock, served by a replicated log:
//! leader election with randomized timeouts, log replication through
//! heartbeats that double as AppendEntries, majority commit, single-server
//! membership changes, and client routing with leader hints.
//!
//! Internal mutex order: state -> log -> commit -> peers -> trackers ->
//! heartbeat. Nothing is held across a network send.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chunk::legacy::TriggerCallback;
use crate::config::CartaConfig;
use crate::container::{ChunkDataContainer, HistoryMap, RamContainer, RevisionMap};
use crate::error::{CartaError, Result};
use crate::id::Id;
use crate::net::hub::PeerHub;
use crate::net::message::{Request, Response};
use crate::net::peer::PeerId;
use crate::revision::Revision;
use crate::schema::TableDescriptor;
use crate::time::LogicalTime;
use crate::txn::transaction::MultiChunkTransactionInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    Joining,
    Follower,
    Candidate,
    Leader,
    Disconnecting,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogOp {
    /// Appended by a fresh leader to commit entries of previous terms.
    Noop,
    InsertRevision(Revision),
    UpdateRevision(Revision),
    AddPeer(PeerId),
    RemovePeer(PeerId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub op: LogOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate: PeerId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader: PeerId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub match_index: u64,
}

/// Outcome of a client operation submitted to one member.
#[derive(Debug, Clone)]
pub enum ClientOutcome {
    /// Entry committed at this index.
    Committed(u64),
    /// This member is not the leader; retry at the hint.
    NotLeader(Option<PeerId>),
    /// Transient refusal (membership change in flight, lease held).
    Declined,
}

struct RaftState {
    role: RaftRole,
    current_term: u64,
    voted_for: Option<PeerId>,
    leader: Option<PeerId>,
    votes_received: usize,
}

struct CommitState {
    commit_index: u64,
    last_applied: u64,
}

#[derive(Debug, Clone, Copy)]
struct FollowerTracker {
    next_index: u64,
    match_index: u64,
}

/// Callback invoked with (inserted ids, updated ids) after a batch of
/// entries is applied. Runs on a detached thread.
type AppliedObserver = Box<dyn Fn(&HashSet<Id>, &HashSet<Id>) + Send + Sync>;

pub struct RaftNode {
    table: String,
    chunk_id: Id,
    hub: Arc<PeerHub>,
    state: Mutex<RaftState>,
    log: Mutex<Vec<LogEntry>>,
    commit: Mutex<CommitState>,
    commit_cv: Condvar,
    /// The other members; never contains self.
    peers: Mutex<BTreeSet<PeerId>>,
    trackers: Mutex<HashMap<PeerId, FollowerTracker>>,
    last_heartbeat: Mutex<Instant>,
    data: Arc<RwLock<RamContainer>>,
    /// Index of an uncommitted membership entry; 0 = none. The leader
    /// refuses further membership changes until it clears.
    pending_config: AtomicU64,
    /// Leader-side exclusive commit lease: write-lock of the raft chunk.
    lease: Mutex<Option<PeerId>>,
    election_timeout_ms: AtomicU64,
    election_min_ms: u64,
    election_max_ms: u64,
    heartbeat_interval: Duration,
    running: AtomicBool,
    driver: Mutex<Option<thread::JoinHandle<()>>>,
    applied_observer: Mutex<Option<AppliedObserver>>,
}

impl RaftNode {
    fn new(
        table: String,
        chunk_id: Id,
        hub: Arc<PeerHub>,
        data: Arc<RwLock<RamContainer>>,
        config: &CartaConfig,
        role: RaftRole,
    ) -> Arc<Self> {
        let timeout =
            config.election_timeout_min_ms + fastrand::u64(..config.election_timeout_max_ms - config.election_timeout_min_ms);
        Arc::new(Self {
            table,
            chunk_id,
            hub,
            state: Mutex::new(RaftState {
                role,
                current_term: 0,
                voted_for: None,
                leader: None,
                votes_received: 0,
            }),
            log: Mutex::new(Vec::new()),
            commit: Mutex::new(CommitState {
                commit_index: 0,
                last_applied: 0,
            }),
            commit_cv: Condvar::new(),
            peers: Mutex::new(BTreeSet::new()),
            trackers: Mutex::new(HashMap::new()),
            last_heartbeat: Mutex::new(Instant::now()),
            data,
            pending_config: AtomicU64::new(0),
            lease: Mutex::new(None),
            election_timeout_ms: AtomicU64::new(timeout),
            election_min_ms: config.election_timeout_min_ms,
            election_max_ms: config.election_timeout_max_ms,
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            running: AtomicBool::new(false),
            driver: Mutex::new(None),
            applied_observer: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn term(&self) -> u64 {
        self.state.lock().current_term
    }

    pub fn role(&self) -> RaftRole {
        self.state.lock().role
    }

    pub fn leader(&self) -> Option<PeerId> {
        self.state.lock().leader.clone()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn set_applied_observer(&self, observer: AppliedObserver) {
        *self.applied_observer.lock() = Some(observer);
    }

    fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.last_heartbeat.lock() = Instant::now();
        let node = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("raft-{}", self.chunk_id))
            .spawn(move || node.driver_loop())
            .expect("spawn raft driver");
        *self.driver.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.driver.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.state.lock().role = RaftRole::Stopped;
        self.commit_cv.notify_all();
    }

    fn driver_loop(self: &Arc<Self>) {
        while self.running.load(Ordering::Acquire) {
            thread::sleep(self.heartbeat_interval);
            let role = self.role();
            match role {
                RaftRole::Leader => {
                    self.replicate_to_followers();
                    self.apply_committed();
                }
                RaftRole::Follower | RaftRole::Candidate => {
                    self.apply_committed();
                    if self.election_timeout_elapsed() {
                        self.conduct_election();
                    }
                }
                RaftRole::Joining => {
                    // Wait for the leader's first AppendEntries.
                }
                RaftRole::Disconnecting | RaftRole::Stopped => break,
            }
        }
    }

    fn election_timeout_elapsed(&self) -> bool {
        let elapsed = self.last_heartbeat.lock().elapsed();
        elapsed >= Duration::from_millis(self.election_timeout_ms.load(Ordering::Relaxed))
    }

    fn reset_election_timeout(&self) {
        *self.last_heartbeat.lock() = Instant::now();
        let fresh =
            self.election_min_ms + fastrand::u64(..self.election_max_ms - self.election_min_ms);
        self.election_timeout_ms.store(fresh, Ordering::Relaxed);
    }

    fn last_log_info(log: &[LogEntry]) -> (u64, u64) {
        match log.last() {
            Some(entry) => (entry.index, entry.term),
            None => (0, 0),
        }
    }

    fn majority(&self) -> usize {
        let total = self.peers.lock().len() + 1;
        total / 2 + 1
    }

    // ==================================================================
    // Election
    // ==================================================================

    fn conduct_election(self: &Arc<Self>) {
        let (term, last_log_index, last_log_term, peers) = {
            let mut state = self.state.lock();
            state.role = RaftRole::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.hub.own_id().clone());
            state.votes_received = 1;
            state.leader = None;
            let log = self.log.lock();
            let (index, log_term) = Self::last_log_info(&log);
            (
                state.current_term,
                index,
                log_term,
                self.peers.lock().iter().cloned().collect::<Vec<_>>(),
            )
        };
        self.reset_election_timeout();
        debug!(
            "{} starting election for chunk {} in term {term}",
            self.hub.own_id(),
            self.chunk_id
        );
        if peers.is_empty() {
            // A lone member is its own majority.
            let mut state = self.state.lock();
            if state.role == RaftRole::Candidate && state.current_term == term {
                self.become_leader(&mut state);
            }
            return;
        }
        let request = Request::RaftRequestVote {
            table: self.table.clone(),
            chunk_id: self.chunk_id,
            request: VoteRequest {
                term,
                candidate: self.hub.own_id().clone(),
                last_log_index,
                last_log_term,
            },
        };
        for peer in peers {
            if self.role() != RaftRole::Candidate || self.term() != term {
                return;
            }
            match self.hub.try_request(&peer, &request) {
                Some(Response::Vote(vote)) => self.handle_vote_response(term, vote),
                Some(other) => debug!("{peer} answered vote request with {other:?}"),
                None => debug!("{peer} unreachable during election"),
            }
        }
    }

    fn handle_vote_response(&self, election_term: u64, vote: VoteResponse) {
        let mut state = self.state.lock();
        if vote.term > state.current_term {
            state.current_term = vote.term;
            state.role = RaftRole::Follower;
            state.voted_for = None;
            return;
        }
        if state.role != RaftRole::Candidate || state.current_term != election_term {
            return;
        }
        if vote.granted {
            state.votes_received += 1;
            if state.votes_received >= self.majority() {
                self.become_leader(&mut state);
            }
        }
    }

    fn become_leader(&self, state: &mut RaftState) {
        state.role = RaftRole::Leader;
        state.leader = Some(self.hub.own_id().clone());
        let mut log = self.log.lock();
        let next = log.len() as u64 + 1;
        {
            let peers: Vec<PeerId> = self.peers.lock().iter().cloned().collect();
            let mut trackers = self.trackers.lock();
            trackers.clear();
            for peer in peers {
                trackers.insert(
                    peer,
                    FollowerTracker {
                        next_index: next,
                        match_index: 0,
                    },
                );
            }
        }
        log.push(LogEntry {
            term: state.current_term,
            index: next,
            op: LogOp::Noop,
        });
        info!(
            "{} became leader of chunk {} in term {}",
            self.hub.own_id(),
            self.chunk_id,
            state.current_term
        );
    }

    pub fn handle_request_vote(&self, request: VoteRequest) -> VoteResponse {
        let mut state = self.state.lock();
        if request.term > state.current_term {
            state.current_term = request.term;
            state.role = RaftRole::Follower;
            state.voted_for = None;
        }
        let granted = if request.term < state.current_term
            || (state.voted_for.is_some() && state.voted_for.as_ref() != Some(&request.candidate))
        {
            false
        } else {
            // Only candidates with a log at least as up to date get the vote.
            let log = self.log.lock();
            let (my_last_index, my_last_term) = Self::last_log_info(&log);
            if request.last_log_term > my_last_term
                || (request.last_log_term == my_last_term
                    && request.last_log_index >= my_last_index)
            {
                state.voted_for = Some(request.candidate.clone());
                drop(log);
                drop(state);
                self.reset_election_timeout();
                return VoteResponse {
                    term: request.term,
                    granted: true,
                };
            }
            false
        };
        VoteResponse {
            term: state.current_term,
            granted,
        }
    }

    // ==================================================================
    // Replication
    // ==================================================================

    fn replicate_to_followers(self: &Arc<Self>) {
        let peers: Vec<PeerId> = self.peers.lock().iter().cloned().collect();
        for peer in peers {
            if self.role() != RaftRole::Leader {
                return;
            }
            let Some(request) = self.build_append_entries(&peer) else {
                continue;
            };
            let wrapped = Request::RaftAppendEntries {
                table: self.table.clone(),
                chunk_id: self.chunk_id,
                request,
            };
            match self.hub.try_request(&peer, &wrapped) {
                Some(Response::AppendEntries(response)) => {
                    self.handle_append_response(&peer, response)
                }
                Some(other) => debug!("{peer} answered append with {other:?}"),
                None => debug!("{peer} unreachable for append entries"),
            }
        }
    }

    fn build_append_entries(&self, peer: &PeerId) -> Option<AppendEntriesRequest> {
        let state = self.state.lock();
        if state.role != RaftRole::Leader {
            return None;
        }
        let term = state.current_term;
        let log = self.log.lock();
        let commit_index = self.commit.lock().commit_index;
        let next_index = self
            .trackers
            .lock()
            .get(peer)
            .map(|tracker| tracker.next_index)
            .unwrap_or(1);
        let prev_log_index = next_index.saturating_sub(1);
        let prev_log_term = if prev_log_index > 0 {
            log.get(prev_log_index as usize - 1).map(|e| e.term).unwrap_or(0)
        } else {
            0
        };
        let entries: Vec<LogEntry> = log.iter().skip(next_index as usize - 1).cloned().collect();
        Some(AppendEntriesRequest {
            term,
            leader: self.hub.own_id().clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: commit_index,
        })
    }

    fn handle_append_response(&self, peer: &PeerId, response: AppendEntriesResponse) {
        {
            let mut state = self.state.lock();
            if response.term > state.current_term {
                state.current_term = response.term;
                state.role = RaftRole::Follower;
                state.voted_for = None;
                return;
            }
            if state.role != RaftRole::Leader {
                return;
            }
        }
        let mut trackers = self.trackers.lock();
        let Some(tracker) = trackers.get_mut(peer) else {
            return;
        };
        if response.success {
            tracker.match_index = response.match_index;
            tracker.next_index = response.match_index + 1;
            drop(trackers);
            self.advance_commit_index();
        } else if tracker.next_index > 1 {
            tracker.next_index -= 1;
        }
    }

    /// Advance `commit_index` to the highest index replicated on a majority,
    /// counting only entries of the current term.
    fn advance_commit_index(&self) {
        let current_term = self.state.lock().current_term;
        let log = self.log.lock();
        let mut commit = self.commit.lock();
        let majority = self.majority();
        let trackers = self.trackers.lock();
        for candidate in (commit.commit_index + 1)..=(log.len() as u64) {
            if log[candidate as usize - 1].term != current_term {
                continue;
            }
            let replicas = 1 + trackers
                .values()
                .filter(|tracker| tracker.match_index >= candidate)
                .count();
            if replicas >= majority {
                commit.commit_index = candidate;
            }
        }
        drop(trackers);
        drop(commit);
        drop(log);
        self.commit_cv.notify_all();
    }

    pub fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.lock();
        if request.term < state.current_term {
            return AppendEntriesResponse {
                term: state.current_term,
                success: false,
                match_index: 0,
            };
        }
        if request.term > state.current_term {
            state.current_term = request.term;
            state.voted_for = None;
        }
        state.role = RaftRole::Follower;
        state.leader = Some(request.leader.clone());
        let current_term = state.current_term;

        let mut log = self.log.lock();
        // Log consistency check: the entry before the new ones must match.
        if request.prev_log_index > 0 {
            match log.get(request.prev_log_index as usize - 1) {
                Some(entry) if entry.term == request.prev_log_term => {}
                Some(_) => {
                    log.truncate(request.prev_log_index as usize - 1);
                    let match_index = log.len() as u64;
                    drop(log);
                    drop(state);
                    self.reset_election_timeout();
                    return AppendEntriesResponse {
                        term: current_term,
                        success: false,
                        match_index,
                    };
                }
                None => {
                    let match_index = log.len() as u64;
                    drop(log);
                    drop(state);
                    self.reset_election_timeout();
                    return AppendEntriesResponse {
                        term: current_term,
                        success: false,
                        match_index,
                    };
                }
            }
        }
        for entry in request.entries {
            let position = entry.index as usize - 1;
            if position < log.len() {
                if log[position].term != entry.term {
                    log.truncate(position);
                    log.push(entry);
                }
            } else {
                log.push(entry);
            }
        }
        let log_len = log.len() as u64;
        {
            let mut commit = self.commit.lock();
            if request.leader_commit > commit.commit_index {
                commit.commit_index = request.leader_commit.min(log_len);
            }
        }
        drop(log);
        drop(state);
        self.reset_election_timeout();
        self.commit_cv.notify_all();
        AppendEntriesResponse {
            term: current_term,
            success: true,
            match_index: log_len,
        }
    }

    // ==================================================================
    // Applying committed entries
    // ==================================================================

    fn apply_committed(self: &Arc<Self>) {
        let to_apply: Vec<LogEntry> = {
            let log = self.log.lock();
            let mut commit = self.commit.lock();
            let start = commit.last_applied as usize;
            let end = (commit.commit_index as usize).min(log.len());
            if start >= end {
                return;
            }
            commit.last_applied = end as u64;
            log[start..end].to_vec()
        };
        let mut inserted = HashSet::new();
        let mut updated = HashSet::new();
        for entry in to_apply {
            match entry.op {
                LogOp::Noop => {}
                LogOp::InsertRevision(revision) => {
                    let id = revision.id();
                    if let Err(e) = self.data.write().patch(revision) {
                        warn!("raft apply insert failed on {}: {e}", self.chunk_id);
                    } else {
                        inserted.insert(id);
                    }
                }
                LogOp::UpdateRevision(revision) => {
                    let id = revision.id();
                    if let Err(e) = self.data.write().patch(revision) {
                        warn!("raft apply update failed on {}: {e}", self.chunk_id);
                    } else {
                        updated.insert(id);
                    }
                }
                LogOp::AddPeer(peer) => {
                    if peer != *self.hub.own_id() {
                        self.peers.lock().insert(peer.clone());
                        let next = self.log.lock().len() as u64 + 1;
                        self.trackers.lock().entry(peer).or_insert(FollowerTracker {
                            next_index: next,
                            match_index: 0,
                        });
                    }
                    if self.pending_config.load(Ordering::Acquire) == entry.index {
                        self.pending_config.store(0, Ordering::Release);
                    }
                }
                LogOp::RemovePeer(peer) => {
                    if peer == *self.hub.own_id() {
                        info!("chunk {}: removed from raft group", self.chunk_id);
                        self.state.lock().role = RaftRole::Disconnecting;
                        self.running.store(false, Ordering::Release);
                    } else {
                        self.peers.lock().remove(&peer);
                        self.trackers.lock().remove(&peer);
                    }
                    if self.pending_config.load(Ordering::Acquire) == entry.index {
                        self.pending_config.store(0, Ordering::Release);
                    }
                }
            }
        }
        self.commit_cv.notify_all();
        if inserted.is_empty() && updated.is_empty() {
            return;
        }
        if self.applied_observer.lock().is_some() {
            let node = Arc::clone(self);
            thread::spawn(move || {
                if let Some(observer) = node.applied_observer.lock().as_ref() {
                    observer(&inserted, &updated);
                }
            });
        }
    }

    // ==================================================================
    // Client operations
    // ==================================================================

    /// Append an entry as leader and wait for it to commit.
    pub fn leader_append_and_wait(self: &Arc<Self>, op: LogOp) -> ClientOutcome {
        let index = {
            let state = self.state.lock();
            if state.role != RaftRole::Leader {
                return ClientOutcome::NotLeader(state.leader.clone());
            }
            let term = state.current_term;
            let mut log = self.log.lock();
            let index = log.len() as u64 + 1;
            log.push(LogEntry { term, index, op });
            index
        };
        self.wait_for_commit(index)
    }

    fn wait_for_commit(self: &Arc<Self>, index: u64) -> ClientOutcome {
        // A lone leader commits by itself.
        if self.peers.lock().is_empty() {
            let log_len = self.log.lock().len() as u64;
            self.commit.lock().commit_index = log_len;
            self.apply_committed();
            return ClientOutcome::Committed(index);
        }
        loop {
            {
                let commit = self.commit.lock();
                if commit.commit_index >= index {
                    drop(commit);
                    self.apply_committed();
                    return ClientOutcome::Committed(index);
                }
            }
            // Role is checked outside the commit guard: the state mutex is
            // above the commit mutex in the lock order.
            if self.role() != RaftRole::Leader || !self.is_running() {
                return ClientOutcome::NotLeader(self.leader());
            }
            let mut commit = self.commit.lock();
            if commit.commit_index < index {
                let _ = self
                    .commit_cv
                    .wait_for(&mut commit, Duration::from_millis(100));
            }
        }
    }

    pub fn handle_client_insert(self: &Arc<Self>, revision: Revision) -> ClientOutcome {
        self.leader_append_and_wait(LogOp::InsertRevision(revision))
    }

    pub fn handle_client_update(self: &Arc<Self>, revision: Revision) -> ClientOutcome {
        self.leader_append_and_wait(LogOp::UpdateRevision(revision))
    }

    /// Single-server membership change; declined while another is in
    /// flight.
    pub fn handle_join_quit(self: &Arc<Self>, peer: PeerId, join: bool) -> ClientOutcome {
        {
            let state = self.state.lock();
            if state.role != RaftRole::Leader {
                return ClientOutcome::NotLeader(state.leader.clone());
            }
        }
        if self.pending_config.load(Ordering::Acquire) != 0 {
            return ClientOutcome::Declined;
        }
        if join {
            // Hand the joiner the full state before the config entry
            // commits, so it can follow the very next heartbeat.
            let mut members: Vec<PeerId> = self.peers.lock().iter().cloned().collect();
            members.push(self.hub.own_id().clone());
            let entries: Vec<LogEntry> = self.log.lock().clone();
            let init = Request::RaftInit {
                table: self.table.clone(),
                chunk_id: self.chunk_id,
                peers: members,
                entries,
            };
            match self.hub.try_request(&peer, &init) {
                Some(Response::Ack) => {}
                other => {
                    warn!("joiner {peer} rejected init: {other:?}");
                    return ClientOutcome::Declined;
                }
            }
        }
        let op = if join {
            LogOp::AddPeer(peer)
        } else {
            LogOp::RemovePeer(peer)
        };
        let index = {
            let state = self.state.lock();
            if state.role != RaftRole::Leader {
                return ClientOutcome::NotLeader(state.leader.clone());
            }
            let term = state.current_term;
            let mut log = self.log.lock();
            let index = log.len() as u64 + 1;
            log.push(LogEntry { term, index, op });
            index
        };
        self.pending_config.store(index, Ordering::Release);
        self.wait_for_commit(index)
    }

    /// Install the init snapshot received from the leader.
    pub fn handle_init(&self, members: Vec<PeerId>, entries: Vec<LogEntry>, sender: &PeerId) {
        let own = self.hub.own_id();
        {
            let mut peers = self.peers.lock();
            peers.clear();
            peers.extend(members.into_iter().filter(|peer| peer != own));
        }
        {
            let mut log = self.log.lock();
            *log = entries;
        }
        let mut state = self.state.lock();
        state.role = RaftRole::Follower;
        state.leader = Some(sender.clone());
        drop(state);
        self.reset_election_timeout();
    }

    // ==================================================================
    // Commit lease (the raft chunk's explicit write lock)
    // ==================================================================

    pub fn handle_lease_request(&self, requester: &PeerId) -> Response {
        {
            let state = self.state.lock();
            if state.role != RaftRole::Leader {
                return Response::NotLeader {
                    hint: state.leader.clone(),
                };
            }
        }
        let mut lease = self.lease.lock();
        match lease.as_ref() {
            None => {
                *lease = Some(requester.clone());
                Response::EntryIndex(self.commit.lock().commit_index)
            }
            Some(holder) if holder == requester => {
                Response::EntryIndex(self.commit.lock().commit_index)
            }
            Some(_) => Response::Decline,
        }
    }

    pub fn handle_lease_release(&self, requester: &PeerId) -> Response {
        let mut lease = self.lease.lock();
        if lease.as_ref() == Some(requester) {
            *lease = None;
            Response::Ack
        } else {
            Response::Decline
        }
    }

    pub fn lease_holder(&self) -> Option<PeerId> {
        self.lease.lock().clone()
    }

    /// Block until the local container has applied everything up to `index`.
    pub fn wait_until_applied(self: &Arc<Self>, index: u64) {
        loop {
            self.apply_committed();
            let commit = self.commit.lock();
            if commit.last_applied >= index {
                return;
            }
            drop(commit);
            thread::sleep(Duration::from_millis(1));
        }
    }
}

// ======================================================================
// RaftChunk
// ======================================================================

struct PendingHandOff {
    info: MultiChunkTransactionInfo,
    since: Instant,
    resolved: Option<bool>,
}

/// A chunk whose coordination is served by a Raft group.
pub struct RaftChunk {
    id: Id,
    table: String,
    hub: Arc<PeerHub>,
    data: Arc<RwLock<RamContainer>>,
    node: Arc<RaftNode>,
    pending: Mutex<Option<PendingHandOff>>,
    resolve_timeout: Duration,
    latest_commit_time: Mutex<LogicalTime>,
    triggers: Mutex<Vec<TriggerCallback>>,
    /// True while this peer holds the leader's commit lease.
    holding_lease: AtomicBool,
}

impl RaftChunk {
    /// Bootstrap the first member of a chunk's raft group. Starts as
    /// follower; with no peers it elects itself after one timeout.
    pub fn new_bootstrap(
        id: Id,
        table: impl Into<String>,
        descriptor: &TableDescriptor,
        hub: Arc<PeerHub>,
        config: &CartaConfig,
    ) -> Result<Arc<Self>> {
        let table = table.into();
        let mut container = RamContainer::new(id);
        container.init(descriptor)?;
        let data = Arc::new(RwLock::new(container));
        let node = RaftNode::new(
            table.clone(),
            id,
            Arc::clone(&hub),
            Arc::clone(&data),
            config,
            RaftRole::Follower,
        );
        node.start();
        let chunk = Arc::new(Self {
            id,
            table,
            hub,
            data,
            node,
            pending: Mutex::new(None),
            resolve_timeout: Duration::from_millis(config.commit_resolve_timeout_ms),
            latest_commit_time: Mutex::new(LogicalTime::default()),
            triggers: Mutex::new(Vec::new()),
            holding_lease: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&chunk);
        chunk.node.set_applied_observer(Box::new(move |inserted, updated| {
            if let Some(chunk) = weak.upgrade() {
                let triggers = chunk.triggers.lock();
                for trigger in triggers.iter() {
                    trigger(inserted, updated);
                }
            }
        }));
        Ok(chunk)
    }

    pub fn attach_trigger(&self, callback: TriggerCallback) -> usize {
        let mut triggers = self.triggers.lock();
        triggers.push(callback);
        triggers.len() - 1
    }

    /// Build a member from the leader's init snapshot.
    pub fn new_from_init(
        id: Id,
        table: impl Into<String>,
        descriptor: &TableDescriptor,
        hub: Arc<PeerHub>,
        config: &CartaConfig,
        members: Vec<PeerId>,
        entries: Vec<LogEntry>,
        sender: &PeerId,
    ) -> Result<Arc<Self>> {
        let chunk = Self::new_bootstrap(id, table, descriptor, hub, config)?;
        chunk.node.handle_init(members, entries, sender);
        Ok(chunk)
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn node(&self) -> &Arc<RaftNode> {
        &self.node
    }

    pub fn stop(&self) {
        self.node.stop();
    }

    pub fn latest_commit_time(&self) -> LogicalTime {
        *self.latest_commit_time.lock()
    }

    fn sync_latest_commit_time(&self, time: LogicalTime) {
        let mut latest = self.latest_commit_time.lock();
        if time > *latest {
            *latest = time;
        }
    }

    // ------------------------------------------------------------------
    // Reads (committed local state)
    // ------------------------------------------------------------------

    pub fn get_by_id(&self, id: Id, time: LogicalTime) -> Option<Arc<Revision>> {
        self.data.read().get_by_id(id, time)
    }

    pub fn latest_at(&self, id: Id, time: LogicalTime) -> Option<Arc<Revision>> {
        self.data.read().latest_at(id, time)
    }

    pub fn dump(&self, time: LogicalTime) -> RevisionMap {
        self.data.read().dump(time)
    }

    pub fn get_available_ids(&self, time: LogicalTime) -> Vec<Id> {
        self.data.read().get_available_ids(time)
    }

    pub fn num_items(&self, time: LogicalTime) -> usize {
        self.data.read().count_at(time)
    }

    pub fn chunk_history(&self, time: LogicalTime) -> HistoryMap {
        self.data.read().chunk_history(time)
    }

    pub fn item_history(&self, id: Id, time: LogicalTime) -> Vec<Arc<Revision>> {
        self.data.read().item_history(id, time)
    }

    // ------------------------------------------------------------------
    // Writes (routed through the leader)
    // ------------------------------------------------------------------

    /// Stamp and submit an insert, retrying at the hinted leader.
    pub fn insert(&self, time: LogicalTime, mut revision: Revision) -> Result<Arc<Revision>> {
        revision.set_chunk_id(self.id);
        revision.set_insert_time(time);
        self.submit(revision, true)
    }

    /// Stamp and submit an update.
    pub fn update(&self, time: LogicalTime, mut revision: Revision) -> Result<Arc<Revision>> {
        let previous = self
            .latest_at(revision.id(), LogicalTime::sample())
            .ok_or_else(|| CartaError::NotFound(format!("id {}", revision.id())))?;
        revision.set_chunk_id(self.id);
        revision.set_insert_time(previous.insert_time());
        revision.set_update_time(time);
        self.submit(revision, false)
    }

    /// Stamp and submit a tombstone.
    pub fn remove(&self, time: LogicalTime, mut revision: Revision) -> Result<Arc<Revision>> {
        revision.set_removed();
        self.update(time, revision)
    }

    fn submit(&self, revision: Revision, insert: bool) -> Result<Arc<Revision>> {
        let time = revision.modification_time();
        let outcome = if self.node.role() == RaftRole::Leader {
            if insert {
                self.node.handle_client_insert(revision.clone())
            } else {
                self.node.handle_client_update(revision.clone())
            }
        } else {
            self.forward_to_leader(&revision, insert)?
        };
        match outcome {
            ClientOutcome::Committed(_) => {
                self.sync_latest_commit_time(time);
                Ok(Arc::new(revision))
            }
            ClientOutcome::NotLeader(_) => Err(CartaError::Decline(
                "no leader accepted the operation".into(),
            )),
            ClientOutcome::Declined => {
                Err(CartaError::Decline("raft group declined the operation".into()))
            }
        }
    }

    fn forward_to_leader(&self, revision: &Revision, insert: bool) -> Result<ClientOutcome> {
        let mut target = self
            .node
            .leader()
            .ok_or_else(|| CartaError::Decline("leader unknown".into()))?;
        for _ in 0..16 {
            let request = if insert {
                Request::RaftClientInsert {
                    table: self.table.clone(),
                    chunk_id: self.id,
                    revision: revision.clone(),
                }
            } else {
                Request::RaftClientUpdate {
                    table: self.table.clone(),
                    chunk_id: self.id,
                    revision: revision.clone(),
                }
            };
            match self.hub.request(&target, &request)? {
                Response::EntryIndex(index) => return Ok(ClientOutcome::Committed(index)),
                Response::NotLeader { hint: Some(hint) } => {
                    target = hint;
                    thread::sleep(Duration::from_millis(5));
                }
                Response::NotLeader { hint: None } | Response::Decline => {
                    thread::sleep(Duration::from_millis(20));
                }
                other => {
                    return Err(CartaError::Transport(format!(
                        "unexpected reply to client op: {other:?}"
                    )))
                }
            }
        }
        Ok(ClientOutcome::NotLeader(None))
    }

    // ------------------------------------------------------------------
    // Write lock = leader commit lease
    // ------------------------------------------------------------------

    /// Acquire the exclusive commit lease from the current leader and wait
    /// until the local replica has caught up with the leader's commit
    /// index. This is the raft chunk's write lock.
    pub fn write_lock(&self) -> Result<()> {
        let own = self.hub.own_id().clone();
        for _ in 0..64 {
            if self.node.role() == RaftRole::Leader {
                match self.node.handle_lease_request(&own) {
                    Response::EntryIndex(index) => {
                        self.holding_lease.store(true, Ordering::Release);
                        self.node.wait_until_applied(index);
                        return Ok(());
                    }
                    Response::Decline => {
                        thread::sleep(Duration::from_millis(10));
                        continue;
                    }
                    _ => {}
                }
                continue;
            }
            let Some(leader) = self.node.leader() else {
                thread::sleep(Duration::from_millis(20));
                continue;
            };
            let request = Request::ChunkLock {
                table: self.table.clone(),
                chunk_id: self.id,
            };
            match self.hub.request(&leader, &request)? {
                Response::EntryIndex(index) => {
                    self.holding_lease.store(true, Ordering::Release);
                    // Catch up with the leader's commit point before the
                    // caller starts its conflict checks.
                    self.node.wait_until_applied(index);
                    return Ok(());
                }
                Response::Decline => thread::sleep(Duration::from_millis(10)),
                Response::NotLeader { .. } => thread::sleep(Duration::from_millis(20)),
                other => {
                    return Err(CartaError::Transport(format!(
                        "unexpected reply to lease request: {other:?}"
                    )))
                }
            }
        }
        Err(CartaError::Decline("commit lease unavailable".into()))
    }

    /// Release the commit lease, resolving a pending hand-off locally and
    /// at every other member.
    pub fn unlock(&self, success: bool) -> Result<()> {
        let resolved_txn = {
            let mut pending = self.pending.lock();
            match pending.as_mut() {
                Some(hand_off) => {
                    hand_off.resolved = Some(success);
                    Some(hand_off.info.transaction_id)
                }
                None => None,
            }
        };
        if let Some(transaction_id) = resolved_txn {
            let request = Request::CommitUnlock {
                table: self.table.clone(),
                chunk_id: self.id,
                transaction_id,
                success,
            };
            for peer in self.node.peers.lock().iter().cloned().collect::<Vec<_>>() {
                let _ = self.hub.try_request(&peer, &request);
            }
        }
        self.holding_lease.store(false, Ordering::Release);
        let own = self.hub.own_id().clone();
        if self.node.role() == RaftRole::Leader {
            self.node.handle_lease_release(&own);
            return Ok(());
        }
        if let Some(leader) = self.node.leader() {
            let request = Request::ChunkUnlock {
                table: self.table.clone(),
                chunk_id: self.id,
            };
            let _ = self.hub.try_request(&leader, &request);
        }
        Ok(())
    }

    /// Write-lock state is explicit: the chunk is locked while its leader
    /// has granted a commit lease, either to this peer or (as seen from
    /// the leader) to any member.
    pub fn is_write_locked(&self) -> bool {
        self.holding_lease.load(Ordering::Acquire) || self.node.lease_holder().is_some()
    }

    // ------------------------------------------------------------------
    // Multi-chunk hand-off
    // ------------------------------------------------------------------

    /// The members of this chunk's raft group, self included.
    pub fn participants(&self) -> Vec<PeerId> {
        let mut members: Vec<PeerId> = self.node.peers.lock().iter().cloned().collect();
        members.push(self.hub.own_id().clone());
        members
    }

    /// Coordinator side: install the hand-off info on every member of the
    /// group, self included. All members must accept.
    pub fn broadcast_commit_info(&self, info: &MultiChunkTransactionInfo) -> bool {
        if !self.handle_commit_info(info.clone()).is_ack() {
            return false;
        }
        let request = Request::CommitInfo {
            table: self.table.clone(),
            chunk_id: self.id,
            info: info.clone(),
        };
        let peers: Vec<PeerId> = self.node.peers.lock().iter().cloned().collect();
        for peer in peers {
            match self.hub.try_request(&peer, &request) {
                Some(Response::Ack) => {}
                other => {
                    warn!("member {peer} rejected commit info: {other:?}");
                    return false;
                }
            }
        }
        true
    }

    /// Accept the transaction info under lock. Declined while another
    /// hand-off is unresolved.
    pub fn handle_commit_info(&self, info: MultiChunkTransactionInfo) -> Response {
        let mut pending = self.pending.lock();
        match pending.as_ref() {
            Some(hand_off) if hand_off.resolved.is_none() => {
                if hand_off.since.elapsed() > self.resolve_timeout {
                    drop(pending);
                    self.resolve_pending_commit();
                    pending = self.pending.lock();
                    if matches!(pending.as_ref(), Some(h) if h.resolved.is_none()) {
                        return Response::Decline;
                    }
                } else {
                    return Response::Decline;
                }
            }
            _ => {}
        }
        *pending = Some(PendingHandOff {
            info,
            since: Instant::now(),
            resolved: None,
        });
        Response::Ack
    }

    pub fn handle_commit_unlock(&self, transaction_id: Id, success: bool) -> Response {
        let mut pending = self.pending.lock();
        match pending.as_mut() {
            Some(hand_off) if hand_off.info.transaction_id == transaction_id => {
                hand_off.resolved = Some(success);
                Response::Ack
            }
            _ => Response::NotFound,
        }
    }

    pub fn handle_query_commit_state(&self, transaction_id: Id) -> Response {
        let pending = self.pending.lock();
        match pending.as_ref() {
            Some(hand_off) if hand_off.info.transaction_id == transaction_id => {
                Response::CommitState {
                    revisions_received: true,
                    resolved: hand_off.resolved,
                }
            }
            _ => Response::NotFound,
        }
    }

    /// Called when the coordinator went silent after acquiring locks: ask
    /// the other participants whether any of them saw the final unlock and
    /// adopt that verdict; an unreferenced transaction counts as aborted.
    pub fn resolve_pending_commit(&self) {
        let (transaction_id, participants) = {
            let pending = self.pending.lock();
            let Some(hand_off) = pending.as_ref() else {
                return;
            };
            if hand_off.resolved.is_some() {
                return;
            }
            (
                hand_off.info.transaction_id,
                hand_off.info.participants.clone(),
            )
        };
        let mut verdict = Some(false);
        for participant in &participants {
            if participant.chunk_id == self.id {
                continue;
            }
            for peer in &participant.peers {
                if peer == self.hub.own_id() {
                    continue;
                }
                let request = Request::QueryCommitState {
                    table: participant.table.clone(),
                    chunk_id: participant.chunk_id,
                    transaction_id,
                };
                match self.hub.try_request(peer, &request) {
                    Some(Response::CommitState {
                        resolved: Some(true),
                        ..
                    }) => {
                        verdict = Some(true);
                        break;
                    }
                    Some(Response::CommitState { .. }) | Some(Response::NotFound) => {}
                    _ => {
                        // Unreachable participant: stay unresolved, retry
                        // on the next stimulus.
                        verdict = None;
                    }
                }
            }
            if verdict == Some(true) {
                break;
            }
        }
        if let Some(resolution) = verdict {
            let mut pending = self.pending.lock();
            if let Some(hand_off) = pending.as_mut() {
                if hand_off.info.transaction_id == transaction_id {
                    hand_off.resolved = Some(resolution);
                    info!(
                        "chunk {} resolved orphaned hand-off {transaction_id} as {}",
                        self.id,
                        if resolution { "committed" } else { "aborted" }
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Bring `peer` into the raft group, routing through the leader.
    pub fn invite(&self, peer: &PeerId) -> Result<bool> {
        if peer == self.hub.own_id() || self.node.peers.lock().contains(peer) {
            return Ok(false);
        }
        if self.node.role() == RaftRole::Leader {
            return Ok(matches!(
                self.node.handle_join_quit(peer.clone(), true),
                ClientOutcome::Committed(_)
            ));
        }
        let Some(leader) = self.node.leader() else {
            return Ok(false);
        };
        let request = Request::RaftJoinQuit {
            table: self.table.clone(),
            chunk_id: self.id,
            peer: peer.clone(),
            join: true,
        };
        Ok(matches!(
            self.hub.request(&leader, &request)?,
            Response::EntryIndex(_)
        ))
    }

    /// Leave the raft group and stop the local node.
    pub fn leave(&self) -> Result<()> {
        let own = self.hub.own_id().clone();
        if self.node.role() == RaftRole::Leader {
            if self.node.peer_count() > 0 {
                let _ = self.node.handle_join_quit(own, false);
            }
        } else if let Some(leader) = self.node.leader() {
            let request = Request::RaftJoinQuit {
                table: self.table.clone(),
                chunk_id: self.id,
                peer: own,
                join: false,
            };
            let _ = self.hub.try_request(&leader, &request);
        }
        self.node.stop();
        Ok(())
    }

    // ------------------------------------------------------------------
    // RPC dispatch targets
    // ------------------------------------------------------------------

    pub fn handle_append_entries(&self, request: AppendEntriesRequest) -> Response {
        Response::AppendEntries(self.node.handle_append_entries(request))
    }

    pub fn handle_request_vote(&self, request: VoteRequest) -> Response {
        Response::Vote(self.node.handle_request_vote(request))
    }

    pub fn handle_client_insert(&self, revision: Revision) -> Response {
        let time = revision.modification_time();
        match self.node.handle_client_insert(revision) {
            ClientOutcome::Committed(index) => {
                self.sync_latest_commit_time(time);
                Response::EntryIndex(index)
            }
            ClientOutcome::NotLeader(hint) => Response::NotLeader { hint },
            ClientOutcome::Declined => Response::Decline,
        }
    }

    pub fn handle_client_update(&self, revision: Revision) -> Response {
        let time = revision.modification_time();
        match self.node.handle_client_update(revision) {
            ClientOutcome::Committed(index) => {
                self.sync_latest_commit_time(time);
                Response::EntryIndex(index)
            }
            ClientOutcome::NotLeader(hint) => Response::NotLeader { hint },
            ClientOutcome::Declined => Response::Decline,
        }
    }

    pub fn handle_join_quit(&self, peer: PeerId, join: bool) -> Response {
        match self.node.handle_join_quit(peer, join) {
            ClientOutcome::Committed(index) => Response::EntryIndex(index),
            ClientOutcome::NotLeader(hint) => Response::NotLeader { hint },
            ClientOutcome::Declined => Response::Decline,
        }
    }

    pub fn handle_query_state(&self) -> Response {
        Response::RaftState {
            role: self.node.role(),
            term: self.node.term(),
            leader: self.node.leader(),
        }
    }
}
