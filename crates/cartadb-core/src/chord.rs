//! Chord distributed hash index.
//!
//! Every table owns one ring. Nodes publish which chunks they hold under
//! `hash(chunk id)`; lookups route `find_successor` queries around the ring.
//! Finger maintenance is lazy (fixed up on `notify`) with a periodic
//! stabilization pass reconciling successor/predecessor links.

use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CartaError, Result};
use crate::id::Id;
use crate::net::hub::PeerHub;
use crate::net::message::{Request, Response};
use crate::net::peer::PeerId;

pub type ChordKey = u64;

/// Finger table size: one finger per bit of the key space.
pub const FINGER_COUNT: usize = 64;
/// Successor list length.
pub const SUCCESSOR_LIST_LEN: usize = 3;

pub fn hash_peer(peer: &PeerId) -> ChordKey {
    hash_value(peer.address())
}

pub fn hash_chunk(chunk_id: Id) -> ChordKey {
    hash_value(chunk_id.0)
}

fn hash_value<T: Hash>(value: T) -> ChordKey {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Circular half-open interval test: true if `key == from`, or `key` lies
/// strictly between `from` and `to` going clockwise (the interval may wrap
/// zero).
pub fn is_in(key: ChordKey, from_inclusive: ChordKey, to_exclusive: ChordKey) -> bool {
    if key == from_inclusive {
        return true;
    }
    if from_inclusive <= to_exclusive {
        from_inclusive < key && key < to_exclusive
    } else {
        from_inclusive < key || key < to_exclusive
    }
}

/// `key ∈ (own, successor]` on the circle; the whole ring when the node is
/// its own successor.
fn in_successor_range(key: ChordKey, own: ChordKey, successor: ChordKey) -> bool {
    if own == successor {
        return true;
    }
    if own < successor {
        key > own && key <= successor
    } else {
        key > own || key <= successor
    }
}

/// Open interval `(from, to)` on the circle.
fn in_open(key: ChordKey, from: ChordKey, to: ChordKey) -> bool {
    if from == to {
        return key != from;
    }
    if from < to {
        from < key && key < to
    } else {
        key > from || key < to
    }
}

/// Chord RPCs, routed through the owning table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChordRpc {
    FindSuccessor { key: ChordKey },
    GetPredecessor,
    Notify { peer: PeerId },
    /// Record `peer` as a holder of the chunk hashed to `key`.
    Store { key: ChordKey, peer: PeerId },
    Unstore { key: ChordKey, peer: PeerId },
    /// Fetch the holder set stored under `key`.
    Fetch { key: ChordKey },
    /// A joining node pulls the keys it is now responsible for from its
    /// successor: everything in `(from_exclusive, to_inclusive]`.
    PullRange {
        from_exclusive: ChordKey,
        to_inclusive: ChordKey,
    },
    /// The leaver hands its stored data to its successor and unlinks.
    Leave {
        leaver: PeerId,
        predecessor: PeerId,
        data: Vec<(ChordKey, Vec<PeerId>)>,
    },
}

#[derive(Clone)]
struct RingNode {
    id: PeerId,
    key: ChordKey,
}

impl RingNode {
    fn new(id: PeerId) -> Self {
        let key = hash_peer(&id);
        Self { id, key }
    }
}

struct RingState {
    predecessor: RingNode,
    successors: Vec<RingNode>,
    /// `fingers[i]` targets `own_key + 2^i`; holds (base key, responsible node).
    fingers: Vec<(ChordKey, RingNode)>,
}

pub struct ChordIndex {
    table: String,
    hub: Arc<PeerHub>,
    own_key: ChordKey,
    state: Mutex<RingState>,
    data: Mutex<HashMap<ChordKey, BTreeSet<PeerId>>>,
    initialized: AtomicBool,
    leaving: AtomicBool,
    stabilizer: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ChordIndex {
    pub fn new(table: impl Into<String>, hub: Arc<PeerHub>) -> Arc<Self> {
        let own = RingNode::new(hub.own_id().clone());
        let own_key = own.key;
        let fingers = (0..FINGER_COUNT)
            .map(|i| (own_key.wrapping_add(1u64.wrapping_shl(i as u32)), own.clone()))
            .collect();
        Arc::new(Self {
            table: table.into(),
            hub,
            own_key,
            state: Mutex::new(RingState {
                predecessor: own.clone(),
                successors: vec![own; SUCCESSOR_LIST_LEN],
                fingers,
            }),
            data: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            leaving: AtomicBool::new(false),
            stabilizer: Mutex::new(None),
        })
    }

    pub fn own_key(&self) -> ChordKey {
        self.own_key
    }

    /// Found a new ring consisting of this node only.
    pub fn create(self: &Arc<Self>, stabilize_interval: Duration) {
        self.initialized.store(true, Ordering::Release);
        self.start_stabilizer(stabilize_interval);
    }

    /// Join an existing ring through `entry`.
    pub fn join(self: &Arc<Self>, entry: &PeerId, stabilize_interval: Duration) -> Result<()> {
        let mut fingers = Vec::with_capacity(FINGER_COUNT);
        for i in 0..FINGER_COUNT {
            let base = self.own_key.wrapping_add(1u64.wrapping_shl(i as u32));
            let holder = self.find_successor_rpc(entry, base)?;
            fingers.push((base, RingNode::new(holder)));
        }
        let successor = fingers[0].1.clone();
        let predecessor = RingNode::new(self.get_predecessor_rpc(&successor.id)?);
        {
            let mut state = self.state.lock();
            state.fingers = fingers;
            state.successors = vec![successor.clone(); SUCCESSOR_LIST_LEN];
            state.predecessor = predecessor.clone();
        }
        self.initialized.store(true, Ordering::Release);
        // Take over the slice of the key space between our predecessor and
        // us; the successor held it so far.
        if successor.id != *self.hub.own_id() {
            let pull = ChordRpc::PullRange {
                from_exclusive: predecessor.key,
                to_inclusive: self.own_key,
            };
            if let Some(Response::ChordData(entries)) = self.routed_request(&successor.id, pull) {
                let mut data = self.data.lock();
                for (key, peers) in entries {
                    data.entry(key).or_default().extend(peers);
                }
            }
        }
        self.notify_rpc(&predecessor.id);
        self.notify_rpc(&successor.id);
        self.start_stabilizer(stabilize_interval);
        Ok(())
    }

    /// Leave the ring: hand stored data to the successor and unlink.
    pub fn leave(&self) {
        if self.leaving.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.stabilizer.lock().take() {
            let _ = handle.join();
        }
        let (successor, predecessor) = {
            let state = self.state.lock();
            (state.successors[0].clone(), state.predecessor.clone())
        };
        if successor.id != *self.hub.own_id() {
            let data: Vec<(ChordKey, Vec<PeerId>)> = self
                .data
                .lock()
                .iter()
                .map(|(key, peers)| (*key, peers.iter().cloned().collect()))
                .collect();
            let rpc = ChordRpc::Leave {
                leaver: self.hub.own_id().clone(),
                predecessor: predecessor.id,
                data,
            };
            if self.routed_request(&successor.id, rpc).is_none() {
                warn!("chord leave: successor {} unreachable", successor.id);
            }
        }
        self.initialized.store(false, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// The live peer responsible for `key`.
    pub fn find_successor(&self, key: ChordKey) -> Result<PeerId> {
        let successor = { self.state.lock().successors[0].clone() };
        if in_successor_range(key, self.own_key, successor.key) {
            return Ok(successor.id);
        }
        let next = self.closest_preceding_finger(key);
        if next == *self.hub.own_id() {
            return Ok(successor.id);
        }
        self.find_successor_rpc(&next, key)
    }

    fn closest_preceding_finger(&self, key: ChordKey) -> PeerId {
        let state = self.state.lock();
        for (_, node) in state.fingers.iter().rev() {
            if in_open(node.key, self.own_key, key) {
                return node.id.clone();
            }
        }
        state.successors[0].id.clone()
    }

    /// Publish this peer as a holder of `chunk_id`.
    pub fn announce_possession(&self, chunk_id: Id) -> Result<()> {
        let key = hash_chunk(chunk_id);
        let responsible = self.find_successor(key)?;
        let own = self.hub.own_id().clone();
        if responsible == own {
            self.data.lock().entry(key).or_default().insert(own);
            return Ok(());
        }
        match self.routed_request(&responsible, ChordRpc::Store { key, peer: own }) {
            Some(Response::Ack) => Ok(()),
            other => Err(CartaError::Transport(format!(
                "store at {responsible} failed: {other:?}"
            ))),
        }
    }

    /// Withdraw this peer as a holder of `chunk_id`.
    pub fn renounce_possession(&self, chunk_id: Id) -> Result<()> {
        let key = hash_chunk(chunk_id);
        let responsible = self.find_successor(key)?;
        let own = self.hub.own_id().clone();
        if responsible == own {
            if let Some(peers) = self.data.lock().get_mut(&key) {
                peers.remove(&own);
            }
            return Ok(());
        }
        match self.routed_request(&responsible, ChordRpc::Unstore { key, peer: own }) {
            Some(Response::Ack) => Ok(()),
            other => Err(CartaError::Transport(format!(
                "unstore at {responsible} failed: {other:?}"
            ))),
        }
    }

    /// The set of peers that announced possession of `chunk_id`.
    pub fn seek_peers(&self, chunk_id: Id) -> Result<Vec<PeerId>> {
        let key = hash_chunk(chunk_id);
        let responsible = self.find_successor(key)?;
        if responsible == *self.hub.own_id() {
            return Ok(self
                .data
                .lock()
                .get(&key)
                .map(|peers| peers.iter().cloned().collect())
                .unwrap_or_default());
        }
        match self.routed_request(&responsible, ChordRpc::Fetch { key }) {
            Some(Response::Peers(peers)) => Ok(peers),
            other => Err(CartaError::Transport(format!(
                "fetch at {responsible} failed: {other:?}"
            ))),
        }
    }

    // ------------------------------------------------------------------
    // RPC plumbing
    // ------------------------------------------------------------------

    fn routed_request(&self, peer: &PeerId, rpc: ChordRpc) -> Option<Response> {
        self.hub.try_request(
            peer,
            &Request::ChordRouted {
                table: self.table.clone(),
                rpc,
            },
        )
    }

    fn find_successor_rpc(&self, peer: &PeerId, key: ChordKey) -> Result<PeerId> {
        match self.routed_request(peer, ChordRpc::FindSuccessor { key }) {
            Some(Response::Peer(found)) => Ok(found),
            other => Err(CartaError::Transport(format!(
                "find_successor at {peer} failed: {other:?}"
            ))),
        }
    }

    fn get_predecessor_rpc(&self, peer: &PeerId) -> Result<PeerId> {
        match self.routed_request(peer, ChordRpc::GetPredecessor) {
            Some(Response::Peer(found)) => Ok(found),
            other => Err(CartaError::Transport(format!(
                "get_predecessor at {peer} failed: {other:?}"
            ))),
        }
    }

    fn notify_rpc(&self, peer: &PeerId) {
        if peer == self.hub.own_id() {
            return;
        }
        let _ = self.routed_request(
            peer,
            ChordRpc::Notify {
                peer: self.hub.own_id().clone(),
            },
        );
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    pub fn handle_routed(&self, rpc: ChordRpc) -> Response {
        match rpc {
            ChordRpc::FindSuccessor { key } => match self.find_successor(key) {
                Ok(peer) => Response::Peer(peer),
                Err(_) => Response::Decline,
            },
            ChordRpc::GetPredecessor => {
                Response::Peer(self.state.lock().predecessor.id.clone())
            }
            ChordRpc::Notify { peer } => {
                self.handle_notify(peer);
                Response::Ack
            }
            ChordRpc::Store { key, peer } => {
                self.data.lock().entry(key).or_default().insert(peer);
                Response::Ack
            }
            ChordRpc::Unstore { key, peer } => {
                if let Some(peers) = self.data.lock().get_mut(&key) {
                    peers.remove(&peer);
                }
                Response::Ack
            }
            ChordRpc::Fetch { key } => Response::Peers(
                self.data
                    .lock()
                    .get(&key)
                    .map(|peers| peers.iter().cloned().collect())
                    .unwrap_or_default(),
            ),
            ChordRpc::PullRange {
                from_exclusive,
                to_inclusive,
            } => {
                let mut data = self.data.lock();
                let moving: Vec<ChordKey> = data
                    .keys()
                    .filter(|key| in_successor_range(**key, from_exclusive, to_inclusive))
                    .copied()
                    .collect();
                let mut entries = Vec::with_capacity(moving.len());
                for key in moving {
                    if let Some(peers) = data.remove(&key) {
                        entries.push((key, peers.into_iter().collect()));
                    }
                }
                Response::ChordData(entries)
            }
            ChordRpc::Leave {
                leaver,
                predecessor,
                data,
            } => {
                self.handle_leave(leaver, predecessor, data);
                Response::Ack
            }
        }
    }

    /// Install a newly learned peer wherever it tightens the ring: every
    /// finger and successor slot whose interval contains it, and the
    /// predecessor link.
    fn handle_notify(&self, peer: PeerId) {
        if peer == *self.hub.own_id() {
            return;
        }
        let node = RingNode::new(peer);
        let mut state = self.state.lock();
        for (base, holder) in state.fingers.iter_mut() {
            if is_in(node.key, *base, holder.key) {
                *holder = node.clone();
                // No break: several fingers can share a holder.
            }
        }
        for i in 0..SUCCESSOR_LIST_LEN {
            let lower = if i == 0 {
                self.own_key
            } else {
                state.successors[i - 1].key
            };
            if is_in(node.key, lower, state.successors[i].key) {
                for j in (i + 1..SUCCESSOR_LIST_LEN).rev() {
                    state.successors[j] = state.successors[j - 1].clone();
                }
                state.successors[i] = node.clone();
                break;
            }
        }
        let predecessor_key = state.predecessor.key;
        if state.predecessor.id == *self.hub.own_id()
            || is_in(node.key, predecessor_key, self.own_key)
        {
            state.predecessor = node;
        }
    }

    fn handle_leave(
        &self,
        leaver: PeerId,
        predecessor: PeerId,
        data: Vec<(ChordKey, Vec<PeerId>)>,
    ) {
        {
            let mut store = self.data.lock();
            for (key, peers) in data {
                store.entry(key).or_default().extend(peers);
            }
        }
        let mut state = self.state.lock();
        if state.predecessor.id == leaver {
            state.predecessor = RingNode::new(predecessor);
        }
        let own = RingNode::new(self.hub.own_id().clone());
        for (_, holder) in state.fingers.iter_mut() {
            if holder.id == leaver {
                *holder = own.clone();
            }
        }
        for slot in state.successors.iter_mut() {
            if slot.id == leaver {
                *slot = own.clone();
            }
        }
    }

    // ------------------------------------------------------------------
    // Stabilization
    // ------------------------------------------------------------------

    fn start_stabilizer(self: &Arc<Self>, interval: Duration) {
        let index = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("chord-stabilize-{}", self.table))
            .spawn(move || {
                // Sleep in short slices so leave() can join promptly.
                let tick = Duration::from_millis(10).min(interval);
                let mut waited = Duration::ZERO;
                while !index.leaving.load(Ordering::Acquire) {
                    thread::sleep(tick);
                    waited += tick;
                    if waited < interval {
                        continue;
                    }
                    waited = Duration::ZERO;
                    if index.initialized.load(Ordering::Acquire) {
                        index.stabilize();
                    }
                }
            })
            .expect("spawn chord stabilizer");
        *self.stabilizer.lock() = Some(handle);
    }

    /// Ask the successor for its predecessor and adopt it as a closer
    /// successor when appropriate, then re-notify.
    fn stabilize(&self) {
        let successor = { self.state.lock().successors[0].clone() };
        if successor.id == *self.hub.own_id() {
            return;
        }
        match self.get_predecessor_rpc(&successor.id) {
            Ok(candidate) => {
                let candidate = RingNode::new(candidate);
                if candidate.id != *self.hub.own_id()
                    && in_open(candidate.key, self.own_key, successor.key)
                {
                    let mut state = self.state.lock();
                    for j in (1..SUCCESSOR_LIST_LEN).rev() {
                        state.successors[j] = state.successors[j - 1].clone();
                    }
                    state.successors[0] = candidate;
                }
                let target = { self.state.lock().successors[0].id.clone() };
                self.notify_rpc(&target);
            }
            Err(_) => {
                // Successor is gone; fall back along the successor list.
                debug!("chord: dropping unreachable successor {}", successor.id);
                let mut state = self.state.lock();
                if state.successors[0].id == successor.id {
                    for j in 0..SUCCESSOR_LIST_LEN - 1 {
                        state.successors[j] = state.successors[j + 1].clone();
                    }
                    let last = RingNode::new(self.hub.own_id().clone());
                    state.successors[SUCCESSOR_LIST_LEN - 1] = last;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_in_plain_interval() {
        assert!(is_in(5, 5, 10));
        assert!(is_in(7, 5, 10));
        assert!(!is_in(10, 5, 10));
        assert!(!is_in(4, 5, 10));
    }

    #[test]
    fn test_is_in_wrapping_interval() {
        assert!(is_in(u64::MAX, u64::MAX - 5, 3));
        assert!(is_in(1, u64::MAX - 5, 3));
        assert!(!is_in(3, u64::MAX - 5, 3));
        assert!(!is_in(100, u64::MAX - 5, 3));
    }

    #[test]
    fn test_successor_range() {
        assert!(in_successor_range(7, 5, 10));
        assert!(in_successor_range(10, 5, 10));
        assert!(!in_successor_range(5, 5, 10));
        assert!(in_successor_range(2, u64::MAX - 1, 3));
        // A node that is its own successor owns the whole ring.
        assert!(in_successor_range(123, 7, 7));
    }

    #[test]
    fn test_hashes_are_stable() {
        let peer = PeerId::new("127.0.0.1:7000");
        assert_eq!(hash_peer(&peer), hash_peer(&peer));
        let id = Id::generate();
        assert_eq!(hash_chunk(id), hash_chunk(id));
    }

    #[test]
    fn test_single_node_ring_owns_everything() {
        let hub = PeerHub::bind("127.0.0.1:0", 1).unwrap();
        let index = ChordIndex::new("t", Arc::clone(&hub));
        index.create(Duration::from_secs(3600));
        let chunk = Id::generate();
        index.announce_possession(chunk).unwrap();
        assert_eq!(index.seek_peers(chunk).unwrap(), vec![hub.own_id().clone()]);
        assert_eq!(
            index.find_successor(hash_chunk(chunk)).unwrap(),
            *hub.own_id()
        );
        index.leave();
        hub.shutdown();
    }
}
