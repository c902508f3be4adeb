//! Typed wire messages.
//!
//! Every RPC is one `Request` variant answered by one `Response` variant,
//! shipped as a length-prefixed JSON frame. The envelope carries the
//! sender's identity and Lamport clock; the reply carries the responder's
//! clock back.

use serde::{Deserialize, Serialize};

use crate::chord::ChordRpc;
use crate::chunk::raft::{
    AppendEntriesRequest, AppendEntriesResponse, LogEntry, RaftRole, VoteRequest, VoteResponse,
};
use crate::id::Id;
use crate::net::peer::PeerId;
use crate::revision::Revision;
use crate::txn::transaction::MultiChunkTransactionInfo;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: PeerId,
    pub clock: u64,
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub clock: u64,
    pub response: Response,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Liveness probe.
    Ping,

    // Legacy chunk coordination.
    ChunkConnect {
        table: String,
        chunk_id: Id,
    },
    ChunkInit {
        table: String,
        chunk_id: Id,
        peers: Vec<PeerId>,
        history: Vec<Revision>,
    },
    ChunkInsert {
        table: String,
        chunk_id: Id,
        revision: Revision,
    },
    ChunkUpdate {
        table: String,
        chunk_id: Id,
        revision: Revision,
    },
    ChunkLock {
        table: String,
        chunk_id: Id,
    },
    ChunkUnlock {
        table: String,
        chunk_id: Id,
    },
    ChunkNewPeer {
        table: String,
        chunk_id: Id,
        peer: PeerId,
    },
    ChunkLeave {
        table: String,
        chunk_id: Id,
    },

    // Raft chunk coordination.
    RaftAppendEntries {
        table: String,
        chunk_id: Id,
        request: AppendEntriesRequest,
    },
    RaftRequestVote {
        table: String,
        chunk_id: Id,
        request: VoteRequest,
    },
    RaftClientInsert {
        table: String,
        chunk_id: Id,
        revision: Revision,
    },
    RaftClientUpdate {
        table: String,
        chunk_id: Id,
        revision: Revision,
    },
    RaftJoinQuit {
        table: String,
        chunk_id: Id,
        peer: PeerId,
        join: bool,
    },
    RaftInit {
        table: String,
        chunk_id: Id,
        peers: Vec<PeerId>,
        entries: Vec<LogEntry>,
    },
    RaftQueryState {
        table: String,
        chunk_id: Id,
    },

    // Multi-chunk commit hand-off.
    CommitInfo {
        table: String,
        chunk_id: Id,
        info: MultiChunkTransactionInfo,
    },
    CommitUnlock {
        table: String,
        chunk_id: Id,
        transaction_id: Id,
        success: bool,
    },
    QueryCommitState {
        table: String,
        chunk_id: Id,
        transaction_id: Id,
    },

    // Chord index, routed through the table that owns the ring.
    ChordRouted {
        table: String,
        rpc: ChordRpc,
    },

    // Table management.
    AnnounceToListeners {
        table: String,
        chunks: Vec<Id>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ack,
    Decline,
    NotFound,
    Relinquished,
    /// The contacted Raft member is not the leader; retry at the hint.
    NotLeader {
        hint: Option<PeerId>,
    },
    Peer(PeerId),
    Peers(Vec<PeerId>),
    /// Chord key-space slice handed to a joining node.
    ChordData(Vec<(u64, Vec<PeerId>)>),
    AppendEntries(AppendEntriesResponse),
    Vote(VoteResponse),
    /// Log index assigned to an accepted client operation.
    EntryIndex(u64),
    RaftState {
        role: RaftRole,
        term: u64,
        leader: Option<PeerId>,
    },
    CommitState {
        /// The chunk holds every revision of the pending transaction.
        revisions_received: bool,
        /// Set once the chunk has locally resolved the hand-off.
        resolved: Option<bool>,
    },
}

impl Response {
    pub fn is_ack(&self) -> bool {
        matches!(self, Response::Ack)
    }

    pub fn is_decline(&self) -> bool {
        matches!(self, Response::Decline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let envelope = Envelope {
            sender: PeerId::new("127.0.0.1:7000"),
            clock: 17,
            request: Request::ChunkLock {
                table: "poses".into(),
                chunk_id: Id::generate(),
            },
        };
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.sender, envelope.sender);
        assert_eq!(decoded.clock, 17);
        assert!(matches!(decoded.request, Request::ChunkLock { .. }));
    }

    #[test]
    fn test_response_predicates() {
        assert!(Response::Ack.is_ack());
        assert!(Response::Decline.is_decline());
        assert!(!Response::Ack.is_decline());
    }
}
