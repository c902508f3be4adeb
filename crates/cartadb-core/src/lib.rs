//! CartaDB — a peer-to-peer, decentralized, multi-writer table store for
//! collaborative mapping.
//!
//! Data is partitioned into chunks replicated across cooperating peers.
//! Each peer may read, insert, update and remove versioned records in any
//! chunk it participates in; consistency is enforced per chunk by one of
//! two coordination protocols (a distributed read/write lock, or Raft).
//! Peers locate chunk holders through a per-table Chord ring and commit
//! multi-chunk changes through an optimistic transaction layer.
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  Transaction (multi-table, caches, tracker push) │
//! │   └─ NetTableTransaction (ordered chunk locks)   │
//! │       └─ ChunkTransaction (views, conflicts)     │
//! ├──────────────────────────────────────────────────┤
//! │  TableManager / NetTable (metatable bootstrap)   │
//! │   ├─ ChordIndex (chunk holder lookup)            │
//! │   └─ Chunk: LegacyChunk | RaftChunk              │
//! ├──────────────────────────────────────────────────┤
//! │  PeerHub (TCP RPC) · FileDiscovery · backup      │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod backup;
pub mod chord;
pub mod chunk;
pub mod config;
pub mod container;
pub mod discovery;
pub mod error;
pub mod id;
pub mod net;
pub mod revision;
pub mod schema;
pub mod table;
pub mod time;
pub mod txn;
pub mod workspace;

pub use crate::chunk::{ChunkRef, LegacyChunk, RaftChunk};
pub use crate::config::{CartaConfig, UnlockStrategy};
pub use crate::container::{ChunkDataContainer, RamContainer};
pub use crate::discovery::{Discovery, FileDiscovery};
pub use crate::error::{CartaError, Result};
pub use crate::id::Id;
pub use crate::net::{PeerHub, PeerId};
pub use crate::revision::{FieldValue, Revision};
pub use crate::schema::{FieldKind, TableDescriptor};
pub use crate::table::{NetTable, TableManager, METATABLE_CHUNK_ID, METATABLE_NAME};
pub use crate::time::LogicalTime;
pub use crate::txn::Transaction;
pub use crate::workspace::Workspace;
