//! The transaction layer: optimistic, multi-chunk commits.

pub mod cache;
pub mod chunk_txn;
pub mod conflict;
pub mod table_txn;
pub mod transaction;
pub mod view;

pub use cache::TableCache;
pub use chunk_txn::{ChunkTransaction, ConflictCondition};
pub use conflict::{Conflict, ConflictMap, Conflicts};
pub use table_txn::NetTableTransaction;
pub use transaction::{MultiChunkParticipant, MultiChunkTransactionInfo, Transaction};
