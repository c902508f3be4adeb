//! Tables and the process-wide table registry.

pub mod manager;
pub mod net_table;

pub use manager::{TableManager, METATABLE_CHUNK_ID, METATABLE_NAME};
pub use net_table::{NetTable, TrackerDeterminer};
