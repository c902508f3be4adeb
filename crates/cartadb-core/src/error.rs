//! Error taxonomy for the CartaDB engine.

use std::fmt;
use std::io;

use crate::id::Id;

/// Errors surfaced by the engine.
///
/// Conflicts and declines are handled by retry loops inside the transaction
/// layer; not-found, relinquished and transport errors propagate to the
/// caller. Structural mismatches are programmer errors and panic instead.
#[derive(Debug)]
pub enum CartaError {
    /// Optimistic concurrency violation at commit time. Carries the ids of
    /// the offending records.
    Conflict(Vec<Id>),
    /// Transient coordination refusal (lock contention, not-leader).
    Decline(String),
    /// Unknown id, chunk or table.
    NotFound(String),
    /// The target peer no longer serves the chunk.
    Relinquished,
    /// Unreachable peer or broken connection.
    Transport(String),
    /// Structural mismatch that should have been caught earlier.
    Invariant(String),
    /// Filesystem error (discovery file, backup files).
    Io(io::Error),
    /// Invalid configuration.
    Config(String),
}

impl fmt::Display for CartaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict(ids) => write!(f, "commit conflict on {} record(s)", ids.len()),
            Self::Decline(reason) => write!(f, "declined: {reason}"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::Relinquished => write!(f, "peer relinquished the chunk"),
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Invariant(e) => write!(f, "invariant violation: {e}"),
            Self::Io(e) => write!(f, "io: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
        }
    }
}

impl std::error::Error for CartaError {}

impl From<io::Error> for CartaError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, CartaError>;
