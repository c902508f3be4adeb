//! Lamport-style logical time.
//!
//! A single process-wide counter totally orders all local events; received
//! messages merge the sender's clock so that causally related events stay
//! ordered across peers.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static CURRENT: AtomicU64 = AtomicU64::new(1);

/// A monotonically increasing scalar with total order. `LogicalTime(0)` is
/// the invalid ("never") value.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogicalTime(pub u64);

impl LogicalTime {
    /// Advance the process clock by one and return the new value.
    pub fn sample() -> Self {
        LogicalTime(CURRENT.fetch_add(1, Ordering::AcqRel))
    }

    /// Merge an observed remote clock value: the local clock jumps past it.
    /// Called by the hub for every received envelope.
    pub fn update(observed: LogicalTime) {
        let target = observed.0 + 1;
        let mut current = CURRENT.load(Ordering::Acquire);
        while current < target {
            match CURRENT.compare_exchange_weak(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(now) => current = now,
            }
        }
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn serialize(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}
