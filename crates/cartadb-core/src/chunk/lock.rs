//! Local state machine of the per-chunk distributed read/write lock.
//!
//! The state here is one peer's view; a chunk is only really write-locked
//! once every peer in the swarm agrees. The distributed protocol around this
//! state lives in the legacy chunk.

use std::thread::ThreadId;

use parking_lot::{Condvar, Mutex};

use crate::net::peer::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    ReadLocked,
    /// A local thread is collecting per-peer grants.
    Attempting,
    WriteLocked,
}

#[derive(Debug)]
pub struct LockInner {
    pub state: LockState,
    /// What a remote writer preempted; restored on its unlock. Only ever
    /// `Unlocked` or `Attempting`.
    pub preempted_state: LockState,
    pub n_readers: usize,
    pub holder: Option<PeerId>,
    /// Local thread owning a write lock or attempt; grants reentrancy.
    pub thread: Option<ThreadId>,
    pub write_recursion_depth: usize,
}

pub struct DistributedRwLock {
    pub(crate) inner: Mutex<LockInner>,
    pub(crate) cv: Condvar,
}

impl Default for DistributedRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl DistributedRwLock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LockInner {
                state: LockState::Unlocked,
                preempted_state: LockState::Unlocked,
                n_readers: 0,
                holder: None,
                thread: None,
                write_recursion_depth: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Construct directly in the write-locked state, as seen by a peer that
    /// just received the init snapshot from the current holder.
    pub fn new_write_locked_by(holder: PeerId) -> Self {
        let lock = Self::new();
        {
            let mut inner = lock.inner.lock();
            inner.state = LockState::WriteLocked;
            inner.preempted_state = LockState::Unlocked;
            inner.holder = Some(holder);
        }
        lock
    }

    pub(crate) fn is_writer(inner: &LockInner, peer: &PeerId) -> bool {
        inner.state == LockState::WriteLocked && inner.holder.as_ref() == Some(peer)
    }

    pub fn state(&self) -> LockState {
        self.inner.lock().state
    }

    /// True if the calling thread holds the write lock on behalf of `self_id`.
    pub fn is_held_by_current_thread(&self, self_id: &PeerId) -> bool {
        let inner = self.inner.lock();
        Self::is_writer(&inner, self_id) && inner.thread == Some(std::thread::current().id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_lock_is_unlocked() {
        let lock = DistributedRwLock::new();
        assert_eq!(lock.state(), LockState::Unlocked);
        assert!(!lock.is_held_by_current_thread(&PeerId::new("a:1")));
    }

    #[test]
    fn test_init_snapshot_state() {
        let holder = PeerId::new("10.0.0.1:7");
        let lock = DistributedRwLock::new_write_locked_by(holder.clone());
        assert_eq!(lock.state(), LockState::WriteLocked);
        let inner = lock.inner.lock();
        assert!(DistributedRwLock::is_writer(&inner, &holder));
        assert_eq!(inner.preempted_state, LockState::Unlocked);
    }
}
