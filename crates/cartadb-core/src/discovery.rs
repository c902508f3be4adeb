//! Peer discovery over a shared file.
//!
//! Every peer appends its own address on startup and removes it on clean
//! shutdown. Readers and writers serialize through a lock file created with
//! `O_EXCL` semantics.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::net::peer::PeerId;

/// Capability set of a discovery source.
pub trait Discovery: Send + Sync {
    /// Publish our own address.
    fn announce(&self) -> Result<()>;
    /// All currently announced peers, excluding ourselves. The peers are not
    /// necessarily all reachable.
    fn get_peers(&self) -> Result<Vec<PeerId>>;
    /// Remove an arbitrary peer from the source.
    fn remove(&self, peer: &PeerId) -> Result<()>;
    /// Remove our own address.
    fn leave(&self) -> Result<()>;
}

/// File-backed discovery.
pub struct FileDiscovery {
    own_id: PeerId,
    file: PathBuf,
    lock_file: PathBuf,
}

impl FileDiscovery {
    pub fn new(own_id: PeerId, file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        let mut lock_file = file.clone();
        lock_file.set_extension("lck");
        Self {
            own_id,
            file,
            lock_file,
        }
    }

    fn lock(&self) -> FileLockGuard<'_> {
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_file)
            {
                Ok(_) => return FileLockGuard { discovery: self },
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(_) => {
                    // Directory missing or unwritable; retry after creating
                    // the parent so a misconfigured path fails loudly later.
                    if let Some(parent) = self.lock_file.parent() {
                        let _ = fs::create_dir_all(parent);
                    }
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    fn read_contents(&self) -> String {
        fs::read_to_string(&self.file).unwrap_or_default()
    }
}

struct FileLockGuard<'a> {
    discovery: &'a FileDiscovery,
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.discovery.lock_file);
    }
}

impl Discovery for FileDiscovery {
    fn announce(&self) -> Result<()> {
        let _guard = self.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file)?;
        writeln!(file, "{}", self.own_id)?;
        Ok(())
    }

    fn get_peers(&self) -> Result<Vec<PeerId>> {
        let _guard = self.lock();
        let contents = self.read_contents();
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && *line != self.own_id.address())
            .map(PeerId::new)
            .collect())
    }

    fn remove(&self, peer: &PeerId) -> Result<()> {
        let _guard = self.lock();
        let contents = self.read_contents();
        let remaining: Vec<&str> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && *line != peer.address())
            .collect();
        let mut body = remaining.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        fs::write(&self.file, body)?;
        Ok(())
    }

    fn leave(&self) -> Result<()> {
        self.remove(&self.own_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovery_pair(dir: &std::path::Path) -> (FileDiscovery, FileDiscovery) {
        let file = dir.join("discovery.txt");
        (
            FileDiscovery::new(PeerId::new("127.0.0.1:7001"), &file),
            FileDiscovery::new(PeerId::new("127.0.0.1:7002"), &file),
        )
    }

    #[test]
    fn test_announce_and_get_peers() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = discovery_pair(dir.path());
        a.announce().unwrap();
        b.announce().unwrap();

        assert_eq!(a.get_peers().unwrap(), vec![PeerId::new("127.0.0.1:7002")]);
        assert_eq!(b.get_peers().unwrap(), vec![PeerId::new("127.0.0.1:7001")]);
    }

    #[test]
    fn test_leave_removes_own_entry_only() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = discovery_pair(dir.path());
        a.announce().unwrap();
        b.announce().unwrap();
        a.leave().unwrap();

        assert!(b.get_peers().unwrap().is_empty());
        assert_eq!(a.get_peers().unwrap(), vec![PeerId::new("127.0.0.1:7002")]);
    }

    #[test]
    fn test_lock_file_is_released() {
        let dir = tempfile::tempdir().unwrap();
        let (a, _) = discovery_pair(dir.path());
        a.announce().unwrap();
        a.announce().unwrap();
        assert!(!dir.path().join("discovery.lck").exists());
    }

    #[test]
    fn test_empty_source() {
        let dir = tempfile::tempdir().unwrap();
        let (a, _) = discovery_pair(dir.path());
        assert!(a.get_peers().unwrap().is_empty());
    }
}
