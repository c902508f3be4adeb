//! Shared fixtures for the end-to-end tests: real peers on localhost TCP
//! sharing one discovery file.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cartadb_core::{
    CartaConfig, FieldKind, FieldValue, FileDiscovery, PeerHub, Revision, TableDescriptor,
    TableManager,
};

pub fn spawn_peer(dir: &Path, founder: bool, use_raft: bool) -> Arc<TableManager> {
    let config = CartaConfig {
        use_raft,
        discovery_file: dir
            .join("discovery.txt")
            .to_string_lossy()
            .into_owned(),
        ..CartaConfig::default()
    };
    let hub = PeerHub::bind("127.0.0.1:0", 4).expect("bind hub");
    let discovery = Arc::new(FileDiscovery::new(
        hub.own_id().clone(),
        dir.join("discovery.txt"),
    ));
    let manager = TableManager::new(hub, discovery, config);
    manager.init(founder).expect("peer bootstrap");
    manager
}

pub fn poses_descriptor() -> TableDescriptor {
    TableDescriptor::new("poses").add_field("n", FieldKind::Int)
}

pub fn record(n: i64) -> Revision {
    let mut revision = Revision::new(cartadb_core::Id::generate());
    revision.set("n", FieldValue::Int(n));
    revision
}

/// Poll until `condition` holds or the timeout elapses.
pub fn await_condition(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

pub fn teardown(managers: Vec<Arc<TableManager>>) {
    for manager in managers {
        manager.kill();
        manager.hub().shutdown();
    }
}
