//! End-to-end Raft chunk coordination: replication, membership growth,
//! leader failover, and the multi-chunk commit hand-off.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cartadb_core::chunk::{ChunkRef, RaftRole};
use cartadb_core::{FieldValue, LogicalTime, TableManager, Transaction};

use common::{await_condition, poses_descriptor, record, spawn_peer, teardown};

fn raft_chunk(chunk: &ChunkRef) -> &Arc<cartadb_core::RaftChunk> {
    match chunk {
        ChunkRef::Raft(chunk) => chunk,
        ChunkRef::Legacy(_) => panic!("expected a raft chunk"),
    }
}

/// Some member of the group sees itself as leader.
fn await_leader(chunks: &[ChunkRef]) -> Option<usize> {
    let mut leader = None;
    let found = await_condition(Duration::from_secs(10), || {
        leader = chunks
            .iter()
            .position(|chunk| raft_chunk(chunk).node().role() == RaftRole::Leader);
        leader.is_some()
    });
    if found {
        leader
    } else {
        None
    }
}

#[test]
fn replication_to_joined_members() {
    let dir = tempfile::tempdir().unwrap();
    let founder = spawn_peer(dir.path(), true, true);
    let poses_x = founder.add_table(poses_descriptor()).unwrap();
    let chunk_x = poses_x.new_chunk().unwrap();
    assert!(await_leader(&[chunk_x.clone()]).is_some());

    // History before the join ships in the init snapshot.
    let early = chunk_x.insert(LogicalTime::sample(), record(1)).unwrap();

    let joiner = spawn_peer(dir.path(), false, true);
    let poses_y = joiner.add_table(poses_descriptor()).unwrap();
    let chunk_y = poses_y.get_chunk(chunk_x.id()).unwrap();

    // Later writes arrive through the replicated log.
    let late = chunk_x.insert(LogicalTime::sample(), record(2)).unwrap();

    assert!(await_condition(Duration::from_secs(5), || {
        let now = LogicalTime::sample();
        chunk_y.get_by_id(early.id(), now).is_some() && chunk_y.get_by_id(late.id(), now).is_some()
    }));
    teardown(vec![joiner, founder]);
}

#[test]
fn follower_insert_routes_to_leader() {
    let dir = tempfile::tempdir().unwrap();
    let founder = spawn_peer(dir.path(), true, true);
    let poses_x = founder.add_table(poses_descriptor()).unwrap();
    let chunk_x = poses_x.new_chunk().unwrap();
    assert!(await_leader(&[chunk_x.clone()]).is_some());

    let joiner = spawn_peer(dir.path(), false, true);
    let poses_y = joiner.add_table(poses_descriptor()).unwrap();
    let chunk_y = poses_y.get_chunk(chunk_x.id()).unwrap();

    // Wait until the follower learned the leader through a heartbeat.
    assert!(await_condition(Duration::from_secs(5), || {
        raft_chunk(&chunk_y).node().leader().is_some()
    }));

    let stored = chunk_y.insert(LogicalTime::sample(), record(9)).unwrap();
    assert!(await_condition(Duration::from_secs(5), || {
        let now = LogicalTime::sample();
        chunk_x.get_by_id(stored.id(), now).is_some()
            && chunk_y.get_by_id(stored.id(), now).is_some()
    }));
    teardown(vec![joiner, founder]);
}

#[test]
fn five_peer_leader_failover() {
    let dir = tempfile::tempdir().unwrap();
    let founder = spawn_peer(dir.path(), true, true);
    let poses = founder.add_table(poses_descriptor()).unwrap();
    let seed_chunk = poses.new_chunk().unwrap();
    assert!(await_leader(&[seed_chunk.clone()]).is_some());

    let mut managers: Vec<Arc<TableManager>> = vec![founder];
    let mut chunks: Vec<ChunkRef> = vec![seed_chunk.clone()];
    for _ in 0..4 {
        let member = spawn_peer(dir.path(), false, true);
        let table = member.add_table(poses_descriptor()).unwrap();
        let chunk = table.get_chunk(seed_chunk.id()).unwrap();
        managers.push(member);
        chunks.push(chunk);
    }
    // Full group assembled: 4 peers besides each member.
    assert!(await_condition(Duration::from_secs(10), || {
        chunks
            .iter()
            .all(|chunk| raft_chunk(chunk).node().peer_count() == 4)
    }));

    let leader_index = await_leader(&chunks).expect("a leader must exist");

    // Kill the leader without ceremony.
    let dead = managers.remove(leader_index);
    let dead_chunk = chunks.remove(leader_index);
    raft_chunk(&dead_chunk).stop();
    dead.hub().shutdown();

    // A survivor takes over within the election timeout regime.
    let new_leader = await_leader(&chunks).expect("survivors must elect a leader");

    // A client insert submitted after the election succeeds and lands on
    // all four survivors.
    let stored = {
        let chunk = chunks[new_leader].clone();
        let mut stored = None;
        assert!(await_condition(Duration::from_secs(10), || {
            match chunk.insert(LogicalTime::sample(), record(42)) {
                Ok(revision) => {
                    stored = Some(revision);
                    true
                }
                Err(_) => false,
            }
        }));
        stored.unwrap()
    };
    assert!(await_condition(Duration::from_secs(10), || {
        chunks
            .iter()
            .all(|chunk| chunk.get_by_id(stored.id(), LogicalTime::sample()).is_some())
    }));
    teardown(managers);
}

#[test]
fn multi_chunk_commit_with_hand_off() {
    let dir = tempfile::tempdir().unwrap();
    let founder = spawn_peer(dir.path(), true, true);
    let poses = founder.add_table(poses_descriptor()).unwrap();
    let chunk_one = poses.new_chunk().unwrap();
    let chunk_two = poses.new_chunk().unwrap();
    assert!(await_leader(&[chunk_one.clone()]).is_some());
    assert!(await_leader(&[chunk_two.clone()]).is_some());

    let mut transaction = Transaction::begin(&founder);
    let first = record(1);
    let second = record(2);
    let (id_one, id_two) = (first.id(), second.id());
    transaction.insert("poses", &chunk_one, first).unwrap();
    transaction.insert("poses", &chunk_two, second).unwrap();
    let commit_time = transaction.commit().unwrap();

    assert!(chunk_one.get_by_id(id_one, commit_time).is_some());
    assert!(chunk_two.get_by_id(id_two, commit_time).is_some());
    // The hand-off resolved as committed and the leases are free again.
    assert!(!chunk_one.is_write_locked());
    assert!(!chunk_two.is_write_locked());
    teardown(vec![founder]);
}

#[test]
fn raft_conflicting_updates_exactly_one_wins() {
    let dir = tempfile::tempdir().unwrap();
    let founder = spawn_peer(dir.path(), true, true);
    let poses_x = founder.add_table(poses_descriptor()).unwrap();
    let chunk_x = poses_x.new_chunk().unwrap();
    assert!(await_leader(&[chunk_x.clone()]).is_some());
    let stored = chunk_x.insert(LogicalTime::sample(), record(7)).unwrap();

    let joiner = spawn_peer(dir.path(), false, true);
    let poses_y = joiner.add_table(poses_descriptor()).unwrap();
    let chunk_y = poses_y.get_chunk(chunk_x.id()).unwrap();
    assert!(await_condition(Duration::from_secs(5), || {
        chunk_y.get_by_id(stored.id(), LogicalTime::sample()).is_some()
    }));

    let mut txn_x = Transaction::begin(&founder);
    let mut txn_y = Transaction::begin(&joiner);
    let read_x = txn_x.get_by_id("poses", stored.id()).unwrap();
    let read_y = txn_y.get_by_id("poses", stored.id()).unwrap();

    let mut eight = read_x.copy_for_write();
    eight.set("n", FieldValue::Int(8));
    txn_x.update("poses", eight).unwrap();
    let mut nine = read_y.copy_for_write();
    nine.set("n", FieldValue::Int(9));
    txn_y.update("poses", nine).unwrap();

    let result_x = txn_x.commit();
    let result_y = txn_y.commit();
    let successes = [&result_x, &result_y]
        .iter()
        .filter(|result| result.is_ok())
        .count();
    assert_eq!(successes, 1, "exactly one commit may win");
    teardown(vec![joiner, founder]);
}
