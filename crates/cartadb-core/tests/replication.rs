//! End-to-end replication over the legacy lock protocol: real peers on
//! localhost TCP, bootstrapped through the shared discovery file and the
//! metatable.

mod common;

use std::time::Duration;

use cartadb_core::{CartaError, FieldValue, LogicalTime, Transaction};

use common::{await_condition, poses_descriptor, record, spawn_peer, teardown};

#[test]
fn single_peer_insert_and_read() {
    let dir = tempfile::tempdir().unwrap();
    let peer = spawn_peer(dir.path(), true, false);
    let poses = peer.add_table(poses_descriptor()).unwrap();
    let chunk = poses.new_chunk().unwrap();

    let mut transaction = Transaction::begin(&peer);
    let staged = record(42);
    let id = staged.id();
    transaction.insert("poses", &chunk, staged).unwrap();
    transaction.commit().unwrap();

    let mut reader = Transaction::begin(&peer);
    let read = reader.get_by_id("poses", id).unwrap();
    assert_eq!(read.get("n"), Some(&FieldValue::Int(42)));

    let dump = reader.dump_active_chunks("poses");
    assert_eq!(dump.len(), 1);
    assert!(dump.contains_key(&id));
    teardown(vec![peer]);
}

#[test]
fn two_peer_replicated_insert() {
    let dir = tempfile::tempdir().unwrap();
    let founder = spawn_peer(dir.path(), true, false);
    let poses_x = founder.add_table(poses_descriptor()).unwrap();
    let chunk_x = poses_x.new_chunk().unwrap();

    let joiner = spawn_peer(dir.path(), false, false);
    let poses_y = joiner.add_table(poses_descriptor()).unwrap();
    // Resolve the chunk through the ring and join its swarm.
    let chunk_y = poses_y.get_chunk(chunk_x.id()).unwrap();
    assert_eq!(chunk_y.id(), chunk_x.id());

    // Inserted after the join: replicated by broadcast.
    let stored = chunk_x.insert(LogicalTime::sample(), record(7)).unwrap();

    assert!(await_condition(Duration::from_secs(5), || {
        chunk_y
            .get_by_id(stored.id(), LogicalTime::sample())
            .map(|revision| revision.get("n") == Some(&FieldValue::Int(7)))
            .unwrap_or(false)
    }));
    let dump = chunk_y.dump(LogicalTime::sample());
    assert_eq!(dump.len(), 1);
    teardown(vec![joiner, founder]);
}

#[test]
fn join_receives_existing_history() {
    let dir = tempfile::tempdir().unwrap();
    let founder = spawn_peer(dir.path(), true, false);
    let poses_x = founder.add_table(poses_descriptor()).unwrap();
    let chunk_x = poses_x.new_chunk().unwrap();
    // Inserted before the join: shipped in the init snapshot.
    let stored = chunk_x.insert(LogicalTime::sample(), record(3)).unwrap();

    let joiner = spawn_peer(dir.path(), false, false);
    let poses_y = joiner.add_table(poses_descriptor()).unwrap();
    let chunk_y = poses_y.get_chunk(chunk_x.id()).unwrap();

    let read = chunk_y.get_by_id(stored.id(), LogicalTime::sample()).unwrap();
    assert_eq!(read.get("n"), Some(&FieldValue::Int(3)));
    teardown(vec![joiner, founder]);
}

#[test]
fn conflicting_updates_exactly_one_wins() {
    let dir = tempfile::tempdir().unwrap();
    let founder = spawn_peer(dir.path(), true, false);
    let poses_x = founder.add_table(poses_descriptor()).unwrap();
    let chunk_x = poses_x.new_chunk().unwrap();
    let stored = chunk_x.insert(LogicalTime::sample(), record(7)).unwrap();

    let joiner = spawn_peer(dir.path(), false, false);
    let poses_y = joiner.add_table(poses_descriptor()).unwrap();
    poses_y.get_chunk(chunk_x.id()).unwrap();

    // Both peers read the record, then both update it.
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
    assert_eq!(successes, 1, "exactly one of the two commits may succeed");
    let conflict = if result_x.is_err() { result_x } else { result_y };
    match conflict {
        Err(CartaError::Conflict(ids)) => assert!(ids.contains(&stored.id())),
        other => panic!("expected a conflict carrying the record, got {other:?}"),
    }
    teardown(vec![joiner, founder]);
}

#[test]
fn multi_chunk_transaction_is_atomic_across_peers() {
    let dir = tempfile::tempdir().unwrap();
    let founder = spawn_peer(dir.path(), true, false);
    let poses_x = founder.add_table(poses_descriptor()).unwrap();
    let chunk_one = poses_x.new_chunk().unwrap();
    let chunk_two = poses_x.new_chunk().unwrap();
    let base = chunk_one.insert(LogicalTime::sample(), record(1)).unwrap();

    let joiner = spawn_peer(dir.path(), false, false);
    let poses_y = joiner.add_table(poses_descriptor()).unwrap();
    let replica_one = poses_y.get_chunk(chunk_one.id()).unwrap();
    let replica_two = poses_y.get_chunk(chunk_two.id()).unwrap();

    let mut transaction = Transaction::begin(&founder);
    let read = transaction.get_by_id("poses", base.id()).unwrap();
    let mut updated = read.copy_for_write();
    updated.set("n", FieldValue::Int(11));
    transaction.update("poses", updated).unwrap();
    let fresh = record(22);
    let fresh_id = fresh.id();
    transaction.insert("poses", &chunk_two, fresh).unwrap();
    let commit_time = transaction.commit().unwrap();

    // Both changes are visible on the remote replicas at commit time.
    assert!(await_condition(Duration::from_secs(5), || {
        let updated_visible = replica_one
            .get_by_id(base.id(), commit_time)
            .map(|revision| revision.get("n") == Some(&FieldValue::Int(11)))
            .unwrap_or(false);
        let inserted_visible = replica_two.get_by_id(fresh_id, commit_time).is_some();
        updated_visible && inserted_visible
    }));
    teardown(vec![joiner, founder]);
}

#[test]
fn triggers_fire_on_replicas_after_commit() {
    let dir = tempfile::tempdir().unwrap();
    let founder = spawn_peer(dir.path(), true, false);
    let poses_x = founder.add_table(poses_descriptor()).unwrap();
    let chunk_x = poses_x.new_chunk().unwrap();

    let joiner = spawn_peer(dir.path(), false, false);
    let poses_y = joiner.add_table(poses_descriptor()).unwrap();
    let chunk_y = poses_y.get_chunk(chunk_x.id()).unwrap();

    let (tx, rx) = crossbeam_channel::unbounded();
    chunk_y.attach_trigger(Box::new(move |insertions, updates| {
        let _ = tx.send((insertions.len(), updates.len()));
    }));

    // A transactional insert ends with an unlock broadcast that fires the
    // replica's triggers.
    let mut transaction = Transaction::begin(&founder);
    transaction.insert("poses", &chunk_x, record(5)).unwrap();
    transaction.commit().unwrap();

    let (insertions, _updates) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(insertions, 1);
    teardown(vec![joiner, founder]);
}
