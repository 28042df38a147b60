// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_log::test;
use vinyl::{
    fault, Config, Env, IteratorType, Lsm, Statement, UpsertOp, UpsertOps,
    STMT_DEFERRED_DELETE,
};

fn open(dir: &tempfile::TempDir) -> Env {
    Config::new(dir.path())
        .write_threads(2)
        .backoff(Duration::from_millis(10), Duration::from_millis(100))
        .open()
        .expect("open")
}

fn write(env: &Env, lsm: &Arc<Lsm>, stmt: Statement) {
    let tx = env.begin();
    env.tx_manager().set(&tx, lsm, stmt).expect("set");
    env.prepare(&tx).expect("prepare");
    env.commit(&tx).expect("commit");
}

fn scan(env: &Env, lsm: &Arc<Lsm>) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut iter = env.iterator(lsm, None, IteratorType::Ge, &b""[..]);
    let mut out = vec![];
    while let Some(stmt) = iter.next().expect("next") {
        out.push((stmt.key.to_vec(), stmt.value.to_vec()));
    }
    out
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    for _ in 0..400 {
        if done() {
            return;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for {what}");
}

fn k(i: u32) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}

#[test]
fn dump_roundtrip_returns_highest_lsn_per_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = open(&dir);
    let lsm = env.create_lsm(512, 0).expect("create");

    for i in 0..100u32 {
        write(&env, &lsm, Statement::replace(k(i), *b"old", 0));
    }
    for i in 0..50u32 {
        write(&env, &lsm, Statement::replace(k(i), *b"new", 0));
    }
    // Deleted keys must not come back after the dump.
    for i in 90..100u32 {
        write(&env, &lsm, Statement::delete(k(i), 0));
    }

    let before = scan(&env, &lsm);
    env.checkpoint().expect("checkpoint");
    let after = scan(&env, &lsm);

    assert_eq!(before, after);
    assert_eq!(90, after.len());
    assert_eq!(b"new".to_vec(), after[0].1);
    assert_eq!(b"old".to_vec(), after[50].1);

    // Everything lives on disk now.
    assert!(lsm.run_count() >= 1);
}

#[test]
fn compaction_identity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = open(&dir);
    let lsm = env.create_lsm(512, 0).expect("create");

    for i in 0..50u32 {
        write(&env, &lsm, Statement::replace(k(i), *b"v1", 0));
    }
    env.checkpoint().expect("checkpoint");

    for i in 25..75u32 {
        write(&env, &lsm, Statement::replace(k(i), *b"v2", 0));
    }
    for i in 0..10u32 {
        write(&env, &lsm, Statement::delete(k(i), 0));
    }
    env.checkpoint().expect("checkpoint");

    let before = scan(&env, &lsm);

    // Two slices in the last level force a compaction of the range.
    wait_until("compaction", || lsm.total_slice_count() <= 1);

    let after = scan(&env, &lsm);
    assert_eq!(before, after);

    // The tombstones and the shadowed versions are gone for good: exactly
    // one run with exactly the live rows remains.
    wait_until("run gc", || lsm.run_count() == 1);
    let runs = lsm.runs();
    assert_eq!(65, runs[0].info().row_count);
}

#[test]
fn dump_failure_backs_off_and_retries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = open(&dir);
    let lsm = env.create_lsm(512, 0).expect("create");

    write(&env, &lsm, Statement::replace(k(1), *b"a", 0));

    fault::arm(fault::Fault::MemDump);

    // The first dump attempt fails, the scheduler backs off and the retry
    // succeeds; the checkpoint outlives the failure.
    env.checkpoint().expect("checkpoint");

    assert!(lsm.run_count() >= 1);
    let stmt = env.get(&lsm, None, k(1)).expect("get").expect("present");
    assert_eq!(&*stmt.value, b"a");
}

#[test]
fn deferred_deletes_reach_the_sink() {
    let dir = tempfile::tempdir().expect("tempdir");

    let received: Arc<Mutex<Vec<(Vec<u8>, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_target = received.clone();

    let env = Config::new(dir.path())
        .write_threads(2)
        .backoff(Duration::from_millis(10), Duration::from_millis(100))
        .deferred_delete_sink(Arc::new(move |old, new| {
            sink_target
                .lock()
                .expect("lock")
                .push((old.value.to_vec(), new.value.to_vec()));
        }))
        .open()
        .expect("open");

    let lsm = env.create_lsm(512, 0).expect("create");

    write(&env, &lsm, Statement::replace(k(1), *b"old", 0));
    env.checkpoint().expect("checkpoint");

    let mut flagged = Statement::replace(k(1), *b"new", 0);
    flagged.flags |= STMT_DEFERRED_DELETE;
    write(&env, &lsm, flagged);
    env.checkpoint().expect("checkpoint");

    // Compaction of the two runs pairs the flagged REPLACE with the tuple
    // it overwrote and ships the pair to the sink.
    wait_until("deferred delete", || {
        !received.lock().expect("lock").is_empty()
    });

    let pairs = received.lock().expect("lock");
    assert_eq!(b"old".to_vec(), pairs[0].0);
    assert_eq!(b"new".to_vec(), pairs[0].1);
}

#[test]
fn upserts_survive_dump_and_fold_on_compaction() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = open(&dir);
    let lsm = env.create_lsm(512, 0).expect("create");

    let int = |n: i64| n.to_le_bytes().to_vec();

    write(&env, &lsm, Statement::replace(k(1), int(1), 0));
    env.checkpoint().expect("checkpoint");

    // The second write is an UPSERT over disk state: the in-memory squash
    // cannot apply it, so it is dumped as an UPSERT.
    write(
        &env,
        &lsm,
        Statement::upsert(k(1), int(0), UpsertOps::from(vec![UpsertOp::Add(5)]), 0),
    );
    env.checkpoint().expect("checkpoint");

    let stmt = env.get(&lsm, None, k(1)).expect("get").expect("present");
    assert_eq!(int(6), stmt.value.to_vec());

    // After compaction the chain is folded into a plain REPLACE.
    wait_until("compaction", || lsm.total_slice_count() <= 1);

    let stmt = env.get(&lsm, None, k(1)).expect("get").expect("present");
    assert_eq!(int(6), stmt.value.to_vec());
}

#[test]
fn force_compaction_compacts_single_level() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = open(&dir);
    let lsm = env.create_lsm(512, 0).expect("create");

    for i in 0..20u32 {
        write(&env, &lsm, Statement::replace(k(i), *b"a", 0));
    }
    env.checkpoint().expect("checkpoint");
    for i in 0..20u32 {
        write(&env, &lsm, Statement::replace(k(i), *b"b", 0));
    }
    env.checkpoint().expect("checkpoint");

    env.force_compaction(&lsm);
    wait_until("forced compaction", || lsm.total_slice_count() <= 1);

    let rows = scan(&env, &lsm);
    assert_eq!(20, rows.len());
    assert!(rows.iter().all(|(_, v)| v == b"b"));
}
