// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::Arc;
use std::time::Duration;
use test_log::test;
use vinyl::{Config, Env, IteratorType, Lsm, Statement};

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

fn k(i: u32) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    for _ in 0..400 {
        if done() {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(25));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn restart_rebuilds_the_same_state() {
    let dir = tempfile::tempdir().expect("tempdir");

    let (before, range_count, run_count) = {
        let env = open(&dir);
        let lsm = env.create_lsm(512, 0).expect("create");

        for i in 0..100u32 {
            write(&env, &lsm, Statement::replace(k(i), *b"a", 0));
        }
        env.checkpoint().expect("checkpoint");

        for i in 50..80u32 {
            write(&env, &lsm, Statement::replace(k(i), *b"b", 0));
        }
        env.checkpoint().expect("checkpoint");

        // Two runs in the last level force a compaction; let the tree
        // settle so the captured shape is stable.
        wait_until("compaction", || {
            lsm.total_slice_count() <= 1 && lsm.run_count() == 1
        });

        (scan(&env, &lsm), lsm.range_count(), lsm.run_count())
    };

    let env = open(&dir);
    let lsm = env.lsm(512, 0).expect("recovered lsm");

    assert_eq!(range_count, lsm.range_count());
    assert_eq!(run_count, lsm.run_count());
    assert_eq!(before, scan(&env, &lsm));
}

#[test]
fn restart_preserves_point_reads_and_lsns() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let env = open(&dir);
        let lsm = env.create_lsm(7, 0).expect("create");
        write(&env, &lsm, Statement::replace(k(1), *b"x", 0)); // lsn 1
        write(&env, &lsm, Statement::replace(k(1), *b"y", 0)); // lsn 2
        env.checkpoint().expect("checkpoint");
    }

    let env = open(&dir);
    let lsm = env.lsm(7, 0).expect("recovered lsm");

    let stmt = env.get(&lsm, None, k(1)).expect("get").expect("present");
    assert_eq!(&*stmt.value, b"y");
    assert_eq!(2, stmt.lsn);

    // New writes continue after the recovered LSN.
    write(&env, &lsm, Statement::replace(k(2), *b"z", 0));
    let stmt = env.get(&lsm, None, k(2)).expect("get").expect("present");
    assert!(stmt.lsn > 2);
}

#[test]
fn dropped_lsm_stays_dropped() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let env = open(&dir);
        let lsm = env.create_lsm(512, 0).expect("create");
        write(&env, &lsm, Statement::replace(k(1), *b"a", 0));
        env.checkpoint().expect("checkpoint");
        env.drop_lsm(&lsm).expect("drop");
    }

    let env = open(&dir);
    assert!(env.lsm(512, 0).is_none());
}

#[test]
fn several_indexes_recover_independently() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let env = open(&dir);
        let primary = env.create_lsm(512, 0).expect("create");
        let secondary = env.create_lsm(512, 1).expect("create");

        write(&env, &primary, Statement::replace(k(1), *b"p", 0));
        write(&env, &secondary, Statement::replace(k(1), *b"s", 0));
        env.checkpoint().expect("checkpoint");
    }

    let env = open(&dir);
    let primary = env.lsm(512, 0).expect("primary");
    let secondary = env.lsm(512, 1).expect("secondary");

    assert_eq!(
        b"p".to_vec(),
        env.get(&primary, None, k(1))
            .expect("get")
            .expect("present")
            .value
            .to_vec()
    );
    assert_eq!(
        b"s".to_vec(),
        env.get(&secondary, None, k(1))
            .expect("get")
            .expect("present")
            .value
            .to_vec()
    );
}
