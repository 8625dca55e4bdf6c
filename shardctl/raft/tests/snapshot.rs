mod common;

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serial_test::serial;

use common::{data, Cluster};

#[test]
#[serial]
fn compaction_preserves_agreement() {
    let cluster = Cluster::start(3);
    let all = [0, 1, 2];
    let mut last = 0;
    for k in 0..10 {
        last = cluster.one(data("pre-snap", k), &all);
    }

    let blob = Bytes::from_static(b"state-through-compaction");
    for i in 0..3 {
        cluster.node(i).snapshot(last - 2, blob.clone());
    }
    // the log keeps extending past the compacted prefix
    for k in 0..5 {
        cluster.one(data("post-snap", k), &all);
    }
}

#[test]
#[serial]
fn restart_resumes_from_the_snapshot() {
    let mut cluster = Cluster::start(3);
    let all = [0, 1, 2];
    let mut last = 0;
    for k in 0..8 {
        last = cluster.one(data("snap", k), &all);
    }
    let blob = Bytes::from_static(b"captured-state");
    for i in 0..3 {
        cluster.node(i).snapshot(last, blob.clone());
    }
    thread::sleep(Duration::from_millis(100));

    for i in 0..3 {
        cluster.restart(i);
    }
    let fresh = cluster.one(data("after-restart", 0), &all);

    for i in 0..3 {
        cluster.await_catch_up(i, fresh);
        let applied = cluster.applied[i].lock().unwrap();
        let (snap_index, snap_data, replay) = applied
            .snapshots
            .first()
            .expect("restart must start from the snapshot")
            .clone();
        assert_eq!(snap_index, last);
        assert_eq!(snap_data, blob);
        assert!(replay, "the boot snapshot is a replay");
        // nothing from the compacted prefix is re-emitted as a command
        assert!(applied.commands.iter().all(|(index, _, _)| *index > last));
    }
}

#[test]
#[serial]
fn lagging_follower_is_brought_over_by_snapshot() {
    let cluster = Cluster::start(3);
    let all = [0, 1, 2];
    cluster.one(data("seed", 0), &all);

    let leader = cluster.leader();
    let follower = (0..3).find(|&i| i != leader).unwrap();
    cluster.disconnect(follower);

    let rest: Vec<usize> = (0..3).filter(|&i| i != follower).collect();
    let mut last = 0;
    for k in 0..10 {
        last = cluster.one(data("ahead", k), &rest);
    }
    // compact the connected peers so the follower's tail is unreachable
    let blob = Bytes::from_static(b"snapshot-for-laggard");
    for &i in &rest {
        cluster.node(i).snapshot(last, blob.clone());
    }
    for k in 0..3 {
        cluster.one(data("beyond", k), &rest);
    }

    cluster.connect(follower);
    let deadline = Instant::now() + common::AGREE_DEADLINE;
    loop {
        let installed = {
            let applied = cluster.applied[follower].lock().unwrap();
            applied
                .snapshots
                .iter()
                .any(|(index, data, _)| *index >= last && *data == blob)
        };
        if installed {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "the lagging follower never received the snapshot"
        );
        thread::sleep(Duration::from_millis(50));
    }
    // and it keeps up with the live log afterwards
    cluster.one(data("joined", 0), &all);
}

#[test]
#[serial]
fn stale_snapshots_are_ignored() {
    let cluster = Cluster::start(3);
    let all = [0, 1, 2];
    let mut last = 0;
    for k in 0..6 {
        last = cluster.one(data("s", k), &all);
    }
    let node = cluster.node(0);
    node.snapshot(last, Bytes::from_static(b"current"));
    // compacting behind the existing snapshot must be a no-op
    node.snapshot(last - 2, Bytes::from_static(b"stale"));
    assert!(node.cond_install_snapshot(0, last));
    assert!(!node.cond_install_snapshot(0, last - 1));
    cluster.one(data("still-alive", 0), &all);
}
