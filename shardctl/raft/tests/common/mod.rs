//! Threaded cluster harness over the in-process router: boots a fixed peer
//! set, records everything each peer applies, and simulates partitions,
//! crashes and restarts through the router and the kept persisters.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::unbounded;
use raft::{ApplyMsg, MemoryPersister, Raft, RaftOptions, RaftService, Router, RouterTransport};

pub const ELECTION_DEADLINE: Duration = Duration::from_secs(10);
pub const AGREE_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Default)]
pub struct Applied {
    pub commands: Vec<(u64, Bytes, bool)>,
    pub snapshots: Vec<(u64, Bytes, bool)>,
}

pub struct Cluster {
    pub n: usize,
    pub router: Arc<Router>,
    pub persisters: Vec<Arc<MemoryPersister>>,
    pub nodes: Vec<Option<Raft>>,
    pub applied: Vec<Arc<Mutex<Applied>>>,
    opts: RaftOptions,
}

fn test_options() -> RaftOptions {
    RaftOptions {
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        heartbeat_interval: Duration::from_millis(40),
        tick_interval: Duration::from_millis(10),
    }
}

impl Cluster {
    pub fn start(n: usize) -> Cluster {
        let router = Router::new(n);
        let mut cluster = Cluster {
            n,
            router,
            persisters: (0..n).map(|_| Arc::new(MemoryPersister::new())).collect(),
            nodes: (0..n).map(|_| None).collect(),
            applied: (0..n).map(|_| Arc::new(Mutex::new(Applied::default()))).collect(),
            opts: test_options(),
        };
        for i in 0..n {
            cluster.boot(i);
        }
        cluster
    }

    fn boot(&mut self, i: usize) {
        let (apply_tx, apply_rx) = unbounded();
        let applied = Arc::new(Mutex::new(Applied::default()));
        self.applied[i] = Arc::clone(&applied);
        let sink = Arc::clone(&applied);
        thread::spawn(move || {
            for msg in apply_rx.iter() {
                let mut applied = sink.lock().unwrap();
                match msg {
                    ApplyMsg::Command { index, data, replay } => {
                        applied.commands.push((index, data, replay))
                    }
                    ApplyMsg::Snapshot { index, data, replay, .. } => {
                        applied.snapshots.push((index, data, replay))
                    }
                }
            }
        });
        let transport = Arc::new(RouterTransport::new(&self.router, i));
        let raft = Raft::start_node(
            i,
            self.n,
            transport,
            self.persisters[i].clone(),
            apply_tx,
            self.opts.clone(),
        )
        .expect("node boots");
        self.router
            .register(i, Arc::new(raft.clone()) as Arc<dyn RaftService>);
        self.nodes[i] = Some(raft);
    }

    pub fn node(&self, i: usize) -> &Raft {
        self.nodes[i].as_ref().expect("node is up")
    }

    pub fn crash(&mut self, i: usize) {
        if let Some(raft) = self.nodes[i].take() {
            raft.kill();
        }
        self.router.deregister(i);
    }

    /// Restart from the persisted state, with a fresh applied record so the
    /// replayed prefix is observable.
    pub fn restart(&mut self, i: usize) {
        self.crash(i);
        self.boot(i);
    }

    pub fn disconnect(&self, i: usize) {
        self.router.set_connected(i, false);
    }

    pub fn connect(&self, i: usize) {
        self.router.set_connected(i, true);
    }

    pub fn alive(&self) -> impl Iterator<Item = (usize, &Raft)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, node)| node.as_ref().map(|raft| (i, raft)))
    }

    /// Waits for a single leader among the given peers.
    pub fn leader_among(&self, peers: &[usize]) -> usize {
        let deadline = Instant::now() + ELECTION_DEADLINE;
        while Instant::now() < deadline {
            let leaders: Vec<usize> = peers
                .iter()
                .copied()
                .filter(|&i| {
                    self.nodes[i]
                        .as_ref()
                        .map(|raft| raft.state().1)
                        .unwrap_or(false)
                })
                .collect();
            if leaders.len() == 1 {
                return leaders[0];
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("no single leader among {:?}", peers);
    }

    pub fn leader(&self) -> usize {
        let peers: Vec<usize> = self.alive().map(|(i, _)| i).collect();
        self.leader_among(&peers)
    }

    pub fn applied_command(&self, i: usize, index: u64) -> Option<Bytes> {
        self.applied[i]
            .lock()
            .unwrap()
            .commands
            .iter()
            .find(|(at, _, _)| *at == index)
            .map(|(_, data, _)| data.clone())
    }

    /// How many of the given peers have applied `data` at `index`.
    pub fn applied_count(&self, peers: &[usize], index: u64, data: &Bytes) -> usize {
        peers
            .iter()
            .filter(|&&i| self.applied_command(i, index) == Some(data.clone()))
            .count()
    }

    /// Submits `data` through every peer that claims leadership until the
    /// whole `expected` set has applied it. Retries across leadership
    /// changes; a stale leader's accepted-but-doomed submission just means
    /// another round.
    pub fn one(&self, data: Bytes, expected: &[usize]) -> u64 {
        let deadline = Instant::now() + AGREE_DEADLINE;
        while Instant::now() < deadline {
            for (_, raft) in self.alive() {
                let (index, _, is_leader) = raft.start(data.clone());
                if !is_leader {
                    continue;
                }
                let attempt_deadline = Instant::now() + Duration::from_secs(1);
                while Instant::now() < attempt_deadline {
                    if self.applied_count(expected, index, &data) == expected.len() {
                        return index;
                    }
                    thread::sleep(Duration::from_millis(20));
                }
                // displaced or stuck at this index, try the next claimant
            }
            thread::sleep(Duration::from_millis(50));
        }
        panic!("command did not reach agreement");
    }

    /// Waits until `peer`'s applied command sequence is a prefix-match of
    /// `reference`'s at least through `index`.
    pub fn await_catch_up(&self, peer: usize, index: u64) {
        let deadline = Instant::now() + AGREE_DEADLINE;
        while Instant::now() < deadline {
            let caught_up = {
                let applied = self.applied[peer].lock().unwrap();
                applied.commands.iter().any(|(at, _, _)| *at >= index)
                    || applied.snapshots.iter().any(|(at, _, _)| *at >= index)
            };
            if caught_up {
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("s{} never caught up to {}", peer, index);
    }
}

pub fn data(tag: &str, k: usize) -> Bytes {
    Bytes::from(format!("{}-{}", tag, k))
}
