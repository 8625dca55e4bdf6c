//! The replication engine: election, append/commit, snapshots, apply.
//!
//! One engine instance runs per peer. Two background threads drive it: a
//! ticker owning the election and heartbeat clocks, and an apply pump that
//! is the sole producer on the apply channel. RPC handlers run on whatever
//! thread the transport delivers them on. Replication attempts and vote
//! solicitations run on short-lived threads, each pinned to the image
//! incarnation it was spawned under; a rotated token makes them exit
//! without effect.
//!
//! Shared counters (`commit_index`, `next_index`, `match_index`) are only
//! moved by compare-and-set keyed on the value observed when the RPC was
//! sent, so reordered slow replies cannot regress the accounting.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info};
use rand::Rng;

use crate::error::PersistError;
use crate::image::{Image, ImageCell, Role};
use crate::log::{Entry, EntryKind, LogInner, RwLog};
use crate::message::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply, RaftReply,
    RaftRequest, RequestVoteArgs, RequestVoteReply,
};
use crate::persist::{PersistedState, Persister};
use crate::transport::{RaftService, Transport};

/// A committed entry or an installed snapshot, delivered to the service in
/// strict index order.
#[derive(Clone, Debug)]
pub enum ApplyMsg {
    Command {
        index: u64,
        data: Bytes,
        /// True when this emission reprocesses log that was already
        /// persisted before the current process start; no live submitter
        /// is waiting on it.
        replay: bool,
    },
    Snapshot {
        index: u64,
        term: u64,
        data: Bytes,
        replay: bool,
    },
}

#[derive(Clone, Debug)]
pub struct RaftOptions {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    /// Strictly less than the minimum election timeout.
    pub heartbeat_interval: Duration,
    pub tick_interval: Duration,
}

impl Default for RaftOptions {
    fn default() -> Self {
        RaftOptions {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            tick_interval: Duration::from_millis(15),
        }
    }
}

struct ElectionTimer {
    deadline: Mutex<Instant>,
}

impl ElectionTimer {
    fn new() -> Self {
        ElectionTimer {
            deadline: Mutex::new(Instant::now()),
        }
    }

    fn reset(&self, opts: &RaftOptions) {
        let span = rand::thread_rng()
            .gen_range(opts.election_timeout_min..opts.election_timeout_max);
        *self.deadline.lock().unwrap() = Instant::now() + span;
    }

    fn expired(&self) -> bool {
        Instant::now() >= *self.deadline.lock().unwrap()
    }
}

struct RaftInner {
    me: usize,
    peers: usize,
    transport: Arc<dyn Transport>,
    persister: Arc<dyn Persister>,
    image: ImageCell,
    log: RwLog,
    commit_index: AtomicU64,
    next_index: Vec<AtomicU64>,
    match_index: Vec<AtomicU64>,
    commit_tx: Sender<u64>,
    timer: ElectionTimer,
    opts: RaftOptions,
    dead: AtomicBool,
    /// Last log index already persisted when this process started; entries
    /// at or below it are emitted with the replay flag set.
    boot_index: u64,
}

/// Handle to one peer's replication engine. Cheap to clone; all clones
/// drive the same peer.
#[derive(Clone)]
pub struct Raft {
    inner: Arc<RaftInner>,
}

impl Raft {
    /// Restores persisted state (if any), spawns the ticker and the apply
    /// pump, and returns the live peer. Committed entries and snapshots
    /// arrive on `apply_tx`; the channel closes after [`Raft::kill`].
    pub fn start_node(
        me: usize,
        peers: usize,
        transport: Arc<dyn Transport>,
        persister: Arc<dyn Persister>,
        apply_tx: Sender<ApplyMsg>,
        opts: RaftOptions,
    ) -> Result<Raft, PersistError> {
        let state_blob = persister.read_state()?;
        let (image, log, boot_index) = if state_blob.is_empty() {
            (ImageCell::new(0, None), RwLog::fresh(), 0)
        } else {
            let state = PersistedState::decode(&state_blob)?;
            let snapshot = persister.read_snapshot()?;
            let log = RwLog::restore(LogInner::from_persisted(
                state.entries,
                state.snapshot_index,
                state.snapshot_term,
                snapshot,
            ));
            let boot_index = log.read().last_index();
            (ImageCell::new(state.current_term, state.voted_for), log, boot_index)
        };
        let snapshot_index = log.read().snapshot_index();

        let (commit_tx, commit_rx) = unbounded();
        let inner = Arc::new(RaftInner {
            me,
            peers,
            transport,
            persister,
            image,
            log,
            commit_index: AtomicU64::new(snapshot_index),
            next_index: (0..peers).map(|_| AtomicU64::new(1)).collect(),
            match_index: (0..peers).map(|_| AtomicU64::new(0)).collect(),
            commit_tx,
            timer: ElectionTimer::new(),
            opts,
            dead: AtomicBool::new(false),
            boot_index,
        });
        let raft = Raft { inner };
        raft.inner.timer.reset(&raft.inner.opts);
        info!(
            "s{} start: term {}, log [{}, {}]",
            me,
            raft.inner.image.capture().current_term,
            snapshot_index,
            boot_index
        );

        let pump = raft.clone();
        thread::spawn(move || pump.apply_pump(commit_rx, apply_tx));
        let ticker = raft.clone();
        thread::spawn(move || ticker.ticker());

        // hand the boot snapshot to the service before anything else
        if snapshot_index > 0 {
            let _ = raft.inner.commit_tx.send(snapshot_index);
        }
        Ok(raft)
    }

    /// Appends a command on the leader path. Returns the entry's absolute
    /// index, the current term, and whether this peer accepted it; commit
    /// happens asynchronously.
    pub fn start(&self, data: Bytes) -> (u64, u64, bool) {
        let rf = &self.inner;
        if self.killed() {
            return (0, 0, false);
        }
        let image = rf.image.capture();
        if image.role != Role::Leader {
            return (0, 0, false);
        }
        let index = {
            let mut log = rf.log.write();
            if image.token.is_stale() {
                return (0, 0, false);
            }
            let index = log.last_index() + 1;
            log.push(Entry::command(index, image.current_term, data));
            rf.match_index[rf.me].store(index, Ordering::SeqCst);
            if self.persist_locked(&log).is_err() {
                return (0, 0, false);
            }
            index
        };
        debug!("s{} start {} at term {}", rf.me, index, image.current_term);
        self.broadcast();
        (index, image.current_term, true)
    }

    /// The service has captured all state up to `index`; fold the log
    /// prefix into the snapshot blob. Ignored when `index` is behind the
    /// current snapshot or past the last entry.
    pub fn snapshot(&self, index: u64, data: Bytes) {
        let rf = &self.inner;
        let mut log = rf.log.write();
        if !log.compact(index, data) {
            return;
        }
        debug!("s{} compacted through {}", rf.me, index);
        let _ = self.persist_locked(&log);
    }

    /// True when the snapshot offered on the apply channel is still current
    /// and the service should switch to it.
    pub fn cond_install_snapshot(&self, _last_term: u64, last_index: u64) -> bool {
        last_index >= self.inner.log.read().snapshot_index()
    }

    /// Current term and whether this peer believes it is the leader.
    pub fn state(&self) -> (u64, bool) {
        let image = self.inner.image.capture();
        (image.current_term, image.role == Role::Leader)
    }

    pub fn kill(&self) {
        self.inner.dead.store(true, Ordering::SeqCst);
        // wake the pump so it can observe the flag and close the channel
        let _ = self
            .inner
            .commit_tx
            .send(self.inner.commit_index.load(Ordering::SeqCst));
        info!("s{} killed", self.inner.me);
    }

    pub fn killed(&self) -> bool {
        self.inner.dead.load(Ordering::SeqCst)
    }

    // -- persistence --

    /// Saves term, vote, snapshot metadata and the live tail, together with
    /// the snapshot blob. Called with the log write lock held so the pair
    /// stays consistent. A failed save is fatal: the peer stops before it
    /// can acknowledge anything that was not made durable.
    fn persist_locked(&self, log: &LogInner) -> Result<(), PersistError> {
        let rf = &self.inner;
        let image = rf.image.capture();
        let (entries, snapshot_index, snapshot_term) = log.to_persisted();
        let state = PersistedState {
            current_term: image.current_term,
            voted_for: image.voted_for,
            snapshot_index,
            snapshot_term,
            entries,
        };
        let result = state
            .encode()
            .and_then(|blob| rf.persister.save(blob, log.snapshot()));
        if let Err(e) = &result {
            error!("s{} persistence failed, stopping: {}", rf.me, e);
            rf.dead.store(true, Ordering::SeqCst);
        }
        result
    }

    fn persist(&self) -> Result<(), PersistError> {
        let log = self.inner.log.write();
        self.persist_locked(&log)
    }

    // -- commit bookkeeping --

    /// Monotonic CAS advance; notifies the pump on success.
    fn advance_commit_to(&self, target: u64) {
        let rf = &self.inner;
        loop {
            let current = rf.commit_index.load(Ordering::SeqCst);
            if target <= current {
                return;
            }
            if rf
                .commit_index
                .compare_exchange(current, target, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                debug!("s{} commit -> {}", rf.me, target);
                let _ = rf.commit_tx.send(target);
                return;
            }
        }
    }

    /// Leader-side commit rule: the largest index replicated on a majority
    /// whose entry carries the current term.
    fn calculate_commit_index(&self, image: &Image) {
        let rf = &self.inner;
        let mut candidate = 0;
        for p in 0..rf.peers {
            candidate = candidate.max(rf.match_index[p].load(Ordering::SeqCst));
        }
        loop {
            if candidate == 0 {
                return;
            }
            let acked = (0..rf.peers)
                .filter(|&p| rf.match_index[p].load(Ordering::SeqCst) >= candidate)
                .count();
            if acked > rf.peers / 2 {
                break;
            }
            candidate -= 1;
        }
        if candidate <= rf.commit_index.load(Ordering::SeqCst) {
            return;
        }
        {
            // entries from earlier terms are never counted directly
            let log = rf.log.read();
            if log.term_at(candidate) != Some(image.current_term) {
                return;
            }
        }
        self.advance_commit_to(candidate);
    }

    // -- apply pump --

    fn apply_pump(&self, commit_rx: Receiver<u64>, apply_tx: Sender<ApplyMsg>) {
        let rf = &self.inner;
        // next absolute index to hand to the service
        let mut next = 0u64;
        for commit_index in commit_rx.iter() {
            if self.killed() {
                break;
            }
            while commit_index >= next {
                let msg = {
                    let log = rf.log.read();
                    let snapshot_index = log.snapshot_index();
                    if next < snapshot_index {
                        // compaction moved past the cursor, fast-forward to
                        // the sentinel
                        next = snapshot_index;
                        continue;
                    }
                    match log.entry(next) {
                        None => break,
                        Some(entry) => match entry.kind {
                            EntryKind::Placeholder => None,
                            EntryKind::Command => Some(ApplyMsg::Command {
                                index: entry.index,
                                data: entry.data.clone(),
                                replay: entry.index <= rf.boot_index,
                            }),
                            EntryKind::Snapshot => Some(ApplyMsg::Snapshot {
                                index: entry.index,
                                term: entry.term,
                                data: log.snapshot(),
                                replay: entry.index <= rf.boot_index,
                            }),
                        },
                    }
                };
                next += 1;
                if let Some(msg) = msg {
                    if apply_tx.send(msg).is_err() {
                        return;
                    }
                }
            }
        }
        // dropping apply_tx closes the service's apply channel
    }

    // -- ticker --

    fn ticker(&self) {
        let rf = &self.inner;
        let mut last_heartbeat = Instant::now() - rf.opts.heartbeat_interval;
        loop {
            thread::sleep(rf.opts.tick_interval);
            if self.killed() {
                return;
            }
            let image = rf.image.capture();
            match image.role {
                Role::Leader => {
                    if last_heartbeat.elapsed() >= rf.opts.heartbeat_interval {
                        last_heartbeat = Instant::now();
                        self.broadcast();
                    }
                }
                Role::Follower | Role::Candidate => {
                    if rf.timer.expired() {
                        self.kickoff_election();
                    }
                }
            }
        }
    }

    // -- election --

    fn kickoff_election(&self) {
        let rf = &self.inner;
        let observed = rf.image.capture();
        let (last_log_index, last_log_term) = rf.log.read().last_info();
        let me = rf.me;
        let candidate = match rf.image.update(&observed.token, |img| {
            img.current_term += 1;
            img.role = Role::Candidate;
            img.voted_for = Some(me);
            img.invalidate();
        }) {
            Some(image) => image,
            None => return,
        };
        if self.persist().is_err() {
            return;
        }
        rf.timer.reset(&rf.opts);
        info!("s{} candidate at term {}", me, candidate.current_term);

        if rf.peers == 1 {
            self.claim_leadership(&candidate);
            return;
        }
        let votes = Arc::new(AtomicU64::new(1));
        for peer in (0..rf.peers).filter(|&p| p != me) {
            let raft = self.clone();
            let candidate = candidate.clone();
            let votes = Arc::clone(&votes);
            let args = RequestVoteArgs {
                term: candidate.current_term,
                candidate: me,
                last_log_index,
                last_log_term,
            };
            thread::spawn(move || raft.solicit_vote(peer, args, candidate, votes));
        }
    }

    /// Final step of a won election: switch the image to leader and
    /// reinitialize the replication accounting. The candidate token being
    /// live guarantees the term is unchanged.
    fn claim_leadership(&self, candidate: &Image) {
        let rf = &self.inner;
        if rf
            .image
            .update(&candidate.token, |img| {
                img.role = Role::Leader;
                img.invalidate();
            })
            .is_none()
        {
            return;
        }
        let last_log_index = rf.log.read().last_index();
        for p in 0..rf.peers {
            rf.next_index[p].store(last_log_index + 1, Ordering::SeqCst);
            rf.match_index[p].store(if p == rf.me { last_log_index } else { 0 }, Ordering::SeqCst);
        }
        rf.timer.reset(&rf.opts);
        info!("s{} leader at term {}", rf.me, candidate.current_term);
        self.broadcast();
    }

    fn solicit_vote(
        &self,
        peer: usize,
        args: RequestVoteArgs,
        candidate: Image,
        votes: Arc<AtomicU64>,
    ) {
        let rf = &self.inner;
        let reply = match rf.transport.call(peer, RaftRequest::RequestVote(args)) {
            Ok(RaftReply::RequestVote(reply)) => reply,
            _ => return,
        };
        if candidate.token.is_stale() || !reply.valid {
            return;
        }
        if reply.term > candidate.current_term {
            self.step_down(&candidate, reply.term);
            return;
        }
        if !reply.vote_granted {
            return;
        }
        let granted = votes.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            "s{} vote from s{} ({}/{})",
            rf.me, peer, granted, rf.peers
        );
        if granted as usize <= rf.peers / 2 {
            return;
        }
        self.claim_leadership(&candidate);
    }

    /// A reply revealed a newer term: become follower without touching the
    /// election timer.
    fn step_down(&self, observed: &Image, term: u64) {
        let updated = self.inner.image.update(&observed.token, |img| {
            img.role = Role::Follower;
            img.current_term = term;
            img.voted_for = None;
            img.invalidate();
        });
        if updated.is_some() {
            info!("s{} follower at term {} (newer term seen)", self.inner.me, term);
            let _ = self.persist();
        }
    }

    // -- replication (leader side) --

    /// One replication round: refresh the commit index, then send every
    /// peer either entries from its `next_index` or, when the log no longer
    /// holds them, the snapshot.
    fn broadcast(&self) {
        let rf = &self.inner;
        let image = rf.image.capture();
        if image.role != Role::Leader || self.killed() {
            return;
        }
        self.calculate_commit_index(&image);
        let leader_commit = rf.commit_index.load(Ordering::SeqCst);
        let log = rf.log.read();
        for peer in (0..rf.peers).filter(|&p| p != rf.me) {
            let next_index = rf.next_index[peer].load(Ordering::SeqCst);
            let match_index = rf.match_index[peer].load(Ordering::SeqCst);
            if next_index <= log.snapshot_index() {
                let args = InstallSnapshotArgs {
                    term: image.current_term,
                    leader: rf.me,
                    last_included_index: log.snapshot_index(),
                    last_included_term: log.snapshot_term(),
                    data: log.snapshot(),
                };
                let raft = self.clone();
                let image = image.clone();
                thread::spawn(move || {
                    raft.offer_snapshot(peer, args, image, next_index, match_index)
                });
                continue;
            }
            let prev_log_index = next_index - 1;
            let prev_log_term = match log.term_at(prev_log_index) {
                Some(term) => term,
                None => continue, // accounting is mid-update, retry next round
            };
            let args = AppendEntriesArgs {
                term: image.current_term,
                leader: rf.me,
                leader_commit,
                prev_log_index,
                prev_log_term,
                entries: log.tail(next_index),
            };
            let raft = self.clone();
            let image = image.clone();
            thread::spawn(move || raft.replicate(peer, args, image, next_index, match_index));
        }
    }

    /// Sends one AppendEntries and folds the reply back into `next_index`/
    /// `match_index`, compare-and-set against the values observed at send
    /// time.
    fn replicate(
        &self,
        peer: usize,
        args: AppendEntriesArgs,
        image: Image,
        next_index: u64,
        match_index: u64,
    ) {
        let rf = &self.inner;
        let reply = match rf.transport.call(peer, RaftRequest::AppendEntries(args.clone())) {
            Ok(RaftReply::AppendEntries(reply)) => reply,
            _ => return,
        };
        if image.token.is_stale() || !reply.valid {
            return;
        }
        if reply.term > image.current_term {
            self.step_down(&image, reply.term);
            return;
        }
        let mut new_next = next_index;
        let mut new_match = match_index;
        if reply.success {
            new_next = next_index + args.entries.len() as u64;
            new_match = new_next - 1;
        } else {
            new_next = reply.conflict_index;
            if let Some(conflict_term) = reply.conflict_term {
                // skip past our own run of the conflicting term, if any
                let log = rf.log.read();
                if log.term_at(new_next) == Some(conflict_term) {
                    while new_next < args.prev_log_index
                        && log.term_at(new_next) == Some(conflict_term)
                    {
                        new_next += 1;
                    }
                }
            }
        }
        if new_next == next_index && new_match == match_index {
            return;
        }
        if !image.token.is_stale()
            && rf.next_index[peer]
                .compare_exchange(next_index, new_next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            && rf.match_index[peer]
                .compare_exchange(match_index, new_match, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            debug!(
                "s{} -> s{}: next {} match {}",
                rf.me, peer, new_next, new_match
            );
        }
    }

    fn offer_snapshot(
        &self,
        peer: usize,
        args: InstallSnapshotArgs,
        image: Image,
        next_index: u64,
        match_index: u64,
    ) {
        let rf = &self.inner;
        let last_included = args.last_included_index;
        let reply = match rf.transport.call(peer, RaftRequest::InstallSnapshot(args)) {
            Ok(RaftReply::InstallSnapshot(reply)) => reply,
            _ => return,
        };
        if image.token.is_stale() || !reply.valid {
            return;
        }
        if reply.term > image.current_term {
            self.step_down(&image, reply.term);
            return;
        }
        if !image.token.is_stale()
            && rf.next_index[peer]
                .compare_exchange(next_index, last_included + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            && rf.match_index[peer]
                .compare_exchange(match_index, last_included, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            debug!("s{} -> s{}: snapshot through {}", rf.me, peer, last_included);
        }
    }

    // -- RPC handlers --

    fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let rf = &self.inner;
        let observed = rf.image.capture();
        let mut reply = AppendEntriesReply {
            valid: !self.killed(),
            term: args.term.max(observed.current_term),
            ..Default::default()
        };
        if !reply.valid {
            return reply;
        }
        if args.term < observed.current_term {
            debug!(
                "s{} refuse append from s{}: term {} < {}",
                rf.me, args.leader, args.term, observed.current_term
            );
            return reply;
        }

        // a live leader for this term: adopt it and follow
        let stays_follower = args.term == observed.current_term && observed.role == Role::Follower;
        let image = match rf.image.update(&observed.token, |img| {
            img.role = Role::Follower;
            img.current_term = args.term;
            img.voted_for = Some(args.leader);
            if !stays_follower {
                img.invalidate();
            }
        }) {
            Some(image) => image,
            None => {
                reply.valid = false;
                return reply;
            }
        };
        rf.timer.reset(&rf.opts);
        if args.term > observed.current_term && self.persist().is_err() {
            reply.valid = false;
            return reply;
        }

        // consistency check under the read lock
        {
            let log = rf.log.read();
            if let Err((conflict_index, conflict_term)) =
                check_prev(&log, args.prev_log_index, args.prev_log_term)
            {
                reply.conflict_index = conflict_index;
                reply.conflict_term = conflict_term;
                reply.valid = !image.token.is_stale();
                debug!(
                    "s{} conflict with s{} at {} (ci {} ct {:?})",
                    rf.me, args.leader, args.prev_log_index, conflict_index, conflict_term
                );
                return reply;
            }
        }

        {
            let mut log = rf.log.write();
            if image.token.is_stale() {
                reply.valid = false;
                return reply;
            }
            // revalidate under the write lock; a concurrent append may have
            // moved the log
            if let Err((conflict_index, conflict_term)) =
                check_prev(&log, args.prev_log_index, args.prev_log_term)
            {
                reply.conflict_index = conflict_index;
                reply.conflict_term = conflict_term;
                return reply;
            }
            let mut mutated = false;
            for entry in &args.entries {
                // entries folded into the snapshot are already matched
                if entry.index <= log.snapshot_index() {
                    continue;
                }
                if entry.index <= log.last_index() {
                    let matches = {
                        let held = log.entry(entry.index).expect("index within tail");
                        held.term == entry.term && held.kind == entry.kind
                    };
                    if matches {
                        continue;
                    }
                    // first divergence: drop the conflicting suffix
                    log.truncate(entry.index);
                }
                log.push(entry.clone());
                mutated = true;
            }
            if mutated {
                if self.persist_locked(&log).is_err() {
                    reply.valid = false;
                    return reply;
                }
                debug!(
                    "s{} appended {} entries from s{}",
                    rf.me,
                    args.entries.len(),
                    args.leader
                );
            }
        }

        reply.success = true;
        let last_new_entry = args.prev_log_index + args.entries.len() as u64;
        self.advance_commit_to(args.leader_commit.min(last_new_entry));
        reply
    }

    fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let rf = &self.inner;
        let mut observed = rf.image.capture();
        let mut reply = RequestVoteReply {
            valid: !self.killed(),
            term: args.term.max(observed.current_term),
            vote_granted: false,
        };
        if !reply.valid {
            return reply;
        }
        if args.term < observed.current_term {
            return reply;
        }
        if args.term > observed.current_term {
            observed = match rf.image.update(&observed.token, |img| {
                img.role = Role::Follower;
                img.current_term = args.term;
                img.voted_for = None;
                img.invalidate();
            }) {
                Some(image) => image,
                None => {
                    reply.valid = false;
                    return reply;
                }
            };
            if self.persist().is_err() {
                reply.valid = false;
                return reply;
            }
        }

        let (last_log_index, last_log_term) = rf.log.read().last_info();
        let log_ok = args.last_log_term > last_log_term
            || (args.last_log_term == last_log_term && args.last_log_index >= last_log_index);
        let free_to_vote =
            observed.voted_for.is_none() || observed.voted_for == Some(args.candidate);
        if !log_ok || !free_to_vote {
            debug!(
                "s{} reject vote for s{} at term {}",
                rf.me, args.candidate, args.term
            );
            return reply;
        }
        if rf
            .image
            .update(&observed.token, |img| img.voted_for = Some(args.candidate))
            .is_none()
        {
            reply.valid = false;
            return reply;
        }
        // the vote must be durable before it is visible
        if self.persist().is_err() {
            reply.valid = false;
            return reply;
        }
        rf.timer.reset(&rf.opts);
        reply.vote_granted = true;
        info!(
            "s{} vote for s{} at term {}",
            rf.me, args.candidate, args.term
        );
        reply
    }

    fn handle_install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotReply {
        let rf = &self.inner;
        let observed = rf.image.capture();
        let mut reply = InstallSnapshotReply {
            valid: !self.killed(),
            term: args.term.max(observed.current_term),
        };
        if !reply.valid || args.term < observed.current_term {
            return reply;
        }
        let stays_follower = args.term == observed.current_term && observed.role == Role::Follower;
        let image = match rf.image.update(&observed.token, |img| {
            img.role = Role::Follower;
            img.current_term = args.term;
            img.voted_for = Some(args.leader);
            if !stays_follower {
                img.invalidate();
            }
        }) {
            Some(image) => image,
            None => {
                reply.valid = false;
                return reply;
            }
        };
        rf.timer.reset(&rf.opts);
        {
            let mut log = rf.log.write();
            if args.last_included_index <= log.snapshot_index() {
                return reply;
            }
            if image.token.is_stale() {
                reply.valid = false;
                return reply;
            }
            log.install(
                args.last_included_index,
                args.last_included_term,
                args.data,
            );
            if self.persist_locked(&log).is_err() {
                reply.valid = false;
                return reply;
            }
            info!(
                "s{} installed snapshot through {} from s{}",
                rf.me, args.last_included_index, args.leader
            );
        }
        // the pump fast-forwards to the sentinel and emits it in order
        self.advance_commit_to(args.last_included_index);
        reply
    }
}

/// Consistency check at `prev_log_index`. `Err` carries the fast-backoff
/// hint: the first index the leader should retry from, and the term of the
/// conflicting entry when one exists.
fn check_prev(
    log: &LogInner,
    prev_log_index: u64,
    prev_log_term: u64,
) -> Result<(), (u64, Option<u64>)> {
    if prev_log_index > log.last_index() {
        return Err((log.last_index() + 1, None));
    }
    if prev_log_index < log.snapshot_index() {
        // the snapshot covers it, treat as matched at the boundary
        return Ok(());
    }
    let held_term = log.term_at(prev_log_index).expect("index within tail");
    if held_term == prev_log_term {
        return Ok(());
    }
    // walk left to the first entry of the conflicting term's run
    let mut conflict_index = prev_log_index;
    while conflict_index > log.snapshot_index()
        && log.term_at(conflict_index - 1) == Some(held_term)
    {
        conflict_index -= 1;
    }
    Err((conflict_index, Some(held_term)))
}

impl RaftService for Raft {
    fn handle(&self, request: RaftRequest) -> RaftReply {
        match request {
            RaftRequest::AppendEntries(args) => {
                RaftReply::AppendEntries(self.handle_append_entries(args))
            }
            RaftRequest::RequestVote(args) => {
                RaftReply::RequestVote(self.handle_request_vote(args))
            }
            RaftRequest::InstallSnapshot(args) => {
                RaftReply::InstallSnapshot(self.handle_install_snapshot(args))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_prev_matches_at_snapshot_boundary() {
        let log = RwLog::fresh();
        let mut inner = log.write();
        for i in 1..=6 {
            inner.push(Entry::command(i, 2, Bytes::new()));
        }
        inner.compact(4, Bytes::new());
        // exactly at the sentinel
        assert!(check_prev(&inner, 4, 2).is_ok());
        // behind the snapshot counts as matched
        assert!(check_prev(&inner, 2, 1).is_ok());
        // past the end reports where the log stops
        assert_eq!(check_prev(&inner, 9, 2), Err((7, None)));
    }

    #[test]
    fn check_prev_reports_term_run_start() {
        let log = RwLog::fresh();
        let mut inner = log.write();
        inner.push(Entry::command(1, 1, Bytes::new()));
        inner.push(Entry::command(2, 2, Bytes::new()));
        inner.push(Entry::command(3, 2, Bytes::new()));
        inner.push(Entry::command(4, 2, Bytes::new()));
        // leader claims term 3 at index 4; we hold a run of term 2 from 2..=4
        assert_eq!(check_prev(&inner, 4, 3), Err((2, Some(2))));
    }
}
