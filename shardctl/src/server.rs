//! The Service Server: serializes client operations through the replicated
//! log and returns each result exactly once.
//!
//! Submission path: build an op tagged with this server's id, hand it to
//! the replicator, block on the waiter registry at the returned index, and
//! compare the applied op against the submitted one; a mismatch means the
//! slot was claimed under another leader and the client must retry
//! elsewhere.
//!
//! Apply path: a single applier thread drains the apply channel, suppresses
//! duplicates through the [`ITable`], runs the application, wakes waiters,
//! and compacts the log through a service snapshot once the persisted state
//! outgrows its budget.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use raft::tcp::{read_frame, write_frame};
use raft::{ApplyMsg, Persister, Raft, RaftOptions, Transport, TransportError};

use crate::application::Application;
use crate::error::ServiceError;
use crate::itable::ITable;
use crate::protocol::{CommandReply, CommandRequest, Identifier, Op, Status};
use crate::replies::OpReplies;

#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub raft: RaftOptions,
    /// Compact once the persisted raft state exceeds this many bytes.
    /// `None` disables service snapshots.
    pub max_raft_state: Option<usize>,
    /// Threads serving client connections on the TCP front end.
    pub connection_threads: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            raft: RaftOptions::default(),
            max_raft_state: None,
            connection_threads: 4,
        }
    }
}

/// Everything the applier persists inside a raft snapshot: the application
/// state plus the duplicate-suppression table.
#[derive(Serialize, Deserialize)]
struct ServiceSnapshot<R> {
    app: Vec<u8>,
    itable: ITable<R>,
}

pub struct Server<A: Application> {
    me: usize,
    raft: Raft,
    waiters: OpReplies<A::Command, A::Reply>,
    persister: Arc<dyn Persister>,
    max_raft_state: Option<usize>,
    connection_threads: usize,
    dead: AtomicBool,
}

impl<A: Application> Server<A> {
    /// Boots the replicator (restoring persisted state if any) and the
    /// applier thread, and returns the live server.
    pub fn start(
        me: usize,
        peers: usize,
        transport: Arc<dyn Transport>,
        persister: Arc<dyn Persister>,
        app: A,
        opts: ServerOptions,
    ) -> Result<Arc<Server<A>>, ServiceError> {
        let (apply_tx, apply_rx) = unbounded();
        let raft = Raft::start_node(me, peers, transport, Arc::clone(&persister), apply_tx, opts.raft)?;
        let server = Arc::new(Server {
            me,
            raft,
            waiters: OpReplies::new(),
            persister,
            max_raft_state: opts.max_raft_state,
            connection_threads: opts.connection_threads,
            dead: AtomicBool::new(false),
        });
        let applier = Arc::clone(&server);
        thread::spawn(move || applier.applier(app, apply_rx));
        info!("s{} service up", me);
        Ok(server)
    }

    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
        self.raft.kill();
        self.waiters.destroy();
        info!("s{} service stopped", self.me);
    }

    pub fn killed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Runs one client operation through the log. Blocks until the command
    /// at the assigned index applies, or leadership is lost.
    pub fn submit(&self, id: Identifier, cmd: A::Command) -> CommandReply<A::Reply> {
        if self.killed() {
            return CommandReply::wrong_leader();
        }
        let op = Op {
            server: self.me,
            id,
            cmd,
        };
        let data = match bincode::serialize(&op) {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                error!("s{} could not encode op: {}", self.me, e);
                return CommandReply::wrong_leader();
            }
        };
        let (index, _term, is_leader) = self.raft.start(data);
        if !is_leader {
            return CommandReply::wrong_leader();
        }
        debug!("s{} waiting on index {}", self.me, index);
        match self.waiters.wait_and_match(index, &op) {
            Some(reply) => CommandReply {
                status: Status::Ok,
                reply: Some(reply),
            },
            None => CommandReply::wrong_leader(),
        }
    }

    pub fn handle(&self, request: CommandRequest<A::Command>) -> CommandReply<A::Reply> {
        self.submit(request.id, request.cmd)
    }

    fn applier(self: Arc<Self>, mut app: A, apply_rx: Receiver<ApplyMsg>) {
        let mut itable: ITable<A::Reply> = ITable::new();
        // highest absolute index reflected in `app`
        let mut cursor = 0u64;
        for msg in apply_rx.iter() {
            if self.killed() {
                break;
            }
            match msg {
                ApplyMsg::Snapshot { index, term, data, .. } => {
                    if !self.raft.cond_install_snapshot(term, index) || index <= cursor {
                        continue;
                    }
                    match bincode::deserialize::<ServiceSnapshot<A::Reply>>(&data) {
                        Ok(snapshot) => {
                            if let Err(e) = app.restore(&snapshot.app) {
                                error!("s{} snapshot restore failed: {}", self.me, e);
                                continue;
                            }
                            itable = snapshot.itable;
                            cursor = index;
                            info!("s{} state restored through {}", self.me, index);
                        }
                        Err(e) => error!("s{} undecodable snapshot: {}", self.me, e),
                    }
                }
                ApplyMsg::Command { index, data, replay } => {
                    if index <= cursor {
                        continue;
                    }
                    let op: Op<A::Command> = match bincode::deserialize(&data) {
                        Ok(op) => op,
                        Err(e) => {
                            error!("s{} undecodable op at {}: {}", self.me, index, e);
                            cursor = index;
                            continue;
                        }
                    };
                    // a waiter can only exist if this server proxied the op
                    // in the current incarnation
                    let wake = op.server == self.me && !replay;
                    let reply = if itable.executed(&op.id) {
                        match itable.cached(op.id.clerk) {
                            Some(reply) => reply,
                            None => continue,
                        }
                    } else {
                        let reply = app.apply(op.cmd.clone());
                        itable.record(op.id, reply.clone());
                        reply
                    };
                    self.waiters.set_and_broadcast(index, op, reply, wake);
                    cursor = index;
                    self.maybe_compact(&app, &itable, cursor);
                }
            }
        }
        debug!("s{} applier done", self.me);
    }

    /// Folds applied state into a raft snapshot once the persisted log
    /// outgrows the configured budget.
    fn maybe_compact(&self, app: &A, itable: &ITable<A::Reply>, cursor: u64) {
        let limit = match self.max_raft_state {
            Some(limit) => limit,
            None => return,
        };
        if self.persister.state_size() < limit {
            return;
        }
        let snapshot = match self.encode_snapshot(app, itable) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("s{} could not encode snapshot: {}", self.me, e);
                return;
            }
        };
        debug!("s{} compacting through {}", self.me, cursor);
        self.raft.snapshot(cursor, snapshot);
    }

    fn encode_snapshot(&self, app: &A, itable: &ITable<A::Reply>) -> Result<Bytes, ServiceError> {
        let snapshot = ServiceSnapshot {
            app: app.snapshot()?,
            itable: itable.clone(),
        };
        Ok(Bytes::from(bincode::serialize(&snapshot)?))
    }

    /// TCP front end: accepts client connections and answers framed
    /// requests on a bounded worker pool.
    pub fn serve(server: Arc<Server<A>>, listener: TcpListener) -> Result<JoinHandle<()>, ServiceError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(server.connection_threads)
            .build()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(thread::spawn(move || {
            for stream in listener.incoming() {
                if server.killed() {
                    break;
                }
                let mut stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("client accept failed: {}", e);
                        continue;
                    }
                };
                let server = Arc::clone(&server);
                pool.spawn(move || {
                    if let Err(e) = server.attend(&mut stream) {
                        debug!("client connection closed: {}", e);
                    }
                });
            }
        }))
    }

    fn attend(&self, stream: &mut TcpStream) -> Result<(), TransportError> {
        loop {
            let request: CommandRequest<A::Command> = read_frame(stream)?;
            let reply = self.handle(request);
            write_frame(stream, &reply)?;
        }
    }
}
