//! Point-to-point RPC between peers.
//!
//! The engine only sees the [`Transport`] trait; the [`Router`] here is the
//! in-process implementation, addressable per peer and able to drop traffic
//! on demand (disconnected nodes, severed links), which is what the cluster
//! test harnesses are built on. A TCP implementation lives in [`crate::tcp`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::error::TransportError;
use crate::message::{RaftRequest, RaftReply};

/// Sends one request to one peer and waits for its reply. Calls may fail or
/// hang for network reasons; callers treat any error as a lost message.
pub trait Transport: Send + Sync {
    fn call(&self, to: usize, request: RaftRequest) -> Result<RaftReply, TransportError>;
}

/// Inbound side of a peer: the engine implements this and the network
/// delivers requests through it.
pub trait RaftService: Send + Sync {
    fn handle(&self, request: RaftRequest) -> RaftReply;
}

struct RouterState {
    nodes: Vec<Option<Arc<dyn RaftService>>>,
    connected: Vec<bool>,
    severed: HashSet<(usize, usize)>,
}

/// In-process network connecting a fixed peer set. Messages between
/// disconnected nodes or across severed links are dropped.
pub struct Router {
    state: Mutex<RouterState>,
}

impl Router {
    pub fn new(peers: usize) -> Arc<Self> {
        Arc::new(Router {
            state: Mutex::new(RouterState {
                nodes: (0..peers).map(|_| None).collect(),
                connected: vec![true; peers],
                severed: HashSet::new(),
            }),
        })
    }

    pub fn register(&self, id: usize, service: Arc<dyn RaftService>) {
        self.state.lock().unwrap().nodes[id] = Some(service);
    }

    /// Detaches a node entirely, as a crash does.
    pub fn deregister(&self, id: usize) {
        self.state.lock().unwrap().nodes[id] = None;
    }

    pub fn set_connected(&self, id: usize, up: bool) {
        self.state.lock().unwrap().connected[id] = up;
    }

    pub fn sever(&self, a: usize, b: usize) {
        let mut state = self.state.lock().unwrap();
        state.severed.insert((a, b));
        state.severed.insert((b, a));
    }

    pub fn heal(&self, a: usize, b: usize) {
        let mut state = self.state.lock().unwrap();
        state.severed.remove(&(a, b));
        state.severed.remove(&(b, a));
    }

    fn route(&self, from: usize, to: usize) -> Result<Arc<dyn RaftService>, TransportError> {
        let state = self.state.lock().unwrap();
        if !state.connected[from] || !state.connected[to] || state.severed.contains(&(from, to)) {
            return Err(TransportError::Unreachable(to));
        }
        state.nodes[to].clone().ok_or(TransportError::Unreachable(to))
    }
}

pub struct RouterTransport {
    router: Arc<Router>,
    from: usize,
}

impl RouterTransport {
    /// The outbound endpoint peer `from` sends through.
    pub fn new(router: &Arc<Router>, from: usize) -> RouterTransport {
        RouterTransport {
            router: Arc::clone(router),
            from,
        }
    }
}

impl Transport for RouterTransport {
    fn call(&self, to: usize, request: RaftRequest) -> Result<RaftReply, TransportError> {
        let service = self.router.route(self.from, to)?;
        Ok(service.handle(request))
    }
}
