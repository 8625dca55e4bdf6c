//! Service cluster harness: a fixed set of servers over the in-process
//! router, with clerk endpoints that can be cut off and restored alongside
//! the simulated network, and crash/restart driven through kept persisters.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use raft::{MemoryPersister, RaftOptions, RaftService, Router, RouterTransport};
use shardctl::{Application, Endpoint, LocalEndpoint, Server, ServerOptions};

pub struct ServiceCluster<A: Application, F: Fn() -> A> {
    pub n: usize,
    pub router: Arc<Router>,
    pub persisters: Vec<Arc<MemoryPersister>>,
    pub servers: Vec<Option<Arc<Server<A>>>>,
    pub endpoints: Vec<Arc<LocalEndpoint<A>>>,
    make_app: F,
    opts: ServerOptions,
}

fn test_options(max_raft_state: Option<usize>) -> ServerOptions {
    ServerOptions {
        raft: RaftOptions {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(40),
            tick_interval: Duration::from_millis(10),
        },
        max_raft_state,
        connection_threads: 2,
    }
}

impl<A: Application, F: Fn() -> A> ServiceCluster<A, F> {
    pub fn start(n: usize, max_raft_state: Option<usize>, make_app: F) -> Self {
        let mut cluster = ServiceCluster {
            n,
            router: Router::new(n),
            persisters: (0..n).map(|_| Arc::new(MemoryPersister::new())).collect(),
            servers: (0..n).map(|_| None).collect(),
            endpoints: (0..n).map(|_| Arc::new(LocalEndpoint::new(None))).collect(),
            make_app,
            opts: test_options(max_raft_state),
        };
        for i in 0..n {
            cluster.boot(i);
        }
        cluster
    }

    fn boot(&mut self, i: usize) {
        let transport = Arc::new(RouterTransport::new(&self.router, i));
        let server = Server::start(
            i,
            self.n,
            transport,
            self.persisters[i].clone(),
            (self.make_app)(),
            self.opts.clone(),
        )
        .expect("server boots");
        self.router
            .register(i, Arc::new(server.raft().clone()) as Arc<dyn RaftService>);
        self.endpoints[i].set(Some(Arc::clone(&server)));
        self.servers[i] = Some(server);
    }

    pub fn server(&self, i: usize) -> &Arc<Server<A>> {
        self.servers[i].as_ref().expect("server is up")
    }

    pub fn clerk_endpoints(&self) -> Vec<Arc<dyn Endpoint<A>>> {
        self.endpoints
            .iter()
            .map(|endpoint| Arc::clone(endpoint) as Arc<dyn Endpoint<A>>)
            .collect()
    }

    /// Index of the server currently claiming leadership, waiting for one
    /// to emerge.
    pub fn leader(&self) -> usize {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let leaders: Vec<usize> = (0..self.n)
                .filter(|&i| {
                    self.servers[i]
                        .as_ref()
                        .map(|server| server.raft().state().1)
                        .unwrap_or(false)
                })
                .collect();
            if leaders.len() == 1 {
                return leaders[0];
            }
            assert!(
                std::time::Instant::now() < deadline,
                "no single leader emerged"
            );
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn crash(&mut self, i: usize) {
        if let Some(server) = self.servers[i].take() {
            server.kill();
        }
        self.router.deregister(i);
        self.endpoints[i].set(None);
    }

    pub fn restart(&mut self, i: usize) {
        self.crash(i);
        self.boot(i);
    }

    /// Cuts a server off from its peers and from clients, as a partition
    /// that swallows the whole machine would.
    pub fn isolate(&self, i: usize) {
        self.router.set_connected(i, false);
        self.endpoints[i].set(None);
    }

    pub fn rejoin(&self, i: usize) {
        self.router.set_connected(i, true);
        self.endpoints[i].set(self.servers[i].clone());
    }
}
