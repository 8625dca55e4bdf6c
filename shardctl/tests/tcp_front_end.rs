//! End-to-end check of the socket front end: a single-node group behind a
//! TCP listener, driven by a clerk over real connections.

use std::net::TcpListener;
use std::sync::Arc;

use serial_test::serial;

use raft::{MemoryPersister, Router, RouterTransport};
use shardctl::{Database, Endpoint, KvClerk, Server, ServerOptions, TcpEndpoint};

#[test]
#[serial]
fn clerk_talks_to_the_server_over_tcp() {
    let router = Router::new(1);
    let server = Server::start(
        0,
        1,
        Arc::new(RouterTransport::new(&router, 0)),
        Arc::new(MemoryPersister::new()),
        Database::new(),
        ServerOptions::default(),
    )
    .unwrap();
    router.register(0, Arc::new(server.raft().clone()));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    Server::serve(Arc::clone(&server), listener).unwrap();

    let endpoints: Vec<Arc<dyn Endpoint<Database>>> = vec![Arc::new(TcpEndpoint::new(addr))];
    let mut clerk = KvClerk::new(endpoints);
    clerk.put("wire", "works");
    clerk.append("wire", "-fine");
    assert_eq!(clerk.get("wire"), Some("works-fine".to_string()));
    assert_eq!(clerk.get("missing"), None);

    server.kill();
}
