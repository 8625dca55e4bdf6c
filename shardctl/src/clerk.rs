//! Clients. A clerk owns a unique identity, numbers its requests, and
//! retries the same `(clerk, seq)` across servers until some leader gives
//! a definitive answer; the server side deduplicates, so retrying is always
//! safe. The last server that answered is tried first next time.

use std::net::TcpStream;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use log::debug;
use uuid::Uuid;

use raft::tcp::{read_frame, write_frame};
use raft::TransportError;

use crate::application::Application;
use crate::controller::{CtrlCommand, ShardConfig, ShardController};
use crate::database::{Database, KvCommand};
use crate::protocol::{CommandReply, CommandRequest, Identifier, Status};
use crate::server::Server;

/// One server, as seen from a clerk.
pub trait Endpoint<A: Application>: Send + Sync {
    fn call(
        &self,
        request: &CommandRequest<A::Command>,
    ) -> Result<CommandReply<A::Reply>, TransportError>;
}

/// In-process endpoint. The slot may be emptied and refilled by a harness
/// simulating crashes and restarts.
pub struct LocalEndpoint<A: Application> {
    server: RwLock<Option<Arc<Server<A>>>>,
}

impl<A: Application> LocalEndpoint<A> {
    pub fn new(server: Option<Arc<Server<A>>>) -> Self {
        LocalEndpoint {
            server: RwLock::new(server),
        }
    }

    pub fn set(&self, server: Option<Arc<Server<A>>>) {
        *self.server.write().unwrap_or_else(|e| e.into_inner()) = server;
    }
}

impl<A: Application> Endpoint<A> for LocalEndpoint<A> {
    fn call(
        &self,
        request: &CommandRequest<A::Command>,
    ) -> Result<CommandReply<A::Reply>, TransportError> {
        let server = self
            .server
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match server {
            Some(server) => Ok(server.handle(request.clone())),
            None => Err(TransportError::Unreachable(0)),
        }
    }
}

/// Endpoint over the TCP front end.
pub struct TcpEndpoint {
    addr: String,
    timeout: Duration,
}

impl TcpEndpoint {
    pub fn new(addr: impl Into<String>) -> Self {
        TcpEndpoint {
            addr: addr.into(),
            timeout: Duration::from_secs(5),
        }
    }
}

impl<A: Application> Endpoint<A> for TcpEndpoint {
    fn call(
        &self,
        request: &CommandRequest<A::Command>,
    ) -> Result<CommandReply<A::Reply>, TransportError> {
        let mut stream = TcpStream::connect(&self.addr)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        write_frame(&mut stream, request)?;
        read_frame(&mut stream)
    }
}

pub struct Clerk<A: Application> {
    endpoints: Vec<Arc<dyn Endpoint<A>>>,
    id: Uuid,
    seq: u64,
    /// Index of the last server that gave a definitive reply.
    preferred: usize,
    retry_pause: Duration,
}

impl<A: Application> Clerk<A> {
    pub fn new(endpoints: Vec<Arc<dyn Endpoint<A>>>) -> Self {
        assert!(!endpoints.is_empty());
        Clerk {
            endpoints,
            id: Uuid::new_v4(),
            seq: 0,
            preferred: 0,
            retry_pause: Duration::from_millis(10),
        }
    }

    /// Runs one operation to completion, retrying across servers until a
    /// leader commits it. Never gives up: transport failures and
    /// WrongLeader both mean "try the next server".
    pub fn call(&mut self, cmd: A::Command) -> A::Reply {
        let id = Identifier {
            clerk: self.id,
            seq: self.seq,
        };
        self.seq += 1;
        let request = CommandRequest { id, cmd };
        let mut server = self.preferred;
        loop {
            match self.endpoints[server].call(&request) {
                Ok(CommandReply {
                    status,
                    reply: Some(reply),
                }) if status != Status::WrongLeader => {
                    self.preferred = server;
                    return reply;
                }
                Ok(_) => debug!("clerk {}: s{} is not the leader", self.id, server),
                Err(e) => debug!("clerk {}: s{} unreachable: {}", self.id, server, e),
            }
            server = (server + 1) % self.endpoints.len();
            if server == self.preferred {
                thread::sleep(self.retry_pause);
            }
        }
    }
}

/// Typed clerk for the shard controller.
pub struct CtrlClerk {
    clerk: Clerk<ShardController>,
}

impl CtrlClerk {
    pub fn new(endpoints: Vec<Arc<dyn Endpoint<ShardController>>>) -> Self {
        CtrlClerk {
            clerk: Clerk::new(endpoints),
        }
    }

    pub fn join(&mut self, groups: std::collections::HashMap<u64, Vec<String>>) {
        self.clerk.call(CtrlCommand::Join { groups });
    }

    pub fn leave(&mut self, gids: Vec<u64>) {
        self.clerk.call(CtrlCommand::Leave { gids });
    }

    pub fn move_shard(&mut self, shard: usize, gid: u64) {
        self.clerk.call(CtrlCommand::Move { shard, gid });
    }

    pub fn query(&mut self, num: i64) -> ShardConfig {
        self.clerk
            .call(CtrlCommand::Query { num })
            .config
            .unwrap_or_default()
    }
}

/// Typed clerk for the key-value store.
pub struct KvClerk {
    clerk: Clerk<Database>,
}

impl KvClerk {
    pub fn new(endpoints: Vec<Arc<dyn Endpoint<Database>>>) -> Self {
        KvClerk {
            clerk: Clerk::new(endpoints),
        }
    }

    pub fn get(&mut self, key: impl Into<String>) -> Option<String> {
        let reply = self.clerk.call(KvCommand::Get { key: key.into() });
        match reply.status {
            Status::NoKey => None,
            _ => Some(reply.value),
        }
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.clerk.call(KvCommand::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.clerk.call(KvCommand::Append {
            key: key.into(),
            value: value.into(),
        });
    }
}
