//! shardctl: a fault-tolerant shard-configuration service.
//!
//! A fixed set of servers replicates client operations through the `raft`
//! crate's log and applies them, exactly once each, to a pluggable
//! application state machine. Two applications ship here: the shard
//! controller ([`controller::ShardController`]) mapping shards to replica
//! groups, and a key-value store ([`database::Database`]). Clients go
//! through a [`clerk::Clerk`], which retries across servers and relies on
//! the server-side duplicate suppression to make retries harmless.

pub mod application;
pub mod clerk;
pub mod controller;
pub mod database;
pub mod error;
pub mod itable;
pub mod protocol;
pub mod replies;
pub mod server;

pub use application::Application;
pub use clerk::{Clerk, CtrlClerk, Endpoint, KvClerk, LocalEndpoint, TcpEndpoint};
pub use controller::{CtrlCommand, CtrlReply, ShardConfig, ShardController, SHARD_COUNT};
pub use database::{Database, KvCommand, KvReply};
pub use error::ServiceError;
pub use itable::ITable;
pub use protocol::{CommandReply, CommandRequest, Identifier, Op, Status};
pub use replies::OpReplies;
pub use server::{Server, ServerOptions};
