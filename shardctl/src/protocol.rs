//! Client-facing wire types.
//!
//! A client operation is identified by `(clerk, seq)`: the clerk issues
//! strictly increasing sequence numbers and retries the same identifier
//! until it gets a definitive reply, which is what makes exactly-once
//! execution possible on the server side.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    NoKey,
    /// This peer is not the leader, or lost leadership before the command
    /// committed; try another peer.
    WrongLeader,
}

/// Logical identity of one client request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub clerk: Uuid,
    pub seq: u64,
}

/// What actually travels through the replicated log. `server` names the
/// peer that proxied the submission so the applier can tell whether a
/// waiter may exist locally; waiter matching compares the whole op.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Op<C> {
    pub server: usize,
    pub id: Identifier,
    pub cmd: C,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandRequest<C> {
    pub id: Identifier,
    pub cmd: C,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandReply<R> {
    pub status: Status,
    pub reply: Option<R>,
}

impl<R> CommandReply<R> {
    pub fn wrong_leader() -> Self {
        CommandReply {
            status: Status::WrongLeader,
            reply: None,
        }
    }
}
