//! RPC types exchanged between peers.
//!
//! Every reply carries `valid`: when false, the responder's role/term image
//! changed while the request was being handled and the caller must discard
//! the reply as stale.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::log::Entry;

/// Envelope for a peer-to-peer request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RaftRequest {
    AppendEntries(AppendEntriesArgs),
    RequestVote(RequestVoteArgs),
    InstallSnapshot(InstallSnapshotArgs),
}

/// Envelope for a peer-to-peer reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RaftReply {
    AppendEntries(AppendEntriesReply),
    RequestVote(RequestVoteReply),
    InstallSnapshot(InstallSnapshotReply),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader: usize,
    pub leader_commit: u64,
    /// Absolute index of the entry immediately preceding `entries`.
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<Entry>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub valid: bool,
    pub term: u64,
    pub success: bool,
    /// First index the leader should retry from when `success` is false.
    pub conflict_index: u64,
    /// Term of the conflicting entry, if the follower had one at
    /// `prev_log_index`.
    pub conflict_term: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate: usize,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub valid: bool,
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    pub term: u64,
    pub leader: usize,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Bytes,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub valid: bool,
    pub term: u64,
}
