//! Leader-based replicated log.
//!
//! A fixed group of peers elects a leader, replicates commands in order,
//! commits prefixes once a majority holds them, and hands committed entries
//! to the embedding service over an apply channel. The log compacts behind
//! service-provided snapshots, and every peer recovers its term, vote, log
//! tail and snapshot from its [`persist::Persister`] after a crash.
//!
//! The embedding service drives a peer through [`Raft::start`],
//! [`Raft::snapshot`], [`Raft::cond_install_snapshot`] and [`Raft::kill`],
//! and consumes [`ApplyMsg`]s from the channel it supplied at start-up.

mod core;
mod error;
mod image;
mod log;
mod message;
mod persist;
pub mod tcp;
mod transport;

pub use crate::core::{ApplyMsg, Raft, RaftOptions};
pub use crate::error::{PersistError, TransportError};
pub use crate::image::{Image, ImageCell, Role, Token};
pub use crate::log::{Entry, EntryKind, RwLog};
pub use crate::message::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply, RaftReply,
    RaftRequest, RequestVoteArgs, RequestVoteReply,
};
pub use crate::persist::{FilePersister, MemoryPersister, PersistedState, Persister};
pub use crate::transport::{RaftService, Router, RouterTransport, Transport};
