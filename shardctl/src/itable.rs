//! Duplicate-suppression table: per clerk, the next sequence number it may
//! execute and the reply to its last executed command. A command whose seq
//! is below the recorded next has already run somewhere in the cluster's
//! history; its cached reply is returned instead of re-executing.
//!
//! The table travels inside the service snapshot so suppression survives
//! compaction and crashes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::Identifier;

#[derive(Clone, Serialize, Deserialize)]
pub struct ITable<R> {
    next_seq: HashMap<Uuid, u64>,
    last_reply: HashMap<Uuid, R>,
}

impl<R: Clone> ITable<R> {
    pub fn new() -> Self {
        ITable {
            next_seq: HashMap::new(),
            last_reply: HashMap::new(),
        }
    }

    /// True when the identified command was already executed.
    pub fn executed(&self, id: &Identifier) -> bool {
        id.seq < self.next_seq.get(&id.clerk).copied().unwrap_or(0)
    }

    /// The memoized reply to the clerk's last executed command.
    pub fn cached(&self, clerk: Uuid) -> Option<R> {
        self.last_reply.get(&clerk).cloned()
    }

    /// Marks `id` executed and memoizes its reply.
    pub fn record(&mut self, id: Identifier, reply: R) {
        self.next_seq.insert(id.clerk, id.seq + 1);
        self.last_reply.insert(id.clerk, reply);
    }
}

impl<R: Clone> Default for ITable<R> {
    fn default() -> Self {
        ITable::new()
    }
}
