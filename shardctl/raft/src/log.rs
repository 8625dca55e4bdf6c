//! The in-memory replicated log.
//!
//! Entries use absolute, monotonically increasing indices. The log may be
//! compacted: everything at or below `snapshot_index` is folded into an
//! opaque snapshot blob, and element 0 of the live tail is always a sentinel
//! entry mirroring the snapshot metadata, so consistency checks at the
//! boundary (`prev_log_index == snapshot_index`) need no special case. For
//! i > 0, `entries[i].index == snapshot_index + i`.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Sentinel occupying position 0 of a log that has never been compacted.
    Placeholder,
    /// A client command carried to the state machine.
    Command,
    /// Sentinel standing in for the compacted prefix.
    Snapshot,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    pub data: Bytes,
}

impl Entry {
    pub fn command(index: u64, term: u64, data: Bytes) -> Self {
        Entry {
            index,
            term,
            kind: EntryKind::Command,
            data,
        }
    }

    fn placeholder() -> Self {
        Entry {
            index: 0,
            term: 0,
            kind: EntryKind::Placeholder,
            data: Bytes::new(),
        }
    }

    fn sentinel(index: u64, term: u64) -> Self {
        Entry {
            index,
            term,
            kind: EntryKind::Snapshot,
            data: Bytes::new(),
        }
    }
}

/// Log contents guarded by [`RwLog`]'s lock.
pub struct LogInner {
    entries: Vec<Entry>,
    snapshot_index: u64,
    snapshot_term: u64,
    snapshot: Bytes,
}

impl LogInner {
    fn fresh() -> Self {
        LogInner {
            entries: vec![Entry::placeholder()],
            snapshot_index: 0,
            snapshot_term: 0,
            snapshot: Bytes::new(),
        }
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    pub fn snapshot(&self) -> Bytes {
        self.snapshot.clone()
    }

    pub fn last_index(&self) -> u64 {
        self.snapshot_index + (self.entries.len() as u64 - 1)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn last_info(&self) -> (u64, u64) {
        (self.last_index(), self.last_term())
    }

    /// Position of an absolute index in the live tail, sentinel included.
    pub fn pos(&self, index: u64) -> Option<usize> {
        if index < self.snapshot_index || index > self.last_index() {
            return None;
        }
        Some((index - self.snapshot_index) as usize)
    }

    pub fn entry(&self, index: u64) -> Option<&Entry> {
        self.pos(index).map(|p| &self.entries[p])
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.entry(index).map(|e| e.term)
    }

    /// Clones the tail starting at absolute index `from`.
    pub fn tail(&self, from: u64) -> Vec<Entry> {
        match self.pos(from) {
            Some(p) => self.entries[p..].to_vec(),
            None => Vec::new(),
        }
    }

    pub fn push(&mut self, entry: Entry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    /// Drops every entry at or after the absolute index `from`. The sentinel
    /// is never dropped.
    pub fn truncate(&mut self, from: u64) {
        if let Some(p) = self.pos(from) {
            if p > 0 {
                self.entries.truncate(p);
            }
        }
    }

    /// Folds everything up to `index` into the snapshot blob and rewrites
    /// position 0 as the snapshot sentinel. Returns false when `index` is
    /// outside the live tail (already compacted, or not yet appended).
    pub fn compact(&mut self, index: u64, data: Bytes) -> bool {
        let p = match self.pos(index) {
            Some(p) if p > 0 => p,
            _ => return false,
        };
        let term = self.entries[p].term;
        self.entries.drain(..p);
        self.entries[0] = Entry::sentinel(index, term);
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.snapshot = data;
        true
    }

    /// Replaces the whole log with a single sentinel for a snapshot received
    /// from the leader.
    pub fn install(&mut self, index: u64, term: u64, data: Bytes) {
        self.entries = vec![Entry::sentinel(index, term)];
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.snapshot = data;
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub(crate) fn to_persisted(&self) -> (Vec<Entry>, u64, u64) {
        (self.entries.clone(), self.snapshot_index, self.snapshot_term)
    }

    pub(crate) fn from_persisted(
        entries: Vec<Entry>,
        snapshot_index: u64,
        snapshot_term: u64,
        snapshot: Bytes,
    ) -> Self {
        LogInner {
            entries,
            snapshot_index,
            snapshot_term,
            snapshot,
        }
    }
}

/// The ordered log behind a read/write lock. Readers run consistency
/// checks, writers truncate, append and compact.
pub struct RwLog {
    inner: RwLock<LogInner>,
}

impl RwLog {
    pub fn fresh() -> Self {
        RwLog {
            inner: RwLock::new(LogInner::fresh()),
        }
    }

    pub(crate) fn restore(inner: LogInner) -> Self {
        RwLog {
            inner: RwLock::new(inner),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, LogInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, LogInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
