//! Waiter registry: the rendezvous between an RPC handler blocked on a log
//! index and the applier that eventually executes whatever committed there.
//!
//! Slots are created lazily by the first waiter, or by the applier itself
//! when the wake flag says a local submitter may arrive (the flag is false
//! for entries replayed from disk at startup, so no ghost slot outlives a
//! restart). Closing a slot's channel is the broadcast that releases every
//! waiter, mirroring the registry-wide done channel that releases everyone
//! on shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{select, unbounded, Receiver, Sender};

use crate::protocol::Op;

enum Never {}

/// One-shot broadcast: dropping the sender releases every receiver clone,
/// current and future.
struct Closer {
    guard: Mutex<Option<Sender<Never>>>,
    closed: Receiver<Never>,
}

impl Closer {
    fn new() -> Self {
        let (guard, closed) = unbounded();
        Closer {
            guard: Mutex::new(Some(guard)),
            closed,
        }
    }

    fn close(&self) {
        self.guard.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn handle(&self) -> Receiver<Never> {
        self.closed.clone()
    }
}

struct Slot<C, R> {
    outcome: Mutex<Option<(Op<C>, R)>>,
    closer: Closer,
}

impl<C, R> Slot<C, R> {
    fn new() -> Self {
        Slot {
            outcome: Mutex::new(None),
            closer: Closer::new(),
        }
    }
}

pub struct OpReplies<C, R> {
    table: Mutex<HashMap<u64, Arc<Slot<C, R>>>>,
    done: Closer,
}

impl<C, R> OpReplies<C, R>
where
    C: Clone + PartialEq,
    R: Clone,
{
    pub fn new() -> Self {
        OpReplies {
            table: Mutex::new(HashMap::new()),
            done: Closer::new(),
        }
    }

    fn slot(&self, index: u64) -> Arc<Slot<C, R>> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(table.entry(index).or_insert_with(|| Arc::new(Slot::new())))
    }

    /// Blocks until the command at `index` has applied, or the registry is
    /// destroyed. Returns the applied op and reply, or `None` on shutdown.
    pub fn wait(&self, index: u64) -> Option<(Op<C>, R)> {
        let slot = self.slot(index);
        let applied = slot.closer.handle();
        let destroyed = self.done.handle();
        select! {
            recv(applied) -> _ => {}
            recv(destroyed) -> _ => {}
        }
        let outcome = slot.outcome.lock().unwrap_or_else(|e| e.into_inner());
        outcome.clone()
    }

    /// [`wait`](Self::wait), then accept the reply only when the applied op
    /// equals the submitted one; anything else means another leader claimed
    /// the slot and the caller must report WrongLeader.
    pub fn wait_and_match(&self, index: u64, submitted: &Op<C>) -> Option<R> {
        match self.wait(index) {
            Some((op, reply)) if op == *submitted => {
                self.delete(index);
                Some(reply)
            }
            _ => None,
        }
    }

    /// Publishes the applied op and reply at `index` and releases its
    /// waiters. With no waiter present this is a no-op unless `wake` is
    /// set, in which case a pre-closed slot is left so a submitter that has
    /// not yet blocked returns immediately.
    pub fn set_and_broadcast(&self, index: u64, op: Op<C>, reply: R, wake: bool) {
        let slot = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            match table.get(&index) {
                Some(slot) => Arc::clone(slot),
                None => {
                    if !wake {
                        return;
                    }
                    let slot = Arc::new(Slot::new());
                    table.insert(index, Arc::clone(&slot));
                    slot
                }
            }
        };
        *slot.outcome.lock().unwrap_or_else(|e| e.into_inner()) = Some((op, reply));
        slot.closer.close();
    }

    pub fn delete(&self, index: u64) {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&index);
    }

    /// Unblocks every current and future waiter; used at shutdown.
    pub fn destroy(&self) {
        self.done.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Identifier;
    use std::thread;
    use std::time::Duration;
    use uuid::Uuid;

    fn op(seq: u64, cmd: u8) -> Op<u8> {
        Op {
            server: 0,
            id: Identifier {
                clerk: Uuid::nil(),
                seq,
            },
            cmd,
        }
    }

    #[test]
    fn waiter_receives_matching_reply() {
        let replies = Arc::new(OpReplies::<u8, String>::new());
        let waiter = Arc::clone(&replies);
        let handle = thread::spawn(move || waiter.wait_and_match(3, &op(0, 7)));
        thread::sleep(Duration::from_millis(20));
        replies.set_and_broadcast(3, op(0, 7), "done".to_string(), false);
        assert_eq!(handle.join().unwrap(), Some("done".to_string()));
    }

    #[test]
    fn mismatched_op_reports_displacement() {
        let replies = Arc::new(OpReplies::<u8, String>::new());
        let waiter = Arc::clone(&replies);
        let handle = thread::spawn(move || waiter.wait_and_match(3, &op(0, 7)));
        thread::sleep(Duration::from_millis(20));
        // a different leader's command landed at our index
        replies.set_and_broadcast(3, op(9, 9), "other".to_string(), false);
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn wake_flag_pre_closes_the_slot() {
        let replies = OpReplies::<u8, String>::new();
        replies.set_and_broadcast(5, op(0, 1), "early".to_string(), true);
        // the submitter arrives after the apply and must not block
        assert_eq!(replies.wait_and_match(5, &op(0, 1)), Some("early".to_string()));
    }

    #[test]
    fn replayed_entries_leave_no_ghost_slot() {
        let replies = OpReplies::<u8, String>::new();
        replies.set_and_broadcast(5, op(0, 1), "replayed".to_string(), false);
        assert!(replies.table.lock().unwrap().is_empty());
    }

    #[test]
    fn destroy_releases_blocked_waiters() {
        let replies = Arc::new(OpReplies::<u8, String>::new());
        let waiter = Arc::clone(&replies);
        let handle = thread::spawn(move || waiter.wait_and_match(1, &op(0, 1)));
        thread::sleep(Duration::from_millis(20));
        replies.destroy();
        assert_eq!(handle.join().unwrap(), None);
        // waiters arriving after destruction return at once
        assert_eq!(replies.wait_and_match(2, &op(0, 2)), None);
    }
}
