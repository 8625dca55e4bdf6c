//! Role/term/vote state with per-incarnation invalidation tokens.
//!
//! Every role transition or term change replaces the peer's image and closes
//! the previous incarnation's token. Background work (an in-flight RPC, a
//! vote count, a replication attempt) captures the image once, then checks
//! the token instead of re-deriving "am I still leader/candidate?" from
//! scratch; a rotated token also defeats ABA hazards when the term moves
//! forward and back.

use std::sync::RwLock;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

enum Never {}

/// A handle onto one incarnation of the image. The token outlives the
/// incarnation: once the image rotates, every clone observes staleness.
#[derive(Clone)]
pub struct Token {
    alive: Receiver<Never>,
}

impl Token {
    pub fn is_stale(&self) -> bool {
        matches!(self.alive.try_recv(), Err(TryRecvError::Disconnected))
    }
}

/// Immutable capture of the image at one instant.
#[derive(Clone)]
pub struct Image {
    pub role: Role,
    pub current_term: u64,
    pub voted_for: Option<usize>,
    pub token: Token,
}

/// Mutable view handed to [`ImageCell::update`] closures.
pub struct ImageMut {
    pub role: Role,
    pub current_term: u64,
    pub voted_for: Option<usize>,
    rotate: bool,
}

impl ImageMut {
    /// Closes the current incarnation's token, invalidating all in-flight
    /// work captured against it.
    pub fn invalidate(&mut self) {
        self.rotate = true;
    }
}

struct Live {
    role: Role,
    current_term: u64,
    voted_for: Option<usize>,
    // dropping the sender is the broadcast that closes the token
    guard: Sender<Never>,
    alive: Receiver<Never>,
}

/// The live image behind its own read/write lock, separate from the log
/// lock. Update closures must not touch the log.
pub struct ImageCell {
    inner: RwLock<Live>,
}

impl ImageCell {
    pub fn new(current_term: u64, voted_for: Option<usize>) -> Self {
        let (guard, alive) = unbounded();
        ImageCell {
            inner: RwLock::new(Live {
                role: Role::Follower,
                current_term,
                voted_for,
                guard,
                alive,
            }),
        }
    }

    pub fn capture(&self) -> Image {
        let live = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Image {
            role: live.role,
            current_term: live.current_term,
            voted_for: live.voted_for,
            token: Token {
                alive: live.alive.clone(),
            },
        }
    }

    /// Runs `f` under the write lock if `observed` still names the live
    /// incarnation. Returns the post-update capture, or `None` when the
    /// observed incarnation was already rotated out, in which case `f` never
    /// runs and the caller's work is stale.
    pub fn update(&self, observed: &Token, f: impl FnOnce(&mut ImageMut)) -> Option<Image> {
        let mut live = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if observed.is_stale() {
            return None;
        }
        let mut view = ImageMut {
            role: live.role,
            current_term: live.current_term,
            voted_for: live.voted_for,
            rotate: false,
        };
        f(&mut view);
        live.role = view.role;
        live.current_term = view.current_term;
        live.voted_for = view.voted_for;
        if view.rotate {
            let (guard, alive) = unbounded();
            live.guard = guard;
            live.alive = alive;
        }
        Some(Image {
            role: live.role,
            current_term: live.current_term,
            voted_for: live.voted_for,
            token: Token {
                alive: live.alive.clone(),
            },
        })
    }
}
