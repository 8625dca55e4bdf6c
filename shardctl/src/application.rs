//! The seam between consensus and service logic.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ServiceError;

/// A deterministic state machine driven by the applier thread, and only by
/// it, so implementations need no interior locking. `apply` must be free of
/// side effects beyond the in-memory state so that every replica converges.
pub trait Application: Send + 'static {
    type Command: Clone + PartialEq + Send + Serialize + DeserializeOwned + 'static;
    type Reply: Clone + Send + Serialize + DeserializeOwned + 'static;

    fn apply(&mut self, cmd: Self::Command) -> Self::Reply;

    /// Serializes the full application state for log compaction.
    fn snapshot(&self) -> Result<Vec<u8>, ServiceError>;

    /// Replaces the application state from a snapshot blob.
    fn restore(&mut self, data: &[u8]) -> Result<(), ServiceError>;
}
