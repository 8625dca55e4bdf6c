//! Durable storage for the two blobs a peer must carry across crashes:
//! the raft state (term, vote, log tail, snapshot metadata) and the
//! service snapshot. The pair is always replaced together.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::PersistError;
use crate::log::Entry;

/// The state blob's wire form. Must round-trip losslessly.
#[derive(Serialize, Deserialize)]
pub struct PersistedState {
    pub current_term: u64,
    pub voted_for: Option<usize>,
    pub snapshot_index: u64,
    pub snapshot_term: u64,
    pub entries: Vec<Entry>,
}

impl PersistedState {
    pub fn encode(&self) -> Result<Bytes, PersistError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self, PersistError> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Scoped durable storage for one peer.
pub trait Persister: Send + Sync {
    /// Atomically replaces both blobs.
    fn save(&self, state: Bytes, snapshot: Bytes) -> Result<(), PersistError>;

    fn read_state(&self) -> Result<Bytes, PersistError>;

    fn read_snapshot(&self) -> Result<Bytes, PersistError>;

    /// Size of the state blob, used by the service to decide when to compact.
    fn state_size(&self) -> usize;
}

/// Keeps the blobs in memory. Survives a simulated crash as long as the
/// harness keeps the persister and hands it to the restarted peer.
#[derive(Default)]
pub struct MemoryPersister {
    blobs: Mutex<(Bytes, Bytes)>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        MemoryPersister::default()
    }
}

impl Persister for MemoryPersister {
    fn save(&self, state: Bytes, snapshot: Bytes) -> Result<(), PersistError> {
        let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        *blobs = (state, snapshot);
        Ok(())
    }

    fn read_state(&self) -> Result<Bytes, PersistError> {
        Ok(self.blobs.lock().unwrap_or_else(|e| e.into_inner()).0.clone())
    }

    fn read_snapshot(&self) -> Result<Bytes, PersistError> {
        Ok(self.blobs.lock().unwrap_or_else(|e| e.into_inner()).1.clone())
    }

    fn state_size(&self) -> usize {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner()).0.len()
    }
}

/// File-backed persister: write to a temp file, fsync, rename. The state
/// file is renamed last so a torn save leaves the previous pair readable.
pub struct FilePersister {
    dir: PathBuf,
    size: Mutex<usize>,
}

impl FilePersister {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let size = fs::metadata(dir.join("state.bin")).map(|m| m.len() as usize).unwrap_or(0);
        Ok(FilePersister {
            dir,
            size: Mutex::new(size),
        })
    }

    fn write_atomic(&self, name: &str, data: &[u8]) -> Result<(), PersistError> {
        let tmp = self.dir.join(format!("{}.tmp", name));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, self.dir.join(name))?;
        Ok(())
    }

    fn read_file(&self, name: &str) -> Result<Bytes, PersistError> {
        match fs::read(self.dir.join(name)) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Bytes::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Persister for FilePersister {
    fn save(&self, state: Bytes, snapshot: Bytes) -> Result<(), PersistError> {
        self.write_atomic("snapshot.bin", &snapshot)?;
        self.write_atomic("state.bin", &state)?;
        *self.size.lock().unwrap_or_else(|e| e.into_inner()) = state.len();
        Ok(())
    }

    fn read_state(&self) -> Result<Bytes, PersistError> {
        self.read_file("state.bin")
    }

    fn read_snapshot(&self) -> Result<Bytes, PersistError> {
        self.read_file("snapshot.bin")
    }

    fn state_size(&self) -> usize {
        *self.size.lock().unwrap_or_else(|e| e.into_inner())
    }
}
