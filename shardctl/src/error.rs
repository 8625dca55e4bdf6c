use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error(transparent)]
    Persist(#[from] raft::PersistError),
    #[error(transparent)]
    Transport(#[from] raft::TransportError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
