use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(usize),
    #[error("rpc timed out")]
    Timeout,
    #[error("rpc codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("state codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
