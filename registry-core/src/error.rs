use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("This node is not the leader")]
    NotLeader,

    #[error("Propose did not commit within the timeout")]
    ProposeTimeout,

    #[error("Malformed command: {0}")]
    Decode(String),

    #[error("Snapshot persist failed: {0}")]
    SnapshotPersist(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
