use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session table is full ({0} sessions)")]
    ResourceExhausted(usize),

    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Unknown session: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
