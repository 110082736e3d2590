use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("transport address pool exhausted")]
    PoolExhausted,

    #[error("entry already exists: {0}")]
    Exists(String),

    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("control protocol error: {0}")]
    Control(String),
}

pub type Result<T> = std::result::Result<T, Error>;
