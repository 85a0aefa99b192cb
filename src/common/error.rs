use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0} queue full")]
    QueueFull(&'static str),

    #[error("network stack error: {0}")]
    Stack(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
