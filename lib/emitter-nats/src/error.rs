use emitter_core::CoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NatsError>;

#[derive(Error, Debug)]
pub enum NatsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid subject: {0}")]
    InvalidSubject(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Connection timed out: {0}")]
    Timeout(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

impl From<NatsError> for CoreError {
    fn from(err: NatsError) -> Self {
        match err {
            NatsError::ConnectionClosed => CoreError::BusClosed,
            other => CoreError::Bus(other.to_string()),
        }
    }
}
