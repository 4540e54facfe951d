use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Bus connection closed")]
    BusClosed,

    #[error("Emit error: {0}")]
    Emit(String),

    #[error("Event source error: {0}")]
    EventSource(String),

    #[error("Invalid router greeting: {0}")]
    InvalidGreeting(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}
