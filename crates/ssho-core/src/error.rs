use thiserror::Error;

/// Errors produced by the ssho session and transport layers.
#[derive(Debug, Error)]
pub enum SshoError {
    /// The shell process could not be started.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// The connection could not be established or broke mid-stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// A viewer's outbound channel rejected a message.
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for SshoError {
    fn from(e: serde_json::Error) -> Self {
        SshoError::InvalidMessage(e.to_string())
    }
}

pub type SshoResult<T> = Result<T, SshoError>;
