use thiserror::Error;

/// Errors that can occur in the tunnel core
#[derive(Error, Debug)]
pub enum DazeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Resolve error: {0}")]
    Resolve(String),

    #[error("blocked host: {0}")]
    Blocked(String),

    #[error("handshake timestamp outside freshness window")]
    StaleHandshake,

    #[error("destination name too long: {0} bytes")]
    OversizedDestination(usize),

    #[error("mux protocol violation: {0}")]
    MuxProtocol(&'static str),

    #[error("stream id pool exhausted")]
    PoolExhausted,

    #[error("closed pipe")]
    ClosedPipe,
}

impl From<DazeError> for std::io::Error {
    fn from(e: DazeError) -> Self {
        match e {
            DazeError::Io(e) => e,
            DazeError::ClosedPipe => {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed pipe")
            }
            e @ DazeError::MuxProtocol(_) => {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
            }
            other => std::io::Error::other(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DazeError>;
