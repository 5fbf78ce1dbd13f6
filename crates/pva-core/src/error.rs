use thiserror::Error;

use crate::status::Status;

/// Errors that can occur in pva.
#[derive(Error, Debug)]
pub enum PvaError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("request error: {0}")]
    Request(String),

    /// An operation finished with a non-OK protocol status. The status is
    /// reported to the peer as-is instead of being wrapped as FATAL.
    #[error("{0}")]
    Status(Status),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::ser::Error<std::io::Error>> for PvaError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        PvaError::Codec(e.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for PvaError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        PvaError::Codec(e.to_string())
    }
}

/// Convenience result type for pva operations.
pub type PvaResult<T> = Result<T, PvaError>;
