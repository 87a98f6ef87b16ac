use thiserror::Error;

use crate::decoder::DecodeError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Source Connection Error - {0}")]
    SourceConnection(String),

    #[error("Source Error - {0}")]
    Source(String),

    #[error("Sink Write Error - {0}")]
    SinkWrite(String),

    #[error("Checkpoint Error - {0}")]
    Checkpoint(String),

    #[error("Serialization Error - {0}")]
    Serialization(String),

    #[error("metrics Error - {0}")]
    Metrics(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),
}

impl Error {
    /// Whether the operation that produced this error may succeed when run again. Bus and store
    /// failures are transient; bad input and bad configuration are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SourceConnection(_) | Error::Source(_) | Error::SinkWrite(_) | Error::Checkpoint(_)
        )
    }
}

impl From<smartcity_kafka::Error> for Error {
    fn from(value: smartcity_kafka::Error) -> Self {
        match value {
            smartcity_kafka::Error::Connection { .. } => Error::SourceConnection(value.to_string()),
            smartcity_kafka::Error::Kafka(_) | smartcity_kafka::Error::Other(_) => {
                Error::Source(value.to_string())
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Serialization(value.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(value: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ActorPatternRecv(value.to_string())
    }
}
