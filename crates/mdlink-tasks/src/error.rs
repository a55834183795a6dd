use mdlink_crypto::CryptoError;
use mdlink_protocol::ProtocolError;
use thiserror::Error;

use crate::dispatch::DispatchError;

#[derive(Error, Debug)]
pub enum TaskError {
    /// The task was dropped before it could complete, e.g. a volatile task
    /// scheduled while disconnected.
    #[error("task aborted")]
    Aborted,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server closed the connection: {message}")]
    ServerClose { message: String, can_reconnect: bool },

    #[error(transparent)]
    Frame(#[from] ProtocolError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("storage: {0:#}")]
    Storage(anyhow::Error),
}

impl TaskError {
    pub fn protocol(message: impl Into<String>) -> Self {
        TaskError::Protocol(message.into())
    }

    /// Whether the error must tear down the connection instead of only
    /// failing the task that raised it.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            TaskError::ConnectionClosed
            | TaskError::Protocol(_)
            | TaskError::ServerClose { .. } => true,
            TaskError::Frame(ProtocolError::SequenceNumberExhausted(_)) => true,
            TaskError::Crypto(CryptoError::CounterExhausted(_)) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(TaskError::ConnectionClosed.is_connection_fatal());
        assert!(TaskError::protocol("unexpected ack").is_connection_fatal());
        assert!(
            TaskError::Frame(ProtocolError::SequenceNumberExhausted("u32")).is_connection_fatal()
        );
        assert!(!TaskError::Aborted.is_connection_fatal());
        assert!(!TaskError::Crypto(CryptoError::Decryption).is_connection_fatal());
        assert!(
            !TaskError::Frame(ProtocolError::Unexpected("SERVER_HELLO")).is_connection_fatal()
        );
    }
}
