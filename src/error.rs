use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MimirError>;

/// Unified error type for the mimir forwarder.
#[derive(Debug, Clone, Error)]
pub enum MimirError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("wire format error: {0}")]
    Proto(String),

    #[error("redis error: {0}")]
    Redis(String),

    #[error("memcached error: {0}")]
    Memcached(String),

    #[error("operation timed out")]
    Timeout,
}

impl From<std::io::Error> for MimirError {
    fn from(err: std::io::Error) -> Self {
        MimirError::Io(Arc::new(err))
    }
}

impl From<hickory_proto::ProtoError> for MimirError {
    fn from(err: hickory_proto::ProtoError) -> Self {
        MimirError::Proto(err.to_string())
    }
}
