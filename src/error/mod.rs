use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Item could not be encoded to (or decoded from) JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configured store is missing, not loaded yet, or of an unsupported type
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A single round trip against the store failed
    #[error("Store operation failed: {0}")]
    StoreOperation(String),

    #[error("Could not read persistence log: {0}")]
    PersistenceRead(#[source] io::Error),

    #[error("Could not write persistence log: {0}")]
    PersistenceWrite(#[source] io::Error),

    #[error("Could not parse persistence log: {0}")]
    PersistenceParse(#[source] serde_json::Error),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::StoreOperation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QueueError::StoreUnavailable("cache".to_string());
        assert_eq!(err.to_string(), "Store unavailable: cache");

        let err = QueueError::PersistenceRead(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn test_serialization_error_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: QueueError = parse_err.into();
        assert!(matches!(err, QueueError::Serialization(_)));
    }
}
