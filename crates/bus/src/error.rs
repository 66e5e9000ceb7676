use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("broker payload rejected: {0}")]
    Seal(String),
}

impl From<redis::RedisError> for BusError {
    fn from(e: redis::RedisError) -> Self {
        Self::Broker(e.to_string())
    }
}
