use thiserror::Error;

/// Storage-layer error taxonomy. The gateway maps these onto HTTP statuses
/// and WS error frames; services add their own variants on top.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("conflict: {0}")]
    Conflict(&'static str),

    #[error("invalid: {0}")]
    Validation(String),

    #[error("rate limited: {0}")]
    RateLimited(&'static str),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
