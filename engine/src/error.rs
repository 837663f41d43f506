use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid value in stored row: {0}")]
    Decode(String),

    #[error("{0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
