use crate::souk::database::DatabaseError;
use crate::souk::dispatcher::feed::FeedError;

pub type Result<T> = core::result::Result<T, SoukError>;

#[derive(Debug, thiserror::Error)]
pub enum SoukError {
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("No active session for this user")]
    SessionNotActive,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Change feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Push delivery error: {0}")]
    Push(#[from] reqwest::Error),

    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}
