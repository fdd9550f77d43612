use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReelPipeError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Insufficient credits")]
    InsufficientCredits,

    #[error("Duplicate event: {0}")]
    DuplicateEvent(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Unknown character theme: {0}")]
    InvalidTheme(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Message bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, ReelPipeError>;
