use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// External feed exhausted its retry budget. The stage did not complete
    /// and is safe to re-run later; never substitute a zero value.
    #[error("Market data unavailable: {0}")]
    DataUnavailable(String),

    /// Operator/programmer error, e.g. scoring a date with no day record.
    #[error("Invalid stage transition: {0}")]
    InvalidTransition(String),

    #[error("Mulligan rejected: {0}")]
    MulliganRejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
