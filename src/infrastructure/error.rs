use crate::domain::error::PacingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("activity store unavailable: {0}")]
    SinkUnavailable(String),
    #[error("activity store rejected records: {0}")]
    SinkRejected(String),
    #[error("activity store write timed out after {0} ms")]
    SinkTimeout(u128),
    #[error("run state changed concurrently; expected last execution {0}")]
    StaleRunState(String),
    #[error(transparent)]
    Pacing(#[from] PacingError),
}

impl InfraError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SinkUnavailable(_) | Self::SinkTimeout(_) | Self::StaleRunState(_) | Self::Sqlite(_)
        )
    }
}
