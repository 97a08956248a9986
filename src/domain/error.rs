use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacingError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}
