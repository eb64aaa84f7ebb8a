//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic business failures only (validation, lifecycle rules).
/// Storage and transport failures have their own error types in `provisioner-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A lifecycle rule was violated (e.g. an install status regression).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    /// The human-readable detail without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Validation(msg) | Self::InvariantViolation(msg) | Self::InvalidId(msg) => msg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_strips_the_category() {
        let err = DomainError::validation("passwords do not match");
        assert_eq!(err.to_string(), "validation failed: passwords do not match");
        assert_eq!(err.message(), "passwords do not match");
        assert_eq!(DomainError::invalid_id("bad uuid").message(), "bad uuid");
    }
}
