//! Failure taxonomy shared by the fetch engine and the persistence gateway.
//!
//! Every fallible call at a suspension point returns `Result<T, Failure>`.
//! Callers decide what to do by matching on the variant instead of
//! inspecting error strings; [`crate::retry::RetryPolicy`] is the main consumer.

use std::time::Duration;
use thiserror::Error;

/// Record-level validation errors. Never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Malformed key: {0}")]
    MalformedKey(String),

    #[error("Value for {field} out of range: {value}")]
    OutOfRange { field: &'static str, value: String },

    #[error("Invalid {field}: {message}")]
    InvalidField { field: &'static str, message: String },

    #[error("Row rejected by database: {0}")]
    Rejected(String),
}

/// Outcome tag for a failed operation.
#[derive(Error, Debug, Clone)]
pub enum Failure {
    /// The external source asked us to wait before retrying the same request.
    #[error("Rate limited, retry after {}s", wait.as_secs())]
    RateLimited { wait: Duration },

    /// Network/connection trouble that may succeed on retry.
    #[error("Transient I/O failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Unrecoverable at the current scope (retries exhausted, bad request,
    /// unusable configuration).
    #[error("Fatal: {0}")]
    Fatal(String),
}

/// Discriminant of [`Failure`], handy for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited,
    Transient,
    Validation,
    Fatal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Transient => "transient",
            FailureKind::Validation => "validation",
            FailureKind::Fatal => "fatal",
        }
    }
}

impl Failure {
    pub fn transient(message: impl Into<String>) -> Self {
        Failure::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Failure::Fatal(message.into())
    }

    pub fn rate_limited_secs(secs: u64) -> Self {
        Failure::RateLimited {
            wait: Duration::from_secs(secs),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Failure::RateLimited { .. } => FailureKind::RateLimited,
            Failure::Transient(_) => FailureKind::Transient,
            Failure::Validation(_) => FailureKind::Validation,
            Failure::Fatal(_) => FailureKind::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind() {
        assert_eq!(Failure::rate_limited_secs(5).kind(), FailureKind::RateLimited);
        assert_eq!(Failure::transient("reset").kind(), FailureKind::Transient);
        assert_eq!(Failure::fatal("gone").kind(), FailureKind::Fatal);

        let validation: Failure = ValidationError::MalformedKey("x".to_string()).into();
        assert_eq!(validation.kind(), FailureKind::Validation);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Failure::rate_limited_secs(5).to_string(),
            "Rate limited, retry after 5s"
        );
        let err = ValidationError::OutOfRange {
            field: "confidence",
            value: "1.5".to_string(),
        };
        assert_eq!(err.to_string(), "Value for confidence out of range: 1.5");
    }
}
