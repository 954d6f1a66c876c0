//! Error types shared across all policies
//!
//! Rejections are represented twice: as lightweight standalone types returned
//! by the permit-level APIs (`try_acquire` and friends), and as variants of
//! the generic [`PolicyError`] produced by the `call`/`execute` decorators,
//! which additionally wraps the underlying operation error. The core never
//! recovers errors; recovery belongs to the caller or a composed retry.

use std::time::Duration;

use thiserror::Error;

/// Simple configuration error for builder validation
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// A circuit breaker refused the call
///
/// Raised while the circuit is open or forced open, or when the half-open
/// trial budget is exhausted.
#[derive(Debug, Clone, Error)]
#[error("Circuit breaker '{name}' does not permit calls")]
pub struct CallNotPermitted {
    /// Name of the rejecting circuit breaker
    pub name: String,
}

/// A rate limiter refused the call within its timeout budget
#[derive(Debug, Clone, Error)]
#[error("Rate limiter '{name}' did not permit the request within {timeout:?}")]
pub struct RequestNotPermitted {
    /// Name of the rejecting rate limiter
    pub name: String,
    /// Wait budget that was exceeded
    pub timeout: Duration,
}

/// A bulkhead refused the call because all permits were in use
#[derive(Debug, Clone, Error)]
#[error("Bulkhead '{name}' is full: {capacity} concurrent calls")]
pub struct BulkheadFull {
    /// Name of the rejecting bulkhead
    pub name: String,
    /// Configured concurrency limit
    pub capacity: usize,
}

/// Errors surfaced by the decorator combinators
///
/// Generic over the underlying operation error type `E` so the original
/// error is preserved when it is propagated or carried by an exhausted retry.
#[derive(Debug, Error)]
pub enum PolicyError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Circuit breaker is open, rejecting calls
    #[error(transparent)]
    CircuitOpen(#[from] CallNotPermitted),

    /// Rate limiter denied the request within its timeout
    #[error(transparent)]
    RateLimited(#[from] RequestNotPermitted),

    /// Bulkhead concurrency capacity exceeded
    #[error(transparent)]
    BulkheadFull(#[from] BulkheadFull),

    /// All retry attempts exhausted; carries the last underlying error
    #[error("All {attempts} retry attempts exhausted")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    /// The underlying operation failed; propagated unchanged
    #[error("Operation failed")]
    OperationFailed {
        #[source]
        source: E,
    },
}

impl<E> PolicyError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// True when the error is a policy rejection rather than a failure of the
    /// wrapped operation.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            PolicyError::CircuitOpen(_) | PolicyError::RateLimited(_) | PolicyError::BulkheadFull(_)
        )
    }

    /// The underlying operation error, when one is carried.
    pub fn source_error(&self) -> Option<&E> {
        match self {
            PolicyError::RetriesExhausted { source, .. }
            | PolicyError::OperationFailed { source } => Some(source),
            _ => None,
        }
    }
}

/// Result type for decorated operations
pub type PolicyResult<T, E> = Result<T, PolicyError<E>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("bad value");
        assert!(err.to_string().contains("bad value"));
    }

    #[test]
    fn test_rejection_display_carries_name() {
        let err = CallNotPermitted { name: "payments".to_string() };
        assert!(err.to_string().contains("payments"));

        let err =
            RequestNotPermitted { name: "quota".to_string(), timeout: Duration::from_millis(25) };
        assert!(err.to_string().contains("quota"));

        let err = BulkheadFull { name: "db".to_string(), capacity: 4 };
        assert!(err.to_string().contains("db"));
        assert!(err.to_string().contains('4'));
    }

    #[test]
    fn test_policy_error_classification() {
        let rejected: PolicyError<std::io::Error> =
            CallNotPermitted { name: "x".to_string() }.into();
        assert!(rejected.is_rejection());
        assert!(rejected.source_error().is_none());

        let failed: PolicyError<std::io::Error> =
            PolicyError::OperationFailed { source: std::io::Error::other("boom") };
        assert!(!failed.is_rejection());
        assert!(failed.source_error().is_some());

        let exhausted: PolicyError<std::io::Error> =
            PolicyError::RetriesExhausted { attempts: 3, source: std::io::Error::other("boom") };
        assert!(!exhausted.is_rejection());
        assert_eq!(exhausted.to_string(), "All 3 retry attempts exhausted");
    }
}
