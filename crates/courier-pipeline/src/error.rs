use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use thiserror::Error;

use courier_common::FailureReason;

/// Error taxonomy for the delivery pipeline.
///
/// Transient kinds are resolved internally through retry and dead-lettering;
/// callers of `enqueue` only ever see `Validation` and `Overloaded`.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Suppressed by preference")]
    Suppressed,

    #[error("Rate limited, retry after {retry_after}")]
    RateLimited { retry_after: DateTime<Utc> },

    #[error("Template not found: {notification_type}/{language}")]
    MissingTemplate {
        notification_type: String,
        language: String,
    },

    #[error("Missing template variables: {}", names.iter().cloned().collect::<Vec<_>>().join(", "))]
    MissingVariables { names: BTreeSet<String> },

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Transient transport error: {0}")]
    TransientTransport(String),

    #[error("Circuit breaker open")]
    CircuitOpen,

    #[error("Permanent transport error: {0}")]
    PermanentTransport(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Pipeline overloaded")]
    Overloaded,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    /// Retryable kinds re-enter the queue with a backoff due-time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::TransientTransport(_) | DeliveryError::CircuitOpen
        )
    }

    /// Compact enumerated reason recorded on FAILED records.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            DeliveryError::Validation(_) => None,
            DeliveryError::Suppressed => Some(FailureReason::Suppressed),
            DeliveryError::RateLimited { .. } => Some(FailureReason::RateLimited),
            DeliveryError::MissingTemplate { .. } => Some(FailureReason::MissingTemplate),
            DeliveryError::MissingVariables { .. } => Some(FailureReason::MissingVariables),
            DeliveryError::UnknownUser(_) => Some(FailureReason::UnknownUser),
            DeliveryError::InvalidRecipient(_) => Some(FailureReason::InvalidRecipient),
            DeliveryError::TransientTransport(_) | DeliveryError::CircuitOpen => {
                Some(FailureReason::RetriesExhausted)
            }
            DeliveryError::PermanentTransport(_) => Some(FailureReason::PermanentTransport),
            DeliveryError::Cancelled => Some(FailureReason::Cancelled),
            DeliveryError::Overloaded => None,
            DeliveryError::Internal(_) => Some(FailureReason::Internal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(DeliveryError::TransientTransport("503".into()).is_retryable());
        assert!(DeliveryError::CircuitOpen.is_retryable());

        assert!(!DeliveryError::Suppressed.is_retryable());
        assert!(!DeliveryError::PermanentTransport("bad mailbox".into()).is_retryable());
        assert!(!DeliveryError::Cancelled.is_retryable());
        assert!(!DeliveryError::RateLimited { retry_after: Utc::now() }.is_retryable());
    }
}
