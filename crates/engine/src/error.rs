//! Error taxonomy for the recovery engine
//!
//! Errors are split along two axes the callers care about: whether the
//! upstream processor should redeliver the event (transient) and whether
//! the caller did something wrong (authentication, validation, invalid
//! state). Conflicts from optimistic-concurrency losses are handled
//! locally and only escape as `Transient` after the retry bound.

use thiserror::Error;

pub type RecoveryResult<T> = Result<T, RecoveryError>;

#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Webhook signature or processor credentials failed verification.
    /// Never retried; logged as a security-relevant event by the caller.
    #[error("webhook signature verification failed")]
    Authentication,

    /// Malformed payload or missing required field. Not retried.
    #[error("invalid payload: {0}")]
    Validation(String),

    /// Optimistic-concurrency loss: the record changed under us.
    /// The loser re-reads and decides whether its operation still applies.
    #[error("conflicting update on invoice {invoice_id}: expected status {expected}, found {actual}")]
    Conflict {
        invoice_id: String,
        expected: String,
        actual: String,
    },

    /// Storage or network hiccup. Surfaced as a 5xx-equivalent so the
    /// processor's own redelivery mechanism tries again later.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Command not valid for the record's current state, e.g. retrying a
    /// cancelled invoice. Surfaced to the caller with a specific reason.
    #[error("invoice {invoice_id} is {status}: {reason}")]
    InvalidState {
        invoice_id: String,
        status: String,
        reason: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The charge-attempt call itself failed at the transport layer
    /// (after local backoff). Distinct from a decline, which is a normal
    /// decision input rather than an error.
    #[error("processor error: {0}")]
    Processor(String),

    #[error("email send failed: {0}")]
    EmailSend(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl RecoveryError {
    /// Whether the upstream caller should redeliver / try again later.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RecoveryError::Transient(_) | RecoveryError::Database(_) | RecoveryError::Processor(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classification() {
        assert!(RecoveryError::Transient("timeout".into()).is_retriable());
        assert!(!RecoveryError::Authentication.is_retriable());
        assert!(!RecoveryError::Validation("missing field".into()).is_retriable());
        assert!(!RecoveryError::InvalidState {
            invoice_id: "in_1".into(),
            status: "cancelled".into(),
            reason: "terminal".into(),
        }
        .is_retriable());
    }
}
