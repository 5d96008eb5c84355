use thiserror::Error;

use crate::identity::SenderKind;

/// Typed error hierarchy for courier.
///
/// Use at module boundaries (webhook intake, reconciliation, store calls,
/// merges). Internal/leaf functions can continue using `anyhow::Result` —
/// the `Internal` variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum CourierError {
    /// Payload shape this system cannot interpret. Terminal: drop and log.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// No integration matches the event's external reference. Terminal, but
    /// a configuration gap operators must see, not a silent drop.
    #[error("Unknown integration: {external_ref}")]
    UnknownIntegration { external_ref: String },

    /// Group/channel/broadcast sender while group handling is disabled.
    #[error("Unsupported sender kind {kind:?}: {raw_id}")]
    UnsupportedSenderKind { kind: SenderKind, raw_id: String },

    /// Storage-layer failure. Retryable ones (busy, locked, transient
    /// unavailability) signal the upstream gateway to redeliver.
    #[error("Storage error: {message}")]
    Storage { message: String, retryable: bool },

    /// The duplicate resolver could not complete a merge within its bounded
    /// retry budget. Surfaced for manual review.
    #[error("Merge conflict for phone {phone} after {attempts} attempts")]
    MergeConflict { phone: String, attempts: u32 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using `CourierError`.
pub type CourierResult<T> = std::result::Result<T, CourierError>;

impl CourierError {
    /// Whether the upstream gateway should retry the delivery that caused
    /// this error. Terminal rejections are acknowledged and dropped.
    pub fn is_retryable(&self) -> bool {
        match self {
            CourierError::Storage { retryable, .. } => *retryable,
            CourierError::MergeConflict { .. } => true,
            _ => false,
        }
    }

    /// Whether this is a terminal rejection of the inbound event itself
    /// (as opposed to an infrastructure failure).
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CourierError::MalformedPayload(_)
                | CourierError::UnknownIntegration { .. }
                | CourierError::UnsupportedSenderKind { .. }
        )
    }

    /// Short class name used in acknowledgement bodies and logs.
    pub fn class(&self) -> &'static str {
        match self {
            CourierError::MalformedPayload(_) => "malformed_payload",
            CourierError::UnknownIntegration { .. } => "unknown_integration",
            CourierError::UnsupportedSenderKind { .. } => "unsupported_sender_kind",
            CourierError::Storage { .. } => "storage",
            CourierError::MergeConflict { .. } => "merge_conflict",
            CourierError::Config(_) => "config",
            CourierError::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for CourierError {
    fn from(err: rusqlite::Error) -> Self {
        // Busy/locked are transient by definition; a constraint violation
        // here means a concurrent writer won a uniqueness race, and a
        // redelivery will find that winner.
        let retryable = matches!(
            err.sqlite_error_code(),
            Some(
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::ConstraintViolation
            )
        );
        CourierError::Storage {
            message: err.to_string(),
            retryable,
        }
    }
}
