//! Unified error type for the tablet engine
//!
//! Every crate in the workspace funnels its failures through [`TabletError`].
//! The variants correspond one-to-one to the exit conditions enumerated in
//! the design's error handling table: `Corruption`, `TryAgain`, `Expired`,
//! `TimedOut`, `AlreadyPresent`, `IllegalState`, `NotFound`, and
//! `ServiceUnavailable`, plus a `Fatal` variant for invariant violations in
//! the consensus apply path.
//!
//! ## Retry policy
//!
//! [`TabletError::is_retryable`] identifies conditions a caller (typically
//! the transaction client runtime) should retry within its deadline.
//! [`TabletError::is_fatal`] identifies conditions that must crash the
//! tablet process rather than be handled locally — crashing is the
//! responsibility of the apply loop in `tablet-engine`, not of this type;
//! `TabletError` only classifies.

use crate::ids::TransactionId;
use thiserror::Error;

/// Result type alias used throughout the tablet engine.
pub type TabletResult<T> = std::result::Result<T, TabletError>;

/// The unified error type for all tablet-engine operations.
#[derive(Debug, Error)]
pub enum TabletError {
    /// A key, value, or frontier could not be decoded.
    ///
    /// Fatal for the operation that raised it; surfaced to the caller as an
    /// error. Does not tear down the tablet unless the committed store
    /// itself becomes unreadable (see [`TabletError::Fatal`]).
    #[error("corruption: {0}")]
    Corruption(String),

    /// A retryable condition: a write-write/read-write conflict, or
    /// uncertainty about an intent's commit status that resolved to
    /// "try again within your deadline".
    #[error("try again: {reason}")]
    TryAgain {
        /// Human-readable conflict or retry reason.
        reason: String,
    },

    /// A transaction's heartbeat lapsed past the status tablet's expiry
    /// window, or a caller queried a status that has since expired.
    #[error("transaction {txn_id} expired")]
    Expired {
        /// The transaction that expired.
        txn_id: TransactionId,
    },

    /// An RPC or blocking wait (e.g. `safe_time`) exceeded its deadline.
    #[error("timed out: {0}")]
    TimedOut(String),

    /// A schema-version advance (or similar idempotent create) lost a race;
    /// the caller should re-read current state and no-op.
    #[error("already present: {0}")]
    AlreadyPresent(String),

    /// API misuse: committing twice, a child transaction of a child, etc.
    /// Always a programmer error.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A referenced tablet, transaction, or metadata record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A background task queue (e.g. backfill chunk dispatch) is saturated;
    /// caller should retry with backoff.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// An invariant that must never be violated by a correctly functioning
    /// consensus-apply path was violated. The apply loop must treat this as
    /// fatal and crash the process rather than let the committed store or
    /// intent store continue diverging from the replicated log.
    #[error("fatal invariant violation: {0}")]
    Fatal(String),
}

impl TabletError {
    /// Construct a [`TabletError::TryAgain`] with the given reason.
    pub fn try_again(reason: impl Into<String>) -> Self {
        TabletError::TryAgain {
            reason: reason.into(),
        }
    }

    /// Whether this error represents a first-class retryable signal rather
    /// than a failure. Conflicts and expirations are retryable; corruption
    /// and illegal-state errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TabletError::TryAgain { .. } | TabletError::TimedOut(_) | TabletError::ServiceUnavailable(_)
        )
    }

    /// Whether this error must crash the owning tablet process rather than
    /// be handled as a normal failure return.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TabletError::Fatal(_))
    }

    /// The stable exit-condition name for this error, used for logging and
    /// for mapping to RPC status codes at the (out-of-scope) transport
    /// layer.
    pub fn code(&self) -> ErrorCode {
        match self {
            TabletError::Corruption(_) => ErrorCode::Corruption,
            TabletError::TryAgain { .. } => ErrorCode::TryAgain,
            TabletError::Expired { .. } => ErrorCode::Expired,
            TabletError::TimedOut(_) => ErrorCode::TimedOut,
            TabletError::AlreadyPresent(_) => ErrorCode::AlreadyPresent,
            TabletError::IllegalState(_) => ErrorCode::IllegalState,
            TabletError::NotFound(_) => ErrorCode::NotFound,
            TabletError::ServiceUnavailable(_) => ErrorCode::ServiceUnavailable,
            // Fatal errors never reach the wire; callers crash before then.
            TabletError::Fatal(_) => ErrorCode::Corruption,
        }
    }
}

/// Wire-level exit condition, mirroring the design's RPC return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// `OK` is implicit (absence of an error); these are the non-OK codes.
    Corruption,
    /// Retryable conflict or transaction-state uncertainty.
    TryAgain,
    /// Transaction or status record expired.
    Expired,
    /// Deadline exceeded.
    TimedOut,
    /// Idempotent create lost a race against itself.
    AlreadyPresent,
    /// Programmer error / API misuse.
    IllegalState,
    /// Referenced entity missing.
    NotFound,
    /// Backpressure; retry with backoff.
    ServiceUnavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_again_is_retryable() {
        let err = TabletError::try_again("write-write conflict");
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
        assert_eq!(err.code(), ErrorCode::TryAgain);
    }

    #[test]
    fn corruption_is_not_retryable() {
        let err = TabletError::Corruption("bad subdoc key".into());
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn fatal_is_classified_fatal() {
        let err = TabletError::Fatal("intent left behind after apply".into());
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn expired_carries_transaction_id() {
        let txn_id = TransactionId::new([7u8; 16]);
        let err = TabletError::Expired { txn_id };
        assert_eq!(err.code(), ErrorCode::Expired);
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn timed_out_and_service_unavailable_are_retryable() {
        assert!(TabletError::TimedOut("safe_time wait".into()).is_retryable());
        assert!(TabletError::ServiceUnavailable("backfill queue full".into()).is_retryable());
    }
}
