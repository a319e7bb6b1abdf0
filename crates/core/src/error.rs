//! Error types for ThemisDB
//!
//! One unified error enum covers the whole engine. Call sites use the
//! constructor helpers and classification predicates instead of matching
//! variants directly, so the taxonomy can grow without churn.
//!
//! Classification:
//! - **Recoverable at the call site**: `NotFound`, `Exists`, `InvalidValue`,
//!   `InvalidQuery`, `UniqueViolation`: returned to the caller, no logging.
//! - **Retryable**: `Conflict`, `Timeout`, `Busy`: callers retry with backoff.
//! - **Fatal to the operation**: `DeadlineExceeded` (partial results allowed),
//!   `Unsupported`.
//! - **Fatal to the process after audit**: `Corruption`, persistent `Io`,
//!   `Internal`.

use std::io;
use thiserror::Error;

/// Result type alias used across all Themis crates.
pub type Result<T> = std::result::Result<T, ThemisError>;

/// Unified error type for all Themis operations.
#[derive(Debug, Error)]
pub enum ThemisError {
    /// The referenced entity, index or catalog object does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Human-readable reference (e.g. `table/pk`, index name).
        what: String,
    },

    /// A create-only put hit an existing key.
    #[error("already exists: {table}/{key}")]
    Exists {
        /// Table of the existing entity.
        table: String,
        /// Primary key of the existing entity.
        key: String,
    },

    /// A value failed validation (malformed document, bad vector, bad geometry).
    #[error("invalid value: {reason}")]
    InvalidValue {
        /// Why the value was rejected.
        reason: String,
    },

    /// A query tree failed validation before planning.
    #[error("invalid query: {reason}")]
    InvalidQuery {
        /// Why the query was rejected.
        reason: String,
    },

    /// A unique index rejected a duplicate value.
    #[error("unique violation on index {index}: value {value}")]
    UniqueViolation {
        /// The violated index, as `table.name`.
        index: String,
        /// Display form of the duplicated value.
        value: String,
    },

    /// Optimistic conflict: another transaction committed the key first.
    ///
    /// Carries the sequence number of the conflicting commit so callers can
    /// re-read at or beyond it before retrying.
    #[error("write conflict on {key} (committed at seq {seq})")]
    Conflict {
        /// The contended key, display form.
        key: String,
        /// Commit sequence of the conflicting writer.
        seq: u64,
    },

    /// Lock acquisition exceeded the configured wait bound.
    #[error("lock wait timeout after {waited_ms}ms on {key}")]
    Timeout {
        /// The key the waiter was blocked on.
        key: String,
        /// How long the waiter was blocked.
        waited_ms: u64,
    },

    /// A read path ran past its deadline; partial results may accompany this.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A background queue is over its high-watermark; writes are refused.
    #[error("busy: {queue} queue over high-watermark")]
    Busy {
        /// Which background queue applied backpressure.
        queue: String,
    },

    /// Data integrity check failed (CRC, manifest hash, torn record).
    #[error("corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// I/O failure from the filesystem layer.
    #[error("io error: {message}")]
    Io {
        /// Description of the failing operation.
        message: String,
        /// Underlying error, when available.
        #[source]
        source: Option<io::Error>,
    },

    /// The operation is not supported by this build or index kind.
    #[error("unsupported: {what}")]
    Unsupported {
        /// What was requested.
        what: String,
    },

    /// Unexpected internal state; indicates a bug.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl ThemisError {
    /// A `NotFound` for an arbitrary reference.
    pub fn not_found(what: impl Into<String>) -> Self {
        ThemisError::NotFound { what: what.into() }
    }

    /// A `NotFound` for an entity.
    pub fn entity_not_found(table: impl Into<String>, key: impl AsRef<str>) -> Self {
        ThemisError::NotFound {
            what: format!("{}/{}", table.into(), key.as_ref()),
        }
    }

    /// An `Exists` for an entity.
    pub fn exists(table: impl Into<String>, key: impl Into<String>) -> Self {
        ThemisError::Exists {
            table: table.into(),
            key: key.into(),
        }
    }

    /// An `InvalidValue` with a reason.
    pub fn invalid_value(reason: impl Into<String>) -> Self {
        ThemisError::InvalidValue {
            reason: reason.into(),
        }
    }

    /// An `InvalidQuery` with a reason.
    pub fn invalid_query(reason: impl Into<String>) -> Self {
        ThemisError::InvalidQuery {
            reason: reason.into(),
        }
    }

    /// A `UniqueViolation` on the given index.
    pub fn unique_violation(index: impl Into<String>, value: impl Into<String>) -> Self {
        ThemisError::UniqueViolation {
            index: index.into(),
            value: value.into(),
        }
    }

    /// A `Conflict` naming the contended key and the winning commit sequence.
    pub fn conflict(key: impl Into<String>, seq: u64) -> Self {
        ThemisError::Conflict {
            key: key.into(),
            seq,
        }
    }

    /// A lock `Timeout` on the given key.
    pub fn timeout(key: impl Into<String>, waited_ms: u64) -> Self {
        ThemisError::Timeout {
            key: key.into(),
            waited_ms,
        }
    }

    /// A `Busy` rejection from the named background queue.
    pub fn busy(queue: impl Into<String>) -> Self {
        ThemisError::Busy {
            queue: queue.into(),
        }
    }

    /// A `Corruption` with a message.
    pub fn corruption(message: impl Into<String>) -> Self {
        ThemisError::Corruption {
            message: message.into(),
        }
    }

    /// An `Io` without an underlying source.
    pub fn io(message: impl Into<String>) -> Self {
        ThemisError::Io {
            message: message.into(),
            source: None,
        }
    }

    /// An `Unsupported` naming the request.
    pub fn unsupported(what: impl Into<String>) -> Self {
        ThemisError::Unsupported { what: what.into() }
    }

    /// An `Internal` with a message.
    pub fn internal(message: impl Into<String>) -> Self {
        ThemisError::Internal {
            message: message.into(),
        }
    }

    /// True for errors a caller is expected to handle without logging:
    /// `NotFound`, `Exists`, `InvalidValue`, `InvalidQuery`, `UniqueViolation`.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ThemisError::NotFound { .. }
                | ThemisError::Exists { .. }
                | ThemisError::InvalidValue { .. }
                | ThemisError::InvalidQuery { .. }
                | ThemisError::UniqueViolation { .. }
        )
    }

    /// True for errors where a retry with backoff may succeed:
    /// `Conflict`, `Timeout`, `Busy`.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ThemisError::Conflict { .. } | ThemisError::Timeout { .. } | ThemisError::Busy { .. }
        )
    }

    /// True for `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ThemisError::NotFound { .. })
    }

    /// True for `Conflict`.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ThemisError::Conflict { .. })
    }

    /// True for errors that should take the process down after an audit log:
    /// `Corruption`, `Io`, `Internal`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ThemisError::Corruption { .. } | ThemisError::Io { .. } | ThemisError::Internal { .. }
        )
    }

    /// The conflicting commit sequence, for `Conflict` errors.
    pub fn conflict_seq(&self) -> Option<u64> {
        match self {
            ThemisError::Conflict { seq, .. } => Some(*seq),
            _ => None,
        }
    }
}

impl From<io::Error> for ThemisError {
    fn from(e: io::Error) -> Self {
        ThemisError::Io {
            message: e.to_string(),
            source: Some(e),
        }
    }
}

impl From<bincode::Error> for ThemisError {
    fn from(e: bincode::Error) -> Self {
        ThemisError::Corruption {
            message: format!("decode failed: {}", e),
        }
    }
}

impl From<serde_json::Error> for ThemisError {
    fn from(e: serde_json::Error) -> Self {
        ThemisError::InvalidValue {
            reason: format!("json: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_disjoint() {
        let recoverable = ThemisError::entity_not_found("users", "42");
        assert!(recoverable.is_recoverable());
        assert!(!recoverable.is_retryable());
        assert!(!recoverable.is_fatal());

        let retryable = ThemisError::conflict("ent:users/42", 17);
        assert!(retryable.is_retryable());
        assert!(!retryable.is_recoverable());
        assert!(!retryable.is_fatal());

        let fatal = ThemisError::corruption("crc mismatch in wal segment 3");
        assert!(fatal.is_fatal());
        assert!(!fatal.is_recoverable());
        assert!(!fatal.is_retryable());
    }

    #[test]
    fn conflict_carries_sequence() {
        let e = ThemisError::conflict("ent:users/42", 99);
        assert_eq!(e.conflict_seq(), Some(99));
        assert!(e.to_string().contains("99"));

        assert_eq!(ThemisError::DeadlineExceeded.conflict_seq(), None);
    }

    #[test]
    fn io_conversion_keeps_source() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let e: ThemisError = io_err.into();
        match e {
            ThemisError::Io { source, .. } => assert!(source.is_some()),
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn display_includes_context() {
        let e = ThemisError::exists("hotels", "h-1");
        assert!(e.to_string().contains("hotels/h-1"));

        let e = ThemisError::unique_violation("users.email", "a@b.c");
        assert!(e.to_string().contains("users.email"));
    }
}
