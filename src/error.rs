//! Error handling for metabase operations.
//!
//! This module defines the error type shared by every adapter and the
//! facade. All public APIs return `Result<T, MetabaseError>`.
//!
//! # Error kinds
//!
//! [`MetabaseError`] carries a stable [`ErrorKind`] identity independent of
//! the Rust variant name, so callers (and the facade's metrics) can match on
//! behavior rather than on `Debug` output. See [`MetabaseError::kind`] and
//! [`MetabaseError::code`].

use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::error;

/// Result type for metabase operations.
pub type Result<T> = std::result::Result<T, MetabaseError>;

/// Stable error identity, independent of the `MetabaseError` variant name.
///
/// These correspond one-to-one with the error kinds named in the
/// specification: they are what callers should match on, not `Debug` output
/// or `.to_string()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or missing request fields.
    InvalidRequest,
    /// No object exists at the requested (project, bucket, key, version).
    ObjectNotFound,
    /// A segment commit targeted a stream with no pending parent object.
    PendingObjectMissing,
    /// `update_segment_pieces` addressed a segment that does not exist.
    SegmentNotFound,
    /// An exact-version insert collided with an existing row.
    ObjectAlreadyExists,
    /// `check_existence` found a committed object already at the location.
    Conflict,
    /// `disallow_delete` refused because precommit would have deleted rows.
    PreconditionFailed,
    /// Retention or legal hold prevents the requested mutation.
    ObjectLock,
    /// Both an expiration and an active lock were supplied.
    ObjectExpiration,
    /// The operation requires a committed object but found a different status.
    ObjectStatus,
    /// Optimistic-concurrency check failed (piece-set changed underneath).
    ValueChanged,
    /// Internal, not surfaced to callers: the adapter should retry the
    /// enclosing transaction closure.
    Retriable,
    /// Backend error with no more specific translation.
    Internal,
}

impl ErrorKind {
    /// Machine-readable code, matching the identities named in the spec.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid-request",
            ErrorKind::ObjectNotFound => "object-not-found",
            ErrorKind::PendingObjectMissing => "pending-object-missing",
            ErrorKind::SegmentNotFound => "segment-not-found",
            ErrorKind::ObjectAlreadyExists => "object-already-exists",
            ErrorKind::Conflict => "conflict",
            ErrorKind::PreconditionFailed => "precondition-failed",
            ErrorKind::ObjectLock => "object-lock",
            ErrorKind::ObjectExpiration => "object-expiration",
            ErrorKind::ObjectStatus => "object-status",
            ErrorKind::ValueChanged => "value-changed",
            ErrorKind::Retriable => "retriable",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Errors that can occur during metabase operations.
///
/// Every public operation returns `Result<T, MetabaseError>`. Backend driver
/// errors are translated at the adapter boundary (see `adapter::translate`)
/// into one of the typed variants below; anything that cannot be translated
/// is wrapped as [`MetabaseError::Internal`] with the cause preserved.
#[derive(Debug, Error)]
pub enum MetabaseError {
    /// Malformed or missing request fields.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No object exists at the requested location.
    #[error("{0} not found")]
    ObjectNotFound(&'static str),

    /// A segment commit targeted a stream with no pending parent.
    #[error("pending object missing for stream")]
    PendingObjectMissing,

    /// `update_segment_pieces` addressed a segment that does not exist.
    #[error("segment not found")]
    SegmentNotFound,

    /// An exact-version insert collided with an existing row.
    #[error("object already exists at version {version}")]
    ObjectAlreadyExists {
        /// The version that already existed.
        version: i64,
    },

    /// `check_existence` found a committed object already at the location.
    #[error("a committed object already exists at this location")]
    Conflict,

    /// `disallow_delete` refused because precommit would have deleted rows.
    #[error("operation would delete {would_delete} existing row(s)")]
    PreconditionFailed {
        /// Number of rows that would have been removed.
        would_delete: usize,
    },

    /// Retention or legal hold prevents the requested mutation.
    #[error("object is under retention or legal hold: {0}")]
    ObjectLock(String),

    /// Both an expiration and an active lock were supplied.
    #[error("object cannot have both an expiration and an active lock")]
    ObjectExpiration,

    /// The operation requires a committed object but found a different status.
    #[error("expected a committed object, found status {found:?}")]
    ObjectStatus {
        /// The status actually observed.
        found: String,
    },

    /// Optimistic-concurrency check failed.
    #[error("piece-set changed concurrently")]
    ValueChanged,

    /// Internal signal that the adapter should retry its transaction closure.
    /// Never escapes the adapter boundary.
    #[error("retriable backend error: {0}")]
    Retriable(String),

    /// Backend driver error with no more specific translation.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error surfaced from the alias cache's backing store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MetabaseError {
    /// Stable kind for this error, independent of the variant's `Debug` name.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MetabaseError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            MetabaseError::ObjectNotFound(_) => ErrorKind::ObjectNotFound,
            MetabaseError::PendingObjectMissing => ErrorKind::PendingObjectMissing,
            MetabaseError::SegmentNotFound => ErrorKind::SegmentNotFound,
            MetabaseError::ObjectAlreadyExists { .. } => ErrorKind::ObjectAlreadyExists,
            MetabaseError::Conflict => ErrorKind::Conflict,
            MetabaseError::PreconditionFailed { .. } => ErrorKind::PreconditionFailed,
            MetabaseError::ObjectLock(_) => ErrorKind::ObjectLock,
            MetabaseError::ObjectExpiration => ErrorKind::ObjectExpiration,
            MetabaseError::ObjectStatus { .. } => ErrorKind::ObjectStatus,
            MetabaseError::ValueChanged => ErrorKind::ValueChanged,
            MetabaseError::Retriable(_) => ErrorKind::Retriable,
            MetabaseError::Internal(_) | MetabaseError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Machine-readable code for this error's kind.
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// True if this error signals that the adapter's transaction closure
    /// should be retried rather than surfaced to the caller.
    pub fn is_retriable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retriable)
    }
}

/// Safely acquires a mutex lock, converting poisoning into an `Internal`
/// error instead of panicking.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| {
        error!("metabase in-process lock poisoned");
        MetabaseError::Internal("in-process lock poisoned".into())
    })
}
