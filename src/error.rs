//! Crate-wide error type.
//!
//! Mirrors `WrongoDBError` shape: one top-level enum with a
//! variant per error *category*, each wrapping a small local struct/enum
//! that carries the category's detail. `std::io::Error` converts via
//! `#[from]` so the EOF/IO category never needs an explicit `.map_err`.

use thiserror::Error;

/// A key or value violates a structural constraint (null key, value
/// written through a key-only view, position out of range).
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ConstraintError(pub String);

/// A value exceeds a configured capacity, or a length field cannot
/// represent the value being encoded.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct CapacityError(pub String);

/// An index, cursor, or database handle was used after being closed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ClosedError(pub String);

/// Lock acquisition failed: timeout, deadlock, or a view constraint
/// (e.g. attempting to write through a read-only view).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockFailure {
    #[error("lock timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("deadlock detected")]
    Deadlock,
    #[error("view does not permit this lock mode")]
    ViewConstraint,
}

/// Data on disk failed a checksum or layout check.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct CorruptionError(pub String);

/// An unexpected condition encountered while replaying redo records on a
/// replica. The caller is expected to close the database after observing
/// this ("replication panic").
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ReplicationPanic(pub String);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("constraint violation: {0}")]
    Constraint(#[from] ConstraintError),

    #[error("capacity/format error: {0}")]
    Capacity(#[from] CapacityError),

    #[error("closed: {0}")]
    Closed(#[from] ClosedError),

    #[error("lock failure: {0}")]
    Lock(#[from] LockFailure),

    #[error("corruption: {0}")]
    Corruption(#[from] CorruptionError),

    #[error("replication panic: {0}")]
    Replication(#[from] ReplicationPanic),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn constraint(msg: impl Into<String>) -> Self {
        ConstraintError(msg.into()).into()
    }

    pub fn capacity(msg: impl Into<String>) -> Self {
        CapacityError(msg.into()).into()
    }

    pub fn closed(msg: impl Into<String>) -> Self {
        ClosedError(msg.into()).into()
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        CorruptionError(msg.into()).into()
    }

    /// An unexpected condition during redo replay that isn't the one
    /// recoverable case (closed index); the caller closes the database
    /// after observing this.
    pub fn replication_panic(msg: impl Into<String>) -> Self {
        ReplicationPanic(msg.into()).into()
    }

    /// True for the one recoverable replay-path error: the target index
    /// was closed and a single reopen attempt is warranted.
    pub fn is_closed(&self) -> bool {
        matches!(self, EngineError::Closed(_))
    }
}
