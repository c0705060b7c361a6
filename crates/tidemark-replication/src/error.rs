//! Error taxonomy of the replication engine.
//!
//! Per-replica failures are isolated to their session and never surface
//! here; these are the errors callers of the public surfaces observe.
//! Internal invariant violations (gap while completing, duplicate slot
//! occupancy, completing beyond the tail) are coding errors and panic
//! instead of returning a variant.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the replication crate.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors surfaced by the replication engine.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ReplicationError {
    /// Enqueue below the committed head, or the slot is already occupied.
    #[error("operation already present or below the committed head")]
    DuplicateOperation,

    /// Memory or item caps hit and no eviction could make room.
    #[error("operation queue is full")]
    QueueFull,

    /// Epoch update with an epoch older than the current one.
    #[error("epoch is older than the current epoch")]
    InvalidEpoch,

    /// Build of a replica that is already known.
    #[error("replica already exists")]
    ReplicaAlreadyExists,

    /// Remove/promote of a replica that is not known.
    #[error("replica does not exist")]
    ReplicaDoesNotExist,

    /// Write issued to a replica that is not the primary.
    #[error("replica is not the primary")]
    NotPrimary,

    /// Write issued while the configuration lacks a write quorum.
    #[error("no write quorum")]
    NoWriteQuorum,

    /// Operation rejected while a reconfiguration is in flight.
    #[error("reconfiguration is pending")]
    ReconfigurationPending,

    /// The operation observed cooperative cancellation.
    #[error("operation was canceled")]
    OperationCanceled,

    /// A fault was reported on this role; all subsequent operations fail.
    #[error("the replicator role has faulted")]
    OperationFailed,

    /// Invariant check failed at an API boundary; faults the role.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Corner-case reconciliation failed (e.g. a disabled build completed);
    /// faults the role.
    #[error("internal replicator error: {0}")]
    InternalError(String),

    /// Operation buffers exceed the configured maximum message size.
    #[error("operation exceeds the maximum replication message size")]
    MessageTooLarge,

    /// Transport send attempted during shutdown. Expected; swallowed by the
    /// senders.
    #[error("object is closed")]
    ObjectClosed,
}

impl ReplicationError {
    /// Wire error code carried in acknowledgment bodies; `0` is success.
    pub fn to_wire_code(&self) -> i32 {
        match self {
            ReplicationError::DuplicateOperation => 1,
            ReplicationError::QueueFull => 2,
            ReplicationError::InvalidEpoch => 3,
            ReplicationError::ReplicaAlreadyExists => 4,
            ReplicationError::ReplicaDoesNotExist => 5,
            ReplicationError::NotPrimary => 6,
            ReplicationError::NoWriteQuorum => 7,
            ReplicationError::ReconfigurationPending => 8,
            ReplicationError::OperationCanceled => 9,
            ReplicationError::OperationFailed => 10,
            ReplicationError::InvalidState(_) => 11,
            ReplicationError::InternalError(_) => 12,
            ReplicationError::MessageTooLarge => 13,
            ReplicationError::ObjectClosed => 14,
        }
    }

    /// Reverses [`Self::to_wire_code`]; `0` maps to `None`.
    pub fn from_wire_code(code: i32) -> Option<Self> {
        match code {
            0 => None,
            1 => Some(ReplicationError::DuplicateOperation),
            2 => Some(ReplicationError::QueueFull),
            3 => Some(ReplicationError::InvalidEpoch),
            4 => Some(ReplicationError::ReplicaAlreadyExists),
            5 => Some(ReplicationError::ReplicaDoesNotExist),
            6 => Some(ReplicationError::NotPrimary),
            7 => Some(ReplicationError::NoWriteQuorum),
            8 => Some(ReplicationError::ReconfigurationPending),
            9 => Some(ReplicationError::OperationCanceled),
            10 => Some(ReplicationError::OperationFailed),
            13 => Some(ReplicationError::MessageTooLarge),
            14 => Some(ReplicationError::ObjectClosed),
            11 => Some(ReplicationError::InvalidState(String::new())),
            _ => Some(ReplicationError::InternalError(format!("wire code {code}"))),
        }
    }
}
