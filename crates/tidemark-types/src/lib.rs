//! # tidemark-types: Core types for `Tidemark`
//!
//! This crate contains the shared vocabulary of the replication engine:
//! - Sequence numbers and their sentinels ([`SequenceNumber`])
//! - Epochs ([`Epoch`])
//! - Replica identity ([`ReplicaId`], [`PartitionId`], [`IncarnationId`],
//!   [`ReplicationEndpointId`])
//! - Roles ([`ReplicaRole`])
//! - Replica descriptions handed down by the reconfiguration authority
//!   ([`ReplicaInformation`])
//! - Progress history ([`ProgressVectorEntry`])
//! - Tombstone garbage-collection watermark ([`TombstoneLowWatermark`])

use std::fmt::{self, Display};
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Sequence Numbers
// ============================================================================

/// A logical sequence number (LSN) assigned to a replication operation by the
/// primary.
///
/// LSNs are strictly positive in the live range. Two sentinels exist outside
/// it: [`SequenceNumber::INVALID`] (zero, never assigned) and
/// [`SequenceNumber::NON_INITIALIZED`] (negative, marks "no value observed
/// yet" in acknowledgments and progress tracking). [`SequenceNumber::MAX`] is
/// a saturating sentinel used as the identity of min-reductions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SequenceNumber(i64);

impl SequenceNumber {
    /// Zero; reserved, never assigned to an operation.
    pub const INVALID: SequenceNumber = SequenceNumber(0);

    /// Marks a sequence number that has not been set.
    pub const NON_INITIALIZED: SequenceNumber = SequenceNumber(-1);

    /// Saturating upper sentinel, identity of min-reductions.
    pub const MAX: SequenceNumber = SequenceNumber(i64::MAX);

    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// True for LSNs in the live range (strictly positive).
    pub const fn is_valid(self) -> bool {
        self.0 > 0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub const fn prev(self) -> Self {
        Self(self.0 - 1)
    }

    /// Number of sequence numbers in `[self, other)`; zero if `other <= self`.
    pub const fn distance_to(self, other: SequenceNumber) -> u64 {
        if other.0 > self.0 {
            (other.0 - self.0) as u64
        } else {
            0
        }
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SequenceNumber {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<SequenceNumber> for i64 {
    fn from(value: SequenceNumber) -> Self {
        value.0
    }
}

impl Add<i64> for SequenceNumber {
    type Output = SequenceNumber;

    fn add(self, rhs: i64) -> SequenceNumber {
        SequenceNumber(self.0 + rhs)
    }
}

impl AddAssign<i64> for SequenceNumber {
    fn add_assign(&mut self, rhs: i64) {
        self.0 += rhs;
    }
}

impl Sub<i64> for SequenceNumber {
    type Output = SequenceNumber;

    fn sub(self, rhs: i64) -> SequenceNumber {
        SequenceNumber(self.0 - rhs)
    }
}

impl Sub<SequenceNumber> for SequenceNumber {
    type Output = i64;

    fn sub(self, rhs: SequenceNumber) -> i64 {
        self.0 - rhs.0
    }
}

// ============================================================================
// Epochs
// ============================================================================

/// The tenure marker of a primary.
///
/// Epochs order lexicographically by `(data_loss_number,
/// configuration_number)` and strictly increase across reconfigurations; a
/// new primary begins its tenure with a new epoch, and every operation
/// carries the epoch of the primary that issued it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Epoch {
    /// Incremented when the partition loses data and restarts its history.
    pub data_loss_number: i64,

    /// Incremented on every reconfiguration within a data-loss generation.
    pub configuration_number: i64,
}

impl Epoch {
    /// Sentinel smaller than every live epoch.
    pub const INVALID: Epoch = Epoch {
        data_loss_number: -1,
        configuration_number: -1,
    };

    pub const fn new(data_loss_number: i64, configuration_number: i64) -> Self {
        Self {
            data_loss_number,
            configuration_number,
        }
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.data_loss_number, self.configuration_number)
    }
}

// ============================================================================
// Replica Identity
// ============================================================================

/// Unique identifier for a replica within a partition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ReplicaId(u64);

impl ReplicaId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ReplicaId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Unique identifier for a stateful partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionId(Uuid);

impl PartitionId {
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Distinguishes successive instances of the same replica across process
/// restarts. A stale incarnation in a message marks the message as addressed
/// to a previous life of the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IncarnationId(Uuid);

impl IncarnationId {
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl Display for IncarnationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only the first group is interesting in traces
        let s = self.0.to_string();
        write!(f, "{}", &s[..8])
    }
}

/// Globally unique identity of one replica instance.
///
/// Used as the actor key for inbound message dispatch and as the trace
/// identity of every component owned by that replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicationEndpointId {
    pub partition_id: PartitionId,
    pub replica_id: ReplicaId,
    pub incarnation_id: IncarnationId,
}

impl ReplicationEndpointId {
    pub fn new(partition_id: PartitionId, replica_id: ReplicaId) -> Self {
        Self {
            partition_id,
            replica_id,
            incarnation_id: IncarnationId::generate(),
        }
    }

    pub const fn with_incarnation(
        partition_id: PartitionId,
        replica_id: ReplicaId,
        incarnation_id: IncarnationId,
    ) -> Self {
        Self {
            partition_id,
            replica_id,
            incarnation_id,
        }
    }
}

impl Display for ReplicationEndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.partition_id, self.replica_id, self.incarnation_id)
    }
}

// ============================================================================
// Roles
// ============================================================================

/// The role a replica plays in the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReplicaRole {
    /// Not serving the partition.
    #[default]
    None,

    /// Accepts writes, drives replication and build.
    Primary,

    /// Being built by the primary; not yet part of any configuration.
    IdleSecondary,

    /// Member of the current (or previous) configuration.
    ActiveSecondary,
}

impl Display for ReplicaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplicaRole::None => "None",
            ReplicaRole::Primary => "Primary",
            ReplicaRole::IdleSecondary => "IdleSecondary",
            ReplicaRole::ActiveSecondary => "ActiveSecondary",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Replica Information
// ============================================================================

/// A replica as described by the external reconfiguration authority.
///
/// Passed into `update_catchup_configuration` and `build_idle`; the engine
/// resolves each entry against its known sessions by `replica_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInformation {
    pub replica_id: ReplicaId,

    pub role: ReplicaRole,

    /// Transport address of the peer's replication endpoint.
    pub replicator_address: String,

    /// Incarnation the authority believes is live at that address.
    pub incarnation_id: IncarnationId,

    /// Progress the replica is known to have; `NON_INITIALIZED` when unknown.
    pub current_progress: SequenceNumber,

    /// Highest LSN the replica can catch up to on its own.
    pub catch_up_capability: SequenceNumber,

    /// When set, the replica's acknowledgment is required before a
    /// reconfiguration quorum completes.
    pub must_catch_up: bool,
}

// ============================================================================
// Progress Vector
// ============================================================================

/// Records the last LSN a replica observed before an epoch boundary.
///
/// A copy source validates on rejoin that its history is a prefix of the
/// secondary's history by comparing progress vectors entry by entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressVectorEntry {
    pub epoch: Epoch,
    pub last_lsn: SequenceNumber,
}

impl ProgressVectorEntry {
    pub const fn new(epoch: Epoch, last_lsn: SequenceNumber) -> Self {
        Self { epoch, last_lsn }
    }
}

// ============================================================================
// Tombstone Low Watermark
// ============================================================================

/// LSN below which delete-tombstones may be garbage-collected by the state
/// provider. The replication engine only moves it forward as acknowledgments
/// advance; consumption is the provider's business.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct TombstoneLowWatermark(SequenceNumber);

impl TombstoneLowWatermark {
    pub const fn new(lsn: SequenceNumber) -> Self {
        Self(lsn)
    }

    pub const fn lsn(self) -> SequenceNumber {
        self.0
    }

    /// Moves the watermark forward; backward moves are ignored.
    pub fn advance(&mut self, lsn: SequenceNumber) -> bool {
        if lsn > self.0 {
            self.0 = lsn;
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
