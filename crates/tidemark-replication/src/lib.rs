//! Primary/secondary replication engine for stateful partitions.
//!
//! Tidemark replicates a stream of user operations from a single primary to
//! a configured set of secondary replicas, builds fresh or lagging
//! secondaries through a copy protocol, drives role transitions, and
//! detects and faults slow or unresponsive participants. The replicated
//! operation stream is the authoritative commit log the hosted service
//! observes.
//!
//! # Architecture
//!
//! Every component is an event-driven state machine: calls take an explicit
//! `now` and return an output of messages to transmit and completions to
//! deliver. There is no internal locking, timing, or I/O; the embedding
//! host serializes access, schedules the retry and ack-batching ticks, and
//! owns the transport. This keeps the whole engine deterministic and
//! simulation-testable.
//!
//! ```text
//!            Replicate            acks
//!   user ──► PrimaryReplicator ◄─────────────┐
//!               │ ReplicaManager             │
//!               │   OperationQueue           │
//!               │   ReplicationSession ──────┼──► transport
//!               │     ReliableOperationSender│
//!               │     CopySender             │
//!               ▼                            │
//!            SecondaryReplicator ────────────┘
//!               │  ReplicationReceiver / CopyReceiver
//!               ▼
//!            OperationStream ──► state provider (consumer)
//! ```
//!
//! # Key types
//!
//! - [`Replicator`]: outer lifecycle and role state machine
//! - [`PrimaryReplicator`] / [`SecondaryReplicator`]: the two role objects
//! - [`OperationQueue`]: LSN-indexed ring with the four sliding markers
//! - [`ReliableOperationSender`]: per-peer retransmission window
//! - [`OperationStream`]: the consumer's ordered view of delivered
//!   operations
//! - [`StateProvider`]: the contract of the hosted service
//!
//! Durability is out of scope: the engine is in-memory, and everything
//! durable lives behind the state provider.

pub mod config;
pub mod copy_context;
pub mod copy_sender;
pub mod error;
pub mod operation;
pub mod primary;
pub mod provider;
pub mod queue;
pub mod replica_manager;
pub mod replicator;
pub mod secondary;
pub mod sender;
pub mod session;
pub mod stats;
pub mod stream;

#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod tests;

pub use config::ReplicatorSettings;
pub use copy_context::CopyContextReceiver;
pub use copy_sender::{CopyPhase, CopySender, CopyState};
pub use error::{ReplicationError, ReplicationResult};
pub use operation::Operation;
pub use primary::PrimaryReplicator;
pub use provider::{OperationDataStream, StateProvider, VecDataStream};
pub use queue::{OperationQueue, QueueOptions};
pub use replica_manager::{CatchUpMode, OutboundEnvelope, PrimaryOutput, QueueHealth, ReplicaManager};
pub use replicator::{Replicator, ReplicatorOutput, ReplicatorState};
pub use secondary::{
    CopyReceiver, ReplicationReceiver, SecondaryOutput, SecondaryReplicator, SecondaryRoleKind,
};
pub use sender::{ReliableOperationSender, SendBatch};
pub use session::ReplicationSession;
pub use stats::{DecayAverage, StandardDeviation};
pub use stream::{DispatchQueue, FaultKind, OperationStream, StreamEntry};
