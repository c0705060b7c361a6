//! One primary-to-peer replication relationship.
//!
//! A session is the long-lived object the primary keeps per remote replica:
//! the reliable replication sender, the (lazily created) copy sender for the
//! build protocol, the peer's endpoint and incarnation, and the per-peer
//! fault and catch-up flags. Sessions outlive reconfigurations as long as
//! the peer remains in the current, previous, or idle sets.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use tidemark_types::{Epoch, IncarnationId, ReplicaId, SequenceNumber};
use tidemark_wire::{AckBody, StartCopyBody};

use crate::config::ReplicatorSettings;
use crate::copy_sender::CopySender;
use crate::error::ReplicationResult;
use crate::operation::Operation;
use crate::provider::OperationDataStream;
use crate::sender::{ReliableOperationSender, SendBatch};

/// Something a session wants on the wire.
#[derive(Debug)]
pub enum SessionSend {
    Replication(SendBatch),
    Copy(SendBatch),
    StartCopy(StartCopyBody),
    InduceFault(String),
}

/// Result of feeding an acknowledgment into a session.
#[derive(Debug, Default)]
pub struct SessionAckOutcome {
    /// Any marker moved; quorum progress should be recomputed.
    pub progress: bool,

    /// The build reached a terminal state this ack.
    pub copy_completion: Option<ReplicationResult<()>>,
}

/// The primary's relationship with one remote replica.
pub struct ReplicationSession {
    name: String,
    replica_id: ReplicaId,
    address: String,
    incarnation: IncarnationId,

    sender: ReliableOperationSender,
    copy: Option<CopySender>,

    /// StartCopy is re-sent each retry tick until the idle's first ack.
    establish_copy_pending: Option<StartCopyBody>,

    /// First LSN the peer receives through replication (idle builds).
    replication_start: SequenceNumber,

    /// Floor below which this idle no longer needs the replication queue;
    /// raised by slow-idle mitigation when the copy covers the range.
    idle_progress_floor: SequenceNumber,

    pub must_catch_up: bool,
    pub is_promoted_to_active: bool,
    is_idle_faulted_due_to_slow_progress: bool,
    is_active_faulted_due_to_slow_progress: bool,
}

impl std::fmt::Debug for ReplicationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Session({} -> {}@{}, recv={}, apply={})",
            self.name,
            self.replica_id,
            self.address,
            self.sender.last_receive_ack(),
            self.sender.last_apply_ack(),
        )
    }
}

impl ReplicationSession {
    pub fn new(
        name: String,
        replica_id: ReplicaId,
        address: String,
        incarnation: IncarnationId,
        settings: &ReplicatorSettings,
    ) -> Self {
        let mut sender = ReliableOperationSender::new(
            format!("{name}->{replica_id}"),
            settings.max_pending_unacked_operations,
            settings.ack_duration_decay_factor,
            settings.ack_duration_decay_interval,
        );
        sender.open();

        Self {
            name,
            replica_id,
            address,
            incarnation,
            sender,
            copy: None,
            establish_copy_pending: None,
            replication_start: SequenceNumber::NON_INITIALIZED,
            idle_progress_floor: SequenceNumber::NON_INITIALIZED,
            must_catch_up: false,
            is_promoted_to_active: false,
            is_idle_faulted_due_to_slow_progress: false,
            is_active_faulted_due_to_slow_progress: false,
        }
    }

    // ========================================================================
    // Identity
    // ========================================================================

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn incarnation(&self) -> IncarnationId {
        self.incarnation
    }

    pub fn has_endpoint(&self, address: &str, incarnation: IncarnationId) -> bool {
        self.address == address && self.incarnation == incarnation
    }

    // ========================================================================
    // Replication sending
    // ========================================================================

    /// Appends operations for transmission. Out-of-order hand-off is the
    /// queue's problem, not the session's; operations arrive here in LSN
    /// order.
    pub fn add_replicate_operations(
        &mut self,
        operations: &[Arc<Operation>],
        completed_snapshot: SequenceNumber,
        now: Instant,
    ) {
        if self.is_faulted() {
            return;
        }
        for op in operations {
            self.sender.add(Arc::clone(op), completed_snapshot, now);
        }
    }

    /// Immediate sends triggered by new work.
    pub fn collect_send(&mut self, now: Instant) -> Vec<SessionSend> {
        let mut sends = Vec::new();
        if self.is_faulted() {
            return sends;
        }
        if let Some(batch) = self.sender.collect_send(now) {
            sends.push(SessionSend::Replication(batch));
        }
        if let Some(copy) = self.copy.as_mut() {
            if let Some(batch) = copy.on_retry_tick(now) {
                sends.push(SessionSend::Copy(batch));
            }
        }
        sends
    }

    /// Retry tick: retransmit unacked tails, re-establish copy, or nag a
    /// faulted peer into recycling.
    pub fn on_retry_tick(&mut self, now: Instant) -> Vec<SessionSend> {
        if self.is_faulted() {
            return vec![SessionSend::InduceFault(
                "faulted due to slow progress".into(),
            )];
        }

        let mut sends = Vec::new();
        if let Some(start_copy) = &self.establish_copy_pending {
            sends.push(SessionSend::StartCopy(*start_copy));
        }
        if let Some(batch) = self.sender.on_retry_tick(now) {
            sends.push(SessionSend::Replication(batch));
        }
        if let Some(copy) = self.copy.as_mut() {
            if let Some(batch) = copy.on_retry_tick(now) {
                sends.push(SessionSend::Copy(batch));
            }
        }
        sends
    }

    // ========================================================================
    // Build protocol
    // ========================================================================

    /// Starts the copy stream toward this (idle) peer and returns the
    /// StartCopy handshake to transmit.
    pub fn begin_copy(
        &mut self,
        source: Box<dyn OperationDataStream>,
        epoch: Epoch,
        replication_start: SequenceNumber,
        settings: &ReplicatorSettings,
    ) -> StartCopyBody {
        let mut copy = CopySender::new(
            format!("{}->{}", self.name, self.replica_id),
            self.replica_id,
            settings.wait_for_replication_acks_on_copy,
            settings.use_stream_faults_and_end_of_stream_acks,
            settings.max_pending_unacked_operations,
            settings.ack_duration_decay_factor,
            settings.ack_duration_decay_interval,
        );
        copy.begin(source, epoch);
        self.copy = Some(copy);
        self.replication_start = replication_start;

        let start_copy = StartCopyBody {
            epoch,
            replica_id: self.replica_id,
            replication_start_sequence: replication_start,
        };
        self.establish_copy_pending = Some(start_copy);
        start_copy
    }

    pub fn copy_sender(&mut self) -> Option<&mut CopySender> {
        self.copy.as_mut()
    }

    /// First LSN the peer receives through replication; set by the build.
    pub fn replication_start(&self) -> SequenceNumber {
        self.replication_start
    }

    /// True when `lsn` names the final operation of this peer's copy.
    pub fn copy_is_last(&self, lsn: SequenceNumber) -> bool {
        self.copy.as_ref().is_some_and(|c| c.is_operation_last(lsn))
    }

    pub fn has_copy_in_progress(&self) -> bool {
        self.copy
            .as_ref()
            .is_some_and(|c| c.state().is_in_progress())
    }

    /// Gives the idle more replication stream via the copy bound instead of
    /// retaining the queue for it. Returns true when the bound moved.
    pub fn extend_idle_replication_lsn(&mut self, replication_lsn: SequenceNumber) -> bool {
        let Some(copy) = self.copy.as_mut() else {
            return false;
        };
        if copy.update_replication_lsn(replication_lsn) {
            self.idle_progress_floor = replication_lsn;
            info!(
                session = %self.name,
                replica = %self.replica_id,
                lsn = %replication_lsn,
                "extended idle replication bound"
            );
            return true;
        }
        false
    }

    /// The earliest LSN the replication queue must retain for this idle.
    pub fn idle_replica_progress(&self) -> SequenceNumber {
        let baseline = if self.replication_start == SequenceNumber::NON_INITIALIZED {
            SequenceNumber::NON_INITIALIZED
        } else {
            self.replication_start.prev()
        };
        self.sender
            .last_receive_ack_or(baseline)
            .max(self.idle_progress_floor)
    }

    // ========================================================================
    // Acknowledgments
    // ========================================================================

    /// Single entry point for a peer ack: updates replication and copy
    /// progress and reports whether anything moved.
    pub fn update_ack_progress(&mut self, ack: &AckBody, now: Instant) -> SessionAckOutcome {
        let mut outcome = SessionAckOutcome::default();

        // Any ack proves the StartCopy handshake arrived.
        if self.establish_copy_pending.is_some() {
            self.establish_copy_pending = None;
        }

        outcome.progress = self.sender.process_ack(
            ack.replication_receive,
            ack.replication_quorum,
            now,
        );

        if let Some(copy) = self.copy.as_mut() {
            if copy.state().is_in_progress() {
                // Copy fields left non-initialized by a peer whose copy
                // receiver has finished mean the whole stream was received.
                copy.process_copy_ack(ack.copy_receive, ack.copy_quorum, now);
                copy.process_replication_ack(ack.copy_quorum, ack.replication_quorum);
                outcome.progress = true;
            }
            outcome.copy_completion = copy.poll_completion();
        }

        outcome
    }

    // ========================================================================
    // Progress
    // ========================================================================

    pub fn last_receive_lsn(&self) -> SequenceNumber {
        self.sender.last_receive_ack()
    }

    pub fn last_apply_lsn(&self) -> SequenceNumber {
        self.sender.last_apply_ack()
    }

    pub fn last_receive_lsn_or(&self, floor: SequenceNumber) -> SequenceNumber {
        self.sender.last_receive_ack_or(floor)
    }

    pub fn last_apply_lsn_or(&self, floor: SequenceNumber) -> SequenceNumber {
        self.sender.last_apply_ack_or(floor)
    }

    pub fn avg_receive_ack_duration(&self) -> Duration {
        self.sender.avg_receive_ack_duration()
    }

    pub fn avg_apply_ack_duration(&self) -> Duration {
        self.sender.avg_apply_ack_duration()
    }

    // ========================================================================
    // Role & fault transitions
    // ========================================================================

    /// Idle ack latencies are not representative of an active's; forget
    /// them on promotion.
    pub fn on_promote_to_active_secondary(&mut self, now: Instant) {
        self.is_promoted_to_active = true;
        self.sender.reset_ack_durations(now);
    }

    pub fn is_idle_faulted_due_to_slow_progress(&self) -> bool {
        self.is_idle_faulted_due_to_slow_progress
    }

    pub fn is_active_faulted_due_to_slow_progress(&self) -> bool {
        self.is_active_faulted_due_to_slow_progress
    }

    pub fn is_faulted(&self) -> bool {
        self.is_idle_faulted_due_to_slow_progress || self.is_active_faulted_due_to_slow_progress
    }

    /// Faults a slow active: transmission stops and the peer is excluded
    /// from memory-reclamation progress.
    pub fn fault_active_due_to_slow_progress(&mut self) {
        warn!(session = %self.name, replica = %self.replica_id, "faulting slow active secondary");
        self.is_active_faulted_due_to_slow_progress = true;
        self.sender.close();
    }

    /// Faults a slow idle: the build stops and cannot complete.
    pub fn fault_idle_due_to_slow_progress(&mut self) -> bool {
        let disabled = self
            .copy
            .as_mut()
            .map_or(true, CopySender::try_disable_build_completion);
        if !disabled {
            // Build already completed; too late to fault it.
            return false;
        }
        warn!(session = %self.name, replica = %self.replica_id, "faulting slow idle");
        self.is_idle_faulted_due_to_slow_progress = true;
        self.sender.close();
        true
    }

    /// Stops all transmission; the session object lingers until no set
    /// references it.
    pub fn close(&mut self) {
        self.sender.close();
        if let Some(copy) = self.copy.as_mut() {
            copy.fail(crate::error::ReplicationError::ObjectClosed);
        }
        self.establish_copy_pending = None;
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tidemark_wire::OperationMetadata;
    use uuid::Uuid;

    use crate::provider::VecDataStream;

    use super::*;

    fn op(lsn: i64) -> Arc<Operation> {
        Arc::new(Operation::new(
            OperationMetadata::normal(SequenceNumber::new(lsn)),
            Epoch::new(1, 1),
            vec![Bytes::from_static(b"x")],
        ))
    }

    fn session() -> ReplicationSession {
        ReplicationSession::new(
            "primary".into(),
            ReplicaId::new(2),
            "10.0.0.2:9099".into(),
            IncarnationId::new(Uuid::nil()),
            &ReplicatorSettings::default(),
        )
    }

    #[test]
    fn replication_ack_reports_progress_once() {
        let mut s = session();
        let now = Instant::now();
        s.add_replicate_operations(&[op(1), op(2)], SequenceNumber::INVALID, now);
        s.collect_send(now);

        let ack = AckBody::replication(SequenceNumber::new(2), SequenceNumber::new(2));
        assert!(s.update_ack_progress(&ack, now).progress);
        assert!(!s.update_ack_progress(&ack, now).progress);
        assert_eq!(s.last_apply_lsn(), SequenceNumber::new(2));
    }

    #[test]
    fn start_copy_retries_until_first_ack() {
        let mut s = session();
        let now = Instant::now();
        s.begin_copy(
            Box::new(VecDataStream::empty()),
            Epoch::new(1, 1),
            SequenceNumber::new(11),
            &ReplicatorSettings::default(),
        );

        let sends = s.on_retry_tick(now);
        assert!(sends
            .iter()
            .any(|send| matches!(send, SessionSend::StartCopy(_))));

        let ack = AckBody::replication(
            SequenceNumber::NON_INITIALIZED,
            SequenceNumber::NON_INITIALIZED,
        )
        .with_copy(SequenceNumber::new(1), SequenceNumber::new(1));
        s.update_ack_progress(&ack, now);

        let sends = s.on_retry_tick(now);
        assert!(!sends
            .iter()
            .any(|send| matches!(send, SessionSend::StartCopy(_))));
    }

    #[test]
    fn faulted_active_emits_induce_fault_and_stops_sending() {
        let mut s = session();
        let now = Instant::now();
        s.add_replicate_operations(&[op(1)], SequenceNumber::INVALID, now);
        s.fault_active_due_to_slow_progress();

        let sends = s.on_retry_tick(now);
        assert_eq!(sends.len(), 1);
        assert!(matches!(sends[0], SessionSend::InduceFault(_)));
    }

    #[test]
    fn idle_progress_uses_replication_start_baseline() {
        let mut s = session();
        s.begin_copy(
            Box::new(VecDataStream::empty()),
            Epoch::new(1, 1),
            SequenceNumber::new(101),
            &ReplicatorSettings::default(),
        );
        assert_eq!(s.idle_replica_progress(), SequenceNumber::new(100));
    }

    #[test]
    fn promotion_resets_latency_history() {
        let mut s = session();
        let t0 = Instant::now();
        s.add_replicate_operations(&[op(1)], SequenceNumber::INVALID, t0);
        s.collect_send(t0);
        s.update_ack_progress(
            &AckBody::replication(SequenceNumber::new(1), SequenceNumber::new(1)),
            t0 + Duration::from_millis(300),
        );
        assert!(s.avg_receive_ack_duration() > Duration::ZERO);

        s.on_promote_to_active_secondary(t0 + Duration::from_millis(400));
        assert_eq!(s.avg_receive_ack_duration(), Duration::ZERO);
        assert!(s.is_promoted_to_active);
    }
}
