//! Primary-side copy stream for building one idle secondary.
//!
//! The sender pulls copy operations from the state provider's enumeration,
//! ships them through a [`ReliableOperationSender`], and coordinates
//! completion with replication progress:
//!
//! ```text
//! NotStarted -> Started -> LsnSet -> ReplCompleted -> Completed
//!                      \__________________________/
//!                       (no replication acks required)
//! ```
//!
//! Copy is done only when the last copy operation is receive-acked *and*
//! the idle's replication acknowledgment covers the LSN recorded at
//! enumeration completion; only then is the idle considered built.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use tidemark_types::{Epoch, ReplicaId, SequenceNumber};
use tidemark_wire::{OperationKind, OperationMetadata};

use crate::error::{ReplicationError, ReplicationResult};
use crate::operation::Operation;
use crate::provider::OperationDataStream;
use crate::sender::{ReliableOperationSender, SendBatch};

// ============================================================================
// Copy State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPhase {
    NotStarted,
    Started,
    LsnSet,
    ReplCompleted,
    Completed,
}

/// The completion half of the copy protocol, tracked separately from the
/// transmission half so acknowledgment races stay local.
#[derive(Debug)]
pub struct CopyState {
    phase: CopyPhase,
    last_copy_lsn: SequenceNumber,
    last_repl_lsn: SequenceNumber,
    wait_for_replication_acks: bool,
}

impl CopyState {
    pub fn new(wait_for_replication_acks: bool) -> Self {
        Self {
            phase: CopyPhase::NotStarted,
            last_copy_lsn: SequenceNumber::NON_INITIALIZED,
            last_repl_lsn: SequenceNumber::NON_INITIALIZED,
            wait_for_replication_acks,
        }
    }

    pub fn phase(&self) -> CopyPhase {
        self.phase
    }

    pub fn last_copy_lsn(&self) -> SequenceNumber {
        self.last_copy_lsn
    }

    pub fn last_repl_lsn(&self) -> SequenceNumber {
        self.last_repl_lsn
    }

    pub fn is_in_progress(&self) -> bool {
        self.phase != CopyPhase::NotStarted && self.phase != CopyPhase::Completed
    }

    pub fn is_completed(&self) -> bool {
        self.phase == CopyPhase::Completed
    }

    pub fn is_replication_completed(&self) -> bool {
        matches!(self.phase, CopyPhase::ReplCompleted | CopyPhase::Completed)
    }

    /// True when `lsn` is the known final copy LSN.
    pub fn is_last_copy_lsn(&self, lsn: SequenceNumber) -> bool {
        matches!(
            self.phase,
            CopyPhase::LsnSet | CopyPhase::ReplCompleted | CopyPhase::Completed
        ) && lsn == self.last_copy_lsn
    }

    /// The build façade prevents two copies of the same replica; starting
    /// twice is a coding error.
    pub fn start(&mut self) {
        assert!(
            self.phase == CopyPhase::NotStarted,
            "copy start in phase {:?}",
            self.phase
        );
        self.phase = CopyPhase::Started;
    }

    /// Records the final LSNs when the enumerator yields its last
    /// operation. Skips straight to `ReplCompleted` when replication acks
    /// are not required.
    pub fn set_lsns(&mut self, copy_lsn: SequenceNumber, replication_lsn: SequenceNumber) {
        if self.phase == CopyPhase::Completed {
            // The copy already completed with an error; nothing to record.
            return;
        }
        assert!(
            self.phase == CopyPhase::Started,
            "set_lsns in phase {:?}",
            self.phase
        );

        self.last_copy_lsn = copy_lsn;
        if self.wait_for_replication_acks {
            self.last_repl_lsn = replication_lsn;
            self.phase = CopyPhase::LsnSet;
        } else {
            self.phase = CopyPhase::ReplCompleted;
        }
    }

    /// Monotonically raises the replication bound while waiting for acks.
    pub fn update_replication_lsn(&mut self, replication_lsn: SequenceNumber) -> bool {
        assert!(
            self.wait_for_replication_acks,
            "replication LSN update without replication acks enabled"
        );
        if self.phase != CopyPhase::LsnSet || self.last_repl_lsn >= replication_lsn {
            return false;
        }
        self.last_repl_lsn = replication_lsn;
        true
    }

    /// Moves to `ReplCompleted` once the peer's replication ack covers the
    /// recorded bound.
    pub fn try_complete_replication(&mut self, sequence_number: SequenceNumber) -> bool {
        if self.phase == CopyPhase::LsnSet && sequence_number >= self.last_repl_lsn {
            self.phase = CopyPhase::ReplCompleted;
            return true;
        }
        false
    }

    /// Terminal transition. A successful finish from any phase other than
    /// `LsnSet`/`ReplCompleted` is a coding error.
    pub fn finish(&mut self, succeeded: bool) {
        if succeeded {
            assert!(
                matches!(self.phase, CopyPhase::LsnSet | CopyPhase::ReplCompleted),
                "successful copy finish in phase {:?}",
                self.phase
            );
        }
        self.phase = CopyPhase::Completed;
    }
}

// ============================================================================
// Copy Sender
// ============================================================================

/// What a pump produced: copy batches to put on the wire.
#[derive(Debug, Default)]
pub struct CopyPumpOutput {
    pub batches: Vec<SendBatch>,

    /// Set when the enumeration yielded its final operation this pump.
    pub enumeration_completed: bool,
}

/// Drives the copy stream toward one idle replica.
pub struct CopySender {
    name: String,
    replica_id: ReplicaId,
    state: CopyState,
    sender: ReliableOperationSender,
    source: Option<Box<dyn OperationDataStream>>,
    copy_epoch: Epoch,
    next_copy_lsn: SequenceNumber,
    enumeration_done: bool,
    end_of_stream_acks: bool,
    disable_build_completion: bool,
    error: Option<ReplicationError>,
    finished: bool,
    completion_reported: bool,
}

impl std::fmt::Debug for CopySender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CopySender({} -> {}, {:?}, copy={}, repl={})",
            self.name,
            self.replica_id,
            self.state.phase(),
            self.state.last_copy_lsn(),
            self.state.last_repl_lsn(),
        )
    }
}

impl CopySender {
    pub fn new(
        name: String,
        replica_id: ReplicaId,
        wait_for_replication_acks: bool,
        end_of_stream_acks: bool,
        window: u64,
        decay_factor: f64,
        decay_interval: Duration,
    ) -> Self {
        Self {
            name: name.clone(),
            replica_id,
            state: CopyState::new(wait_for_replication_acks),
            sender: ReliableOperationSender::new(
                format!("{name}:copy"),
                window,
                decay_factor,
                decay_interval,
            ),
            source: None,
            copy_epoch: Epoch::INVALID,
            next_copy_lsn: SequenceNumber::new(1),
            enumeration_done: false,
            end_of_stream_acks,
            disable_build_completion: false,
            error: None,
            finished: false,
            completion_reported: false,
        }
    }

    pub fn state(&self) -> &CopyState {
        &self.state
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Begins the copy: adopts the provider's enumeration and opens the
    /// reliable sender.
    pub fn begin(&mut self, source: Box<dyn OperationDataStream>, copy_epoch: Epoch) {
        info!(copy = %self.name, replica = %self.replica_id, "copy starting");
        self.state.start();
        self.source = Some(source);
        self.copy_epoch = copy_epoch;
        self.sender.open();
    }

    /// Pulls operations from the enumeration into the send window and
    /// returns batches ready for the wire. `replication_bound` is the
    /// primary's last replication LSN, recorded as the catch-up bound when
    /// the enumeration completes.
    pub fn pump(
        &mut self,
        replication_bound: SequenceNumber,
        now: Instant,
    ) -> ReplicationResult<CopyPumpOutput> {
        let mut output = CopyPumpOutput::default();
        if self.finished || self.error.is_some() {
            return Ok(output);
        }

        while !self.enumeration_done && self.sender.has_window_room() {
            let source = self
                .source
                .as_mut()
                .ok_or_else(|| ReplicationError::InvalidState("copy pump before begin".into()))?;
            match source.next() {
                Ok(Some(segments)) => {
                    let op = Arc::new(Operation::new(
                        OperationMetadata::normal(self.next_copy_lsn),
                        self.copy_epoch,
                        segments,
                    ));
                    self.sender.add(op, SequenceNumber::NON_INITIALIZED, now);
                    self.next_copy_lsn = self.next_copy_lsn.next();
                }
                Ok(None) => {
                    // The terminator becomes a sentinel on the wire: an
                    // explicit EndOfStream operation when EOS acks are
                    // enabled, a bare zero-buffer marker otherwise.
                    let kind = if self.end_of_stream_acks {
                        OperationKind::EndOfStream
                    } else {
                        OperationKind::Normal
                    };
                    let terminator = Arc::new(Operation::new(
                        OperationMetadata {
                            kind,
                            sequence_number: self.next_copy_lsn,
                            atomic_group_id: SequenceNumber::NON_INITIALIZED,
                        },
                        self.copy_epoch,
                        Vec::new(),
                    ));
                    self.sender
                        .add(terminator, SequenceNumber::NON_INITIALIZED, now);

                    let last_copy = self.next_copy_lsn;
                    self.next_copy_lsn = self.next_copy_lsn.next();
                    self.enumeration_done = true;
                    self.source = None;
                    output.enumeration_completed = true;

                    info!(
                        copy = %self.name,
                        replica = %self.replica_id,
                        last_copy = %last_copy,
                        last_repl = %replication_bound,
                        "copy enumeration complete"
                    );
                    self.state.set_lsns(last_copy, replication_bound);
                }
                Err(error) => {
                    warn!(copy = %self.name, %error, "copy enumeration failed");
                    self.fail(error.clone());
                    return Err(error);
                }
            }
        }

        if let Some(batch) = self.sender.collect_send(now) {
            output.batches.push(batch);
        }
        Ok(output)
    }

    /// Retransmits the unacked copy tail.
    pub fn on_retry_tick(&mut self, now: Instant) -> Option<SendBatch> {
        if self.finished {
            return None;
        }
        self.sender.on_retry_tick(now)
    }

    /// True when `lsn` names the final copy operation.
    pub fn is_operation_last(&self, lsn: SequenceNumber) -> bool {
        self.state.is_last_copy_lsn(lsn)
    }

    /// Applies the copy half of a peer acknowledgment. A `NON_INITIALIZED`
    /// receive LSN in a copy-bearing ack means the peer holds the whole
    /// copy stream.
    pub fn process_copy_ack(
        &mut self,
        copy_receive: SequenceNumber,
        copy_quorum: SequenceNumber,
        now: Instant,
    ) {
        if !self.state.is_in_progress() {
            return;
        }

        let receive = if copy_receive == SequenceNumber::NON_INITIALIZED {
            self.state.last_copy_lsn()
        } else {
            copy_receive
        };
        let quorum = if copy_quorum == SequenceNumber::NON_INITIALIZED {
            self.state.last_copy_lsn()
        } else {
            copy_quorum
        };
        self.sender.process_ack(receive, quorum, now);
    }

    /// Applies the replication half of a peer acknowledgment: once the copy
    /// stream is fully applied, replication progress can complete the copy.
    pub fn process_replication_ack(
        &mut self,
        copy_quorum: SequenceNumber,
        replication_quorum: SequenceNumber,
    ) {
        if !self.state.is_in_progress() {
            return;
        }
        // ReplCompleted must not be set before the copy stream is done;
        // otherwise an early idle ack with no replication traffic would
        // pin the build-complete LSN forever.
        if copy_quorum == SequenceNumber::NON_INITIALIZED
            || self.state.is_last_copy_lsn(copy_quorum)
        {
            if !self.disable_build_completion
                && self.state.try_complete_replication(replication_quorum)
            {
                debug!(
                    copy = %self.name,
                    replica = %self.replica_id,
                    lsn = %replication_quorum,
                    "replication caught up for copy"
                );
            }
        }
    }

    /// Raises the replication catch-up bound (slow-idle mitigation gives
    /// the idle more replication stream to chew through instead of
    /// faulting it).
    pub fn update_replication_lsn(&mut self, replication_lsn: SequenceNumber) -> bool {
        if self.state.phase() != CopyPhase::LsnSet {
            return false;
        }
        self.state.update_replication_lsn(replication_lsn)
    }

    /// Marks the build as no longer completable. Returns false when the
    /// copy already completed; it is then too late to disable.
    pub fn try_disable_build_completion(&mut self) -> bool {
        assert!(
            !self.disable_build_completion,
            "{}: build completion already disabled",
            self.name
        );
        if self.state.is_completed() || self.finished {
            return false;
        }
        self.disable_build_completion = true;
        true
    }

    /// Fails the copy with `error`; the next poll reports it.
    pub fn fail(&mut self, error: ReplicationError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
        self.state.finish(false);
        self.sender.close();
        self.finished = true;
    }

    /// Checks for terminal completion. Reports exactly once: `Some(Ok)`
    /// when the last copy operation is receive-acked and replication has
    /// caught up; `Some(Err)` on failure, including the retroactive
    /// failure of a build whose completion was disabled.
    pub fn poll_completion(&mut self) -> Option<ReplicationResult<()>> {
        if self.completion_reported {
            return None;
        }
        if self.finished || self.error.is_some() {
            self.finished = true;
            self.completion_reported = true;
            return Some(self.error.clone().map_or(Ok(()), Err));
        }

        let copy_acked = self.enumeration_done
            && !self.sender.has_unacked()
            && self
                .state
                .is_last_copy_lsn(self.sender.last_receive_ack());
        if copy_acked && self.state.is_replication_completed() {
            self.finished = true;
            self.completion_reported = true;
            self.sender.close();
            if self.disable_build_completion {
                // The build raced its own disablement: it must not promote.
                warn!(
                    copy = %self.name,
                    replica = %self.replica_id,
                    "build completed after being disabled; failing retroactively"
                );
                self.state.finish(false);
                let error = ReplicationError::InternalError(
                    "build completed in spite of being disabled due to slow progress".into(),
                );
                self.error = Some(error.clone());
                return Some(Err(error));
            }
            self.state.finish(true);
            info!(copy = %self.name, replica = %self.replica_id, "copy complete");
            return Some(Ok(()));
        }
        None
    }
}

// ============================================================================
// Tests
// ============================================================================
