//! The primary's authority on the replica set.
//!
//! Owns the primary operation queue, the session sets (current
//! configuration, previous configuration during reconfiguration, and
//! building idles), the write-quorum progress math, catch-up waiting, and
//! slow-peer detection.
//!
//! Everything is event-driven: public methods take an explicit `now` and
//! return a [`PrimaryOutput`] of messages to transmit and completions to
//! deliver. The embedding replicator serializes calls.

use std::collections::HashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, warn};

use tidemark_types::{
    Epoch, ProgressVectorEntry, ReplicaId, ReplicaInformation, ReplicationEndpointId,
    SequenceNumber, TombstoneLowWatermark,
};
use tidemark_wire::{
    AckBody, CopyContextOperationBody, CopyOperationBody, InduceFaultBody, MessageBody,
    MessageIdHeader, OperationMetadata, ReplicationOperationBody, StartCopyBody,
};

use crate::config::ReplicatorSettings;
use crate::copy_context::CopyContextReceiver;
use crate::error::{ReplicationError, ReplicationResult};
use crate::operation::Operation;
use crate::provider::StateProvider;
use crate::queue::{OperationQueue, QueueOptions};
use crate::sender::SendBatch;
use crate::session::{ReplicationSession, SessionSend};
use crate::stats::StandardDeviation;

// ============================================================================
// Output
// ============================================================================

/// A message the primary wants on the wire.
#[derive(Debug)]
pub struct OutboundEnvelope {
    pub target_address: String,
    pub target_replica: ReplicaId,
    pub message_id: MessageIdHeader,
    pub body: MessageBody,
}

/// Effects produced by one primary event.
#[derive(Debug, Default)]
pub struct PrimaryOutput {
    /// Messages to hand to the transport.
    pub sends: Vec<OutboundEnvelope>,

    /// Replicate operations that reached their verdict: quorum commit or
    /// cancellation.
    pub completed_replicates: Vec<(SequenceNumber, ReplicationResult<()>)>,

    /// Builds that reached a terminal state.
    pub build_completions: Vec<(ReplicaId, ReplicationResult<()>)>,

    /// A catch-up wait finished.
    pub catch_up_completed: Option<ReplicationResult<()>>,

    /// The close drain finished; the role can be torn down.
    pub close_completed: bool,
}

impl PrimaryOutput {
    pub fn merge(&mut self, other: PrimaryOutput) {
        self.sends.extend(other.sends);
        self.completed_replicates.extend(other.completed_replicates);
        self.build_completions.extend(other.build_completions);
        if other.catch_up_completed.is_some() {
            self.catch_up_completed = other.catch_up_completed;
        }
        self.close_completed |= other.close_completed;
    }

    pub fn is_empty(&self) -> bool {
        self.sends.is_empty()
            && self.completed_replicates.is_empty()
            && self.build_completions.is_empty()
            && self.catch_up_completed.is_none()
            && !self.close_completed
    }
}

// ============================================================================
// Catch-up
// ============================================================================

/// How far a catch-up wait must go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpMode {
    /// Every current-configuration replica acks the latest LSN.
    QuorumAll,

    /// A write quorum (and every must-catch-up replica) reaches the
    /// reconfiguration bound.
    WriteQuorum,
}

#[derive(Debug)]
struct CatchUpWaiter {
    mode: CatchUpMode,
    /// `QuorumAll`: the latest LSN at begin. `WriteQuorum`: the
    /// reconfiguration catch-up bound.
    target: SequenceNumber,
}

// ============================================================================
// Replica Manager
// ============================================================================

/// Primary-role replica set and progress tracker.
pub struct ReplicaManager {
    endpoint_id: ReplicationEndpointId,
    settings: Arc<ReplicatorSettings>,
    epoch: Epoch,

    queue: OperationQueue,

    sessions: HashMap<ReplicaId, ReplicationSession>,
    /// Membership lists into `sessions`; a replica can be in CC and PC.
    cc: Vec<ReplicaId>,
    pc: Vec<ReplicaId>,
    idle: Vec<ReplicaId>,

    write_quorum_cc: u32,
    write_quorum_pc: u32,
    use_pc: bool,
    has_quorum_cc: bool,
    has_quorum_pc: bool,

    /// Idles whose copy enumerates up to the latest LSN.
    copy_until_latest: BTreeSet<ReplicaId>,

    /// Copy-context pipelines for persisted-state builds.
    copy_context_receivers: HashMap<ReplicaId, CopyContextReceiver>,

    /// Replicate calls waiting for quorum commit, by LSN.
    pending_replicates: BTreeSet<i64>,

    catch_up: Option<CatchUpWaiter>,

    /// Bound a write-quorum catch-up must reach; stamped by configuration
    /// updates.
    catchup_completion_lsn: SequenceNumber,

    /// Cached CC progress for catch-up evaluation.
    majority_apply_acked_cc: SequenceNumber,
    all_apply_acked_cc: SequenceNumber,

    /// LSN below which the state provider may garbage-collect delete
    /// tombstones: everything every replica has applied.
    tombstone_low_watermark: TombstoneLowWatermark,

    progress_vector: Vec<ProgressVectorEntry>,
}

/// Point-in-time queue summary for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueHealth {
    pub usage_percent: u8,
    pub operation_count: u64,
    pub memory_bytes: u64,
    pub first_sequence_number: SequenceNumber,
    pub last_sequence_number: SequenceNumber,
}

impl ReplicaManager {
    pub fn new(
        endpoint_id: ReplicationEndpointId,
        epoch: Epoch,
        settings: Arc<ReplicatorSettings>,
        start_sequence: SequenceNumber,
    ) -> Self {
        let queue = OperationQueue::new(QueueOptions {
            name: format!("REPL-{endpoint_id}"),
            initial_size: settings.initial_replication_queue_size,
            max_size: settings.max_replication_queue_size,
            max_memory_size: settings.max_replication_queue_memory_size,
            max_completed_count: 0,
            max_completed_bytes: 0,
            // Not consulted on the primary (nothing dispatches to a local
            // consumer), but the flag rides the queue across demotion.
            require_service_ack: settings.require_service_ack,
            clean_on_complete: true,
            ignore_commit: false,
            start_sequence,
        });
        Self::with_queue(endpoint_id, epoch, settings, queue)
    }

    /// Builds a manager around an adopted queue (promotion from secondary).
    pub fn with_queue(
        endpoint_id: ReplicationEndpointId,
        epoch: Epoch,
        settings: Arc<ReplicatorSettings>,
        queue: OperationQueue,
    ) -> Self {
        Self {
            endpoint_id,
            settings,
            epoch,
            queue,
            sessions: HashMap::new(),
            cc: Vec::new(),
            pc: Vec::new(),
            idle: Vec::new(),
            write_quorum_cc: 1,
            write_quorum_pc: 0,
            use_pc: false,
            // Until the first configuration update arrives, acks cannot
            // advance anything.
            has_quorum_cc: false,
            has_quorum_pc: false,
            copy_until_latest: BTreeSet::new(),
            copy_context_receivers: HashMap::new(),
            pending_replicates: BTreeSet::new(),
            catch_up: None,
            catchup_completion_lsn: SequenceNumber::NON_INITIALIZED,
            majority_apply_acked_cc: SequenceNumber::NON_INITIALIZED,
            all_apply_acked_cc: SequenceNumber::NON_INITIALIZED,
            tombstone_low_watermark: TombstoneLowWatermark::default(),
            progress_vector: Vec::new(),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// Surrenders the queue for a role transition.
    pub fn into_queue(self) -> OperationQueue {
        self.queue
    }

    /// Restarts the LSN space after data loss: the state provider's
    /// recovered history dictates where new operations begin.
    pub fn reset_sequence(&mut self, start_sequence: SequenceNumber) {
        assert!(
            self.pending_replicates.is_empty(),
            "{}: sequence reset with replicate operations in flight",
            self.endpoint_id
        );
        self.queue.reset(start_sequence);
        info!(endpoint = %self.endpoint_id, start = %start_sequence, "sequence space reset");
    }

    /// Last LSN assigned by this primary.
    pub fn current_progress(&self) -> SequenceNumber {
        self.queue.last_sequence_number()
    }

    /// Lowest LSN this primary can serve to a catching-up peer.
    pub fn catch_up_capability(&self) -> SequenceNumber {
        self.queue.first_sequence_number()
    }

    pub fn has_write_quorum(&self) -> bool {
        self.has_quorum_cc && (!self.use_pc || self.has_quorum_pc)
    }

    pub fn session(&self, replica_id: ReplicaId) -> Option<&ReplicationSession> {
        self.sessions.get(&replica_id)
    }

    pub fn pending_replicate_count(&self) -> usize {
        self.pending_replicates.len()
    }

    /// Tombstones below this LSN have been applied everywhere and may be
    /// garbage-collected by the state provider.
    pub fn tombstone_low_watermark(&self) -> TombstoneLowWatermark {
        self.tombstone_low_watermark
    }

    /// Queue summary the partition controller polls for health reports.
    pub fn queue_health(&self) -> QueueHealth {
        QueueHealth {
            usage_percent: self.queue.usage_percent(),
            operation_count: self.queue.operation_count(),
            memory_bytes: self.queue.total_memory(),
            first_sequence_number: self.queue.first_sequence_number(),
            last_sequence_number: self.queue.last_sequence_number(),
        }
    }

    // ========================================================================
    // Epoch
    // ========================================================================

    /// Installs a new epoch; LSNs continue strictly increasing across the
    /// boundary.
    pub fn update_epoch(&mut self, epoch: Epoch) -> ReplicationResult<()> {
        if epoch < self.epoch {
            return Err(ReplicationError::InvalidEpoch);
        }
        if epoch > self.epoch {
            self.progress_vector.push(ProgressVectorEntry::new(
                self.epoch,
                self.queue.last_sequence_number(),
            ));
            info!(endpoint = %self.endpoint_id, old = %self.epoch, new = %epoch, "primary epoch updated");
            self.epoch = epoch;
        }
        Ok(())
    }

    pub fn progress_vector(&self) -> &[ProgressVectorEntry] {
        &self.progress_vector
    }

    // ========================================================================
    // Replicate
    // ========================================================================

    /// Assigns the next LSN to `data`, enqueues it, and fans it out to all
    /// sessions. The returned LSN's completion is delivered through a later
    /// output once quorum acks arrive.
    pub fn replicate(
        &mut self,
        data: Vec<Bytes>,
        now: Instant,
    ) -> ReplicationResult<(SequenceNumber, PrimaryOutput)> {
        if !self.has_write_quorum() {
            return Err(ReplicationError::NoWriteQuorum);
        }

        let data_size: u64 = data.iter().map(|b| b.len() as u64).sum();
        if data_size > self.settings.max_replication_message_size {
            return Err(ReplicationError::MessageTooLarge);
        }

        let sequence_number = self.queue.tail();
        let op = Arc::new(Operation::new(
            OperationMetadata::normal(sequence_number),
            self.epoch,
            data,
        ));
        self.queue.try_enqueue(Arc::clone(&op), now)?;
        self.pending_replicates.insert(sequence_number.as_i64());

        let mut output = PrimaryOutput::default();
        let completed_snapshot = self.queue.committed_head().prev();
        for replica_id in self.all_send_targets() {
            let session = self.sessions.get_mut(&replica_id).expect("listed session");
            session.add_replicate_operations(
                std::slice::from_ref(&op),
                completed_snapshot,
                now,
            );
            let sends = session.collect_send(now);
            Self::push_session_sends(&mut output, &self.sessions[&replica_id], sends, self.epoch);
        }

        // Backpressure mitigation runs on every enqueue.
        output.merge(self.mitigate_slow_peers(now));

        Ok((sequence_number, output))
    }

    // ========================================================================
    // Acknowledgments
    // ========================================================================

    /// Routes an inbound ack to its session and recomputes progress.
    /// Incarnation mismatches are dropped: the ack addressed a previous
    /// life of the peer.
    pub fn process_ack(
        &mut self,
        from_address: &str,
        from_endpoint: ReplicationEndpointId,
        ack: &AckBody,
        now: Instant,
    ) -> PrimaryOutput {
        let mut output = PrimaryOutput::default();

        let Some(replica_id) = self.find_session_by_endpoint(from_address, from_endpoint) else {
            debug!(
                endpoint = %self.endpoint_id,
                from = %from_endpoint,
                "ack from unknown or stale endpoint dropped"
            );
            return output;
        };

        let session = self.sessions.get_mut(&replica_id).expect("found session");
        let outcome = session.update_ack_progress(ack, now);

        if let Some(completion) = outcome.copy_completion {
            match &completion {
                Ok(()) => {
                    info!(endpoint = %self.endpoint_id, replica = %replica_id, "idle build complete");
                }
                Err(error) => {
                    warn!(endpoint = %self.endpoint_id, replica = %replica_id, %error, "idle build failed");
                }
            }
            self.copy_context_receivers.remove(&replica_id);
            output.build_completions.push((replica_id, completion));
        }

        if outcome.progress {
            output.merge(self.pump_copy(replica_id, now));
            let session = self.sessions.get_mut(&replica_id).expect("found session");
            let sends = session.collect_send(now);
            Self::push_session_sends(&mut output, &self.sessions[&replica_id], sends, self.epoch);
            output.merge(self.update_progress(now));
        }

        output
    }

    /// Copy-context operations from a building persisted-state idle.
    pub fn process_copy_context(
        &mut self,
        body: CopyContextOperationBody,
        now: Instant,
    ) -> PrimaryOutput {
        let mut output = PrimaryOutput::default();
        let replica_id = body.replica_id;

        if !self.settings.has_persisted_state {
            // Context from a non-persisted peer is protocol noise.
            debug!(endpoint = %self.endpoint_id, replica = %replica_id, "copy context dropped: volatile partition");
            return output;
        }
        let Some(receiver) = self.copy_context_receivers.get_mut(&replica_id) else {
            debug!(endpoint = %self.endpoint_id, replica = %replica_id, "copy context without a build in progress");
            return output;
        };

        let ack = receiver.process_operation(body, now);
        if let Some(session) = self.sessions.get(&replica_id) {
            output.sends.push(OutboundEnvelope {
                target_address: session.address().to_string(),
                target_replica: replica_id,
                message_id: MessageIdHeader::fresh(),
                body: MessageBody::CopyContextAck(ack),
            });
        }
        output
    }

    // ========================================================================
    // Progress
    // ========================================================================

    /// Recomputes committed/completed LSNs, advances the queue, and settles
    /// replicate futures and catch-up waits.
    pub fn update_progress(&mut self, now: Instant) -> PrimaryOutput {
        let mut output = PrimaryOutput::default();
        if !self.has_write_quorum() {
            return output;
        }

        let (committed, completed) = self.compute_progress();
        // A peer cannot legitimately ack beyond what was ever assigned.
        let committed = committed.min(self.queue.last_sequence_number());
        let completed = completed.min(self.queue.last_sequence_number());

        let old_committed = self.queue.committed_head().prev();
        if committed.is_valid() {
            self.queue.update_commit_head(committed, now);
        }
        let new_committed = self.queue.committed_head().prev();

        if completed.is_valid() {
            self.queue.update_completed_head(completed, now);
        }

        if new_committed > old_committed {
            let settled: Vec<i64> = self
                .pending_replicates
                .range(..=new_committed.as_i64())
                .copied()
                .collect();
            for lsn in settled {
                self.pending_replicates.remove(&lsn);
                output
                    .completed_replicates
                    .push((SequenceNumber::new(lsn), Ok(())));
            }
        }

        if let Some(result) = self.evaluate_catch_up() {
            self.catch_up = None;
            output.catch_up_completed = Some(result);
        }

        output
    }

    /// Current (committed, completed) LSNs across CC, PC, and idles.
    fn compute_progress(&mut self) -> (SequenceNumber, SequenceNumber) {
        let completed_floor = self.queue.first_sequence_number().prev();

        let (mut committed, all_acked, mut completed) = {
            let cc_sessions = self.sessions_of(&self.cc);
            Self::replicas_progress(completed_floor, &cc_sessions, self.write_quorum_cc)
        };

        self.majority_apply_acked_cc = committed;
        self.all_apply_acked_cc = all_acked;
        if all_acked.is_valid() {
            self.tombstone_low_watermark.advance(all_acked);
        }

        // Idle replicas pin the completed floor: the queue must retain
        // whatever a non-faulted builder still needs.
        let idle_floor = self
            .idle
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .filter(|s| !s.is_idle_faulted_due_to_slow_progress())
            .map(ReplicationSession::idle_replica_progress)
            .min();
        if let Some(idle_floor) = idle_floor {
            if completed == SequenceNumber::NON_INITIALIZED || idle_floor < completed {
                completed = idle_floor;
            }
        }

        if self.use_pc && self.has_quorum_pc {
            let pc_sessions = self.sessions_of(&self.pc);
            let (pc_committed, pc_completed) = if self.write_quorum_pc == 1 && !pc_sessions.is_empty()
            {
                // I/P,S/N transition: the primary is not part of PC, so the
                // lone session's own ack is authoritative.
                let mut apply_acks: Vec<SequenceNumber> = pc_sessions
                    .iter()
                    .map(|s| s.last_apply_lsn_or(completed_floor))
                    .collect();
                apply_acks.sort_unstable();
                (apply_acks[0], apply_acks[0])
            } else {
                let (pc_committed, _, pc_completed) =
                    Self::replicas_progress(completed_floor, &pc_sessions, self.write_quorum_pc);
                (pc_committed, pc_completed)
            };

            committed = min_initialized(committed, pc_committed);
            completed = min_initialized(completed, pc_completed);
        }

        (committed, completed)
    }

    /// Quorum progress over one configuration's sessions.
    ///
    /// `committed`: descending apply acks at index `quorum - 2` (the
    /// primary is an implicit first ack). `completed`: ascending receive
    /// acks of *non-faulted* sessions at index 0, clamped to `committed` so
    /// uncommitted operations stay available for new builds. Faulted
    /// sessions are excluded so a stuck peer cannot pin memory.
    fn replicas_progress(
        completed_floor: SequenceNumber,
        sessions: &[&ReplicationSession],
        write_quorum: u32,
    ) -> (SequenceNumber, SequenceNumber, SequenceNumber) {
        if write_quorum <= 1 {
            return (
                SequenceNumber::NON_INITIALIZED,
                SequenceNumber::NON_INITIALIZED,
                SequenceNumber::NON_INITIALIZED,
            );
        }

        let quorum_index = (write_quorum - 2) as usize;
        assert!(
            quorum_index < sessions.len(),
            "progress computed without enough replicas: index {} >= {}",
            quorum_index,
            sessions.len()
        );

        let mut apply_acks: Vec<SequenceNumber> = sessions
            .iter()
            .map(|s| s.last_apply_lsn_or(completed_floor))
            .collect();
        apply_acks.sort_unstable_by(|a, b| b.cmp(a));
        let committed = apply_acks[quorum_index];
        let all_acked = apply_acks[sessions.len() - 1];

        let non_faulted: Vec<&&ReplicationSession> = sessions
            .iter()
            .filter(|s| !s.is_active_faulted_due_to_slow_progress())
            .collect();
        if non_faulted.is_empty() {
            return (committed, all_acked, SequenceNumber::NON_INITIALIZED);
        }

        let mut receive_acks: Vec<SequenceNumber> = non_faulted
            .iter()
            .map(|s| s.last_receive_lsn_or(completed_floor))
            .collect();
        receive_acks.sort_unstable();
        let completed = receive_acks[0].min(committed);

        (committed, all_acked, completed)
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Installs a reconfiguration's quorum sets.
    ///
    /// Every current-configuration entry must already be known (active or
    /// idle) or carry explicit initial progress; newly added sessions are
    /// seeded with the pending operation range. Previous-configuration
    /// replicas with missing history are paused rather than rejected: PC is
    /// only read for quorum math.
    pub fn update_catchup_configuration(
        &mut self,
        previous: &[ReplicaInformation],
        previous_quorum: u32,
        current: &[ReplicaInformation],
        current_quorum: u32,
        now: Instant,
    ) -> ReplicationResult<PrimaryOutput> {
        assert!(
            self.settings.allow_multiple_quorum_set || self.catch_up.is_none() || !self.use_pc,
            "{}: overlapping quorum sets installed while a catch-up is running",
            self.endpoint_id
        );

        // Validate before mutating anything.
        for info in current {
            let known = self.sessions.contains_key(&info.replica_id);
            if !known && info.current_progress == SequenceNumber::NON_INITIALIZED {
                warn!(
                    endpoint = %self.endpoint_id,
                    replica = %info.replica_id,
                    "configuration names an unknown replica without initial progress"
                );
                return Err(ReplicationError::ReplicaDoesNotExist);
            }
        }

        let old_cc: Vec<ReplicaId> = std::mem::take(&mut self.cc);
        let old_pc: Vec<ReplicaId> = std::mem::take(&mut self.pc);

        let mut new_cc = Vec::new();
        for info in current {
            if !self.sessions.contains_key(&info.replica_id) {
                self.add_seeded_session(info, /* tolerate_missing */ false, now)?;
            }
            let was_idle = self.idle.contains(&info.replica_id);
            if was_idle {
                self.idle.retain(|id| *id != info.replica_id);
                self.copy_until_latest.remove(&info.replica_id);
                self.copy_context_receivers.remove(&info.replica_id);
                let session = self.sessions.get_mut(&info.replica_id).expect("idle session");
                session.on_promote_to_active_secondary(now);
                info!(endpoint = %self.endpoint_id, replica = %info.replica_id, "idle promoted to active");
            }
            let session = self.sessions.get_mut(&info.replica_id).expect("cc session");
            session.must_catch_up = info.must_catch_up;
            new_cc.push(info.replica_id);
        }

        let mut new_pc = Vec::new();
        for info in previous {
            if !self.sessions.contains_key(&info.replica_id) {
                // A PC replica the primary has no history for is paused: it
                // participates in quorum math but receives nothing.
                self.add_seeded_session(info, /* tolerate_missing */ true, now)?;
            }
            new_pc.push(info.replica_id);
        }

        // Close sessions no configuration references anymore.
        for replica_id in old_cc.iter().chain(old_pc.iter()) {
            let still_used = new_cc.contains(replica_id)
                || new_pc.contains(replica_id)
                || self.idle.contains(replica_id);
            if !still_used {
                if let Some(mut session) = self.sessions.remove(replica_id) {
                    info!(endpoint = %self.endpoint_id, replica = %replica_id, "session removed by reconfiguration");
                    session.close();
                }
            }
        }

        self.cc = new_cc;
        self.pc = new_pc;
        self.write_quorum_cc = current_quorum;
        self.write_quorum_pc = previous_quorum;
        self.use_pc = !self.pc.is_empty();
        self.has_quorum_cc = Self::has_enough_replicas(self.cc.len(), current_quorum);
        self.has_quorum_pc = Self::has_enough_replicas(self.pc.len(), previous_quorum);
        self.catchup_completion_lsn = self.queue.last_sequence_number();

        info!(
            endpoint = %self.endpoint_id,
            cc = self.cc.len(),
            pc = self.pc.len(),
            cc_quorum = current_quorum,
            pc_quorum = previous_quorum,
            "configuration updated"
        );

        if !self.settings.allow_multiple_quorum_set && self.catch_up.is_some() {
            // Marker advancement is deferred to the running catch-up.
            return Ok(PrimaryOutput::default());
        }
        Ok(self.update_progress(now))
    }

    /// Ends a reconfiguration: the current configuration stands alone.
    pub fn update_current_configuration(
        &mut self,
        current: &[ReplicaInformation],
        current_quorum: u32,
        now: Instant,
    ) -> ReplicationResult<PrimaryOutput> {
        self.update_catchup_configuration(&[], 0, current, current_quorum, now)
    }

    fn has_enough_replicas(session_count: usize, quorum: u32) -> bool {
        // The primary is part of every quorum.
        quorum <= 1 || session_count + 1 >= quorum as usize
    }

    /// Creates a session for a configuration entry and seeds its sender
    /// with the operations it is missing.
    fn add_seeded_session(
        &mut self,
        info: &ReplicaInformation,
        tolerate_missing: bool,
        now: Instant,
    ) -> ReplicationResult<()> {
        let mut session = ReplicationSession::new(
            format!("{}", self.endpoint_id),
            info.replica_id,
            info.replicator_address.clone(),
            info.incarnation_id,
            &self.settings,
        );

        let start = if info.current_progress.is_valid() {
            info.current_progress.next().max(self.queue.first_sequence_number())
        } else {
            self.queue.first_sequence_number()
        };

        match self.queue.operations_from(start) {
            Some(operations) => {
                let completed_snapshot = self.queue.committed_head().prev();
                session.add_replicate_operations(&operations, completed_snapshot, now);
            }
            None if tolerate_missing => {
                debug!(
                    endpoint = %self.endpoint_id,
                    replica = %info.replica_id,
                    "previous-configuration session paused: history unavailable"
                );
                session.close();
            }
            None => {
                return Err(ReplicationError::InvalidState(format!(
                    "operations from {start} unavailable to seed replica {}",
                    info.replica_id
                )));
            }
        }

        self.sessions.insert(info.replica_id, session);
        Ok(())
    }

    // ========================================================================
    // Build
    // ========================================================================

    /// Starts building an idle replica: opens its session, arranges the
    /// copy-context pipeline for persisted peers, begins the copy stream,
    /// and emits the StartCopy handshake.
    pub fn begin_build_idle(
        &mut self,
        info: &ReplicaInformation,
        provider: &mut dyn StateProvider,
        now: Instant,
    ) -> ReplicationResult<PrimaryOutput> {
        if self.sessions.contains_key(&info.replica_id) {
            return Err(ReplicationError::ReplicaAlreadyExists);
        }

        let mut session = ReplicationSession::new(
            format!("{}", self.endpoint_id),
            info.replica_id,
            info.replicator_address.clone(),
            info.incarnation_id,
            &self.settings,
        );

        let replication_start = self.queue.tail();

        let context = if self.settings.has_persisted_state {
            let receiver = CopyContextReceiver::new(
                format!("{}", self.endpoint_id),
                info.replica_id,
                self.settings.initial_copy_queue_size,
                self.settings.max_copy_queue_size,
            );
            let stream = receiver.stream();
            self.copy_context_receivers.insert(info.replica_id, receiver);
            Some(stream)
        } else {
            None
        };

        let until_latest = provider.supports_copy_until_latest_lsn();
        let up_to = if until_latest {
            SequenceNumber::MAX
        } else {
            replication_start.prev()
        };
        let source = provider.copy_state(up_to, context)?;

        let start_copy: StartCopyBody =
            session.begin_copy(source, self.epoch, replication_start, &self.settings);

        let mut output = PrimaryOutput::default();
        output.sends.push(OutboundEnvelope {
            target_address: session.address().to_string(),
            target_replica: info.replica_id,
            message_id: MessageIdHeader::fresh(),
            body: MessageBody::StartCopy(start_copy),
        });

        info!(
            endpoint = %self.endpoint_id,
            replica = %info.replica_id,
            start = %replication_start,
            until_latest,
            "building idle replica"
        );

        self.idle.push(info.replica_id);
        if until_latest {
            self.copy_until_latest.insert(info.replica_id);
        }
        self.sessions.insert(info.replica_id, session);

        output.merge(self.pump_copy(info.replica_id, now));
        Ok(output)
    }

    /// Removes an idle replica that is no longer wanted.
    pub fn remove_replica(&mut self, replica_id: ReplicaId, now: Instant) -> ReplicationResult<PrimaryOutput> {
        if !self.idle.contains(&replica_id) {
            return Err(ReplicationError::ReplicaDoesNotExist);
        }
        self.idle.retain(|id| *id != replica_id);
        self.copy_until_latest.remove(&replica_id);
        self.copy_context_receivers.remove(&replica_id);
        if let Some(mut session) = self.sessions.remove(&replica_id) {
            session.close();
        }
        info!(endpoint = %self.endpoint_id, replica = %replica_id, "idle replica removed");
        Ok(self.update_progress(now))
    }

    /// Advances one idle's copy enumeration into its send window.
    fn pump_copy(&mut self, replica_id: ReplicaId, now: Instant) -> PrimaryOutput {
        let mut output = PrimaryOutput::default();
        let replication_bound = if self.copy_until_latest.contains(&replica_id) {
            self.queue.last_sequence_number()
        } else {
            SequenceNumber::NON_INITIALIZED // bound fixed at begin: start - 1
        };

        let Some(session) = self.sessions.get_mut(&replica_id) else {
            return output;
        };
        let bound = if replication_bound == SequenceNumber::NON_INITIALIZED {
            // Fixed-bound copy: replication takes over at the start LSN.
            session.replication_start().prev()
        } else {
            replication_bound
        };
        let Some(copy) = session.copy_sender() else {
            return output;
        };

        match copy.pump(bound, now) {
            Ok(pump) => {
                let epoch = self.epoch;
                let batches = pump.batches;
                let session = &self.sessions[&replica_id];
                for batch in batches {
                    Self::push_copy_batch(&mut output, session, batch, epoch);
                }
            }
            Err(error) => {
                warn!(endpoint = %self.endpoint_id, replica = %replica_id, %error, "copy pump failed");
                output.build_completions.push((replica_id, Err(error)));
                self.copy_context_receivers.remove(&replica_id);
            }
        }
        output
    }

    // ========================================================================
    // Catch-up
    // ========================================================================

    /// Begins waiting for replicas to catch up. The wait completes through
    /// a later output, or immediately if already satisfied.
    ///
    /// A `WriteQuorum` wait that includes an unreachable must-catch-up
    /// replica never completes on its own; the reconfiguration authority is
    /// expected to cancel it. Faulted sessions are excluded from memory
    /// reclamation but still gate catch-up.
    pub fn begin_wait_for_catch_up(
        &mut self,
        mode: CatchUpMode,
        now: Instant,
    ) -> PrimaryOutput {
        let target = match mode {
            CatchUpMode::QuorumAll => self.queue.last_sequence_number(),
            CatchUpMode::WriteQuorum => self.catchup_completion_lsn,
        };
        info!(endpoint = %self.endpoint_id, ?mode, %target, "catch-up wait started");
        self.catch_up = Some(CatchUpWaiter { mode, target });
        self.update_progress(now)
    }

    /// Cancels a running catch-up wait.
    pub fn cancel_catch_up(&mut self) -> PrimaryOutput {
        let mut output = PrimaryOutput::default();
        if self.catch_up.take().is_some() {
            output.catch_up_completed = Some(Err(ReplicationError::OperationCanceled));
        }
        output
    }

    fn evaluate_catch_up(&self) -> Option<ReplicationResult<()>> {
        let waiter = self.catch_up.as_ref()?;
        match waiter.mode {
            CatchUpMode::QuorumAll => {
                if self.write_quorum_cc <= 1 && self.cc.is_empty() {
                    return Some(Ok(()));
                }
                if !waiter.target.is_valid() {
                    return Some(Ok(()));
                }
                // Every CC replica must have applied everything.
                let all_acked = self
                    .cc
                    .iter()
                    .filter_map(|id| self.sessions.get(id))
                    .map(|s| s.last_apply_lsn())
                    .min()
                    .unwrap_or(SequenceNumber::NON_INITIALIZED);
                (all_acked >= waiter.target).then_some(Ok(()))
            }
            CatchUpMode::WriteQuorum => {
                if !waiter.target.is_valid() {
                    return Some(Ok(()));
                }
                if self.majority_apply_acked_cc == SequenceNumber::NON_INITIALIZED
                    || self.majority_apply_acked_cc < waiter.target
                {
                    return None;
                }
                let all_must_catch_up_done = self
                    .cc
                    .iter()
                    .filter_map(|id| self.sessions.get(id))
                    .filter(|s| s.must_catch_up)
                    .all(|s| s.last_apply_lsn() >= waiter.target);
                all_must_catch_up_done.then_some(Ok(()))
            }
        }
    }

    // ========================================================================
    // Slow-peer mitigation
    // ========================================================================

    /// Runs on every enqueue: when the queue is filling up, find the peer
    /// responsible and stop servicing it.
    fn mitigate_slow_peers(&mut self, now: Instant) -> PrimaryOutput {
        let mut output = PrimaryOutput::default();
        let usage = self.queue.usage_percent();
        if usage < self.settings.slow_restart_at_queue_usage_percent {
            return output;
        }

        if self.settings.enable_slow_active_secondary_restart {
            output.merge(self.try_fault_slow_active(now));
        }
        if self.settings.enable_slow_idle_restart {
            output.merge(self.try_mitigate_slow_idles(now));
        }
        output
    }

    fn try_fault_slow_active(&mut self, now: Instant) -> PrimaryOutput {
        let mut output = PrimaryOutput::default();
        if self.write_quorum_cc < 2 || !self.has_quorum_cc {
            return output;
        }

        let age = self.queue.first_operation_age(now);
        if age < self.settings.slow_active_secondary_restart_at_operation_age {
            return output;
        }

        // A quorum LSN at or below the queue's first LSN means nothing in
        // the queue has been quorum-acked: the quorum itself is slow, and
        // removing one peer fixes nothing.
        if self.majority_apply_acked_cc <= self.queue.first_sequence_number() {
            return output;
        }

        let non_faulted: Vec<&ReplicationSession> = self
            .cc
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .filter(|s| !s.is_active_faulted_due_to_slow_progress())
            .collect();
        let retain =
            self.write_quorum_cc as u64 + self.settings.slow_active_secondary_additional_replicas_to_retain;
        if (non_faulted.len() as u64) <= retain.saturating_sub(1) {
            return output;
        }

        let Some(slow_replica) = Self::slowest_replica_if_outlier(&non_faulted, self.write_quorum_cc)
        else {
            return output;
        };

        warn!(
            endpoint = %self.endpoint_id,
            replica = %slow_replica,
            usage = self.queue.usage_percent(),
            age_ms = age.as_millis() as u64,
            "slow active secondary detected"
        );
        if let Some(session) = self.sessions.get_mut(&slow_replica) {
            session.fault_active_due_to_slow_progress();
        }
        output.merge(self.update_progress(now));
        output
    }

    /// The lone slowest peer, if its receive-ack average is beyond
    /// `mean + 2 * stddev` of the quorum's and it also has the least
    /// progress.
    fn slowest_replica_if_outlier(
        sessions: &[&ReplicationSession],
        write_quorum: u32,
    ) -> Option<ReplicaId> {
        assert!(write_quorum >= 2, "outlier detection needs a quorum of 2+");
        if sessions.is_empty() {
            return None;
        }

        let mut by_duration: Vec<&&ReplicationSession> = sessions.iter().collect();
        by_duration.sort_by_key(|s| s.avg_receive_ack_duration());
        let slowest = by_duration[by_duration.len() - 1];

        let mut quorum_durations = StandardDeviation::new();
        let upto = (write_quorum as usize - 2).min(by_duration.len() - 1);
        for session in &by_duration[..=upto] {
            quorum_durations.add(session.avg_receive_ack_duration());
        }

        let threshold = quorum_durations.average() + quorum_durations.std_dev() * 2;
        if slowest.avg_receive_ack_duration() <= threshold {
            return None;
        }

        // The slowness must coincide with the least progress.
        let least_progress = sessions
            .iter()
            .min_by_key(|s| s.last_receive_lsn())
            .expect("non-empty");
        (least_progress.replica_id() == slowest.replica_id()).then(|| slowest.replica_id())
    }

    fn try_mitigate_slow_idles(&mut self, now: Instant) -> PrimaryOutput {
        let mut output = PrimaryOutput::default();
        if self.idle.is_empty() {
            return output;
        }

        // First give the idles more room: let the copy cover the pending
        // replication range instead of the queue.
        let last_lsn = self.queue.last_sequence_number();
        let mut extended = false;
        for replica_id in self.idle.clone() {
            if let Some(session) = self.sessions.get_mut(&replica_id) {
                if !session.is_idle_faulted_due_to_slow_progress() {
                    extended |= session.extend_idle_replication_lsn(last_lsn);
                }
            }
        }
        if extended {
            output.merge(self.update_progress(now));
            // Only back off if the extension actually relieved the queue;
            // otherwise fall through and fault in this same pass.
            if self.queue.usage_percent() < self.settings.slow_restart_at_queue_usage_percent {
                return output;
            }
        }

        // Extension was not enough: fault idles pinning the queue.
        let earliest = self.queue.first_sequence_number();
        let mut faulted_any = false;
        for replica_id in self.idle.clone() {
            let Some(session) = self.sessions.get_mut(&replica_id) else {
                continue;
            };
            if session.is_idle_faulted_due_to_slow_progress() {
                continue;
            }
            if session.idle_replica_progress() <= earliest && session.fault_idle_due_to_slow_progress() {
                faulted_any = true;
                self.copy_context_receivers.remove(&replica_id);
            }
        }
        if faulted_any {
            output.merge(self.update_progress(now));
        }
        output
    }

    // ========================================================================
    // Timer & shutdown
    // ========================================================================

    /// Retry tick: retransmissions, copy pumps, StartCopy re-sends, and
    /// induce-fault nags.
    pub fn on_retry_tick(&mut self, now: Instant) -> PrimaryOutput {
        let mut output = PrimaryOutput::default();

        let replica_ids: Vec<ReplicaId> = self.sessions.keys().copied().collect();
        for replica_id in replica_ids {
            output.merge(self.pump_copy(replica_id, now));
            let session = self.sessions.get_mut(&replica_id).expect("listed session");
            let sends = session.on_retry_tick(now);
            Self::push_session_sends(&mut output, &self.sessions[&replica_id], sends, self.epoch);
        }
        output
    }

    /// Cancels everything in flight. `drained` reports whether the pending
    /// replicates had reached quorum before the close.
    pub fn close(&mut self, now: Instant) -> PrimaryOutput {
        let mut output = self.update_progress(now);

        for lsn in std::mem::take(&mut self.pending_replicates) {
            output
                .completed_replicates
                .push((SequenceNumber::new(lsn), Err(ReplicationError::OperationCanceled)));
        }
        output.merge(self.cancel_catch_up());

        for session in self.sessions.values_mut() {
            session.close();
        }
        for (replica_id, _) in self.copy_context_receivers.drain() {
            debug!(endpoint = %self.endpoint_id, replica = %replica_id, "copy context receiver dropped at close");
        }
        info!(endpoint = %self.endpoint_id, "replica manager closed");
        output
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn sessions_of(&self, ids: &[ReplicaId]) -> Vec<&ReplicationSession> {
        ids.iter().filter_map(|id| self.sessions.get(id)).collect()
    }

    /// CC, idle (non-faulted), and PC-only sessions, deduplicated.
    fn all_send_targets(&self) -> Vec<ReplicaId> {
        let mut targets: Vec<ReplicaId> = Vec::new();
        for id in &self.cc {
            targets.push(*id);
        }
        for id in &self.idle {
            if let Some(session) = self.sessions.get(id) {
                if !session.is_idle_faulted_due_to_slow_progress() {
                    targets.push(*id);
                }
            }
        }
        if self.use_pc {
            for id in &self.pc {
                if !targets.contains(id) {
                    targets.push(*id);
                }
            }
        }
        targets
    }

    fn find_session_by_endpoint(
        &self,
        address: &str,
        endpoint: ReplicationEndpointId,
    ) -> Option<ReplicaId> {
        self.sessions
            .values()
            .find(|s| {
                s.replica_id() == endpoint.replica_id
                    && s.has_endpoint(address, endpoint.incarnation_id)
            })
            .map(ReplicationSession::replica_id)
    }

    fn push_session_sends(
        output: &mut PrimaryOutput,
        session: &ReplicationSession,
        sends: Vec<SessionSend>,
        epoch: Epoch,
    ) {
        for send in sends {
            match send {
                SessionSend::Replication(batch) => {
                    Self::push_replication_batch(output, session, batch, epoch);
                }
                SessionSend::Copy(batch) => {
                    Self::push_copy_batch(output, session, batch, epoch);
                }
                SessionSend::StartCopy(body) => {
                    output.sends.push(OutboundEnvelope {
                        target_address: session.address().to_string(),
                        target_replica: session.replica_id(),
                        message_id: MessageIdHeader::fresh(),
                        body: MessageBody::StartCopy(body),
                    });
                }
                SessionSend::InduceFault(reason) => {
                    output.sends.push(OutboundEnvelope {
                        target_address: session.address().to_string(),
                        target_replica: session.replica_id(),
                        message_id: MessageIdHeader::fresh(),
                        body: MessageBody::InduceFault(InduceFaultBody {
                            target_replica_id: session.replica_id(),
                            target_incarnation: session.incarnation(),
                            reason,
                        }),
                    });
                }
            }
        }
    }

    fn push_replication_batch(
        output: &mut PrimaryOutput,
        session: &ReplicationSession,
        batch: SendBatch,
        epoch: Epoch,
    ) {
        let body = ReplicationOperationBody {
            operations: batch.operations.iter().map(|op| op.to_wire()).collect(),
            primary_epoch: epoch,
            completed_sequence_number: batch.completed_snapshot,
            last_in_batch: true,
        };
        output.sends.push(OutboundEnvelope {
            target_address: session.address().to_string(),
            target_replica: session.replica_id(),
            message_id: batch.message_id,
            body: MessageBody::ReplicationOperation(body),
        });
    }

    fn push_copy_batch(
        output: &mut PrimaryOutput,
        session: &ReplicationSession,
        batch: SendBatch,
        epoch: Epoch,
    ) {
        for op in &batch.operations {
            let is_last = session.copy_is_last(op.sequence_number());
            output.sends.push(OutboundEnvelope {
                target_address: session.address().to_string(),
                target_replica: session.replica_id(),
                message_id: batch.message_id,
                body: MessageBody::CopyOperation(CopyOperationBody {
                    replica_id: session.replica_id(),
                    primary_epoch: epoch,
                    operation: op.to_wire(),
                    is_last,
                }),
            });
        }
    }
}

/// Minimum treating `NON_INITIALIZED` as absent.
fn min_initialized(a: SequenceNumber, b: SequenceNumber) -> SequenceNumber {
    if b == SequenceNumber::NON_INITIALIZED {
        a
    } else if a == SequenceNumber::NON_INITIALIZED {
        b
    } else {
        a.min(b)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use tidemark_types::{IncarnationId, PartitionId, ReplicaRole};
    use uuid::Uuid;

    use super::*;

    fn endpoint(replica: u64) -> ReplicationEndpointId {
        ReplicationEndpointId::with_incarnation(
            PartitionId::new(Uuid::nil()),
            ReplicaId::new(replica),
            IncarnationId::new(Uuid::nil()),
        )
    }

    fn info(replica: u64) -> ReplicaInformation {
        ReplicaInformation {
            replica_id: ReplicaId::new(replica),
            role: ReplicaRole::ActiveSecondary,
            replicator_address: format!("10.0.0.{replica}:9099"),
            incarnation_id: IncarnationId::new(Uuid::nil()),
            current_progress: SequenceNumber::INVALID,
            catch_up_capability: SequenceNumber::NON_INITIALIZED,
            must_catch_up: false,
        }
    }

    fn manager(secondaries: &[u64], quorum: u32) -> ReplicaManager {
        let mut manager = ReplicaManager::new(
            endpoint(1),
            Epoch::new(1, 1),
            Arc::new(ReplicatorSettings::default()),
            SequenceNumber::new(1),
        );
        let infos: Vec<ReplicaInformation> = secondaries.iter().map(|r| info(*r)).collect();
        manager
            .update_current_configuration(&infos, quorum, Instant::now())
            .expect("configure");
        manager
    }

    fn ack(manager: &mut ReplicaManager, replica: u64, receive: i64, apply: i64, now: Instant) {
        let body = AckBody::replication(SequenceNumber::new(receive), SequenceNumber::new(apply));
        manager.process_ack(
            &format!("10.0.0.{replica}:9099"),
            endpoint(replica),
            &body,
            now,
        );
    }

    fn payload() -> Vec<Bytes> {
        vec![Bytes::from_static(b"op")]
    }

    #[test]
    fn committed_is_quorum_apply_and_completed_is_min_receive() {
        let mut m = manager(&[2, 3], 2);
        let now = Instant::now();
        for _ in 0..4 {
            m.replicate(payload(), now).expect("replicate");
        }

        // Replica 2 applied everything; replica 3 only received LSN 1.
        ack(&mut m, 2, 4, 4, now);
        ack(&mut m, 3, 1, SequenceNumber::NON_INITIALIZED.as_i64(), now);

        // Quorum of 2 = primary + the best remote ack.
        assert_eq!(m.queue().committed_head(), SequenceNumber::new(5));
        // Memory release is bounded by the slowest receive ack.
        assert_eq!(m.queue().first_sequence_number(), SequenceNumber::new(2));
    }

    #[test]
    fn pc_singleton_uses_the_lone_session_ack() {
        let mut m = manager(&[2], 2);
        let now = Instant::now();
        for _ in 0..3 {
            m.replicate(payload(), now).expect("replicate");
        }
        ack(&mut m, 2, 3, 3, now);
        assert_eq!(m.queue().committed_head(), SequenceNumber::new(4));

        // I/P,S/N: PC holds only replica 3 with quorum 1; its ack alone is
        // authoritative and caps progress.
        let previous = [info(3)];
        let current = [info(2)];
        m.update_catchup_configuration(&previous, 1, &current, 2, now)
            .expect("reconfigure");

        let (lsn, _) = m.replicate(payload(), now).expect("replicate");
        assert_eq!(lsn, SequenceNumber::new(4));

        // Replica 2's ack is not enough: the lone PC session gates commit.
        ack(&mut m, 2, 4, 4, now);
        assert!(m.pending_replicate_count() > 0);

        ack(&mut m, 3, 4, 4, now);
        assert_eq!(m.pending_replicate_count(), 0);
    }

    #[test]
    fn tombstone_watermark_tracks_all_acked() {
        let mut m = manager(&[2, 3], 2);
        let now = Instant::now();
        for _ in 0..3 {
            m.replicate(payload(), now).expect("replicate");
        }
        ack(&mut m, 2, 3, 3, now);
        assert_eq!(m.tombstone_low_watermark().lsn(), SequenceNumber::INVALID);

        // Only once *every* replica applied an LSN can tombstones below it
        // be collected.
        ack(&mut m, 3, 2, 2, now);
        assert_eq!(m.tombstone_low_watermark().lsn(), SequenceNumber::new(2));
    }

    #[test]
    fn queue_health_reflects_backlog() {
        let mut m = manager(&[2], 2);
        let now = Instant::now();
        for _ in 0..3 {
            m.replicate(payload(), now).expect("replicate");
        }
        let health = m.queue_health();
        assert_eq!(health.operation_count, 3);
        assert_eq!(health.first_sequence_number, SequenceNumber::new(1));
        assert_eq!(health.last_sequence_number, SequenceNumber::new(3));
        assert!(health.memory_bytes > 0);
    }

    #[test]
    fn no_fault_when_quorum_has_not_advanced_past_the_queue() {
        let settings = ReplicatorSettings {
            initial_replication_queue_size: 8,
            max_replication_queue_size: 8,
            ..Default::default()
        };
        let mut m = ReplicaManager::new(
            endpoint(1),
            Epoch::new(1, 1),
            Arc::new(settings),
            SequenceNumber::new(1),
        );
        let infos = [info(2), info(3), info(4)];
        let t0 = Instant::now();
        m.update_current_configuration(&infos, 2, t0).expect("configure");

        for _ in 0..5 {
            m.replicate(payload(), t0).expect("replicate");
        }
        ack(&mut m, 2, 2, 2, t0 + std::time::Duration::from_millis(50));
        ack(&mut m, 3, 2, 2, t0 + std::time::Duration::from_millis(50));
        ack(&mut m, 4, 1, 1, t0 + std::time::Duration::from_millis(500));
        assert_eq!(m.queue().first_sequence_number(), SequenceNumber::new(2));

        // The quorum LSN sits exactly at the queue's first LSN: nothing in
        // the queue is quorum-acked, so the whole quorum is slow and no
        // single peer may be scapegoated, outlier or not.
        let t1 = t0 + std::time::Duration::from_secs(40);
        for _ in 0..3 {
            m.replicate(payload(), t1).expect("replicate");
        }
        let session = m.session(ReplicaId::new(4)).expect("session");
        assert!(!session.is_active_faulted_due_to_slow_progress());
    }

    #[test]
    fn insufficient_idle_extension_still_faults_in_the_same_pass() {
        use crate::testing::MockStateProvider;

        let settings = ReplicatorSettings {
            initial_replication_queue_size: 8,
            max_replication_queue_size: 8,
            max_pending_unacked_operations: 2,
            ..Default::default()
        };
        let mut m = ReplicaManager::new(
            endpoint(1),
            Epoch::new(1, 1),
            Arc::new(settings),
            SequenceNumber::new(1),
        );
        let now = Instant::now();
        m.update_current_configuration(&[info(2)], 2, now)
            .expect("configure");

        // Idle 9's copy enumerated completely, so its replication bound is
        // extendable; idle 10's enumeration stalls behind the send window
        // and keeps pinning the queue at its replication start.
        let mut empty_copy = MockStateProvider::with_copy_payloads(0);
        m.begin_build_idle(&info(9), &mut empty_copy, now).expect("build 9");
        let mut long_copy = MockStateProvider::with_copy_payloads(5);
        m.begin_build_idle(&info(10), &mut long_copy, now).expect("build 10");

        for _ in 0..7 {
            m.replicate(payload(), now).expect("replicate");
        }

        // Extending idle 9 did not relieve the queue, so the pinning idle
        // is faulted in the same mitigation pass, not deferred to the next
        // enqueue.
        let pinned = m.session(ReplicaId::new(10)).expect("session 10");
        assert!(pinned.is_idle_faulted_due_to_slow_progress());
        let extended = m.session(ReplicaId::new(9)).expect("session 9");
        assert!(!extended.is_idle_faulted_due_to_slow_progress());
    }

    #[test]
    fn unknown_replica_without_progress_fails_configuration() {
        let mut m = manager(&[2], 2);
        let mut unknown = info(9);
        unknown.current_progress = SequenceNumber::NON_INITIALIZED;
        let result = m.update_current_configuration(&[info(2), unknown], 2, Instant::now());
        assert_eq!(result.unwrap_err(), ReplicationError::ReplicaDoesNotExist);
    }

    #[test]
    fn removed_session_stops_receiving() {
        let mut m = manager(&[2, 3], 2);
        let now = Instant::now();
        m.replicate(payload(), now).expect("replicate");

        // Drop replica 3 from the configuration entirely.
        m.update_current_configuration(&[info(2)], 2, now)
            .expect("reconfigure");
        assert!(m.session(ReplicaId::new(3)).is_none());

        let (_, output) = m.replicate(payload(), now).expect("replicate");
        assert!(output
            .sends
            .iter()
            .all(|envelope| envelope.target_replica != ReplicaId::new(3)));
    }
}
