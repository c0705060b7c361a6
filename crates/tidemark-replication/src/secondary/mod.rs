//! Secondary-role replication.
//!
//! The [`SecondaryReplicator`] owns the two ordered receive pipelines
//! (replication and copy), sends acknowledgments back to the primary,
//! streams its copy context up during a persisted-state build, and
//! enforces the epoch barrier: no operation of a newer epoch reaches the
//! consumer before every operation of the older epoch has been applied and
//! the state provider has persisted the new epoch.

mod copy_receiver;
mod replication_receiver;

pub use copy_receiver::{CopyProgress, CopyReceiver};
pub use replication_receiver::{ReplicationProgress, ReplicationReceiver};

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use tidemark_types::{Epoch, ProgressVectorEntry, ReplicationEndpointId, SequenceNumber};
use tidemark_wire::{
    AckBody, CopyContextAckBody, CopyContextOperationBody, CopyOperationBody, FromHeader,
    InduceFaultBody, MessageBody, MessageIdHeader, OperationMetadata, ReplicationOperationBody,
    StartCopyBody, WireOperation,
};

use crate::config::ReplicatorSettings;
use crate::error::{ReplicationError, ReplicationResult};
use crate::operation::Operation;
use crate::provider::{OperationDataStream, StateProvider};
use crate::queue::OperationQueue;
use crate::replica_manager::OutboundEnvelope;
use crate::sender::ReliableOperationSender;
use crate::stream::{FaultKind, OperationStream};

// ============================================================================
// Output
// ============================================================================

/// Effects produced by one secondary event.
#[derive(Debug, Default)]
pub struct SecondaryOutput {
    /// Messages to hand to the transport (acks, copy context).
    pub sends: Vec<OutboundEnvelope>,

    /// A deferred epoch update finished.
    pub epoch_updated: Option<ReplicationResult<()>>,

    /// The close drain finished; the role can be torn down.
    pub close_completed: bool,

    /// The role faulted; the partition controller should rebuild us.
    pub fault: Option<(FaultKind, ReplicationError)>,
}

impl SecondaryOutput {
    pub fn merge(&mut self, other: SecondaryOutput) {
        self.sends.extend(other.sends);
        if other.epoch_updated.is_some() {
            self.epoch_updated = other.epoch_updated;
        }
        self.close_completed |= other.close_completed;
        if other.fault.is_some() && self.fault.is_none() {
            self.fault = other.fault;
        }
    }
}

/// Which secondary flavor this replica currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryRoleKind {
    /// Being built; not yet part of any configuration.
    Idle,

    /// Configured member of the replica set.
    Active,
}

// ============================================================================
// Copy-context sender (secondary side of a persisted build)
// ============================================================================

/// Streams the secondary's copy context to the primary, reliably.
struct CopyContextSender {
    sender: ReliableOperationSender,
    source: Option<Box<dyn OperationDataStream>>,
    next_lsn: SequenceNumber,
    last_lsn: SequenceNumber,
    exhausted: bool,
}

impl CopyContextSender {
    fn new(source: Box<dyn OperationDataStream>, settings: &ReplicatorSettings) -> Self {
        let mut sender = ReliableOperationSender::new(
            "copy-context".into(),
            settings.max_pending_unacked_operations,
            settings.ack_duration_decay_factor,
            settings.ack_duration_decay_interval,
        );
        sender.open();
        Self {
            sender,
            source: Some(source),
            next_lsn: SequenceNumber::new(1),
            last_lsn: SequenceNumber::NON_INITIALIZED,
            exhausted: false,
        }
    }

    /// Pulls context into the send window; returns operations to transmit.
    fn pump(&mut self, epoch: Epoch, now: Instant) -> ReplicationResult<Vec<(WireOperation, bool)>> {
        while !self.exhausted && self.sender.has_window_room() {
            let Some(source) = self.source.as_mut() else {
                break;
            };
            match source.next()? {
                Some(segments) => {
                    let op = Arc::new(Operation::new(
                        OperationMetadata::normal(self.next_lsn),
                        epoch,
                        segments,
                    ));
                    self.sender.add(op, SequenceNumber::NON_INITIALIZED, now);
                    self.next_lsn = self.next_lsn.next();
                }
                None => {
                    // Zero-buffer terminator carries the last flag.
                    let op = Arc::new(Operation::new(
                        OperationMetadata::normal(self.next_lsn),
                        epoch,
                        Vec::new(),
                    ));
                    self.sender.add(op, SequenceNumber::NON_INITIALIZED, now);
                    self.last_lsn = self.next_lsn;
                    self.next_lsn = self.next_lsn.next();
                    self.exhausted = true;
                    self.source = None;
                }
            }
        }

        Ok(self.collect(now))
    }

    fn on_retry_tick(&mut self, now: Instant) -> Vec<(WireOperation, bool)> {
        self.collect(now)
    }

    fn collect(&mut self, now: Instant) -> Vec<(WireOperation, bool)> {
        match self.sender.collect_send(now) {
            Some(batch) => batch
                .operations
                .iter()
                .map(|op| (op.to_wire(), op.sequence_number() == self.last_lsn))
                .collect(),
            None => Vec::new(),
        }
    }

    fn process_ack(&mut self, acked: SequenceNumber, now: Instant) {
        self.sender
            .process_ack(acked, SequenceNumber::NON_INITIALIZED, now);
    }

    fn is_done(&self) -> bool {
        self.exhausted && !self.sender.has_unacked()
    }
}

// ============================================================================
// Secondary Replicator
// ============================================================================

/// Secondary-role façade: receive pipelines, acks, build participation,
/// epoch barrier, and close drain.
pub struct SecondaryReplicator {
    endpoint_id: ReplicationEndpointId,
    settings: Arc<ReplicatorSettings>,
    epoch: Epoch,
    role: SecondaryRoleKind,

    replication: Option<ReplicationReceiver>,
    copy: Option<CopyReceiver>,
    context: Option<CopyContextSender>,

    /// Ack target, learned from the primary's first message.
    primary: Option<(String, ReplicationEndpointId)>,

    /// Epoch barrier in flight: the new epoch plus batches held back until
    /// the old epoch drains.
    pending_epoch: Option<Epoch>,
    held_batches: Vec<ReplicationOperationBody>,

    /// End-of-stream the close drain waits on.
    close_eos: Option<Arc<Operation>>,
    closing: bool,
    close_done: bool,

    faulted: Option<ReplicationError>,
    progress_vector: Vec<ProgressVectorEntry>,
}

impl SecondaryReplicator {
    /// A fresh idle, waiting for StartCopy to learn its replication start.
    pub fn new_idle(
        endpoint_id: ReplicationEndpointId,
        epoch: Epoch,
        settings: Arc<ReplicatorSettings>,
    ) -> Self {
        let copy = CopyReceiver::new(format!("{endpoint_id}"), &settings);
        Self {
            endpoint_id,
            settings,
            epoch,
            role: SecondaryRoleKind::Idle,
            replication: None,
            copy: Some(copy),
            context: None,
            primary: None,
            pending_epoch: None,
            held_batches: Vec::new(),
            close_eos: None,
            closing: false,
            close_done: false,
            faulted: None,
            progress_vector: Vec::new(),
        }
    }

    /// An active secondary that adopts an existing queue (demotion from
    /// primary keeps all replication state).
    pub fn from_queue(
        endpoint_id: ReplicationEndpointId,
        epoch: Epoch,
        settings: Arc<ReplicatorSettings>,
        queue: OperationQueue,
    ) -> Self {
        let replication =
            ReplicationReceiver::from_queue(format!("{endpoint_id}"), &settings, queue);
        Self {
            endpoint_id,
            settings,
            epoch,
            role: SecondaryRoleKind::Active,
            replication: Some(replication),
            copy: None,
            context: None,
            primary: None,
            pending_epoch: None,
            held_batches: Vec::new(),
            close_eos: None,
            closing: false,
            close_done: false,
            faulted: None,
            progress_vector: Vec::new(),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn role(&self) -> SecondaryRoleKind {
        self.role
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.is_some()
    }

    /// Consumer-facing replication stream.
    pub fn replication_stream(&self) -> Option<OperationStream> {
        self.replication.as_ref().map(ReplicationReceiver::stream)
    }

    /// Consumer-facing copy stream.
    pub fn copy_stream(&self) -> Option<OperationStream> {
        self.copy.as_ref().map(CopyReceiver::stream)
    }

    /// Last LSN this secondary has received in order.
    pub fn current_progress(&self) -> SequenceNumber {
        self.replication
            .as_ref()
            .map(|r| r.progress().receive)
            .unwrap_or(SequenceNumber::NON_INITIALIZED)
    }

    /// Last LSN the consumer has applied.
    pub fn applied_progress(&self) -> SequenceNumber {
        self.replication
            .as_ref()
            .map(|r| r.progress().apply)
            .unwrap_or(SequenceNumber::NON_INITIALIZED)
    }

    pub fn progress_vector(&self) -> &[ProgressVectorEntry] {
        &self.progress_vector
    }

    /// Promotion: the queue moves to the new primary role object.
    pub fn into_queue(mut self) -> Option<OperationQueue> {
        self.replication.take().map(ReplicationReceiver::into_queue)
    }

    /// Idle became a configured member.
    pub fn promote_to_active(&mut self) {
        info!(endpoint = %self.endpoint_id, "idle promoted to active secondary");
        self.role = SecondaryRoleKind::Active;
    }

    // ========================================================================
    // Inbound: build
    // ========================================================================

    /// StartCopy from the building primary: fixes the replication start
    /// LSN and, for persisted state, begins streaming copy context up.
    pub fn process_start_copy(
        &mut self,
        from: &FromHeader,
        body: &StartCopyBody,
        provider: &mut dyn StateProvider,
        now: Instant,
    ) -> SecondaryOutput {
        let mut output = SecondaryOutput::default();
        if self.faulted.is_some() {
            return output;
        }
        if body.epoch < self.epoch {
            debug!(endpoint = %self.endpoint_id, epoch = %body.epoch, "stale StartCopy dropped");
            return output;
        }

        self.primary = Some((from.address.clone(), from.endpoint_id));
        self.epoch = self.epoch.max(body.epoch);

        if self.replication.is_none() {
            self.replication = Some(ReplicationReceiver::new(
                format!("{}", self.endpoint_id),
                &self.settings,
                body.replication_start_sequence,
            ));
            if let Some(copy) = self.copy.as_mut() {
                copy.set_replication_start(body.replication_start_sequence);
            }
            info!(
                endpoint = %self.endpoint_id,
                start = %body.replication_start_sequence,
                "copy started"
            );
        }

        if self.settings.has_persisted_state && self.context.is_none() {
            match provider.copy_context() {
                Ok(Some(source)) => {
                    self.context = Some(CopyContextSender::new(source, &self.settings));
                    output.merge(self.pump_context(now));
                }
                Ok(None) => {}
                Err(error) => {
                    output.merge(self.fault(FaultKind::Transient, error, now));
                }
            }
        }

        output
    }

    /// Copy operations from the primary.
    pub fn process_copy_batch(
        &mut self,
        from: &FromHeader,
        body: &CopyOperationBody,
        now: Instant,
    ) -> SecondaryOutput {
        let mut output = SecondaryOutput::default();
        if self.faulted.is_some() {
            return output;
        }
        if body.primary_epoch < self.epoch {
            debug!(endpoint = %self.endpoint_id, "copy operation from older epoch dropped");
            return output;
        }
        self.primary = Some((from.address.clone(), from.endpoint_id));

        let Some(copy) = self.copy.as_mut() else {
            debug!(endpoint = %self.endpoint_id, "copy operation without a copy receiver");
            return output;
        };
        match copy.process_operation(body, now) {
            Ok(_) => {
                output.merge(self.send_ack(now));
            }
            Err(error) => {
                warn!(endpoint = %self.endpoint_id, %error, "copy receive failed");
                output.merge(self.fault(FaultKind::Transient, error, now));
            }
        }
        output
    }

    /// Primary's progress on our copy-context stream.
    pub fn process_copy_context_ack(
        &mut self,
        body: &CopyContextAckBody,
        now: Instant,
    ) -> SecondaryOutput {
        let mut output = SecondaryOutput::default();
        if self.faulted.is_some() {
            return output;
        }

        if body.error_code != 0 {
            let error = ReplicationError::from_wire_code(body.error_code)
                .unwrap_or(ReplicationError::OperationFailed);
            warn!(endpoint = %self.endpoint_id, %error, "primary failed our copy context");
            return self.fault(FaultKind::Transient, error, now);
        }

        if let Some(context) = self.context.as_mut() {
            context.process_ack(body.sequence_number, now);
            if context.is_done() {
                debug!(endpoint = %self.endpoint_id, "copy context fully acknowledged");
                self.context = None;
            } else {
                output.merge(self.pump_context(now));
            }
        }
        output
    }

    // ========================================================================
    // Inbound: replication
    // ========================================================================

    /// A replication batch from the primary. Batches from a newer epoch
    /// are held until the epoch barrier completes.
    pub fn process_replication_batch(
        &mut self,
        from: &FromHeader,
        body: &ReplicationOperationBody,
        provider: &mut dyn StateProvider,
        now: Instant,
    ) -> SecondaryOutput {
        let mut output = SecondaryOutput::default();
        if self.faulted.is_some() || self.closing {
            return output;
        }
        if body.primary_epoch < self.epoch {
            debug!(
                endpoint = %self.endpoint_id,
                from_epoch = %body.primary_epoch,
                "replication batch from older epoch dropped"
            );
            return output;
        }
        self.primary = Some((from.address.clone(), from.endpoint_id));

        if body.primary_epoch > self.epoch || self.pending_epoch.is_some() {
            // Epoch boundary: the batch waits behind the barrier.
            let target = self
                .pending_epoch
                .map_or(body.primary_epoch, |pending| pending.max(body.primary_epoch));
            self.pending_epoch = Some(target);
            self.held_batches.push(body.clone());
            output.merge(self.try_complete_epoch_barrier(provider, now));
            return output;
        }

        output.merge(self.apply_replication_batch(body, now));
        output
    }

    fn apply_replication_batch(
        &mut self,
        body: &ReplicationOperationBody,
        now: Instant,
    ) -> SecondaryOutput {
        let mut output = SecondaryOutput::default();
        let Some(replication) = self.replication.as_mut() else {
            debug!(endpoint = %self.endpoint_id, "replication batch before StartCopy dropped");
            return output;
        };

        match replication.process_batch(body, now) {
            Ok(_) => output.merge(self.send_ack(now)),
            Err(error) => {
                warn!(endpoint = %self.endpoint_id, %error, "replication receive failed");
                output.merge(self.fault(FaultKind::Transient, error, now));
            }
        }
        output
    }

    /// Explicit ack solicitation.
    pub fn process_request_ack(&mut self, from: &FromHeader, now: Instant) -> SecondaryOutput {
        self.primary = Some((from.address.clone(), from.endpoint_id));
        self.send_ack(now)
    }

    /// Primary gave up on us; recycle.
    pub fn process_induce_fault(&mut self, body: &InduceFaultBody, now: Instant) -> SecondaryOutput {
        if body.target_replica_id != self.endpoint_id.replica_id
            || body.target_incarnation != self.endpoint_id.incarnation_id
        {
            return SecondaryOutput::default();
        }
        warn!(endpoint = %self.endpoint_id, reason = %body.reason, "fault induced by primary");
        self.fault(FaultKind::Transient, ReplicationError::OperationFailed, now)
    }

    // ========================================================================
    // Consumer interaction
    // ========================================================================

    /// The consumer applied one replication operation.
    pub fn ack_replication_operation(
        &mut self,
        op: &Arc<Operation>,
        provider: &mut dyn StateProvider,
        now: Instant,
    ) -> SecondaryOutput {
        let mut output = SecondaryOutput::default();

        if op.is_end_of_stream() {
            op.acknowledge();
            if self.closing && self.close_eos.is_some() {
                self.close_eos = None;
                self.close_done = true;
                output.close_completed = true;
            }
            return output;
        }

        if let Some(replication) = self.replication.as_mut() {
            replication.on_operation_acked(op, now);
            if self.settings.require_service_ack {
                output.merge(self.send_ack(now));
            }
        }

        output.merge(self.try_complete_epoch_barrier(provider, now));
        output.merge(self.check_close_drained());
        output
    }

    /// Polls the consumer fault channels; a reported fault tears the role
    /// down.
    pub fn poll_stream_faults(&mut self, now: Instant) -> SecondaryOutput {
        let mut reported = None;
        if let Some(replication) = self.replication.as_ref() {
            reported = reported.or_else(|| replication.dispatch_queue().take_fault());
        }
        if let Some(copy) = self.copy.as_ref() {
            reported = reported.or_else(|| copy.dispatch_queue().take_fault());
        }

        match reported {
            Some(kind) => {
                warn!(endpoint = %self.endpoint_id, ?kind, "consumer reported stream fault");
                let mut output = self.fault(kind, ReplicationError::OperationFailed, now);
                // Teardown already happened; still flush a final ack so the
                // primary learns our last position.
                output.merge(self.send_ack(now));
                output
            }
            None => SecondaryOutput::default(),
        }
    }

    // ========================================================================
    // Epoch updates
    // ========================================================================

    /// Controller-driven epoch update. Completes immediately when the
    /// pipelines are drained; otherwise defers until the consumer catches
    /// up, and the completion rides a later output.
    pub fn update_epoch(
        &mut self,
        epoch: Epoch,
        provider: &mut dyn StateProvider,
        now: Instant,
    ) -> ReplicationResult<SecondaryOutput> {
        if let Some(error) = &self.faulted {
            return Err(error.clone());
        }
        if epoch < self.epoch {
            return Err(ReplicationError::InvalidEpoch);
        }
        if epoch == self.epoch {
            let mut output = SecondaryOutput::default();
            output.epoch_updated = Some(Ok(()));
            return Ok(output);
        }

        self.pending_epoch = Some(
            self.pending_epoch
                .map_or(epoch, |pending| pending.max(epoch)),
        );
        Ok(self.try_complete_epoch_barrier(provider, now))
    }

    /// Re-checks a pending epoch barrier. The drain it waits on advances
    /// as the consumer empties the dispatch queue, which produces no event
    /// of its own; the host polls this from its tick.
    pub fn poll_epoch_barrier(
        &mut self,
        provider: &mut dyn StateProvider,
        now: Instant,
    ) -> SecondaryOutput {
        self.try_complete_epoch_barrier(provider, now)
    }

    /// Runs the barrier: when every dispatched operation of the old epoch
    /// has been applied, persist the new epoch and release held batches.
    fn try_complete_epoch_barrier(
        &mut self,
        provider: &mut dyn StateProvider,
        now: Instant,
    ) -> SecondaryOutput {
        let mut output = SecondaryOutput::default();
        let Some(new_epoch) = self.pending_epoch else {
            return output;
        };

        let drained = self.replication.as_ref().map_or(true, ReplicationReceiver::is_drained);
        if !drained {
            return output;
        }

        let previous_last = self.applied_progress();
        match provider.update_epoch(new_epoch, previous_last) {
            Ok(()) => {
                info!(
                    endpoint = %self.endpoint_id,
                    old = %self.epoch,
                    new = %new_epoch,
                    last_lsn = %previous_last,
                    "epoch barrier complete"
                );
                self.progress_vector
                    .push(ProgressVectorEntry::new(self.epoch, previous_last));
                self.epoch = new_epoch;
                self.pending_epoch = None;
                output.epoch_updated = Some(Ok(()));

                // Release the batches that were waiting behind the barrier.
                let held = std::mem::take(&mut self.held_batches);
                for body in held {
                    if body.primary_epoch > self.epoch {
                        // A yet-newer epoch: re-arm the barrier.
                        self.pending_epoch = Some(body.primary_epoch);
                        self.held_batches.push(body);
                        continue;
                    }
                    output.merge(self.apply_replication_batch(&body, now));
                }
            }
            Err(error) => {
                warn!(endpoint = %self.endpoint_id, %error, "state provider rejected epoch update");
                output.epoch_updated = Some(Err(error.clone()));
                output.merge(self.fault(FaultKind::Transient, error, now));
            }
        }
        output
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Begins a graceful close: with stream faults and EOS acks enabled the
    /// consumer sees an end-of-stream operation and the close completes when
    /// it is acknowledged; otherwise the close completes immediately.
    pub fn begin_close(&mut self, now: Instant) -> SecondaryOutput {
        let mut output = SecondaryOutput::default();
        self.closing = true;

        if self.settings.use_stream_faults_and_end_of_stream_acks {
            if let Some(replication) = self.replication.as_mut() {
                let eos = replication.enqueue_end_of_stream(self.epoch);
                self.close_eos = Some(eos);
            }
        }
        if let Some(copy) = self.copy.as_mut() {
            if !copy.is_done() {
                copy.abandon(now);
            }
        }

        if self.close_eos.is_none() {
            self.close_done = true;
            output.close_completed = true;
        }
        output
    }

    fn check_close_drained(&mut self) -> SecondaryOutput {
        let mut output = SecondaryOutput::default();
        if self.closing && !self.close_done && self.close_eos.is_none() {
            self.close_done = true;
            output.close_completed = true;
        }
        output
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Batched-ack tick: flush the current ack, retransmit copy context.
    pub fn on_batch_ack_tick(&mut self, now: Instant) -> SecondaryOutput {
        let mut output = self.send_ack(now);
        if let Some(context) = self.context.as_mut() {
            let ops = context.on_retry_tick(now);
            Self::push_context_ops(
                &mut output,
                self.primary.as_ref(),
                self.endpoint_id,
                ops,
            );
        }
        output
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn pump_context(&mut self, now: Instant) -> SecondaryOutput {
        let mut output = SecondaryOutput::default();
        let epoch = self.epoch;
        let Some(context) = self.context.as_mut() else {
            return output;
        };
        match context.pump(epoch, now) {
            Ok(ops) => {
                Self::push_context_ops(&mut output, self.primary.as_ref(), self.endpoint_id, ops);
            }
            Err(error) => {
                warn!(endpoint = %self.endpoint_id, %error, "copy context enumeration failed");
                output.merge(self.fault(FaultKind::Transient, error, now));
            }
        }
        output
    }

    fn push_context_ops(
        output: &mut SecondaryOutput,
        primary: Option<&(String, ReplicationEndpointId)>,
        endpoint_id: ReplicationEndpointId,
        ops: Vec<(WireOperation, bool)>,
    ) {
        let Some((address, _)) = primary else {
            return;
        };
        for (operation, is_last) in ops {
            output.sends.push(OutboundEnvelope {
                target_address: address.clone(),
                target_replica: endpoint_id.replica_id,
                message_id: MessageIdHeader::fresh(),
                body: MessageBody::CopyContextOperation(CopyContextOperationBody {
                    replica_id: endpoint_id.replica_id,
                    operation,
                    is_last,
                }),
            });
        }
    }

    /// The combined replication + copy acknowledgment for the primary.
    fn send_ack(&mut self, _now: Instant) -> SecondaryOutput {
        let mut output = SecondaryOutput::default();
        let Some((address, primary_endpoint)) = self.primary.clone() else {
            return output;
        };

        let (replication_receive, replication_quorum) = match self.replication.as_ref() {
            Some(replication) => {
                let progress = replication.progress();
                (progress.receive, progress.apply)
            }
            None => (
                SequenceNumber::NON_INITIALIZED,
                SequenceNumber::NON_INITIALIZED,
            ),
        };

        let mut ack = AckBody {
            replication_receive,
            replication_quorum,
            copy_receive: SequenceNumber::NON_INITIALIZED,
            copy_quorum: SequenceNumber::NON_INITIALIZED,
            error_code: self
                .faulted
                .as_ref()
                .map_or(0, ReplicationError::to_wire_code),
        };
        if let Some(copy) = self.copy.as_ref() {
            if !copy.is_done() {
                let progress = copy.progress();
                ack = ack.with_copy(progress.receive, progress.apply);
            }
        }

        output.sends.push(OutboundEnvelope {
            target_address: address,
            target_replica: primary_endpoint.replica_id,
            message_id: MessageIdHeader::fresh(),
            body: MessageBody::ReplicationAck(ack),
        });
        output
    }

    fn fault(&mut self, kind: FaultKind, error: ReplicationError, now: Instant) -> SecondaryOutput {
        let mut output = SecondaryOutput::default();
        if self.faulted.is_some() {
            return output;
        }
        self.faulted = Some(error.clone());

        if let Some(replication) = self.replication.as_mut() {
            replication.abandon(now);
        }
        if let Some(copy) = self.copy.as_mut() {
            copy.abandon(now);
        }
        self.context = None;
        self.held_batches.clear();
        self.pending_epoch = None;

        output.fault = Some((kind, error));
        output
    }
}

#[cfg(test)]
mod tests;
