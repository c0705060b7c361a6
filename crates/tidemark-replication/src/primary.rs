//! Primary-role façade.
//!
//! A thin orchestrator over [`ReplicaManager`]: it carries the role's
//! fault state (the first error wins and every later public call
//! short-circuits to `OperationFailed`), dispatches inbound messages, and
//! runs the close protocol, which optionally drains in-flight replicate
//! operations to quorum before canceling the rest.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{info, warn};

use tidemark_types::{
    Epoch, ReplicaId, ReplicaInformation, ReplicationEndpointId, SequenceNumber,
};
use tidemark_wire::{AckBody, CopyContextOperationBody};

use crate::config::ReplicatorSettings;
use crate::error::{ReplicationError, ReplicationResult};
use crate::provider::StateProvider;
use crate::queue::OperationQueue;
use crate::replica_manager::{CatchUpMode, PrimaryOutput, ReplicaManager};

/// Close drain in progress.
#[derive(Debug)]
struct CloseDrain {
    deadline: Instant,
}

/// Primary-role surface: replicate, build, reconfigure, catch up, close.
pub struct PrimaryReplicator {
    endpoint_id: ReplicationEndpointId,
    manager: ReplicaManager,
    faulted: Option<ReplicationError>,
    closing: Option<CloseDrain>,
    closed: bool,
    wait_for_quorum_timeout: Option<std::time::Duration>,
}

impl PrimaryReplicator {
    pub fn new(
        endpoint_id: ReplicationEndpointId,
        epoch: Epoch,
        settings: Arc<ReplicatorSettings>,
        start_sequence: SequenceNumber,
    ) -> Self {
        let wait = settings.wait_for_quorum_timeout;
        Self {
            endpoint_id,
            manager: ReplicaManager::new(endpoint_id, epoch, settings, start_sequence),
            faulted: None,
            closing: None,
            closed: false,
            wait_for_quorum_timeout: wait,
        }
    }

    /// Promotion: the secondary's queue continues as the primary queue.
    pub fn from_queue(
        endpoint_id: ReplicationEndpointId,
        epoch: Epoch,
        settings: Arc<ReplicatorSettings>,
        queue: OperationQueue,
    ) -> Self {
        let wait = settings.wait_for_quorum_timeout;
        Self {
            endpoint_id,
            manager: ReplicaManager::with_queue(endpoint_id, epoch, settings, queue),
            faulted: None,
            closing: None,
            closed: false,
            wait_for_quorum_timeout: wait,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn epoch(&self) -> Epoch {
        self.manager.epoch()
    }

    pub fn manager(&self) -> &ReplicaManager {
        &self.manager
    }

    pub fn current_progress(&self) -> SequenceNumber {
        self.manager.current_progress()
    }

    pub fn catch_up_capability(&self) -> SequenceNumber {
        self.manager.catch_up_capability()
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.is_some()
    }

    /// Demotion: the queue moves to the new secondary role object.
    pub fn into_queue(self) -> OperationQueue {
        self.manager.into_queue()
    }

    fn guard(&self) -> ReplicationResult<()> {
        if self.faulted.is_some() {
            return Err(ReplicationError::OperationFailed);
        }
        if self.closing.is_some() || self.closed {
            return Err(ReplicationError::ObjectClosed);
        }
        Ok(())
    }

    /// Faults the role; the partition controller sees the original error
    /// in its fault report, while later callers see `OperationFailed`.
    pub fn fault(&mut self, error: ReplicationError) {
        if self.faulted.is_none() {
            warn!(endpoint = %self.endpoint_id, %error, "primary role faulted");
            self.faulted = Some(error);
        }
    }

    /// Scans an output for conditions that fault the whole role.
    fn absorb(&mut self, output: &PrimaryOutput) {
        for (replica_id, completion) in &output.build_completions {
            if let Err(ReplicationError::InternalError(reason)) = completion {
                warn!(
                    endpoint = %self.endpoint_id,
                    replica = %replica_id,
                    %reason,
                    "build reconciliation failure faults the primary"
                );
                self.fault(ReplicationError::InternalError(reason.clone()));
            }
        }
    }

    // ========================================================================
    // User surface
    // ========================================================================

    /// Replicates one user operation; its LSN completes on quorum commit.
    pub fn replicate(
        &mut self,
        data: Vec<Bytes>,
        now: Instant,
    ) -> ReplicationResult<(SequenceNumber, PrimaryOutput)> {
        self.guard()?;
        let (lsn, output) = self.manager.replicate(data, now)?;
        self.absorb(&output);
        Ok((lsn, output))
    }

    pub fn update_epoch(&mut self, epoch: Epoch) -> ReplicationResult<()> {
        self.guard()?;
        self.manager.update_epoch(epoch)
    }

    /// Primary-side data-loss check: asks the provider whether state
    /// changed underneath us and restarts the LSN space if so. Returns
    /// whether state changed.
    pub fn on_data_loss(
        &mut self,
        provider: &mut dyn StateProvider,
    ) -> ReplicationResult<bool> {
        self.guard()?;
        let changed = provider.on_data_loss()?;
        if changed {
            let last = provider.last_committed_sequence_number()?;
            info!(endpoint = %self.endpoint_id, %last, "state changed after data loss");
            self.manager.reset_sequence(last.next().max(SequenceNumber::new(1)));
        }
        Ok(changed)
    }

    // ========================================================================
    // Controller surface
    // ========================================================================

    pub fn build_idle(
        &mut self,
        info: &ReplicaInformation,
        provider: &mut dyn StateProvider,
        now: Instant,
    ) -> ReplicationResult<PrimaryOutput> {
        self.guard()?;
        self.manager.begin_build_idle(info, provider, now)
    }

    pub fn remove_replica(
        &mut self,
        replica_id: ReplicaId,
        now: Instant,
    ) -> ReplicationResult<PrimaryOutput> {
        self.guard()?;
        self.manager.remove_replica(replica_id, now)
    }

    pub fn update_catchup_configuration(
        &mut self,
        previous: &[ReplicaInformation],
        previous_quorum: u32,
        current: &[ReplicaInformation],
        current_quorum: u32,
        now: Instant,
    ) -> ReplicationResult<PrimaryOutput> {
        self.guard()?;
        self.manager
            .update_catchup_configuration(previous, previous_quorum, current, current_quorum, now)
    }

    pub fn update_current_configuration(
        &mut self,
        current: &[ReplicaInformation],
        current_quorum: u32,
        now: Instant,
    ) -> ReplicationResult<PrimaryOutput> {
        self.guard()?;
        self.manager
            .update_current_configuration(current, current_quorum, now)
    }

    pub fn begin_wait_for_catch_up(
        &mut self,
        mode: CatchUpMode,
        now: Instant,
    ) -> ReplicationResult<PrimaryOutput> {
        self.guard()?;
        Ok(self.manager.begin_wait_for_catch_up(mode, now))
    }

    pub fn cancel_catch_up(&mut self) -> PrimaryOutput {
        self.manager.cancel_catch_up()
    }

    // ========================================================================
    // Inbound dispatch
    // ========================================================================

    pub fn process_ack(
        &mut self,
        from_address: &str,
        from_endpoint: ReplicationEndpointId,
        ack: &AckBody,
        now: Instant,
    ) -> PrimaryOutput {
        if self.faulted.is_some() || self.closed {
            return PrimaryOutput::default();
        }
        let mut output = self.manager.process_ack(from_address, from_endpoint, ack, now);
        self.absorb(&output);
        output.merge(self.poll_close(now));
        output
    }

    pub fn process_copy_context(
        &mut self,
        body: CopyContextOperationBody,
        now: Instant,
    ) -> PrimaryOutput {
        if self.faulted.is_some() || self.closed {
            return PrimaryOutput::default();
        }
        self.manager.process_copy_context(body, now)
    }

    // ========================================================================
    // Timers & close
    // ========================================================================

    pub fn on_retry_tick(&mut self, now: Instant) -> PrimaryOutput {
        if self.closed {
            return PrimaryOutput::default();
        }
        let mut output = self.manager.on_retry_tick(now);
        self.absorb(&output);
        output.merge(self.poll_close(now));
        output
    }

    /// Begins the close protocol. With a quorum-drain timeout configured,
    /// in-flight replicate operations get that long to commit; the close
    /// then cancels whatever remains, closes every session, and cancels any
    /// running catch-up.
    pub fn begin_close(&mut self, now: Instant) -> PrimaryOutput {
        if self.closed {
            let mut output = PrimaryOutput::default();
            output.close_completed = true;
            return output;
        }

        match self.wait_for_quorum_timeout {
            Some(timeout) if self.manager.pending_replicate_count() > 0 && self.faulted.is_none() => {
                info!(
                    endpoint = %self.endpoint_id,
                    pending = self.manager.pending_replicate_count(),
                    "close draining in-flight replicates"
                );
                self.closing = Some(CloseDrain {
                    deadline: now + timeout,
                });
                self.poll_close(now)
            }
            _ => self.finish_close(now),
        }
    }

    fn poll_close(&mut self, now: Instant) -> PrimaryOutput {
        let Some(drain) = self.closing.as_ref() else {
            return PrimaryOutput::default();
        };
        if self.manager.pending_replicate_count() == 0 || now >= drain.deadline {
            return self.finish_close(now);
        }
        PrimaryOutput::default()
    }

    fn finish_close(&mut self, now: Instant) -> PrimaryOutput {
        self.closing = None;
        self.closed = true;
        let mut output = self.manager.close(now);
        output.close_completed = true;
        output
    }

    /// Demotion: close immediately (pending replicates cancel) and hand the
    /// queue to the incoming secondary. Operations this primary committed
    /// were already applied locally; completing them keeps the new role
    /// from re-dispatching them to the consumer.
    pub fn close_for_demotion(mut self, now: Instant) -> (PrimaryOutput, OperationQueue) {
        let output = self.finish_close(now);
        let mut queue = self.into_queue();
        let committed = queue.committed_head().prev();
        queue.update_completed_head(committed, now);
        (output, queue)
    }
}

#[cfg(test)]
mod tests {
    use tidemark_types::{IncarnationId, PartitionId, ReplicaRole};
    use tidemark_wire::MessageBody;
    use uuid::Uuid;

    use crate::testing::MockStateProvider;

    use super::*;

    fn endpoint(replica: u64) -> ReplicationEndpointId {
        ReplicationEndpointId::with_incarnation(
            PartitionId::new(Uuid::nil()),
            ReplicaId::new(replica),
            IncarnationId::new(Uuid::nil()),
        )
    }

    fn replica_info(replica: u64) -> ReplicaInformation {
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

    fn primary() -> PrimaryReplicator {
        let mut p = PrimaryReplicator::new(
            endpoint(1),
            Epoch::new(1, 1),
            Arc::new(ReplicatorSettings::default()),
            SequenceNumber::new(1),
        );
        let now = Instant::now();
        p.update_current_configuration(&[replica_info(2)], 2, now)
            .expect("configure");
        p
    }

    fn data() -> Vec<Bytes> {
        vec![Bytes::from_static(b"payload")]
    }

    #[test]
    fn replicate_before_configuration_lacks_quorum() {
        let mut p = PrimaryReplicator::new(
            endpoint(1),
            Epoch::new(1, 1),
            Arc::new(ReplicatorSettings::default()),
            SequenceNumber::new(1),
        );
        assert_eq!(
            p.replicate(data(), Instant::now()).unwrap_err(),
            ReplicationError::NoWriteQuorum
        );
    }

    #[test]
    fn oversized_operation_is_rejected() {
        let settings = ReplicatorSettings {
            max_replication_message_size: 4,
            ..Default::default()
        };
        let mut p = PrimaryReplicator::new(
            endpoint(1),
            Epoch::new(1, 1),
            Arc::new(settings),
            SequenceNumber::new(1),
        );
        let now = Instant::now();
        p.update_current_configuration(&[replica_info(2)], 2, now)
            .expect("configure");
        assert_eq!(
            p.replicate(data(), now).unwrap_err(),
            ReplicationError::MessageTooLarge
        );
    }

    #[test]
    fn faulted_role_short_circuits() {
        let mut p = primary();
        p.fault(ReplicationError::InvalidState("boom".into()));
        assert_eq!(
            p.replicate(data(), Instant::now()).unwrap_err(),
            ReplicationError::OperationFailed
        );
        assert_eq!(
            p.update_epoch(Epoch::new(2, 1)).unwrap_err(),
            ReplicationError::OperationFailed
        );
    }

    #[test]
    fn close_without_timeout_cancels_pending() {
        let mut p = primary();
        let now = Instant::now();
        let (lsn, _) = p.replicate(data(), now).expect("replicate");

        let output = p.begin_close(now);
        assert!(output.close_completed);
        assert!(output
            .completed_replicates
            .iter()
            .any(|(l, r)| *l == lsn && *r == Err(ReplicationError::OperationCanceled)));
        assert_eq!(
            p.replicate(data(), now).unwrap_err(),
            ReplicationError::ObjectClosed
        );
    }

    #[test]
    fn close_with_timeout_drains_to_quorum() {
        let settings = ReplicatorSettings {
            wait_for_quorum_timeout: Some(std::time::Duration::from_secs(30)),
            ..Default::default()
        };
        let mut p = PrimaryReplicator::new(
            endpoint(1),
            Epoch::new(1, 1),
            Arc::new(settings),
            SequenceNumber::new(1),
        );
        let now = Instant::now();
        p.update_current_configuration(&[replica_info(2)], 2, now)
            .expect("configure");
        let (lsn, _) = p.replicate(data(), now).expect("replicate");

        let output = p.begin_close(now);
        assert!(!output.close_completed);

        // The peer's ack settles the replicate; the close then completes.
        let ack = AckBody::replication(lsn, lsn);
        let output = p.process_ack("10.0.0.2:9099", endpoint(2), &ack, now);
        assert!(output.close_completed);
        assert!(output
            .completed_replicates
            .iter()
            .any(|(l, r)| *l == lsn && r.is_ok()));
    }

    #[test]
    fn data_loss_restarts_sequence_space() {
        let mut p = primary();
        let mut provider = MockStateProvider {
            data_loss_changed_state: true,
            last_committed: SequenceNumber::new(41),
            ..Default::default()
        };
        assert!(p.on_data_loss(&mut provider).expect("data loss"));
        assert_eq!(p.current_progress(), SequenceNumber::new(41));
    }

    #[test]
    fn build_then_remove_idle() {
        let mut p = primary();
        let now = Instant::now();
        let mut provider = MockStateProvider::with_copy_payloads(2);

        let output = p
            .build_idle(&replica_info(7), &mut provider, now)
            .expect("build");
        assert!(output
            .sends
            .iter()
            .any(|e| matches!(e.body, MessageBody::StartCopy(_))));
        assert!(output
            .sends
            .iter()
            .any(|e| matches!(e.body, MessageBody::CopyOperation(_))));

        assert_eq!(
            p.build_idle(&replica_info(7), &mut provider, now).unwrap_err(),
            ReplicationError::ReplicaAlreadyExists
        );
        p.remove_replica(ReplicaId::new(7), now).expect("remove");
        assert_eq!(
            p.remove_replica(ReplicaId::new(7), now).unwrap_err(),
            ReplicationError::ReplicaDoesNotExist
        );
    }
}
