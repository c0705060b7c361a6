//! The outer replicator lifecycle.
//!
//! A replicator owns at most one role object at a time (a
//! [`PrimaryReplicator`] or a [`SecondaryReplicator`]) and routes transport
//! messages and controller calls to it. Role changes compose the close of
//! the outgoing role with the construction of the incoming one, moving the
//! operation queue between them so no replication state is lost across a
//! promotion or demotion.
//!
//! ```text
//! Created -> Opened
//! Opened -> Primary | SecondaryIdle | SecondaryActive | RoleNone
//! Primary -> ChangingRole(-> SecondaryActive | RoleNone)
//! SecondaryIdle -> SecondaryActive | ChangingRole(-> Primary | RoleNone)
//! SecondaryActive -> ChangingRole(-> Primary | RoleNone)
//! Primary -> CheckingDataLoss -> Primary
//! any non-terminal -> Closing -> Closed
//! any state -> Aborting -> Aborted
//! failure in an open state -> Faulted (then only -> RoleNone)
//! ```

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{info, warn};

use tidemark_types::{
    Epoch, ReplicaId, ReplicaInformation, ReplicaRole, ReplicationEndpointId, SequenceNumber,
};
use tidemark_wire::{Message, MessageBody};

use crate::config::ReplicatorSettings;
use crate::error::{ReplicationError, ReplicationResult};
use crate::operation::Operation;
use crate::primary::PrimaryReplicator;
use crate::provider::StateProvider;
use crate::queue::OperationQueue;
use crate::replica_manager::{CatchUpMode, OutboundEnvelope, PrimaryOutput};
use crate::secondary::{SecondaryOutput, SecondaryReplicator};
use crate::stream::{FaultKind, OperationStream};

// ============================================================================
// Lifecycle state
// ============================================================================

/// Lifecycle states of a replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    Created,
    Opened,
    ChangingRole,
    Primary,
    SecondaryIdle,
    SecondaryActive,
    CheckingDataLoss,
    Closing,
    Closed,
    Aborting,
    Aborted,
    Faulted,
    RoleNone,
}

/// What a role-change transition must do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoleChangeAction {
    None,
    CreateInitialPrimary,
    CreateInitialSecondary,
    PromoteSecondaryToPrimary,
    DemotePrimaryToSecondary,
    PromoteIdleToActive,
    ClosePrimary,
    CloseSecondary,
}

/// Pure transition table; the replicator drives it.
#[derive(Debug)]
struct LifecycleState {
    state: ReplicatorState,
    role: ReplicaRole,
}

impl LifecycleState {
    fn new() -> Self {
        Self {
            state: ReplicatorState::Created,
            role: ReplicaRole::None,
        }
    }

    fn transition_to_opened(&mut self) -> ReplicationResult<()> {
        if self.state != ReplicatorState::Created {
            return Err(ReplicationError::InvalidState(format!(
                "open in state {:?}",
                self.state
            )));
        }
        self.state = ReplicatorState::Opened;
        Ok(())
    }

    fn transition_to_changing_role(
        &mut self,
        new_role: ReplicaRole,
    ) -> ReplicationResult<RoleChangeAction> {
        let action = match self.state {
            ReplicatorState::Opened => match new_role {
                ReplicaRole::Primary => RoleChangeAction::CreateInitialPrimary,
                ReplicaRole::IdleSecondary | ReplicaRole::ActiveSecondary => {
                    RoleChangeAction::CreateInitialSecondary
                }
                ReplicaRole::None => RoleChangeAction::None,
            },
            ReplicatorState::Primary => match new_role {
                ReplicaRole::Primary => {
                    panic!("role change to primary on a primary; use update_epoch")
                }
                ReplicaRole::ActiveSecondary => RoleChangeAction::DemotePrimaryToSecondary,
                ReplicaRole::None => RoleChangeAction::ClosePrimary,
                ReplicaRole::IdleSecondary => {
                    return Err(ReplicationError::InvalidState(
                        "primary cannot become an idle secondary".into(),
                    ));
                }
            },
            ReplicatorState::SecondaryActive => match new_role {
                ReplicaRole::Primary => RoleChangeAction::PromoteSecondaryToPrimary,
                ReplicaRole::None => RoleChangeAction::CloseSecondary,
                _ => {
                    return Err(ReplicationError::InvalidState(format!(
                        "active secondary cannot become {new_role}"
                    )));
                }
            },
            ReplicatorState::SecondaryIdle => match new_role {
                ReplicaRole::Primary => RoleChangeAction::PromoteSecondaryToPrimary,
                ReplicaRole::ActiveSecondary => RoleChangeAction::PromoteIdleToActive,
                ReplicaRole::None => RoleChangeAction::CloseSecondary,
                ReplicaRole::IdleSecondary => {
                    return Err(ReplicationError::InvalidState(
                        "idle secondary is already idle".into(),
                    ));
                }
            },
            ReplicatorState::Faulted => match new_role {
                ReplicaRole::None => RoleChangeAction::None,
                _ => {
                    return Err(ReplicationError::InvalidState(
                        "a faulted replicator can only drop its role".into(),
                    ));
                }
            },
            _ => {
                return Err(ReplicationError::InvalidState(format!(
                    "role change in state {:?}",
                    self.state
                )));
            }
        };

        self.state = ReplicatorState::ChangingRole;
        self.role = new_role;
        Ok(action)
    }

    fn transition_to_primary(&mut self) {
        assert!(
            matches!(
                self.state,
                ReplicatorState::ChangingRole | ReplicatorState::CheckingDataLoss
            ),
            "transition to primary from {:?}",
            self.state
        );
        self.state = ReplicatorState::Primary;
    }

    fn transition_to_secondary_idle(&mut self) {
        assert!(
            self.state == ReplicatorState::ChangingRole,
            "transition to idle from {:?}",
            self.state
        );
        self.state = ReplicatorState::SecondaryIdle;
    }

    fn transition_to_secondary_active(&mut self) {
        assert!(
            self.state == ReplicatorState::ChangingRole,
            "transition to active from {:?}",
            self.state
        );
        self.state = ReplicatorState::SecondaryActive;
    }

    fn transition_to_role_none(&mut self) {
        assert!(
            self.state == ReplicatorState::ChangingRole,
            "transition to role-none from {:?}",
            self.state
        );
        self.state = ReplicatorState::RoleNone;
    }

    fn transition_to_checking_data_loss(&mut self) -> ReplicationResult<()> {
        if self.state != ReplicatorState::Primary {
            return Err(ReplicationError::InvalidState(format!(
                "data-loss check in state {:?}",
                self.state
            )));
        }
        self.state = ReplicatorState::CheckingDataLoss;
        Ok(())
    }

    fn transition_to_closing(&mut self) -> ReplicationResult<()> {
        match self.state {
            ReplicatorState::Opened
            | ReplicatorState::Primary
            | ReplicatorState::SecondaryActive
            | ReplicatorState::SecondaryIdle
            | ReplicatorState::Faulted
            | ReplicatorState::RoleNone => {
                self.state = ReplicatorState::Closing;
                Ok(())
            }
            _ => Err(ReplicationError::InvalidState(format!(
                "close in state {:?}",
                self.state
            ))),
        }
    }

    fn transition_to_closed(&mut self) {
        assert!(
            self.state == ReplicatorState::Closing,
            "transition to closed from {:?}",
            self.state
        );
        self.state = ReplicatorState::Closed;
    }

    fn transition_to_aborting(&mut self) -> ReplicationResult<()> {
        match self.state {
            ReplicatorState::ChangingRole | ReplicatorState::Aborting | ReplicatorState::Aborted => {
                Err(ReplicationError::InvalidState(format!(
                    "abort in state {:?}",
                    self.state
                )))
            }
            _ => {
                self.state = ReplicatorState::Aborting;
                Ok(())
            }
        }
    }

    fn transition_to_aborted(&mut self) {
        assert!(
            self.state == ReplicatorState::Aborting,
            "transition to aborted from {:?}",
            self.state
        );
        self.state = ReplicatorState::Aborted;
    }

    fn transition_to_faulted(&mut self) {
        self.state = ReplicatorState::Faulted;
    }
}

// ============================================================================
// Output
// ============================================================================

/// Unified effects from one replicator event.
#[derive(Debug, Default)]
pub struct ReplicatorOutput {
    pub sends: Vec<OutboundEnvelope>,
    pub completed_replicates: Vec<(SequenceNumber, ReplicationResult<()>)>,
    pub build_completions: Vec<(ReplicaId, ReplicationResult<()>)>,
    pub catch_up_completed: Option<ReplicationResult<()>>,
    pub epoch_updated: Option<ReplicationResult<()>>,
    pub close_completed: bool,

    /// A role fault to report to the partition controller.
    pub fault: Option<(FaultKind, ReplicationError)>,
}

impl ReplicatorOutput {
    pub fn merge(&mut self, other: ReplicatorOutput) {
        self.sends.extend(other.sends);
        self.completed_replicates.extend(other.completed_replicates);
        self.build_completions.extend(other.build_completions);
        if other.catch_up_completed.is_some() {
            self.catch_up_completed = other.catch_up_completed;
        }
        if other.epoch_updated.is_some() {
            self.epoch_updated = other.epoch_updated;
        }
        self.close_completed |= other.close_completed;
        if other.fault.is_some() && self.fault.is_none() {
            self.fault = other.fault;
        }
    }
}

impl From<PrimaryOutput> for ReplicatorOutput {
    fn from(output: PrimaryOutput) -> Self {
        Self {
            sends: output.sends,
            completed_replicates: output.completed_replicates,
            build_completions: output.build_completions,
            catch_up_completed: output.catch_up_completed,
            epoch_updated: None,
            close_completed: output.close_completed,
            fault: None,
        }
    }
}

impl From<SecondaryOutput> for ReplicatorOutput {
    fn from(output: SecondaryOutput) -> Self {
        Self {
            sends: output.sends,
            completed_replicates: Vec::new(),
            build_completions: Vec::new(),
            catch_up_completed: None,
            epoch_updated: output.epoch_updated,
            close_completed: output.close_completed,
            fault: output.fault,
        }
    }
}

// ============================================================================
// Replicator
// ============================================================================

enum RoleObject {
    None,
    Primary(PrimaryReplicator),
    Secondary(SecondaryReplicator),
}

/// The replication engine of one replica: lifecycle, role objects, message
/// routing.
pub struct Replicator {
    endpoint_id: ReplicationEndpointId,
    settings: Arc<ReplicatorSettings>,
    lifecycle: LifecycleState,
    role: RoleObject,
    epoch: Epoch,

    /// A role-drop (to None) waiting for the outgoing role's close drain.
    pending_role_drop: bool,
}

impl Replicator {
    pub fn new(
        endpoint_id: ReplicationEndpointId,
        settings: ReplicatorSettings,
    ) -> ReplicationResult<Self> {
        settings.validate()?;
        Ok(Self {
            endpoint_id,
            settings: Arc::new(settings),
            lifecycle: LifecycleState::new(),
            role: RoleObject::None,
            epoch: Epoch::INVALID,
            pending_role_drop: false,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> ReplicatorState {
        self.lifecycle.state
    }

    pub fn role(&self) -> ReplicaRole {
        self.lifecycle.role
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Last LSN known to this replica in its current role.
    pub fn current_progress(&self) -> SequenceNumber {
        match &self.role {
            RoleObject::Primary(primary) => primary.current_progress(),
            RoleObject::Secondary(secondary) => secondary.current_progress(),
            RoleObject::None => SequenceNumber::NON_INITIALIZED,
        }
    }

    pub fn catch_up_capability(&self) -> SequenceNumber {
        match &self.role {
            RoleObject::Primary(primary) => primary.catch_up_capability(),
            RoleObject::Secondary(secondary) => secondary.applied_progress(),
            RoleObject::None => SequenceNumber::NON_INITIALIZED,
        }
    }

    /// Consumer streams (secondary roles only).
    pub fn replication_stream(&self) -> Option<OperationStream> {
        match &self.role {
            RoleObject::Secondary(secondary) => secondary.replication_stream(),
            _ => None,
        }
    }

    pub fn copy_stream(&self) -> Option<OperationStream> {
        match &self.role {
            RoleObject::Secondary(secondary) => secondary.copy_stream(),
            _ => None,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn open(&mut self) -> ReplicationResult<()> {
        self.lifecycle.transition_to_opened()?;
        info!(endpoint = %self.endpoint_id, "replicator opened");
        Ok(())
    }

    /// Changes role. The epoch must be at least the current one; a newer
    /// epoch is installed before the new role becomes externally visible.
    pub fn change_role(
        &mut self,
        epoch: Epoch,
        new_role: ReplicaRole,
        provider: &mut dyn StateProvider,
        now: Instant,
    ) -> ReplicationResult<ReplicatorOutput> {
        if epoch < self.epoch {
            return Err(ReplicationError::InvalidEpoch);
        }

        let action = self.lifecycle.transition_to_changing_role(new_role)?;
        info!(
            endpoint = %self.endpoint_id,
            ?action,
            %new_role,
            %epoch,
            "changing role"
        );
        let outgoing_epoch = self.epoch;
        self.epoch = epoch;

        let mut output = ReplicatorOutput::default();
        match action {
            RoleChangeAction::None => {
                self.role = RoleObject::None;
                self.lifecycle.transition_to_role_none();
            }
            RoleChangeAction::CreateInitialPrimary => {
                let last = provider.last_committed_sequence_number()?;
                let start = last.next().max(SequenceNumber::new(1));
                let mut primary = PrimaryReplicator::new(
                    self.endpoint_id,
                    epoch,
                    Arc::clone(&self.settings),
                    start,
                );
                primary.update_epoch(epoch)?;
                self.role = RoleObject::Primary(primary);
                self.lifecycle.transition_to_primary();
            }
            RoleChangeAction::CreateInitialSecondary => {
                let mut secondary = SecondaryReplicator::new_idle(
                    self.endpoint_id,
                    epoch,
                    Arc::clone(&self.settings),
                );
                if new_role == ReplicaRole::ActiveSecondary {
                    secondary.promote_to_active();
                    self.role = RoleObject::Secondary(secondary);
                    self.lifecycle.transition_to_secondary_active();
                } else {
                    self.role = RoleObject::Secondary(secondary);
                    self.lifecycle.transition_to_secondary_idle();
                }
            }
            RoleChangeAction::PromoteSecondaryToPrimary => {
                let RoleObject::Secondary(secondary) =
                    std::mem::replace(&mut self.role, RoleObject::None)
                else {
                    unreachable!("promotion without a secondary role");
                };
                let primary = self.promote_to_primary(secondary, epoch, provider, now)?;
                self.role = RoleObject::Primary(primary);
                self.lifecycle.transition_to_primary();
            }
            RoleChangeAction::DemotePrimaryToSecondary => {
                let RoleObject::Primary(primary) =
                    std::mem::replace(&mut self.role, RoleObject::None)
                else {
                    unreachable!("demotion without a primary role");
                };
                let (close_output, queue) = primary.close_for_demotion(now);
                let mut close_output: ReplicatorOutput = close_output.into();
                // The role close is internal to the transition.
                close_output.close_completed = false;
                output.merge(close_output);

                // The queue continues on the secondary in retain mode.
                let queue = OperationQueue::adopt(
                    format!("REPL-{}", self.endpoint_id),
                    queue,
                    self.settings.initial_replication_queue_size,
                    self.settings.max_replication_queue_size,
                    self.settings.max_replication_queue_memory_size,
                    self.settings.max_completed_operations_count,
                    self.settings.max_completed_operations_memory_size,
                    /* clean_on_complete */ false,
                    now,
                );
                // The secondary starts at the outgoing epoch so the new
                // epoch flows through the provider's update_epoch barrier.
                let mut secondary = SecondaryReplicator::from_queue(
                    self.endpoint_id,
                    outgoing_epoch,
                    Arc::clone(&self.settings),
                    queue,
                );
                let update = secondary.update_epoch(epoch, provider, now)?;
                output.merge(update.into());
                self.role = RoleObject::Secondary(secondary);
                self.lifecycle.transition_to_secondary_active();
            }
            RoleChangeAction::PromoteIdleToActive => {
                if let RoleObject::Secondary(secondary) = &mut self.role {
                    secondary.promote_to_active();
                    let update = secondary.update_epoch(epoch, provider, now)?;
                    output.merge(update.into());
                }
                self.lifecycle.transition_to_secondary_active();
            }
            RoleChangeAction::ClosePrimary => {
                let RoleObject::Primary(mut primary) =
                    std::mem::replace(&mut self.role, RoleObject::None)
                else {
                    unreachable!("close without a primary role");
                };
                output.merge(primary.begin_close(now).into());
                self.role = RoleObject::None;
                self.lifecycle.transition_to_role_none();
            }
            RoleChangeAction::CloseSecondary => {
                let RoleObject::Secondary(mut secondary) =
                    std::mem::replace(&mut self.role, RoleObject::None)
                else {
                    unreachable!("close without a secondary role");
                };
                let close = secondary.begin_close(now);
                if close.close_completed {
                    output.merge(close.into());
                    self.role = RoleObject::None;
                    self.lifecycle.transition_to_role_none();
                } else {
                    // The consumer still owes the end-of-stream ack; the
                    // transition finishes when it arrives.
                    output.merge(close.into());
                    self.role = RoleObject::Secondary(secondary);
                    self.pending_role_drop = true;
                }
            }
        }

        Ok(output)
    }

    fn promote_to_primary(
        &mut self,
        secondary: SecondaryReplicator,
        epoch: Epoch,
        provider: &mut dyn StateProvider,
        now: Instant,
    ) -> ReplicationResult<PrimaryReplicator> {
        let primary = match secondary.into_queue() {
            Some(mut queue) => {
                // Buffered out-of-order operations were never observed by
                // anyone; drop them. Then fold the committed prefix into
                // the completed window and release it, so the clean-mode
                // primary queue starts with coinciding markers.
                queue.discard_uncommitted(now);
                let committed = queue.committed_head().prev();
                queue.update_completed_head(committed, now);
                let head = queue.head();
                queue.release_completed_up_to(head, now);

                let queue = OperationQueue::adopt(
                    format!("REPL-{}", self.endpoint_id),
                    queue,
                    self.settings.initial_replication_queue_size,
                    self.settings.max_replication_queue_size,
                    self.settings.max_replication_queue_memory_size,
                    0,
                    0,
                    /* clean_on_complete */ true,
                    now,
                );
                PrimaryReplicator::from_queue(
                    self.endpoint_id,
                    epoch,
                    Arc::clone(&self.settings),
                    queue,
                )
            }
            None => {
                let last = provider.last_committed_sequence_number()?;
                PrimaryReplicator::new(
                    self.endpoint_id,
                    epoch,
                    Arc::clone(&self.settings),
                    last.next().max(SequenceNumber::new(1)),
                )
            }
        };
        let mut primary = primary;
        primary.update_epoch(epoch)?;
        Ok(primary)
    }

    /// Installs a new epoch without changing role.
    pub fn update_epoch(
        &mut self,
        epoch: Epoch,
        provider: &mut dyn StateProvider,
        now: Instant,
    ) -> ReplicationResult<ReplicatorOutput> {
        if epoch < self.epoch {
            return Err(ReplicationError::InvalidEpoch);
        }
        let output = match &mut self.role {
            RoleObject::Primary(primary) => {
                primary.update_epoch(epoch)?;
                let mut output = ReplicatorOutput::default();
                output.epoch_updated = Some(Ok(()));
                output
            }
            RoleObject::Secondary(secondary) => {
                secondary.update_epoch(epoch, provider, now)?.into()
            }
            RoleObject::None => {
                let mut output = ReplicatorOutput::default();
                output.epoch_updated = Some(Ok(()));
                output
            }
        };
        self.epoch = epoch;
        Ok(self.absorb(output))
    }

    /// Primary-only: runs the data-loss check with the provider.
    pub fn on_data_loss(
        &mut self,
        provider: &mut dyn StateProvider,
    ) -> ReplicationResult<bool> {
        self.lifecycle.transition_to_checking_data_loss()?;
        let result = match &mut self.role {
            RoleObject::Primary(primary) => primary.on_data_loss(provider),
            _ => Err(ReplicationError::NotPrimary),
        };
        match &result {
            Ok(_) => self.lifecycle.transition_to_primary(),
            Err(_) => self.lifecycle.transition_to_faulted(),
        }
        result
    }

    pub fn close(&mut self, now: Instant) -> ReplicationResult<ReplicatorOutput> {
        self.lifecycle.transition_to_closing()?;
        let mut output = ReplicatorOutput::default();
        match std::mem::replace(&mut self.role, RoleObject::None) {
            RoleObject::Primary(mut primary) => {
                output.merge(primary.begin_close(now).into());
            }
            RoleObject::Secondary(mut secondary) => {
                output.merge(secondary.begin_close(now).into());
            }
            RoleObject::None => {}
        }
        self.lifecycle.transition_to_closed();
        output.close_completed = true;
        info!(endpoint = %self.endpoint_id, "replicator closed");
        Ok(output)
    }

    /// Abort: immediate teardown, no drains.
    pub fn abort(&mut self, now: Instant) -> ReplicationResult<ReplicatorOutput> {
        self.lifecycle.transition_to_aborting()?;
        let mut output = ReplicatorOutput::default();
        match std::mem::replace(&mut self.role, RoleObject::None) {
            RoleObject::Primary(mut primary) => {
                output.merge(primary.begin_close(now).into());
            }
            RoleObject::Secondary(_) => {}
            RoleObject::None => {}
        }
        self.lifecycle.transition_to_aborted();
        info!(endpoint = %self.endpoint_id, "replicator aborted");
        Ok(output)
    }

    // ========================================================================
    // Primary surface
    // ========================================================================

    pub fn replicate(
        &mut self,
        data: Vec<Bytes>,
        now: Instant,
    ) -> ReplicationResult<(SequenceNumber, ReplicatorOutput)> {
        let RoleObject::Primary(primary) = &mut self.role else {
            return Err(ReplicationError::NotPrimary);
        };
        let (lsn, output) = primary.replicate(data, now)?;
        Ok((lsn, self.absorb(output.into())))
    }

    pub fn build_idle(
        &mut self,
        info: &ReplicaInformation,
        provider: &mut dyn StateProvider,
        now: Instant,
    ) -> ReplicationResult<ReplicatorOutput> {
        let RoleObject::Primary(primary) = &mut self.role else {
            return Err(ReplicationError::NotPrimary);
        };
        let output = primary.build_idle(info, provider, now)?;
        Ok(self.absorb(output.into()))
    }

    pub fn remove_replica(
        &mut self,
        replica_id: ReplicaId,
        now: Instant,
    ) -> ReplicationResult<ReplicatorOutput> {
        let RoleObject::Primary(primary) = &mut self.role else {
            return Err(ReplicationError::NotPrimary);
        };
        let output = primary.remove_replica(replica_id, now)?;
        Ok(self.absorb(output.into()))
    }

    pub fn update_catchup_configuration(
        &mut self,
        previous: &[ReplicaInformation],
        previous_quorum: u32,
        current: &[ReplicaInformation],
        current_quorum: u32,
        now: Instant,
    ) -> ReplicationResult<ReplicatorOutput> {
        let RoleObject::Primary(primary) = &mut self.role else {
            return Err(ReplicationError::NotPrimary);
        };
        let output = primary.update_catchup_configuration(
            previous,
            previous_quorum,
            current,
            current_quorum,
            now,
        )?;
        Ok(self.absorb(output.into()))
    }

    pub fn update_current_configuration(
        &mut self,
        current: &[ReplicaInformation],
        current_quorum: u32,
        now: Instant,
    ) -> ReplicationResult<ReplicatorOutput> {
        let RoleObject::Primary(primary) = &mut self.role else {
            return Err(ReplicationError::NotPrimary);
        };
        let output = primary.update_current_configuration(current, current_quorum, now)?;
        Ok(self.absorb(output.into()))
    }

    pub fn begin_wait_for_catch_up(
        &mut self,
        mode: CatchUpMode,
        now: Instant,
    ) -> ReplicationResult<ReplicatorOutput> {
        let RoleObject::Primary(primary) = &mut self.role else {
            return Err(ReplicationError::NotPrimary);
        };
        let output = primary.begin_wait_for_catch_up(mode, now)?;
        Ok(self.absorb(output.into()))
    }

    pub fn cancel_catch_up(&mut self) -> ReplicatorOutput {
        match &mut self.role {
            RoleObject::Primary(primary) => primary.cancel_catch_up().into(),
            _ => ReplicatorOutput::default(),
        }
    }

    // ========================================================================
    // Secondary surface
    // ========================================================================

    /// The consumer applied one operation from a secondary stream.
    pub fn ack_operation(
        &mut self,
        op: &Arc<Operation>,
        provider: &mut dyn StateProvider,
        now: Instant,
    ) -> ReplicatorOutput {
        let output = match &mut self.role {
            RoleObject::Secondary(secondary) => {
                secondary.ack_replication_operation(op, provider, now).into()
            }
            _ => ReplicatorOutput::default(),
        };
        self.absorb(output)
    }

    // ========================================================================
    // Transport dispatch
    // ========================================================================

    /// Routes one inbound message to the active role. Messages for the
    /// wrong role are protocol remnants and are dropped.
    pub fn process_message(
        &mut self,
        message: &Message,
        provider: &mut dyn StateProvider,
        now: Instant,
    ) -> ReplicatorOutput {
        let from = &message.from;
        let output: ReplicatorOutput = match (&mut self.role, &message.body) {
            (RoleObject::Primary(primary), MessageBody::ReplicationAck(ack)) => primary
                .process_ack(&from.address, from.endpoint_id, ack, now)
                .into(),
            (RoleObject::Primary(primary), MessageBody::CopyContextOperation(body)) => {
                primary.process_copy_context(body.clone(), now).into()
            }
            (RoleObject::Secondary(secondary), MessageBody::ReplicationOperation(body)) => {
                secondary
                    .process_replication_batch(from, body, provider, now)
                    .into()
            }
            (RoleObject::Secondary(secondary), MessageBody::CopyOperation(body)) => {
                secondary.process_copy_batch(from, body, now).into()
            }
            (RoleObject::Secondary(secondary), MessageBody::StartCopy(body)) => {
                secondary.process_start_copy(from, body, provider, now).into()
            }
            (RoleObject::Secondary(secondary), MessageBody::CopyContextAck(body)) => {
                secondary.process_copy_context_ack(body, now).into()
            }
            (RoleObject::Secondary(secondary), MessageBody::RequestAck(_)) => {
                secondary.process_request_ack(from, now).into()
            }
            (RoleObject::Secondary(secondary), MessageBody::InduceFault(body)) => {
                secondary.process_induce_fault(body, now).into()
            }
            _ => {
                warn!(
                    endpoint = %self.endpoint_id,
                    action = %message.action(),
                    state = ?self.lifecycle.state,
                    "message dropped: no role to handle it"
                );
                ReplicatorOutput::default()
            }
        };
        self.absorb(output)
    }

    /// Periodic tick: retransmissions, batched acks, barrier and fault
    /// polls, and pending role-drop completion.
    pub fn on_retry_tick(
        &mut self,
        provider: &mut dyn StateProvider,
        now: Instant,
    ) -> ReplicatorOutput {
        let output: ReplicatorOutput = match &mut self.role {
            RoleObject::Primary(primary) => primary.on_retry_tick(now).into(),
            RoleObject::Secondary(secondary) => {
                let mut output = secondary.on_batch_ack_tick(now);
                output.merge(secondary.poll_epoch_barrier(provider, now));
                output.merge(secondary.poll_stream_faults(now));
                output.into()
            }
            RoleObject::None => ReplicatorOutput::default(),
        };
        self.absorb(output)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Applies output side effects to the lifecycle: role faults move the
    /// machine to Faulted, and a completed close drain finishes a pending
    /// role drop.
    fn absorb(&mut self, output: ReplicatorOutput) -> ReplicatorOutput {
        if output.fault.is_some()
            && !matches!(
                self.lifecycle.state,
                ReplicatorState::Closing
                    | ReplicatorState::Closed
                    | ReplicatorState::Aborting
                    | ReplicatorState::Aborted
            )
        {
            self.lifecycle.transition_to_faulted();
        }
        if output.close_completed && self.pending_role_drop {
            self.pending_role_drop = false;
            self.role = RoleObject::None;
            if self.lifecycle.state == ReplicatorState::ChangingRole {
                self.lifecycle.transition_to_role_none();
            }
        }
        output
    }
}

// ============================================================================
// Tests
// ============================================================================
