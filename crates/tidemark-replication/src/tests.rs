//! End-to-end replication scenarios.
//!
//! These tests wire a primary and real secondaries together by shuttling
//! the outputs of one into the inputs of the other, with no transport in
//! between.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use uuid::Uuid;

use tidemark_types::{
    Epoch, IncarnationId, PartitionId, ReplicaId, ReplicaInformation, ReplicaRole,
    ReplicationEndpointId, SequenceNumber,
};
use tidemark_wire::{AckBody, FromHeader, MessageBody};

use crate::config::ReplicatorSettings;
use crate::error::ReplicationError;
use crate::primary::PrimaryReplicator;
use crate::replica_manager::{CatchUpMode, OutboundEnvelope, PrimaryOutput};
use crate::secondary::SecondaryReplicator;
use crate::stream::StreamEntry;
use crate::testing::MockStateProvider;

// ============================================================================
// Helpers
// ============================================================================

fn endpoint(replica: u64) -> ReplicationEndpointId {
    ReplicationEndpointId::with_incarnation(
        PartitionId::new(Uuid::nil()),
        ReplicaId::new(replica),
        IncarnationId::new(Uuid::nil()),
    )
}

fn address(replica: u64) -> String {
    format!("10.0.0.{replica}:9099")
}

fn replica_info(replica: u64) -> ReplicaInformation {
    ReplicaInformation {
        replica_id: ReplicaId::new(replica),
        role: ReplicaRole::ActiveSecondary,
        replicator_address: address(replica),
        incarnation_id: IncarnationId::new(Uuid::nil()),
        current_progress: SequenceNumber::INVALID,
        catch_up_capability: SequenceNumber::NON_INITIALIZED,
        must_catch_up: false,
    }
}

fn replica_info_with_progress(replica: u64, progress: i64) -> ReplicaInformation {
    ReplicaInformation {
        current_progress: SequenceNumber::new(progress),
        ..replica_info(replica)
    }
}

fn payload() -> Vec<Bytes> {
    vec![Bytes::from_static(b"user-operation")]
}

fn primary_with_cc(secondaries: &[u64], quorum: u32, settings: ReplicatorSettings) -> PrimaryReplicator {
    let mut primary = PrimaryReplicator::new(
        endpoint(1),
        Epoch::new(1, 1),
        Arc::new(settings),
        SequenceNumber::new(1),
    );
    let infos: Vec<ReplicaInformation> = secondaries.iter().map(|r| replica_info(*r)).collect();
    primary
        .update_current_configuration(&infos, quorum, Instant::now())
        .expect("configure");
    primary
}

fn ack_from(primary: &mut PrimaryReplicator, replica: u64, ack: AckBody, now: Instant) -> PrimaryOutput {
    primary.process_ack(&address(replica), endpoint(replica), &ack, now)
}

/// Delivers primary envelopes addressed to one secondary, returning the
/// acks the secondary produced.
fn deliver_to_secondary(
    sends: &[OutboundEnvelope],
    replica: u64,
    secondary: &mut SecondaryReplicator,
    provider: &mut MockStateProvider,
    now: Instant,
) -> Vec<AckBody> {
    let from = FromHeader {
        address: address(1),
        endpoint_id: endpoint(1),
    };
    let mut acks = Vec::new();
    for envelope in sends {
        if envelope.target_replica != ReplicaId::new(replica) {
            continue;
        }
        let output = match &envelope.body {
            MessageBody::StartCopy(body) => secondary.process_start_copy(&from, body, provider, now),
            MessageBody::CopyOperation(body) => secondary.process_copy_batch(&from, body, now),
            MessageBody::ReplicationOperation(body) => {
                secondary.process_replication_batch(&from, body, provider, now)
            }
            MessageBody::CopyContextAck(body) => secondary.process_copy_context_ack(body, now),
            _ => continue,
        };
        for send in output.sends {
            if let MessageBody::ReplicationAck(ack) = send.body {
                acks.push(ack);
            }
        }
    }
    acks
}

fn queue_markers(primary: &PrimaryReplicator) -> (i64, i64, i64, i64) {
    let queue = primary.manager().queue();
    (
        queue.completed_head().as_i64() - 1,
        queue.head().as_i64() - 1,
        queue.committed_head().as_i64() - 1,
        queue.tail().as_i64() - 1,
    )
}

// ============================================================================
// Scenario 1: basic commit
// ============================================================================

#[test]
fn basic_commit_with_one_secondary() {
    let mut primary = primary_with_cc(&[2], 2, ReplicatorSettings::default());
    let now = Instant::now();

    assert_eq!(queue_markers(&primary), (0, 0, 0, 0));

    let mut lsns = Vec::new();
    for _ in 0..3 {
        let (lsn, _) = primary.replicate(payload(), now).expect("replicate");
        lsns.push(lsn);
    }
    assert_eq!(lsns, vec![1, 2, 3].into_iter().map(SequenceNumber::new).collect::<Vec<_>>());
    assert_eq!(queue_markers(&primary), (0, 0, 0, 3));

    // Receive acks alone move nothing: commit needs the apply quorum and
    // memory release is clamped to the commit.
    let receive_only = AckBody::replication(SequenceNumber::new(3), SequenceNumber::NON_INITIALIZED);
    let output = ack_from(&mut primary, 2, receive_only, now);
    assert!(output.completed_replicates.is_empty());
    assert_eq!(queue_markers(&primary), (0, 0, 0, 3));

    // Apply acks complete the replicates and release the queue.
    let apply = AckBody::replication(SequenceNumber::new(3), SequenceNumber::new(3));
    let output = ack_from(&mut primary, 2, apply, now);
    let completed: Vec<i64> = output
        .completed_replicates
        .iter()
        .map(|(lsn, result)| {
            assert!(result.is_ok());
            lsn.as_i64()
        })
        .collect();
    assert_eq!(completed, vec![1, 2, 3]);
    assert_eq!(queue_markers(&primary), (3, 3, 3, 3));
    assert_eq!(primary.current_progress(), SequenceNumber::new(3));
}

// ============================================================================
// Scenario 2: duplicate delivery at the secondary
// ============================================================================

#[test]
fn duplicate_batches_do_not_duplicate_delivery() {
    let mut primary = primary_with_cc(&[2], 2, ReplicatorSettings::default());
    let mut secondary =
        SecondaryReplicator::new_idle(endpoint(2), Epoch::new(1, 1), Arc::new(ReplicatorSettings::default()));
    let mut provider = MockStateProvider::default();
    let now = Instant::now();

    // Tell the secondary where replication starts.
    secondary.process_start_copy(
        &FromHeader {
            address: address(1),
            endpoint_id: endpoint(1),
        },
        &tidemark_wire::StartCopyBody {
            epoch: Epoch::new(1, 1),
            replica_id: ReplicaId::new(2),
            replication_start_sequence: SequenceNumber::new(1),
        },
        &mut provider,
        now,
    );

    let mut sends = Vec::new();
    for _ in 0..3 {
        let (_, output) = primary.replicate(payload(), now).expect("replicate");
        sends.extend(output.sends);
    }

    // Deliver every batch twice; the retransmissions overlap too.
    let acks_first = deliver_to_secondary(&sends, 2, &mut secondary, &mut provider, now);
    let acks_second = deliver_to_secondary(&sends, 2, &mut secondary, &mut provider, now);
    let last_first = acks_first.last().expect("acks");
    let last_second = acks_second.last().expect("acks");
    assert_eq!(last_first.replication_receive, SequenceNumber::new(3));
    assert_eq!(last_second.replication_receive, SequenceNumber::new(3));

    // The consumer observes 1..=3 exactly once, in order.
    let stream = secondary.replication_stream().expect("stream");
    let mut seen = Vec::new();
    while let StreamEntry::Operation(op) = stream.get_next() {
        seen.push(op.sequence_number().as_i64());
    }
    assert_eq!(seen, vec![1, 2, 3]);
}

// ============================================================================
// Scenario 3: building an idle replica
// ============================================================================

#[test]
fn build_idle_completes_after_copy_and_replication_acks() {
    let mut primary = primary_with_cc(&[2], 2, ReplicatorSettings::default());
    let now = Instant::now();

    // Primary has history up to LSN 100.
    for _ in 0..100 {
        primary.replicate(payload(), now).expect("replicate");
    }
    let ack = AckBody::replication(SequenceNumber::new(100), SequenceNumber::new(100));
    ack_from(&mut primary, 2, ack, now);
    assert_eq!(primary.current_progress(), SequenceNumber::new(100));

    // Begin building replica 9 with two copy operations.
    let mut build_provider = MockStateProvider::with_copy_payloads(2);
    let output = primary
        .build_idle(&replica_info(9), &mut build_provider, now)
        .expect("build");

    let mut idle = SecondaryReplicator::new_idle(
        endpoint(9),
        Epoch::new(1, 1),
        Arc::new(ReplicatorSettings::default()),
    );
    let mut idle_provider = MockStateProvider::default();
    let mut acks = deliver_to_secondary(&output.sends, 9, &mut idle, &mut idle_provider, now);

    // Meanwhile the primary commits LSN 101; the idle receives it through
    // the replication stream (its receiver starts at 101).
    let (lsn, output) = primary.replicate(payload(), now).expect("replicate");
    assert_eq!(lsn, SequenceNumber::new(101));
    acks.extend(deliver_to_secondary(&output.sends, 9, &mut idle, &mut idle_provider, now));

    // Feed the idle's acknowledgments back; the final one covers both the
    // whole copy stream and replication LSN 101.
    let mut build_result = None;
    for ack in acks {
        let output = ack_from(&mut primary, 9, ack, now);
        for (replica, result) in output.build_completions {
            assert_eq!(replica, ReplicaId::new(9));
            build_result = Some(result);
        }
    }
    assert!(matches!(build_result, Some(Ok(()))), "build should complete: {build_result:?}");

    // The idle's consumer sees the full copy stream.
    let copy_stream = idle.copy_stream().expect("copy stream");
    let mut copied = 0;
    loop {
        match copy_stream.get_next() {
            StreamEntry::Operation(op) if op.is_end_of_stream() => {}
            StreamEntry::Operation(_) => copied += 1,
            StreamEntry::EndOfStream => break,
            StreamEntry::Pending => panic!("copy stream stalled"),
        }
    }
    assert_eq!(copied, 2);
}

// ============================================================================
// Scenario 4: slow secondary detection
// ============================================================================

#[test]
fn lone_slow_secondary_is_faulted_and_memory_released() {
    let settings = ReplicatorSettings {
        initial_replication_queue_size: 8,
        max_replication_queue_size: 8,
        ..Default::default()
    };
    let mut primary = primary_with_cc(&[2, 3, 4], 2, settings);
    let t0 = Instant::now();

    for _ in 0..5 {
        primary.replicate(payload(), t0).expect("replicate");
    }

    // Fast peers ack everything quickly; the slow one acks only LSN 1,
    // late.
    let fast = AckBody::replication(SequenceNumber::new(5), SequenceNumber::new(5));
    ack_from(&mut primary, 2, fast, t0 + Duration::from_millis(50));
    ack_from(&mut primary, 3, fast, t0 + Duration::from_millis(50));
    let slow = AckBody::replication(SequenceNumber::new(1), SequenceNumber::new(1));
    ack_from(&mut primary, 4, slow, t0 + Duration::from_millis(500));

    // The slow peer pins the queue at LSN 2.
    assert_eq!(
        primary.manager().queue().first_sequence_number(),
        SequenceNumber::new(2)
    );

    // Forty seconds later the queue crosses the fill threshold.
    let t1 = t0 + Duration::from_secs(40);
    for _ in 0..3 {
        primary.replicate(payload(), t1).expect("replicate");
    }

    let session = primary
        .manager()
        .session(ReplicaId::new(4))
        .expect("session");
    assert!(session.is_active_faulted_due_to_slow_progress());

    // With the faulted peer excluded, the fast majority's progress frees
    // the retained range.
    assert_eq!(
        primary.manager().queue().first_sequence_number(),
        SequenceNumber::new(6)
    );

    // The retry tick nags the faulted peer to recycle.
    let output = primary.on_retry_tick(t1);
    assert!(output.sends.iter().any(|envelope| {
        envelope.target_replica == ReplicaId::new(4)
            && matches!(envelope.body, MessageBody::InduceFault(_))
    }));
}

// ============================================================================
// Scenario 5: reconfiguration with a previous configuration
// ============================================================================

#[test]
fn reconfiguration_commit_is_min_of_both_configurations() {
    let mut primary = primary_with_cc(&[2, 3], 2, ReplicatorSettings::default());
    let now = Instant::now();

    for _ in 0..10 {
        primary.replicate(payload(), now).expect("replicate");
    }
    let ack = AckBody::replication(SequenceNumber::new(10), SequenceNumber::new(10));
    ack_from(&mut primary, 2, ack, now);
    ack_from(&mut primary, 3, ack, now);
    assert_eq!(queue_markers(&primary).2, 10);

    // {2,3} q=2 transitions to {2,3,4,5} q=3 with PC {2,3} q=2.
    let previous = [replica_info(2), replica_info(3)];
    let current = [
        replica_info(2),
        replica_info(3),
        replica_info_with_progress(4, 10),
        replica_info_with_progress(5, 10),
    ];
    primary
        .update_catchup_configuration(&previous, 2, &current, 3, now)
        .expect("reconfigure");

    assert!(primary.manager().has_write_quorum());

    // New operations cannot commit until the widened quorum acks: 4 and 5
    // count as being at LSN 10, so the CC quorum index lands on 10.
    let (lsn, _) = primary.replicate(payload(), now).expect("replicate");
    assert_eq!(lsn, SequenceNumber::new(11));
    assert_eq!(queue_markers(&primary).2, 10);

    // One old member acking is not enough for the new quorum of 3.
    let ack11 = AckBody::replication(SequenceNumber::new(11), SequenceNumber::new(11));
    let output = ack_from(&mut primary, 2, ack11, now);
    assert!(output.completed_replicates.is_empty());

    // A second ack satisfies CC (primary + 2 acks) and PC {2,3} q=2.
    let output = ack_from(&mut primary, 3, ack11, now);
    assert!(output
        .completed_replicates
        .iter()
        .any(|(l, r)| *l == SequenceNumber::new(11) && r.is_ok()));
}

// ============================================================================
// Scenario 6: queue-full backpressure with recovery
// ============================================================================

#[test]
fn queue_full_surfaces_and_recovers_after_acks() {
    let settings = ReplicatorSettings {
        initial_replication_queue_size: 4,
        max_replication_queue_size: 4,
        ..Default::default()
    };
    let mut primary = primary_with_cc(&[2], 2, settings);
    let now = Instant::now();

    for _ in 0..4 {
        primary.replicate(payload(), now).expect("replicate");
    }
    assert_eq!(
        primary.replicate(payload(), now).unwrap_err(),
        ReplicationError::QueueFull
    );

    // The peer acks LSN 1; the retry slips in.
    let ack = AckBody::replication(SequenceNumber::new(1), SequenceNumber::new(1));
    ack_from(&mut primary, 2, ack, now);
    let (lsn, _) = primary.replicate(payload(), now).expect("retry");
    assert_eq!(lsn, SequenceNumber::new(5));
    assert_eq!(queue_markers(&primary).0, 1);
}

// ============================================================================
// Catch-up waits
// ============================================================================

#[test]
fn write_quorum_catch_up_waits_for_must_catch_up_replica() {
    let mut primary = primary_with_cc(&[2, 3], 2, ReplicatorSettings::default());
    let now = Instant::now();

    for _ in 0..5 {
        primary.replicate(payload(), now).expect("replicate");
    }

    // Reconfigure with replica 3 marked must-catch-up; the bound is the
    // last LSN at reconfiguration time.
    let mut info3 = replica_info(3);
    info3.must_catch_up = true;
    primary
        .update_catchup_configuration(
            &[replica_info(2), replica_info(3)],
            2,
            &[replica_info(2), info3],
            2,
            now,
        )
        .expect("reconfigure");

    let output = primary
        .begin_wait_for_catch_up(CatchUpMode::WriteQuorum, now)
        .expect("catch up");
    assert!(output.catch_up_completed.is_none());

    // Replica 2 alone satisfies the write quorum, but 3 must catch up too.
    let ack = AckBody::replication(SequenceNumber::new(5), SequenceNumber::new(5));
    let output = ack_from(&mut primary, 2, ack, now);
    assert!(output.catch_up_completed.is_none());

    let output = ack_from(&mut primary, 3, ack, now);
    assert!(matches!(output.catch_up_completed, Some(Ok(()))));
}

#[test]
fn quorum_all_catch_up_waits_for_slowest() {
    let mut primary = primary_with_cc(&[2, 3], 2, ReplicatorSettings::default());
    let now = Instant::now();

    for _ in 0..3 {
        primary.replicate(payload(), now).expect("replicate");
    }

    let output = primary
        .begin_wait_for_catch_up(CatchUpMode::QuorumAll, now)
        .expect("catch up");
    assert!(output.catch_up_completed.is_none());

    let ack = AckBody::replication(SequenceNumber::new(3), SequenceNumber::new(3));
    let output = ack_from(&mut primary, 2, ack, now);
    assert!(output.catch_up_completed.is_none(), "one of two acked");

    let output = ack_from(&mut primary, 3, ack, now);
    assert!(matches!(output.catch_up_completed, Some(Ok(()))));
}

#[test]
fn catch_up_cancellation_surfaces_canceled() {
    let mut primary = primary_with_cc(&[2], 2, ReplicatorSettings::default());
    let now = Instant::now();
    primary.replicate(payload(), now).expect("replicate");

    primary
        .begin_wait_for_catch_up(CatchUpMode::QuorumAll, now)
        .expect("catch up");
    let output = primary.cancel_catch_up();
    assert!(matches!(
        output.catch_up_completed,
        Some(Err(ReplicationError::OperationCanceled))
    ));
}

// ============================================================================
// Ack idempotence across the pair
// ============================================================================

#[test]
fn ack_replay_in_any_order_converges() {
    let make_primary = || primary_with_cc(&[2], 2, ReplicatorSettings::default());
    let now = Instant::now();

    let run = |ack_order: &[(i64, i64)]| {
        let mut primary = make_primary();
        for _ in 0..4 {
            primary.replicate(payload(), now).expect("replicate");
        }
        for (receive, quorum) in ack_order {
            let ack =
                AckBody::replication(SequenceNumber::new(*receive), SequenceNumber::new(*quorum));
            ack_from(&mut primary, 2, ack, now);
        }
        queue_markers(&primary)
    };

    let in_order = run(&[(1, 1), (2, 2), (4, 4)]);
    let replayed = run(&[(4, 4), (1, 1), (4, 4), (2, 2)]);
    let stale_last = run(&[(4, 4), (3, 3)]);
    assert_eq!(in_order, replayed);
    assert_eq!(in_order, stale_last);
    assert_eq!(in_order, (4, 4, 4, 4));
}
