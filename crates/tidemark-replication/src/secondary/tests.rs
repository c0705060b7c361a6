//! Secondary replicator behavior tests.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use tidemark_types::{Epoch, PartitionId, ReplicaId, ReplicationEndpointId, SequenceNumber};
use tidemark_wire::{
    AckBody, FromHeader, InduceFaultBody, MessageBody, OperationMetadata,
    ReplicationOperationBody, StartCopyBody, WireOperation,
};

use crate::config::ReplicatorSettings;
use crate::stream::{FaultKind, StreamEntry};
use crate::testing::MockStateProvider;

use super::{SecondaryReplicator, SecondaryRoleKind};

fn endpoint(replica: u64) -> ReplicationEndpointId {
    ReplicationEndpointId::new(PartitionId::generate(), ReplicaId::new(replica))
}

fn primary_header() -> FromHeader {
    FromHeader {
        address: "10.0.0.1:9099".into(),
        endpoint_id: endpoint(1),
    }
}

fn settings() -> Arc<ReplicatorSettings> {
    Arc::new(ReplicatorSettings::default())
}

fn batch(epoch: Epoch, lsns: &[i64]) -> ReplicationOperationBody {
    ReplicationOperationBody {
        operations: lsns
            .iter()
            .map(|lsn| {
                let payload = Bytes::from_static(b"data");
                WireOperation {
                    metadata: OperationMetadata::normal(SequenceNumber::new(*lsn)),
                    epoch,
                    segment_sizes: vec![payload.len() as u64],
                    segments: vec![payload],
                }
            })
            .collect(),
        primary_epoch: epoch,
        completed_sequence_number: SequenceNumber::NON_INITIALIZED,
        last_in_batch: true,
    }
}

fn last_ack(output: &super::SecondaryOutput) -> AckBody {
    output
        .sends
        .iter()
        .rev()
        .find_map(|envelope| match &envelope.body {
            MessageBody::ReplicationAck(ack) => Some(*ack),
            _ => None,
        })
        .expect("output carries an ack")
}

#[test]
fn replication_flow_acks_receive_and_apply() {
    let epoch = Epoch::new(1, 1);
    let mut secondary = SecondaryReplicator::new_idle(endpoint(2), epoch, settings());
    let mut provider = MockStateProvider::default();
    let now = Instant::now();

    secondary.process_start_copy(
        &primary_header(),
        &StartCopyBody {
            epoch,
            replica_id: ReplicaId::new(2),
            replication_start_sequence: SequenceNumber::new(1),
        },
        &mut provider,
        now,
    );

    let output =
        secondary.process_replication_batch(&primary_header(), &batch(epoch, &[1, 2, 3]), &mut provider, now);
    let ack = last_ack(&output);
    assert_eq!(ack.replication_receive, SequenceNumber::new(3));
    assert_eq!(ack.replication_quorum, SequenceNumber::new(3));

    // Strict in-order delivery on the stream.
    let stream = secondary.replication_stream().expect("stream");
    for expected in 1..=3 {
        match stream.get_next() {
            StreamEntry::Operation(op) => assert_eq!(op.sequence_number().as_i64(), expected),
            other => panic!("expected op {expected}, got {other:?}"),
        }
    }
}

#[test]
fn stale_epoch_batches_are_dropped() {
    let epoch = Epoch::new(2, 1);
    let mut secondary = SecondaryReplicator::new_idle(endpoint(2), epoch, settings());
    let mut provider = MockStateProvider::default();
    let now = Instant::now();

    secondary.process_start_copy(
        &primary_header(),
        &StartCopyBody {
            epoch,
            replica_id: ReplicaId::new(2),
            replication_start_sequence: SequenceNumber::new(1),
        },
        &mut provider,
        now,
    );

    let stale = batch(Epoch::new(1, 9), &[1]);
    let output =
        secondary.process_replication_batch(&primary_header(), &stale, &mut provider, now);
    assert!(output.sends.is_empty());
    assert_eq!(secondary.current_progress(), SequenceNumber::new(0));
}

#[test]
fn epoch_barrier_drains_before_provider_update() {
    let e1 = Epoch::new(1, 1);
    let e2 = Epoch::new(1, 2);
    let mut secondary = SecondaryReplicator::new_idle(endpoint(2), e1, settings());
    let mut provider = MockStateProvider::default();
    let now = Instant::now();

    secondary.process_start_copy(
        &primary_header(),
        &StartCopyBody {
            epoch: e1,
            replica_id: ReplicaId::new(2),
            replication_start_sequence: SequenceNumber::new(1),
        },
        &mut provider,
        now,
    );
    secondary.process_replication_batch(&primary_header(), &batch(e1, &[1]), &mut provider, now);

    // New-epoch batch arrives while op 1 sits undelivered: it must wait.
    secondary.process_replication_batch(&primary_header(), &batch(e2, &[2]), &mut provider, now);
    assert!(provider.epoch_updates.is_empty());
    assert_eq!(secondary.epoch(), e1);

    let stream = secondary.replication_stream().expect("stream");
    match stream.get_next() {
        StreamEntry::Operation(op) => assert_eq!(op.sequence_number().as_i64(), 1),
        other => panic!("expected op 1, got {other:?}"),
    }
    // Nothing from the new epoch is observable before the barrier.
    assert!(matches!(stream.get_next(), StreamEntry::Pending));

    let output = secondary.poll_epoch_barrier(&mut provider, now);
    assert!(matches!(output.epoch_updated, Some(Ok(()))));
    assert_eq!(provider.epoch_updates, vec![(e2, SequenceNumber::new(1))]);
    assert_eq!(secondary.epoch(), e2);

    match stream.get_next() {
        StreamEntry::Operation(op) => assert_eq!(op.sequence_number().as_i64(), 2),
        other => panic!("expected op 2, got {other:?}"),
    }
}

#[test]
fn failed_epoch_update_faults_the_role() {
    let e1 = Epoch::new(1, 1);
    let mut secondary = SecondaryReplicator::new_idle(endpoint(2), e1, settings());
    let mut provider = MockStateProvider {
        fail_update_epoch: true,
        ..Default::default()
    };
    let now = Instant::now();

    let output = secondary
        .update_epoch(Epoch::new(1, 2), &mut provider, now)
        .expect("update accepted");
    assert!(matches!(output.epoch_updated, Some(Err(_))));
    assert!(output.fault.is_some());
    assert!(secondary.is_faulted());
}

#[test]
fn consumer_fault_terminates_streams() {
    let epoch = Epoch::new(1, 1);
    let mut secondary = SecondaryReplicator::new_idle(endpoint(2), epoch, settings());
    let mut provider = MockStateProvider::default();
    let now = Instant::now();

    secondary.process_start_copy(
        &primary_header(),
        &StartCopyBody {
            epoch,
            replica_id: ReplicaId::new(2),
            replication_start_sequence: SequenceNumber::new(1),
        },
        &mut provider,
        now,
    );
    secondary.process_replication_batch(&primary_header(), &batch(epoch, &[1, 2]), &mut provider, now);

    let stream = secondary.replication_stream().expect("stream");
    stream.report_fault(FaultKind::Permanent);

    let output = secondary.poll_stream_faults(now);
    match output.fault {
        Some((FaultKind::Permanent, _)) => {}
        other => panic!("expected permanent fault, got {other:?}"),
    }
    assert!(matches!(stream.get_next(), StreamEntry::EndOfStream));
    // The flushed ack carries the fault code.
    assert_ne!(last_ack(&output).error_code, 0);
}

#[test]
fn close_waits_for_end_of_stream_ack() {
    let epoch = Epoch::new(1, 1);
    let mut secondary = SecondaryReplicator::new_idle(endpoint(2), epoch, settings());
    let mut provider = MockStateProvider::default();
    let now = Instant::now();

    secondary.process_start_copy(
        &primary_header(),
        &StartCopyBody {
            epoch,
            replica_id: ReplicaId::new(2),
            replication_start_sequence: SequenceNumber::new(1),
        },
        &mut provider,
        now,
    );
    secondary.process_replication_batch(&primary_header(), &batch(epoch, &[1]), &mut provider, now);

    let output = secondary.begin_close(now);
    assert!(!output.close_completed);

    // The consumer drains up to the synthetic end-of-stream and acks it.
    let stream = secondary.replication_stream().expect("stream");
    let mut eos = None;
    loop {
        match stream.get_next() {
            StreamEntry::Operation(op) if op.is_end_of_stream() => {
                eos = Some(op);
                break;
            }
            StreamEntry::Operation(_) => {}
            StreamEntry::EndOfStream => break,
            StreamEntry::Pending => panic!("stream stalled before end of stream"),
        }
    }
    let eos = eos.expect("explicit end-of-stream operation");
    let output = secondary.ack_replication_operation(&eos, &mut provider, now);
    assert!(output.close_completed);
}

#[test]
fn induce_fault_matches_incarnation() {
    let epoch = Epoch::new(1, 1);
    let our_endpoint = endpoint(2);
    let mut secondary = SecondaryReplicator::new_idle(our_endpoint, epoch, settings());
    let now = Instant::now();

    // Wrong incarnation: ignored.
    let other = endpoint(2);
    let output = secondary.process_induce_fault(
        &InduceFaultBody {
            target_replica_id: ReplicaId::new(2),
            target_incarnation: other.incarnation_id,
            reason: "slow".into(),
        },
        now,
    );
    assert!(output.fault.is_none());

    let output = secondary.process_induce_fault(
        &InduceFaultBody {
            target_replica_id: ReplicaId::new(2),
            target_incarnation: our_endpoint.incarnation_id,
            reason: "slow".into(),
        },
        now,
    );
    assert!(output.fault.is_some());
    assert!(secondary.is_faulted());
}

#[test]
fn promotion_reports_role_change() {
    let mut secondary = SecondaryReplicator::new_idle(endpoint(2), Epoch::new(1, 1), settings());
    assert_eq!(secondary.role(), SecondaryRoleKind::Idle);
    secondary.promote_to_active();
    assert_eq!(secondary.role(), SecondaryRoleKind::Active);
}
