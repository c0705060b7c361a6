//! Ordered receive pipeline for the replication stream.
//!
//! Inbound batches land in an operation queue keyed by LSN; the contiguous
//! prefix is dispatched to the consumer through the dispatch queue, and
//! receive/apply progress is reported back to the primary in piggybacked
//! acknowledgments. Out-of-order arrivals buffer in the queue until the gap
//! fills.
//!
//! With `require_service_ack`, completion (and therefore the apply half of
//! the ack) waits for the consumer's explicit acknowledgment of each
//! operation; otherwise dispatch counts as applied.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use tidemark_types::SequenceNumber;
use tidemark_wire::ReplicationOperationBody;

use crate::config::ReplicatorSettings;
use crate::error::{ReplicationError, ReplicationResult};
use crate::operation::Operation;
use crate::queue::{OperationQueue, QueueOptions};
use crate::stream::{DispatchQueue, OperationStream};

/// Replication progress to report to the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationProgress {
    /// Last LSN of the contiguous received prefix.
    pub receive: SequenceNumber,

    /// Last LSN the consumer has applied.
    pub apply: SequenceNumber,
}

/// Receives, orders, and dispatches replication operations.
pub struct ReplicationReceiver {
    name: String,
    queue: OperationQueue,
    dispatch: Arc<DispatchQueue>,
    require_service_ack: bool,
    start_sequence: SequenceNumber,
}

impl std::fmt::Debug for ReplicationReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReplicationReceiver({}, {:?})", self.name, self.queue)
    }
}

impl ReplicationReceiver {
    pub fn new(name: String, settings: &ReplicatorSettings, start_sequence: SequenceNumber) -> Self {
        let queue = OperationQueue::new(QueueOptions {
            name: format!("{name}:repl"),
            initial_size: settings.initial_replication_queue_size,
            max_size: settings.max_replication_queue_size,
            max_memory_size: settings.max_replication_queue_memory_size,
            max_completed_count: settings.max_completed_operations_count,
            max_completed_bytes: settings.max_completed_operations_memory_size,
            require_service_ack: settings.require_service_ack,
            clean_on_complete: false,
            ignore_commit: false,
            start_sequence,
        });
        Self::from_queue(name, settings, queue)
    }

    /// Wraps an adopted queue (demotion from primary keeps the replication
    /// state).
    pub fn from_queue(name: String, settings: &ReplicatorSettings, mut queue: OperationQueue) -> Self {
        let capacity = if settings.max_replication_queue_size > 0 {
            settings.max_replication_queue_size
        } else {
            settings.initial_replication_queue_size * 16
        };
        let dispatch = DispatchQueue::new(capacity as usize);

        let sink = Arc::clone(&dispatch);
        let require_service_ack = settings.require_service_ack;
        let start_sequence = queue.head();
        queue.set_commit_callback(Box::new(move |op| {
            if require_service_ack {
                op.set_needs_service_ack();
            }
            if sink.enqueue(Arc::clone(op)).is_err() {
                debug!(lsn = %op.sequence_number(), "dispatch dropped after stream close");
            }
        }));

        Self {
            name,
            queue,
            dispatch,
            require_service_ack,
            start_sequence,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn stream(&self) -> OperationStream {
        OperationStream::new(Arc::clone(&self.dispatch))
    }

    pub fn dispatch_queue(&self) -> &Arc<DispatchQueue> {
        &self.dispatch
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// Surrenders the queue for promotion to primary.
    pub fn into_queue(mut self) -> OperationQueue {
        self.queue.clear_commit_callback();
        self.dispatch.close();
        self.queue
    }

    pub fn progress(&self) -> ReplicationProgress {
        ReplicationProgress {
            receive: self.queue.committed_head().prev(),
            apply: self.queue.head().prev(),
        }
    }

    pub fn start_sequence(&self) -> SequenceNumber {
        self.start_sequence
    }

    /// True when every dispatched operation has been consumed and acked;
    /// the epoch barrier and close wait on this.
    pub fn is_drained(&self) -> bool {
        self.queue.head() == self.queue.committed_head() && self.dispatch.is_empty()
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    /// Enqueues one batch. Duplicates are dropped silently (the ack tells
    /// the primary where we are); gaps buffer until filled. Returns the
    /// progress to ack.
    pub fn process_batch(
        &mut self,
        body: &ReplicationOperationBody,
        now: Instant,
    ) -> ReplicationResult<ReplicationProgress> {
        for wire_op in &body.operations {
            let op = Arc::new(Operation::from_wire(wire_op.clone()));
            match self.queue.try_enqueue(op, now) {
                Ok(()) | Err(ReplicationError::DuplicateOperation) => {}
                Err(error) => {
                    debug!(receiver = %self.name, %error, "replication enqueue failed");
                    return Err(error);
                }
            }
        }

        // Dispatch the in-order prefix, then advance completion as far as
        // the service-ack mode allows: without service acks the dispatch
        // itself counts as applied.
        self.queue.commit(now);
        self.queue.complete(now);

        Ok(self.progress())
    }

    /// Consumer acknowledged apply for `op`. Advances the apply marker
    /// through the acked prefix.
    pub fn on_operation_acked(&mut self, op: &Arc<Operation>, now: Instant) -> ReplicationProgress {
        op.acknowledge();
        self.queue.complete(now);
        self.progress()
    }

    /// Local end-of-stream marker pushed straight into the dispatch queue;
    /// it never occupies an LSN slot.
    pub fn enqueue_end_of_stream(&mut self, epoch: tidemark_types::Epoch) -> Arc<Operation> {
        let eos = Arc::new(Operation::end_of_stream(
            SequenceNumber::NON_INITIALIZED,
            epoch,
        ));
        if self.require_service_ack {
            eos.set_needs_service_ack();
        }
        let _ = self.dispatch.enqueue(Arc::clone(&eos));
        self.dispatch.close();
        eos
    }

    /// Drops everything the consumer has not seen; used by fault teardown.
    pub fn abandon(&mut self, now: Instant) {
        self.dispatch.clear();
        self.dispatch.close();
        self.queue.discard_uncommitted(now);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tidemark_types::Epoch;
    use tidemark_wire::{OperationMetadata, WireOperation};

    use crate::stream::StreamEntry;

    use super::*;

    fn batch(lsns: &[i64]) -> ReplicationOperationBody {
        ReplicationOperationBody {
            operations: lsns
                .iter()
                .map(|lsn| {
                    let payload = Bytes::from_static(b"op");
                    WireOperation {
                        metadata: OperationMetadata::normal(SequenceNumber::new(*lsn)),
                        epoch: Epoch::new(1, 1),
                        segment_sizes: vec![payload.len() as u64],
                        segments: vec![payload],
                    }
                })
                .collect(),
            primary_epoch: Epoch::new(1, 1),
            completed_sequence_number: SequenceNumber::NON_INITIALIZED,
            last_in_batch: true,
        }
    }

    fn receiver(require_service_ack: bool) -> ReplicationReceiver {
        let settings = ReplicatorSettings {
            require_service_ack,
            ..Default::default()
        };
        ReplicationReceiver::new("sec".into(), &settings, SequenceNumber::new(1))
    }

    #[test]
    fn in_order_batch_acks_receive_and_apply() {
        let mut r = receiver(false);
        let now = Instant::now();
        let progress = r.process_batch(&batch(&[1, 2, 3]), now).expect("batch");
        assert_eq!(progress.receive, SequenceNumber::new(3));
        assert_eq!(progress.apply, SequenceNumber::new(3));
    }

    #[test]
    fn out_of_order_buffers_until_gap_fills() {
        let mut r = receiver(false);
        let now = Instant::now();
        let progress = r.process_batch(&batch(&[2, 3]), now).expect("batch");
        assert_eq!(progress.receive, SequenceNumber::new(0));

        let stream = r.stream();
        assert!(matches!(stream.get_next(), StreamEntry::Pending));

        let progress = r.process_batch(&batch(&[1]), now).expect("fill");
        assert_eq!(progress.receive, SequenceNumber::new(3));

        // Strictly increasing delivery with no gaps.
        for expected in 1..=3 {
            match stream.get_next() {
                StreamEntry::Operation(op) => {
                    assert_eq!(op.sequence_number().as_i64(), expected);
                }
                other => panic!("expected op {expected}, got {other:?}"),
            }
        }
    }

    #[test]
    fn duplicates_are_idempotent() {
        let mut r = receiver(false);
        let now = Instant::now();
        r.process_batch(&batch(&[1, 2]), now).expect("batch");
        let progress = r.process_batch(&batch(&[1, 2]), now).expect("dup");
        assert_eq!(progress.receive, SequenceNumber::new(2));
        // The stream sees each operation once.
        let stream = r.stream();
        let mut seen = 0;
        while let StreamEntry::Operation(_) = stream.get_next() {
            seen += 1;
        }
        assert_eq!(seen, 2);
    }

    #[test]
    fn service_ack_gates_apply_progress() {
        let mut r = receiver(true);
        let now = Instant::now();
        let progress = r.process_batch(&batch(&[1, 2]), now).expect("batch");
        assert_eq!(progress.receive, SequenceNumber::new(2));
        assert_eq!(progress.apply, SequenceNumber::new(0));

        let stream = r.stream();
        let first = match stream.get_next() {
            StreamEntry::Operation(op) => op,
            other => panic!("expected op, got {other:?}"),
        };
        let progress = r.on_operation_acked(&first, now);
        assert_eq!(progress.apply, SequenceNumber::new(1));
    }

    #[test]
    fn drained_tracks_dispatch_and_acks() {
        let mut r = receiver(true);
        let now = Instant::now();
        assert!(r.is_drained());
        r.process_batch(&batch(&[1]), now).expect("batch");
        assert!(!r.is_drained());

        let stream = r.stream();
        let op = match stream.get_next() {
            StreamEntry::Operation(op) => op,
            other => panic!("expected op, got {other:?}"),
        };
        assert!(!r.is_drained());
        r.on_operation_acked(&op, now);
        assert!(r.is_drained());
    }
}
