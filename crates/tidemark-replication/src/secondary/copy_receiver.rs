//! Ordered receive pipeline for the copy (build) stream.
//!
//! Unlike the replication receiver there is no quorum here: acks address
//! the lone building primary. Copy operations are single-use, so the queue
//! runs with `clean_on_complete` and `ignore_commit` and releases each
//! operation the moment it is dispatched.
//!
//! The final operation carries an explicit `is_last` flag. A zero-buffer
//! last operation is a bare terminator and is not dispatched; with
//! end-of-stream acks enabled the last operation is an explicit
//! `EndOfStream` that the consumer sees and acknowledges. Once the whole
//! stream has been received and dispatched, the receive side resets and the
//! dispatch queue closes.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use tidemark_types::SequenceNumber;
use tidemark_wire::{CopyOperationBody, OperationKind, OperationMetadata};

use crate::config::ReplicatorSettings;
use crate::error::{ReplicationError, ReplicationResult};
use crate::operation::Operation;
use crate::queue::{OperationQueue, QueueOptions};
use crate::stream::{DispatchQueue, OperationStream};

/// Copy progress to report to the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyProgress {
    pub receive: SequenceNumber,
    pub apply: SequenceNumber,
}

/// Receives and dispatches the copy stream of a build.
pub struct CopyReceiver {
    name: String,
    queue: OperationQueue,
    dispatch: Arc<DispatchQueue>,
    /// LSN of the flagged last operation, once seen.
    last_copy_lsn: Option<SequenceNumber>,
    /// Replication LSNs start here; everything below arrived through copy.
    replication_start: Option<SequenceNumber>,
    done: bool,
}

impl std::fmt::Debug for CopyReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CopyReceiver({}, done={}, {:?})", self.name, self.done, self.queue)
    }
}

impl CopyReceiver {
    pub fn new(name: String, settings: &ReplicatorSettings) -> Self {
        let mut queue = OperationQueue::new(QueueOptions {
            name: format!("{name}:copy"),
            initial_size: settings.initial_copy_queue_size,
            max_size: settings.max_copy_queue_size,
            max_memory_size: 0,
            max_completed_count: 0,
            max_completed_bytes: 0,
            require_service_ack: false,
            clean_on_complete: true,
            ignore_commit: true,
            start_sequence: SequenceNumber::new(1),
        });

        let dispatch = DispatchQueue::new(settings.max_copy_queue_size.max(2) as usize);
        let sink = Arc::clone(&dispatch);
        let dispatch_eos = settings.use_stream_faults_and_end_of_stream_acks;
        queue.set_commit_callback(Box::new(move |op| {
            if op.is_end_of_stream() && !dispatch_eos {
                // Bare terminator: nothing for the consumer.
                return;
            }
            if sink.enqueue(Arc::clone(op)).is_err() {
                debug!(lsn = %op.sequence_number(), "copy dispatch dropped after stream close");
            }
        }));

        Self {
            name,
            queue,
            dispatch,
            last_copy_lsn: None,
            replication_start: None,
            done: false,
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

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn set_replication_start(&mut self, start: SequenceNumber) {
        self.replication_start = Some(start);
    }

    pub fn replication_start(&self) -> Option<SequenceNumber> {
        self.replication_start
    }

    pub fn progress(&self) -> CopyProgress {
        let head = self.queue.head().prev();
        CopyProgress {
            receive: head,
            apply: head,
        }
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    /// Accepts one copy operation; duplicates are dropped, gaps buffer.
    /// Returns the copy progress to piggyback on the next ack, or `None`
    /// once the copy has already finished (copy ack fields go quiet).
    pub fn process_operation(
        &mut self,
        body: &CopyOperationBody,
        now: Instant,
    ) -> ReplicationResult<Option<CopyProgress>> {
        if self.done {
            return Ok(None);
        }

        let mut metadata = body.operation.metadata;
        if body.is_last {
            self.last_copy_lsn = Some(metadata.sequence_number);
            if body.operation.segments.is_empty() && metadata.kind == OperationKind::Normal {
                // Legacy terminator: classify it so dispatch skips it.
                metadata = OperationMetadata {
                    kind: OperationKind::EndOfStream,
                    ..metadata
                };
            }
        }

        let op = Arc::new(Operation::new(
            metadata,
            body.operation.epoch,
            body.operation.segments.clone(),
        ));
        match self.queue.try_enqueue(op, now) {
            Ok(()) | Err(ReplicationError::DuplicateOperation) => {}
            Err(error) => {
                debug!(receiver = %self.name, %error, "copy enqueue failed");
                return Err(error);
            }
        }

        // Single-use stream: commit folds into completion and each
        // dispatched operation is released immediately.
        self.queue.complete(now);

        let progress = self.progress();
        if let Some(last) = self.last_copy_lsn {
            if self.queue.head() > last {
                info!(receiver = %self.name, last = %last, "copy stream complete");
                self.done = true;
                self.dispatch.close();
                self.queue.reset(SequenceNumber::new(1));
            }
        }
        Ok(Some(progress))
    }

    /// Tears the stream down without completing it.
    pub fn abandon(&mut self, now: Instant) {
        self.dispatch.clear();
        self.dispatch.close();
        self.queue.discard_pending(self.queue.head(), now);
        self.done = true;
    }
}
