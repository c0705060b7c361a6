//! Primary-side receiver for a building secondary's copy context.
//!
//! A persisted-state idle sends its copy context (what it already has) up
//! to the primary; the primary orders those operations and feeds them to
//! the state provider's copy-state enumeration. Progress flows back to the
//! idle piggybacked on the copy-context ack: the last in-order context LSN
//! plus an error code (0 = ok).

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use tidemark_types::{ReplicaId, SequenceNumber};
use tidemark_wire::{CopyContextAckBody, CopyContextOperationBody, OperationKind, OperationMetadata};

use crate::error::ReplicationError;
use crate::operation::Operation;
use crate::queue::{OperationQueue, QueueOptions};
use crate::stream::{DispatchQueue, OperationStream};

/// Receives and orders copy-context operations from one building idle.
pub struct CopyContextReceiver {
    name: String,
    replica_id: ReplicaId,
    queue: OperationQueue,
    dispatch: Arc<DispatchQueue>,
    /// LSN of the context terminator, once seen.
    last_context_lsn: Option<SequenceNumber>,
    error: Option<ReplicationError>,
    done: bool,
}

impl std::fmt::Debug for CopyContextReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CopyContextReceiver({} <- {}, done={})",
            self.name, self.replica_id, self.done
        )
    }
}

impl CopyContextReceiver {
    pub fn new(
        name: String,
        replica_id: ReplicaId,
        initial_queue_size: u64,
        max_queue_size: u64,
    ) -> Self {
        let mut queue = OperationQueue::new(QueueOptions {
            name: format!("{name}:ctx"),
            initial_size: initial_queue_size,
            max_size: max_queue_size,
            max_memory_size: 0,
            max_completed_count: 0,
            max_completed_bytes: 0,
            require_service_ack: false,
            clean_on_complete: false,
            ignore_commit: true,
            start_sequence: SequenceNumber::new(1),
        });

        let dispatch = DispatchQueue::new(max_queue_size.max(2) as usize);
        let sink = Arc::clone(&dispatch);
        queue.set_commit_callback(Box::new(move |op| {
            if op.is_end_of_stream() {
                // Terminator: the context stream is complete.
                sink.close();
            } else if sink.enqueue(Arc::clone(op)).is_err() {
                // Dispatch capacity matches the queue capacity; a full
                // queue here means the stream was already torn down.
                debug!(lsn = %op.sequence_number(), "context dispatch dropped after close");
            }
        }));

        Self {
            name,
            replica_id,
            queue,
            dispatch,
            last_context_lsn: None,
            error: None,
            done: false,
        }
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// The stream handed to the state provider's copy-state enumeration.
    pub fn stream(&self) -> OperationStream {
        OperationStream::new(Arc::clone(&self.dispatch))
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Accepts one inbound context operation and produces the ack to send
    /// back. Duplicates are acked, not errored.
    pub fn process_operation(
        &mut self,
        body: CopyContextOperationBody,
        now: Instant,
    ) -> CopyContextAckBody {
        if let Some(error) = &self.error {
            return CopyContextAckBody {
                sequence_number: self.last_completed(),
                error_code: error.to_wire_code(),
            };
        }

        let mut metadata = body.operation.metadata;
        if body.is_last {
            self.last_context_lsn = Some(metadata.sequence_number);
            if body.operation.segments.is_empty() {
                // A bare terminator carries no payload for the provider.
                metadata = OperationMetadata {
                    kind: OperationKind::EndOfStream,
                    ..metadata
                };
            }
        }

        let op = Arc::new(Operation::new(metadata, body.operation.epoch, body.operation.segments));
        match self.queue.try_enqueue(op, now) {
            Ok(()) | Err(ReplicationError::DuplicateOperation) => {}
            Err(error) => {
                warn!(
                    receiver = %self.name,
                    replica = %self.replica_id,
                    %error,
                    "copy context enqueue failed"
                );
                self.fail(error.clone());
                return CopyContextAckBody {
                    sequence_number: self.last_completed(),
                    error_code: error.to_wire_code(),
                };
            }
        }

        // Dispatch the in-order prefix; the queue folds commit into
        // completion for this single-use stream.
        self.queue.complete(now);

        if let Some(last) = self.last_context_lsn {
            if self.queue.head() > last {
                self.done = true;
                self.dispatch.close();
            }
        }

        CopyContextAckBody {
            sequence_number: self.last_completed(),
            error_code: 0,
        }
    }

    /// Fails the context stream; the next ack informs the secondary.
    pub fn fail(&mut self, error: ReplicationError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
        self.dispatch.clear();
        self.dispatch.close();
        self.done = true;
    }

    /// Ack body reflecting current progress, for piggybacked resends.
    pub fn current_ack(&self) -> CopyContextAckBody {
        CopyContextAckBody {
            sequence_number: self.last_completed(),
            error_code: self.error.as_ref().map_or(0, ReplicationError::to_wire_code),
        }
    }

    fn last_completed(&self) -> SequenceNumber {
        let head = self.queue.head();
        if head == SequenceNumber::new(1) {
            SequenceNumber::NON_INITIALIZED
        } else {
            head.prev()
        }
    }
}
