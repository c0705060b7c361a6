//! Consumer-facing operation streams.
//!
//! A [`DispatchQueue`] is the bounded hand-off between a receive pipeline
//! (replication or copy) and the single consumer draining it. The consumer
//! holds an [`OperationStream`]; the receiver keeps pushing in-order
//! operations as they commit. Backpressure is the queue's fixed capacity.
//!
//! The stream is also the consumer's fault channel: `report_fault`
//! immediately clears everything dispatchable and closes the stream, so all
//! current and future `get_next` calls observe end-of-stream; the owning
//! secondary picks the fault up on its next event.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::operation::Operation;

/// Severity of a consumer-reported stream fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The replica should be restarted.
    Transient,

    /// The replica's state is unusable and must be rebuilt.
    Permanent,
}

/// Result of polling an [`OperationStream`].
#[derive(Debug, Clone)]
pub enum StreamEntry {
    /// The next in-order operation.
    Operation(Arc<Operation>),

    /// The stream has ended; no further operations will arrive.
    EndOfStream,

    /// Nothing dispatchable right now.
    Pending,
}

/// Bounded single-consumer queue of dispatched operations.
#[derive(Debug)]
pub struct DispatchQueue {
    items: ArrayQueue<Arc<Operation>>,
    closed: AtomicBool,
    fault: Mutex<Option<FaultKind>>,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            items: ArrayQueue::new(capacity.max(1)),
            closed: AtomicBool::new(false),
            fault: Mutex::new(None),
        })
    }

    /// Hands an operation to the consumer; fails when the consumer is not
    /// keeping up.
    pub fn enqueue(&self, op: Arc<Operation>) -> Result<(), Arc<Operation>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(op);
        }
        self.items.push(op)
    }

    /// Marks the stream finished; drained-then-closed reads as end-of-stream.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drops everything not yet consumed.
    pub fn clear(&self) {
        while self.items.pop().is_some() {}
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn pop(&self) -> Option<Arc<Operation>> {
        self.items.pop()
    }

    fn record_fault(&self, kind: FaultKind) {
        let mut fault = self.fault.lock().expect("fault lock");
        // First report wins; later reports cannot downgrade a permanent.
        if fault.is_none() {
            *fault = Some(kind);
        }
    }

    /// Consumes a reported fault, if any. Polled by the owning secondary.
    pub fn take_fault(&self) -> Option<FaultKind> {
        self.fault.lock().expect("fault lock").take()
    }
}

/// The consumer's view of one dispatch queue.
#[derive(Debug, Clone)]
pub struct OperationStream {
    queue: Arc<DispatchQueue>,
}

impl OperationStream {
    pub fn new(queue: Arc<DispatchQueue>) -> Self {
        Self { queue }
    }

    /// Next operation in order. Single consumer only.
    pub fn get_next(&self) -> StreamEntry {
        match self.queue.pop() {
            Some(op) => StreamEntry::Operation(op),
            None if self.queue.is_closed() => StreamEntry::EndOfStream,
            None => StreamEntry::Pending,
        }
    }

    /// Reports a consumer fault: clears pending operations and terminates
    /// the stream, so every subsequent [`Self::get_next`] observes
    /// end-of-stream.
    pub fn report_fault(&self, kind: FaultKind) {
        self.queue.record_fault(kind);
        self.queue.clear();
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tidemark_types::{Epoch, SequenceNumber};
    use tidemark_wire::OperationMetadata;

    use super::*;

    fn op(lsn: i64) -> Arc<Operation> {
        Arc::new(Operation::new(
            OperationMetadata::normal(SequenceNumber::new(lsn)),
            Epoch::new(1, 1),
            vec![Bytes::from_static(b"x")],
        ))
    }

    #[test]
    fn delivers_in_order() {
        let queue = DispatchQueue::new(8);
        let stream = OperationStream::new(Arc::clone(&queue));
        queue.enqueue(op(1)).expect("1");
        queue.enqueue(op(2)).expect("2");

        match stream.get_next() {
            StreamEntry::Operation(op) => assert_eq!(op.sequence_number().as_i64(), 1),
            other => panic!("expected operation, got {other:?}"),
        }
        match stream.get_next() {
            StreamEntry::Operation(op) => assert_eq!(op.sequence_number().as_i64(), 2),
            other => panic!("expected operation, got {other:?}"),
        }
        assert!(matches!(stream.get_next(), StreamEntry::Pending));
    }

    #[test]
    fn close_after_drain_is_end_of_stream() {
        let queue = DispatchQueue::new(8);
        let stream = OperationStream::new(Arc::clone(&queue));
        queue.enqueue(op(1)).expect("1");
        queue.close();

        assert!(matches!(stream.get_next(), StreamEntry::Operation(_)));
        assert!(matches!(stream.get_next(), StreamEntry::EndOfStream));
        assert!(matches!(stream.get_next(), StreamEntry::EndOfStream));
    }

    #[test]
    fn report_fault_clears_and_terminates() {
        let queue = DispatchQueue::new(8);
        let stream = OperationStream::new(Arc::clone(&queue));
        queue.enqueue(op(1)).expect("1");
        queue.enqueue(op(2)).expect("2");

        stream.report_fault(FaultKind::Transient);
        assert!(matches!(stream.get_next(), StreamEntry::EndOfStream));
        assert_eq!(queue.take_fault(), Some(FaultKind::Transient));
        assert_eq!(queue.take_fault(), None);
        // Closed queue refuses further dispatch.
        assert!(queue.enqueue(op(3)).is_err());
    }

    #[test]
    fn bounded_capacity_applies_backpressure() {
        let queue = DispatchQueue::new(1);
        queue.enqueue(op(1)).expect("fits");
        assert!(queue.enqueue(op(2)).is_err());
    }
}
