//! The in-memory operation model.
//!
//! One [`Operation`] is shared (via `Arc`) across every session that still
//! has to send it; its payload segments are reference-counted [`Bytes`] so
//! retransmission to N peers never copies the body. Lifecycle transitions
//! stamp a timestamp exactly once each; the cleanup transition is performed
//! by the last queue releasing the operation.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;

use tidemark_types::{Epoch, SequenceNumber};
use tidemark_wire::{OperationKind, OperationMetadata, WireOperation};

/// Lifecycle timestamps, stamped on first transition only.
#[derive(Debug, Default, Clone, Copy)]
struct Lifecycle {
    enqueued_at: Option<Instant>,
    committed_at: Option<Instant>,
    completed_at: Option<Instant>,
    cleaned_at: Option<Instant>,
}

/// An operation held by a replication or copy queue.
#[derive(Debug)]
pub struct Operation {
    metadata: OperationMetadata,
    epoch: Epoch,
    segments: Vec<Bytes>,
    data_size: u64,
    lifecycle: Mutex<Lifecycle>,

    /// Set when the operation has been dispatched to the consumer and the
    /// queue is configured to wait for the consumer's apply ack.
    needs_service_ack: AtomicBool,
}

impl Operation {
    pub fn new(metadata: OperationMetadata, epoch: Epoch, segments: Vec<Bytes>) -> Self {
        let data_size = segments.iter().map(|s| s.len() as u64).sum();
        Self {
            metadata,
            epoch,
            segments,
            data_size,
            lifecycle: Mutex::new(Lifecycle::default()),
            needs_service_ack: AtomicBool::new(false),
        }
    }

    /// Synthetic terminator used to quiesce a stream.
    pub fn end_of_stream(sequence_number: SequenceNumber, epoch: Epoch) -> Self {
        Self::new(OperationMetadata::end_of_stream(sequence_number), epoch, Vec::new())
    }

    pub fn from_wire(wire: WireOperation) -> Self {
        Self::new(wire.metadata, wire.epoch, wire.segments)
    }

    pub fn to_wire(&self) -> WireOperation {
        WireOperation {
            metadata: self.metadata,
            epoch: self.epoch,
            segment_sizes: self.segments.iter().map(|s| s.len() as u64).collect(),
            segments: self.segments.clone(),
        }
    }

    pub fn metadata(&self) -> OperationMetadata {
        self.metadata
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.metadata.sequence_number
    }

    pub fn kind(&self) -> OperationKind {
        self.metadata.kind
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.metadata.kind == OperationKind::EndOfStream
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    // ========================================================================
    // Lifecycle transitions
    // ========================================================================

    /// Stamps the enqueue time. Re-stamps when an operation moves between
    /// queues across a role transition: its lifecycle starts over.
    pub fn mark_enqueued(&self, now: Instant) {
        let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock");
        lifecycle.enqueued_at = Some(now);
        lifecycle.committed_at = None;
        lifecycle.completed_at = None;
        lifecycle.cleaned_at = None;
    }

    /// Stamps commit; returns false if the operation was already committed.
    pub fn mark_committed(&self, now: Instant) -> bool {
        let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock");
        if lifecycle.committed_at.is_some() {
            return false;
        }
        lifecycle.committed_at = Some(now);
        true
    }

    /// Stamps completion; returns false if already completed.
    pub fn mark_completed(&self, now: Instant) -> bool {
        let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock");
        if lifecycle.completed_at.is_some() {
            return false;
        }
        lifecycle.completed_at = Some(now);
        true
    }

    /// Stamps cleanup; returns false if already cleaned.
    pub fn mark_cleaned(&self, now: Instant) -> bool {
        let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock");
        if lifecycle.cleaned_at.is_some() {
            return false;
        }
        lifecycle.cleaned_at = Some(now);
        true
    }

    /// Time since the operation entered its current queue.
    pub fn enqueued_since(&self, now: Instant) -> Duration {
        let lifecycle = self.lifecycle.lock().expect("lifecycle lock");
        lifecycle
            .enqueued_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default()
    }

    // ========================================================================
    // Service acknowledgment
    // ========================================================================

    /// Marks the operation as dispatched and awaiting the consumer's ack.
    pub fn set_needs_service_ack(&self) {
        self.needs_service_ack.store(true, Ordering::Release);
    }

    /// Consumer acked apply; returns true only on the first call.
    pub fn acknowledge(&self) -> bool {
        self.needs_service_ack.swap(false, Ordering::AcqRel)
    }

    pub fn needs_service_ack(&self) -> bool {
        self.needs_service_ack.load(Ordering::Acquire)
    }
}
