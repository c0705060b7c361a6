//! Reliable per-peer operation sending.
//!
//! A [`ReliableOperationSender`] owns the contiguous unacknowledged tail
//! `[last_receive_ack + 1 .. highest_given]` toward one peer and hands back
//! the batch to retransmit on every retry tick until the peer's receive
//! acks drain it. Operations that have been receive-acked are never sent
//! again; the primary queue relies on that to reclaim their memory safely.
//!
//! Acks are idempotent and monotonic: stale values are ignored, never
//! errors. Each new receive and apply acknowledgment feeds a decaying
//! latency average so the replica manager can spot outliers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use tidemark_types::SequenceNumber;
use tidemark_wire::MessageIdHeader;

use crate::operation::Operation;
use crate::stats::DecayAverage;

/// One transmission's worth of operations.
#[derive(Debug, Clone)]
pub struct SendBatch {
    pub operations: Vec<Arc<Operation>>,

    /// Primary's committed LSN piggybacked on the batch.
    pub completed_snapshot: SequenceNumber,

    /// Stable id across retries of this tail; index counts transmissions.
    pub message_id: MessageIdHeader,
}

#[derive(Debug)]
struct SendEntry {
    op: Arc<Operation>,
    first_sent_at: Option<Instant>,
}

/// Retransmitting send window toward one peer.
#[derive(Debug)]
pub struct ReliableOperationSender {
    name: String,

    /// Unacknowledged tail, ordered by LSN.
    entries: VecDeque<SendEntry>,

    /// Receive-acked operations awaiting the peer's apply ack, with their
    /// first transmission time.
    apply_pending: VecDeque<(SequenceNumber, Instant)>,

    last_receive_ack: SequenceNumber,
    last_apply_ack: SequenceNumber,
    highest_given: SequenceNumber,

    /// Latest committed-LSN snapshot to piggyback.
    completed_snapshot: SequenceNumber,

    /// Send-window cap: at most this many operations in flight.
    window: u64,

    active: bool,
    message_id: MessageIdHeader,

    avg_receive_ack: DecayAverage,
    avg_apply_ack: DecayAverage,
}

impl ReliableOperationSender {
    pub fn new(
        name: String,
        window: u64,
        decay_factor: f64,
        decay_interval: Duration,
    ) -> Self {
        Self {
            name,
            entries: VecDeque::new(),
            apply_pending: VecDeque::new(),
            last_receive_ack: SequenceNumber::NON_INITIALIZED,
            last_apply_ack: SequenceNumber::NON_INITIALIZED,
            highest_given: SequenceNumber::NON_INITIALIZED,
            completed_snapshot: SequenceNumber::NON_INITIALIZED,
            window: window.max(1),
            active: false,
            message_id: MessageIdHeader::fresh(),
            avg_receive_ack: DecayAverage::new(decay_factor, decay_interval),
            avg_apply_ack: DecayAverage::new(decay_factor, decay_interval),
        }
    }

    pub fn open(&mut self) {
        self.active = true;
    }

    /// Stops all sending. Pending entries are dropped; the next retry tick
    /// observes the inactive state and returns nothing.
    pub fn close(&mut self) {
        self.active = false;
        self.entries.clear();
        self.apply_pending.clear();
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Appends `op` as the newest operation to send, with the primary's
    /// committed LSN at hand-off for piggybacking.
    pub fn add(&mut self, op: Arc<Operation>, completed_snapshot: SequenceNumber, _now: Instant) {
        if !self.active {
            return;
        }
        let lsn = op.sequence_number();
        debug_assert!(
            lsn > self.highest_given,
            "sender {}: {lsn} added out of order after {}",
            self.name,
            self.highest_given
        );
        // An LSN the peer already acked never re-enters the window.
        if lsn <= self.last_receive_ack {
            return;
        }
        self.highest_given = lsn;
        self.completed_snapshot = completed_snapshot;
        self.entries.push_back(SendEntry {
            op,
            first_sent_at: None,
        });
    }

    /// The batch to (re)transmit now: the unacked tail up to the window cap.
    /// Returns `None` when closed or there is nothing to send.
    pub fn collect_send(&mut self, now: Instant) -> Option<SendBatch> {
        if !self.active || self.entries.is_empty() {
            return None;
        }

        let mut operations = Vec::new();
        for entry in self.entries.iter_mut().take(self.window as usize) {
            if entry.first_sent_at.is_none() {
                entry.first_sent_at = Some(now);
            }
            operations.push(Arc::clone(&entry.op));
        }

        let batch = SendBatch {
            operations,
            completed_snapshot: self.completed_snapshot,
            message_id: self.message_id,
        };
        self.message_id = self.message_id.next_try();
        Some(batch)
    }

    /// Retry tick: identical to [`Self::collect_send`]; the name documents
    /// the caller.
    pub fn on_retry_tick(&mut self, now: Instant) -> Option<SendBatch> {
        self.collect_send(now)
    }

    /// Applies a peer acknowledgment. Returns true when either marker moved.
    pub fn process_ack(
        &mut self,
        receive_ack: SequenceNumber,
        apply_ack: SequenceNumber,
        now: Instant,
    ) -> bool {
        let mut progress = false;

        if receive_ack > self.last_receive_ack {
            while let Some(entry) = self.entries.front() {
                if entry.op.sequence_number() > receive_ack {
                    break;
                }
                let entry = self.entries.pop_front().expect("front exists");
                if let Some(sent_at) = entry.first_sent_at {
                    self.avg_receive_ack
                        .update(now.saturating_duration_since(sent_at), now);
                    self.apply_pending
                        .push_back((entry.op.sequence_number(), sent_at));
                }
            }
            self.last_receive_ack = receive_ack;
            progress = true;
        }

        if apply_ack > self.last_apply_ack {
            while let Some(&(lsn, sent_at)) = self.apply_pending.front() {
                if lsn > apply_ack {
                    break;
                }
                self.apply_pending.pop_front();
                self.avg_apply_ack
                    .update(now.saturating_duration_since(sent_at), now);
            }
            self.last_apply_ack = apply_ack;
            progress = true;
        }

        if progress {
            debug!(
                sender = %self.name,
                receive = %self.last_receive_ack,
                apply = %self.last_apply_ack,
                pending = self.entries.len(),
                "ack progress"
            );
        }
        progress
    }

    // ========================================================================
    // Progress & statistics
    // ========================================================================

    pub fn last_receive_ack(&self) -> SequenceNumber {
        self.last_receive_ack
    }

    pub fn last_apply_ack(&self) -> SequenceNumber {
        self.last_apply_ack
    }

    /// Receive progress with a floor: a peer that has not acked yet is at
    /// least at the floor of already-completed operations.
    pub fn last_receive_ack_or(&self, floor: SequenceNumber) -> SequenceNumber {
        if self.last_receive_ack == SequenceNumber::NON_INITIALIZED {
            floor
        } else {
            self.last_receive_ack.max(floor)
        }
    }

    pub fn last_apply_ack_or(&self, floor: SequenceNumber) -> SequenceNumber {
        if self.last_apply_ack == SequenceNumber::NON_INITIALIZED {
            floor
        } else {
            self.last_apply_ack.max(floor)
        }
    }

    pub fn has_unacked(&self) -> bool {
        !self.entries.is_empty()
    }

    /// True while the unacked tail is below the send-window cap.
    pub fn has_window_room(&self) -> bool {
        (self.entries.len() as u64) < self.window
    }

    pub fn highest_given(&self) -> SequenceNumber {
        self.highest_given
    }

    pub fn avg_receive_ack_duration(&self) -> Duration {
        self.avg_receive_ack.value()
    }

    pub fn avg_apply_ack_duration(&self) -> Duration {
        self.avg_apply_ack.value()
    }

    /// Forgets latency history; idle-phase latencies are not representative
    /// once a peer is promoted.
    pub fn reset_ack_durations(&mut self, now: Instant) {
        self.avg_receive_ack.reset(now);
        self.avg_apply_ack.reset(now);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tidemark_types::Epoch;
    use tidemark_wire::OperationMetadata;

    use super::*;

    fn op(lsn: i64) -> Arc<Operation> {
        Arc::new(Operation::new(
            OperationMetadata::normal(SequenceNumber::new(lsn)),
            Epoch::new(1, 1),
            vec![Bytes::from_static(b"data")],
        ))
    }

    fn sender() -> ReliableOperationSender {
        let mut s = ReliableOperationSender::new(
            "peer-1".into(),
            1024,
            0.95,
            Duration::from_secs(5),
        );
        s.open();
        s
    }

    #[test]
    fn retransmits_until_receive_acked() {
        let mut s = sender();
        let now = Instant::now();
        s.add(op(1), SequenceNumber::INVALID, now);
        s.add(op(2), SequenceNumber::INVALID, now);

        let first = s.collect_send(now).expect("batch");
        assert_eq!(first.operations.len(), 2);

        // Nothing acked: the retry tick resends the same tail.
        let retry = s.on_retry_tick(now).expect("retry");
        assert_eq!(retry.operations.len(), 2);
        assert_eq!(retry.message_id.id, first.message_id.id);
        assert_eq!(retry.message_id.index, first.message_id.index + 1);

        // Receive ack for 1: only 2 remains.
        assert!(s.process_ack(SequenceNumber::new(1), SequenceNumber::NON_INITIALIZED, now));
        let retry = s.on_retry_tick(now).expect("retry");
        assert_eq!(retry.operations.len(), 1);
        assert_eq!(retry.operations[0].sequence_number().as_i64(), 2);
    }

    #[test]
    fn acks_are_idempotent_and_monotonic() {
        let mut s = sender();
        let now = Instant::now();
        for lsn in 1..=3 {
            s.add(op(lsn), SequenceNumber::INVALID, now);
        }
        s.collect_send(now);

        assert!(s.process_ack(SequenceNumber::new(3), SequenceNumber::new(3), now));
        // Replay and stale acks change nothing and report no progress.
        assert!(!s.process_ack(SequenceNumber::new(3), SequenceNumber::new(3), now));
        assert!(!s.process_ack(SequenceNumber::new(1), SequenceNumber::new(1), now));
        assert_eq!(s.last_receive_ack(), SequenceNumber::new(3));
        assert_eq!(s.last_apply_ack(), SequenceNumber::new(3));
        assert!(!s.has_unacked());
    }

    #[test]
    fn out_of_order_ack_sequences_converge() {
        let mut a = sender();
        let mut b = sender();
        let now = Instant::now();
        for lsn in 1..=4 {
            a.add(op(lsn), SequenceNumber::INVALID, now);
            b.add(op(lsn), SequenceNumber::INVALID, now);
        }
        a.collect_send(now);
        b.collect_send(now);

        // Same set of acks in different orders leaves identical state.
        for (r, q) in [(1, 1), (3, 2), (4, 4)] {
            a.process_ack(SequenceNumber::new(r), SequenceNumber::new(q), now);
        }
        for (r, q) in [(4, 4), (3, 2), (1, 1)] {
            b.process_ack(SequenceNumber::new(r), SequenceNumber::new(q), now);
        }
        assert_eq!(a.last_receive_ack(), b.last_receive_ack());
        assert_eq!(a.last_apply_ack(), b.last_apply_ack());
        assert_eq!(a.has_unacked(), b.has_unacked());
    }

    #[test]
    fn window_caps_batch_size() {
        let mut s = ReliableOperationSender::new(
            "peer-2".into(),
            2,
            0.95,
            Duration::from_secs(5),
        );
        s.open();
        let now = Instant::now();
        for lsn in 1..=5 {
            s.add(op(lsn), SequenceNumber::INVALID, now);
        }
        let batch = s.collect_send(now).expect("batch");
        assert_eq!(batch.operations.len(), 2);
        s.process_ack(SequenceNumber::new(2), SequenceNumber::NON_INITIALIZED, now);
        let batch = s.collect_send(now).expect("batch");
        assert_eq!(
            batch.operations[0].sequence_number(),
            SequenceNumber::new(3)
        );
    }

    #[test]
    fn close_stops_sending() {
        let mut s = sender();
        let now = Instant::now();
        s.add(op(1), SequenceNumber::INVALID, now);
        s.close();
        assert!(s.on_retry_tick(now).is_none());
        // Adds after close are ignored.
        s.add(op(2), SequenceNumber::INVALID, now);
        assert!(!s.has_unacked());
    }

    #[test]
    fn ack_latency_feeds_decaying_average() {
        let mut s = sender();
        let t0 = Instant::now();
        s.add(op(1), SequenceNumber::INVALID, t0);
        s.collect_send(t0);
        let t1 = t0 + Duration::from_millis(250);
        s.process_ack(SequenceNumber::new(1), SequenceNumber::NON_INITIALIZED, t1);
        assert_eq!(s.avg_receive_ack_duration().as_millis(), 250);
        let t2 = t0 + Duration::from_millis(400);
        s.process_ack(SequenceNumber::new(1), SequenceNumber::new(1), t2);
        assert_eq!(s.avg_apply_ack_duration().as_millis(), 400);
    }

    #[test]
    fn floored_progress_for_fresh_sessions() {
        let s = sender();
        assert_eq!(
            s.last_receive_ack_or(SequenceNumber::new(10)),
            SequenceNumber::new(10)
        );
        assert_eq!(
            s.last_apply_ack_or(SequenceNumber::new(10)),
            SequenceNumber::new(10)
        );
    }
}
