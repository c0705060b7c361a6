//! The sequence-number-indexed operation queue.
//!
//! A ring of `Option<Arc<Operation>>` slots addressed by `lsn & mask`, with
//! four sliding markers:
//!
//! ```text
//!   completed_head <= head <= committed_head <= tail
//! ```
//!
//! - `completed_head`: smallest LSN still retained (inclusive lower bound)
//! - `head`: first LSN not yet completed
//! - `committed_head`: first LSN not yet committed
//! - `tail`: first unused LSN (exclusive upper bound)
//!
//! On the primary, commit means quorum-receive-acked and the queue runs in
//! `clean_on_complete` mode: completed items are released immediately and
//! the head pair advances together. On a secondary, commit means dispatched
//! to the consumer, and completed items are retained (up to the configured
//! caps) for retransmission to building idle peers.
//!
//! Capacity is always a power of two. It grows toward the configured
//! maximum when an incoming LSN exceeds the window and shrinks back toward
//! the initial size when utilization drops; a convergent-capacity estimator
//! (running average of observed capacities rounded up to a power of two)
//! jumps expansion straight to the likely steady-state size.
//!
//! The queue is not internally synchronized; it is serialized by its
//! owner. Marker violations are coding errors and panic.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use tidemark_types::SequenceNumber;

use crate::error::{ReplicationError, ReplicationResult};
use crate::operation::Operation;

/// Invoked inline for every operation whose commit transition runs. Must not
/// block; the owner's serialization is held around the call.
pub type CommitCallback = Box<dyn FnMut(&Arc<Operation>) + Send>;

/// Construction parameters for an [`OperationQueue`].
pub struct QueueOptions {
    /// Trace identity, e.g. `"REPL"` or `"COPY"` plus the endpoint.
    pub name: String,

    /// Starting capacity; a power of two greater than 1.
    pub initial_size: u64,

    /// Item cap; a power of two, or 0 for uncapped (memory cap required).
    pub max_size: u64,

    /// Byte cap over live operations; 0 for uncapped.
    pub max_memory_size: u64,

    /// Retained-completed item cap; 0 disables. Only meaningful when
    /// `clean_on_complete` is off.
    pub max_completed_count: u64,

    /// Retained-completed byte cap; 0 disables.
    pub max_completed_bytes: u64,

    /// Completion waits for the consumer's apply acknowledgment.
    pub require_service_ack: bool,

    /// Release items as soon as they complete.
    pub clean_on_complete: bool,

    /// Commit is folded into completion (single-use streams such as copy).
    pub ignore_commit: bool,

    /// First LSN the queue will hold; strictly positive.
    pub start_sequence: SequenceNumber,
}

/// Ring-backed container of in-flight operations for one replicator role.
pub struct OperationQueue {
    name: String,

    slots: Vec<Option<Arc<Operation>>>,

    initial_size: u64,
    max_size: u64,
    max_memory_size: u64,
    max_completed_count: u64,
    max_completed_bytes: u64,

    require_service_ack: bool,
    clean_on_complete: bool,
    ignore_commit: bool,

    commit_callback: Option<CommitCallback>,

    capacity: u64,
    mask: i64,

    completed_head: SequenceNumber,
    head: SequenceNumber,
    committed_head: SequenceNumber,
    tail: SequenceNumber,

    // Convergent-capacity bookkeeping
    expanded_last: bool,
    capacity_sum: u64,
    capacity_change_count: u64,
    convergent_capacity: u64,

    total_memory: u64,
    completed_memory: u64,
    operation_count: u64,
    completed_count: u64,
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}, {}, {}, {}] mem={} completed_mem={} count={}",
            self.name,
            self.completed_head,
            self.head,
            self.committed_head,
            self.tail,
            self.total_memory,
            self.completed_memory,
            self.operation_count,
        )
    }
}

impl OperationQueue {
    pub fn new(options: QueueOptions) -> Self {
        assert!(
            options.initial_size > 1 && options.initial_size.is_power_of_two(),
            "queue {}: initial capacity {} must be a power of two greater than 1",
            options.name,
            options.initial_size
        );
        assert!(
            options.max_size == 0 || options.max_size.is_power_of_two(),
            "queue {}: max capacity {} must be a power of two",
            options.name,
            options.max_size
        );
        assert!(
            options.max_size == 0 || options.initial_size <= options.max_size,
            "queue {}: initial capacity {} exceeds max {}",
            options.name,
            options.initial_size,
            options.max_size
        );
        assert!(
            options.max_size != 0 || options.max_memory_size != 0,
            "queue {}: either an item cap or a memory cap must be configured",
            options.name
        );
        assert!(
            options.start_sequence.is_valid(),
            "queue {}: start sequence {} must be strictly positive",
            options.name,
            options.start_sequence
        );
        assert!(
            !(options.clean_on_complete
                && (options.max_completed_count != 0 || options.max_completed_bytes != 0)),
            "queue {}: clean-on-complete queues retain nothing, completed caps are meaningless",
            options.name
        );

        let capacity = options.initial_size;
        let mut slots = Vec::new();
        slots.resize_with(capacity as usize, || None);

        Self {
            name: options.name,
            slots,
            initial_size: options.initial_size,
            max_size: options.max_size,
            max_memory_size: options.max_memory_size,
            max_completed_count: options.max_completed_count,
            max_completed_bytes: options.max_completed_bytes,
            require_service_ack: options.require_service_ack,
            clean_on_complete: options.clean_on_complete,
            ignore_commit: options.ignore_commit,
            commit_callback: None,
            capacity,
            mask: capacity as i64 - 1,
            completed_head: options.start_sequence,
            head: options.start_sequence,
            committed_head: options.start_sequence,
            tail: options.start_sequence,
            expanded_last: false,
            capacity_sum: capacity,
            capacity_change_count: 1,
            convergent_capacity: 0,
            total_memory: 0,
            completed_memory: 0,
            operation_count: 0,
            completed_count: 0,
        }
    }

    /// Builds a queue by adopting another queue's contents across a role
    /// transition. The operations restart their lifecycle: enqueue times are
    /// refreshed, and the new role's caps and cleanup mode apply.
    pub fn adopt(
        name: String,
        mut other: OperationQueue,
        initial_size: u64,
        max_size: u64,
        max_memory_size: u64,
        max_completed_count: u64,
        max_completed_bytes: u64,
        clean_on_complete: bool,
        now: Instant,
    ) -> Self {
        for slot in other.slots.iter().flatten() {
            slot.mark_enqueued(now);
        }

        let mut queue = Self {
            name,
            slots: std::mem::take(&mut other.slots),
            initial_size,
            max_size,
            max_memory_size,
            max_completed_count,
            max_completed_bytes,
            require_service_ack: other.require_service_ack,
            clean_on_complete,
            ignore_commit: other.ignore_commit,
            commit_callback: None,
            capacity: other.capacity,
            mask: other.mask,
            completed_head: other.completed_head,
            head: other.head,
            committed_head: other.committed_head,
            tail: other.tail,
            expanded_last: other.expanded_last,
            capacity_sum: other.capacity_sum,
            capacity_change_count: other.capacity_change_count,
            convergent_capacity: 0,
            total_memory: other.total_memory,
            completed_memory: other.completed_memory,
            operation_count: other.operation_count,
            completed_count: other.completed_count,
        };

        assert!(
            queue.initial_size > 1 && queue.initial_size.is_power_of_two(),
            "queue {}: initial capacity {} must be a power of two greater than 1",
            queue.name,
            queue.initial_size
        );
        assert!(
            queue.max_size != 0 || queue.max_memory_size != 0,
            "queue {}: either an item cap or a memory cap must be configured",
            queue.name
        );

        if max_size > 0 {
            assert!(
                queue.operation_count <= max_size,
                "queue {}: adopted {} operations over the cap {}",
                queue.name,
                queue.operation_count,
                max_size
            );

            // Force a shrink toward the new role's sizing.
            let was_expanded = queue.expanded_last;
            queue.expanded_last = true;
            if !queue.shrink(active_span(queue.completed_head, queue.tail), false, now) {
                queue.expanded_last = was_expanded;
            }

            queue.capacity_sum = queue.capacity;
            queue.capacity_change_count = 1;
            queue.convergent_capacity = 0;
            queue.mask = queue.capacity as i64 - 1;
        }

        queue.check_invariants();
        queue
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn completed_head(&self) -> SequenceNumber {
        self.completed_head
    }

    pub fn head(&self) -> SequenceNumber {
        self.head
    }

    pub fn committed_head(&self) -> SequenceNumber {
        self.committed_head
    }

    pub fn tail(&self) -> SequenceNumber {
        self.tail
    }

    /// Last LSN ever given to the queue; `tail - 1`.
    pub fn last_sequence_number(&self) -> SequenceNumber {
        self.tail.prev()
    }

    /// Smallest LSN whose operation is still retained.
    pub fn first_sequence_number(&self) -> SequenceNumber {
        self.completed_head
    }

    pub fn operation_count(&self) -> u64 {
        self.operation_count
    }

    pub fn total_memory(&self) -> u64 {
        self.total_memory
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.operation_count == 0
    }

    pub fn clean_on_complete(&self) -> bool {
        self.clean_on_complete
    }

    /// Live (non-completed) usage as a percentage of the hard cap.
    pub fn usage_percent(&self) -> u8 {
        let usage = if self.max_size > 0 {
            let live = self.operation_count - self.completed_count;
            live.saturating_mul(100) / self.max_size
        } else if self.max_memory_size > 0 {
            let live = self.total_memory - self.completed_memory;
            live.saturating_mul(100) / self.max_memory_size
        } else {
            0
        };
        usage.min(100) as u8
    }

    /// Age of the oldest retained operation; zero on an empty queue.
    pub fn first_operation_age(&self, now: Instant) -> Duration {
        if self.operation_count == 0 {
            return Duration::ZERO;
        }
        self.slots[self.position(self.completed_head)]
            .as_ref()
            .map(|op| op.enqueued_since(now))
            .unwrap_or_default()
    }

    pub fn operation(&self, sequence_number: SequenceNumber) -> Option<&Arc<Operation>> {
        if sequence_number < self.tail {
            self.slots[self.position(sequence_number)].as_ref()
        } else {
            None
        }
    }

    /// Operations in `[first, tail)` in order; `None` if the range has a gap.
    pub fn operations_from(&self, first: SequenceNumber) -> Option<Vec<Arc<Operation>>> {
        let mut operations = Vec::new();
        let mut lsn = first;
        while lsn < self.tail {
            match &self.slots[self.position(lsn)] {
                Some(op) => operations.push(Arc::clone(op)),
                None => return None,
            }
            lsn = lsn.next();
        }
        Some(operations)
    }

    /// Changes the commit mode. Only legal while commit and head coincide.
    pub fn set_ignore_commit(&mut self, value: bool) {
        assert!(
            self.committed_head == self.head,
            "queue {}: ignore_commit -> {value}: commit head {} != head {}",
            self.name,
            self.committed_head,
            self.head
        );
        self.ignore_commit = value;
    }

    /// Installs the commit callback and replays it over every operation that
    /// committed before the callback existed, in order.
    pub fn set_commit_callback(&mut self, mut callback: CommitCallback) {
        let mut lsn = self.head;
        while lsn < self.committed_head {
            let pos = self.position(lsn);
            let op = self.slots[pos]
                .as_ref()
                .unwrap_or_else(|| {
                    panic!(
                        "queue {}: committed operation {lsn} missing during callback replay",
                        self.name
                    )
                });
            callback(op);
            lsn = lsn.next();
        }
        self.commit_callback = Some(callback);
    }

    pub fn clear_commit_callback(&mut self) {
        self.commit_callback = None;
    }

    // ========================================================================
    // Enqueue
    // ========================================================================

    /// Places an operation at its LSN slot, growing or evicting as needed.
    pub fn try_enqueue(&mut self, op: Arc<Operation>, now: Instant) -> ReplicationResult<()> {
        let sequence_number = op.sequence_number();
        assert!(
            sequence_number.is_valid(),
            "queue {}: enqueue of invalid LSN {sequence_number}",
            self.name
        );

        if sequence_number < self.committed_head
            || (sequence_number < self.tail && self.slots[self.position(sequence_number)].is_some())
        {
            debug!(queue = %self.name, lsn = %sequence_number, "duplicate enqueue");
            return Err(ReplicationError::DuplicateOperation);
        }

        self.make_room_for(sequence_number, op.data_size(), now)?;

        self.operation_count += 1;
        self.total_memory += op.data_size();
        op.mark_enqueued(now);

        if sequence_number >= self.tail {
            // All slots between the old tail and the new LSN must be free;
            // make-room guarantees it, a straggler here is a coding error.
            let mut lsn = self.tail;
            while lsn <= sequence_number {
                assert!(
                    self.slots[self.position(lsn)].is_none(),
                    "queue {}: slot for {lsn} still occupied past the tail",
                    self.name
                );
                lsn = lsn.next();
            }
            self.tail = sequence_number.next();
        }

        let position = self.position(sequence_number);
        self.slots[position] = Some(op);

        debug!(
            queue = %self.name,
            lsn = %sequence_number,
            tail = %self.tail,
            memory = self.total_memory,
            "enqueued"
        );

        self.check_invariants();
        Ok(())
    }

    /// Makes room for an operation of `data_size` bytes at `sequence_number`:
    /// drops pending operations above it, trims completed items, then
    /// expands, and reports [`ReplicationError::QueueFull`] if all fail.
    fn make_room_for(
        &mut self,
        sequence_number: SequenceNumber,
        data_size: u64,
        now: Instant,
    ) -> ReplicationResult<()> {
        if self.max_memory_size > 0 {
            let live = self.total_memory - self.completed_memory + data_size;
            if live > self.max_memory_size {
                // The live set alone exceeds the cap. Operations above the
                // incoming LSN were never acknowledged by anyone; dropping
                // them is safe because the sender will retransmit.
                let mut freed = false;
                if sequence_number < self.tail {
                    let mut drop_start = self.tail.prev();
                    let mut memory_after_drop = live;
                    while drop_start > sequence_number && memory_after_drop > self.max_memory_size {
                        if let Some(op) = &self.slots[self.position(drop_start)] {
                            memory_after_drop -= op.data_size();
                        }
                        drop_start = drop_start.prev();
                        while drop_start >= self.committed_head
                            && self.slots[self.position(drop_start)].is_none()
                        {
                            drop_start = drop_start.prev();
                        }
                    }
                    if memory_after_drop <= self.max_memory_size {
                        warn!(
                            queue = %self.name,
                            from = %drop_start.next(),
                            to = %self.tail.prev(),
                            "dropping pending operations to relieve memory pressure"
                        );
                        self.discard_pending(drop_start.next(), now);
                        freed = true;
                    }
                }
                if !freed {
                    warn!(
                        queue = %self.name,
                        lsn = %sequence_number,
                        size = data_size,
                        memory = self.total_memory,
                        "queue memory full"
                    );
                    return Err(ReplicationError::QueueFull);
                }
            }

            let new_memory = self.total_memory + data_size;
            if new_memory > self.max_memory_size {
                // Trim completed items to fit the total under the cap.
                let mut cleared_up_to = self.completed_head;
                let mut remaining = new_memory;
                while cleared_up_to < self.head && remaining > self.max_memory_size {
                    if let Some(op) = &self.slots[self.position(cleared_up_to)] {
                        remaining -= op.data_size();
                    }
                    cleared_up_to = cleared_up_to.next();
                }
                assert!(
                    remaining <= self.max_memory_size,
                    "queue {}: completed trim cannot satisfy the memory cap",
                    self.name
                );
                self.clear_completed_up_to(cleared_up_to, now);
            }
        }

        let missing_slots =
            (sequence_number - self.completed_head) - self.capacity as i64 + 1;
        if missing_slots > 0 {
            // Secondaries keep completed items; try growing without evicting.
            if !self.clean_on_complete
                && self.expand((sequence_number - self.completed_head) as u64)
            {
                return Ok(());
            }

            let completed_available = self.head - self.completed_head;
            if missing_slots <= completed_available {
                // Remove as few completed items as possible, then see if the
                // smaller active set lets us shrink.
                self.clear_completed_up_to(self.completed_head + missing_slots, now);
                self.shrink((sequence_number - self.completed_head) as u64, false, now);
            } else {
                self.clear_completed_up_to(self.head, now);
                if !self.expand((sequence_number - self.head) as u64) {
                    warn!(
                        queue = %self.name,
                        lsn = %sequence_number,
                        capacity = self.capacity,
                        "queue full"
                    );
                    return Err(ReplicationError::QueueFull);
                }
            }
        }

        Ok(())
    }

    // ========================================================================
    // Capacity management
    // ========================================================================

    /// Convergent capacity: running average of observed capacities rounded
    /// up to a power of two. Lazily cached.
    fn convergent_capacity(&mut self) -> u64 {
        if self.convergent_capacity == 0 {
            self.convergent_capacity =
                (self.capacity_sum / self.capacity_change_count).next_power_of_two().max(2);
        }
        self.convergent_capacity
    }

    fn expand(&mut self, active_items: u64) -> bool {
        assert!(
            active_items >= self.capacity,
            "queue {}: expand requested with {} active items under capacity {}",
            self.name,
            active_items,
            self.capacity
        );

        let convergent = self.convergent_capacity();
        let new_capacity = if convergent > active_items {
            convergent
        } else {
            let mut new_capacity = self.capacity << 1;
            while active_items >= new_capacity
                && (self.max_size == 0 || new_capacity < self.max_size)
            {
                new_capacity <<= 1;
            }
            if (self.max_size > 0 && new_capacity > self.max_size) || active_items >= new_capacity {
                return false;
            }
            new_capacity
        };

        debug!(
            queue = %self.name,
            old = self.capacity,
            new = new_capacity,
            "expanding"
        );
        self.update_capacity(new_capacity);
        self.expanded_last = true;
        true
    }

    fn shrink(&mut self, active_items: u64, clear_completed: bool, now: Instant) -> bool {
        if !self.expanded_last {
            return false;
        }

        let mut new_capacity = self.initial_size;
        while new_capacity < self.capacity && new_capacity < active_items {
            new_capacity <<= 1;
        }
        if new_capacity >= self.capacity {
            return false;
        }

        if clear_completed {
            self.clear_completed_up_to(self.head, now);
        }

        debug!(
            queue = %self.name,
            old = self.capacity,
            new = new_capacity,
            "shrinking"
        );
        self.update_capacity(new_capacity);
        self.expanded_last = false;
        true
    }

    fn update_capacity(&mut self, new_capacity: u64) {
        assert!(new_capacity > 1, "queue {}: capacity must exceed 1", self.name);
        assert!(
            new_capacity != self.capacity,
            "queue {}: capacity update to the same value",
            self.name
        );

        let mut new_slots: Vec<Option<Arc<Operation>>> = Vec::new();
        new_slots.resize_with(new_capacity as usize, || None);
        let new_mask = new_capacity as i64 - 1;

        let mut lsn = self.completed_head;
        while lsn < self.tail {
            let old_pos = self.position(lsn);
            let new_pos = (lsn.as_i64() & new_mask) as usize;
            new_slots[new_pos] = self.slots[old_pos].take();
            lsn = lsn.next();
        }

        self.slots = new_slots;
        self.capacity = new_capacity;
        self.mask = new_mask;
        self.capacity_change_count += 1;
        self.capacity_sum += new_capacity;
        self.convergent_capacity = 0;
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Commits the contiguous run starting at the committed head; stops at
    /// the first gap. Returns whether the marker advanced.
    pub fn commit(&mut self, now: Instant) -> bool {
        if self.committed_head == self.tail {
            return false;
        }

        let old_commit = self.committed_head;
        let mut lsn = self.committed_head;
        while lsn < self.tail {
            if self.slots[self.position(lsn)].is_none() {
                debug!(queue = %self.name, gap = %lsn, "commit stopped at gap");
                break;
            }
            self.commit_item(lsn, now);
            lsn = lsn.next();
        }

        if old_commit < self.committed_head {
            self.check_invariants();
            true
        } else {
            false
        }
    }

    /// Commits everything up to and including `sequence_number`, which must
    /// lie within `[head, tail)` with every slot populated.
    pub fn commit_up_to(&mut self, sequence_number: SequenceNumber, now: Instant) -> bool {
        if !sequence_number.is_valid() {
            return false;
        }
        assert!(
            sequence_number >= self.head && sequence_number < self.tail,
            "queue {}: commit up to {sequence_number} outside [{}, {})",
            self.name,
            self.head,
            self.tail
        );

        if self.committed_head == self.tail || sequence_number < self.committed_head {
            return false;
        }

        let old_commit = self.committed_head;
        let mut lsn = self.committed_head;
        while lsn <= sequence_number {
            assert!(
                self.slots[self.position(lsn)].is_some(),
                "queue {}: commit up to {sequence_number}: {lsn} does not exist",
                self.name
            );
            self.commit_item(lsn, now);
            lsn = lsn.next();
        }

        if old_commit < self.committed_head {
            self.check_invariants();
            true
        } else {
            false
        }
    }

    /// Moves the committed head to `sequence_number + 1`, forward (by
    /// committing) or backward (clamped at `head`). Idempotent.
    pub fn update_commit_head(&mut self, sequence_number: SequenceNumber, now: Instant) -> bool {
        if sequence_number < SequenceNumber::INVALID {
            return false;
        }

        let new_head = sequence_number.next();
        if self.committed_head == new_head {
            return true;
        }
        if self.committed_head > new_head {
            if new_head < self.head {
                return false;
            }
            debug!(
                queue = %self.name,
                old = %self.committed_head,
                new = %new_head,
                "commit head moved back"
            );
            self.committed_head = new_head;
            self.check_invariants();
            return true;
        }
        self.commit_up_to(sequence_number, now)
    }

    fn commit_item(&mut self, sequence_number: SequenceNumber, now: Instant) {
        let pos = self.position(sequence_number);
        let op = self.slots[pos].as_ref().expect("commit of empty slot");
        op.mark_committed(now);
        if let Some(callback) = self.commit_callback.as_mut() {
            callback(op);
        }
        self.committed_head = self.committed_head.next();
    }

    // ========================================================================
    // Complete
    // ========================================================================

    /// Completes contiguously from the head: commit-then-complete each
    /// populated slot, stopping at the first gap, and, when the queue waits
    /// for service acks, at the first operation the consumer has not acked.
    pub fn complete(&mut self, now: Instant) -> bool {
        let last = if self.ignore_commit {
            self.tail
        } else {
            self.committed_head
        };
        if self.head == last {
            return false;
        }

        let old_head = self.head;
        let mut lsn = self.head;
        while lsn < last {
            let pos = self.position(lsn);
            match &self.slots[pos] {
                None => {
                    debug!(queue = %self.name, gap = %lsn, "complete stopped at gap");
                    break;
                }
                Some(op) if self.require_service_ack && op.needs_service_ack() => {
                    debug!(queue = %self.name, lsn = %lsn, "complete waiting for service ack");
                    break;
                }
                Some(_) => {}
            }
            self.complete_item(lsn, now);
            lsn = lsn.next();
        }

        if old_head < self.head {
            self.check_invariants();
            if self.clean_on_complete {
                self.shrink(active_span(self.completed_head, self.tail), false, now);
            }
            true
        } else {
            false
        }
    }

    /// Completes deterministically up to `sequence_number`; every
    /// intermediate slot must be populated and service-acked.
    pub fn complete_up_to(&mut self, sequence_number: SequenceNumber, now: Instant) -> bool {
        assert!(
            sequence_number < self.tail,
            "queue {}: complete up to {sequence_number} beyond the tail {}",
            self.name,
            self.tail
        );

        if self.head == self.tail || !sequence_number.is_valid() {
            return false;
        }
        if self.head > sequence_number {
            return false;
        }

        let mut last = sequence_number;
        if !self.ignore_commit && last >= self.committed_head {
            // Completion never overtakes commit.
            last = self.committed_head.prev();
        }

        let old_head = self.head;
        let mut lsn = self.head;
        while lsn <= last {
            let pos = self.position(lsn);
            let populated_and_acked = match &self.slots[pos] {
                Some(op) => !(self.require_service_ack && op.needs_service_ack()),
                None => false,
            };
            assert!(
                populated_and_acked,
                "queue {}: operation {lsn} missing or awaiting service ack during bounded complete",
                self.name
            );
            self.complete_item(lsn, now);
            lsn = lsn.next();
        }

        if old_head < self.head {
            self.check_invariants();
            if self.clean_on_complete {
                self.shrink(active_span(self.completed_head, self.tail), false, now);
            }
            true
        } else {
            false
        }
    }

    /// Moves the completion head to `sequence_number + 1`, forward by
    /// completing, or backward within the retained completed window (clamped
    /// at `completed_head`).
    pub fn update_completed_head(&mut self, sequence_number: SequenceNumber, now: Instant) -> bool {
        if sequence_number < SequenceNumber::INVALID {
            return false;
        }

        let mut new_head = sequence_number.next();
        if self.head == new_head {
            return true;
        }
        if self.head > new_head {
            if self.completed_head == self.head {
                // Nothing retained; the head cannot move back.
                return false;
            }
            if new_head < self.completed_head {
                new_head = self.completed_head;
            }
            debug!(
                queue = %self.name,
                old = %self.head,
                new = %new_head,
                "completion head moved back"
            );
            while self.head > new_head {
                self.head = self.head.prev();
                let op = self.slots[self.position(self.head)]
                    .as_ref()
                    .expect("retained completed slot must be populated");
                self.completed_memory -= op.data_size();
                self.completed_count -= 1;
            }
            self.check_invariants();
            return true;
        }
        self.complete_up_to(sequence_number, now)
    }

    fn complete_item(&mut self, sequence_number: SequenceNumber, now: Instant) {
        let pos = self.position(sequence_number);

        if self.ignore_commit {
            self.committed_head = self.committed_head.next();
            let op = self.slots[pos].as_ref().expect("complete of empty slot");
            op.mark_committed(now);
            if let Some(callback) = self.commit_callback.as_mut() {
                callback(op);
            }
        }

        let op = self.slots[pos].as_ref().expect("complete of empty slot");
        op.mark_completed(now);
        self.head = self.head.next();

        if self.clean_on_complete {
            let op = self.slots[pos].take().expect("cleanup of empty slot");
            self.operation_count -= 1;
            self.total_memory -= op.data_size();
            self.completed_head = self.completed_head.next();
            op.mark_cleaned(now);
        } else {
            let data_size = self.slots[pos].as_ref().map(|op| op.data_size()).unwrap_or(0);
            self.completed_memory += data_size;
            self.completed_count += 1;
            if self.should_trim_completed() {
                self.trim_completed(now);
            }
        }
    }

    // ========================================================================
    // Completed-item retention
    // ========================================================================

    fn should_trim_completed(&self) -> bool {
        (self.max_completed_bytes != 0 && self.completed_memory > self.max_completed_bytes)
            || (self.max_completed_count != 0 && self.completed_count > self.max_completed_count)
    }

    fn trim_completed(&mut self, now: Instant) {
        assert!(
            self.should_trim_completed(),
            "queue {}: trim requested with nothing over the caps",
            self.name
        );

        loop {
            let pos = self.position(self.completed_head);
            let op = self.slots[pos]
                .take()
                .expect("completed items are contiguous from the completed head");
            self.operation_count -= 1;
            self.completed_count -= 1;
            self.completed_memory -= op.data_size();
            self.total_memory -= op.data_size();
            self.completed_head = self.completed_head.next();
            op.mark_cleaned(now);

            if !self.should_trim_completed() {
                break;
            }
        }

        self.shrink(active_span(self.completed_head, self.tail), false, now);
        self.check_invariants();
    }

    /// Releases retained completed operations below `sequence_number`.
    pub fn release_completed_up_to(&mut self, sequence_number: SequenceNumber, now: Instant) -> bool {
        if sequence_number <= self.completed_head || sequence_number > self.head {
            return false;
        }
        self.clear_completed_up_to(sequence_number, now);
        assert!(
            sequence_number <= self.tail,
            "queue {}: completed head {sequence_number} beyond the tail",
            self.name
        );
        self.shrink(active_span(sequence_number, self.tail), false, now);
        true
    }

    fn clear_completed_up_to(&mut self, sequence_number: SequenceNumber, now: Instant) {
        while self.completed_head < sequence_number {
            self.remove_item(self.completed_head, now);
            self.completed_head = self.completed_head.next();
        }
        self.check_invariants();
    }

    /// Forgets completion state: the retained completed window rejoins the
    /// pending range and will be re-dispatched.
    pub fn reset_completed(&mut self) {
        self.completed_memory = 0;
        self.completed_count = 0;
        self.head = self.completed_head;
    }

    // ========================================================================
    // Discard / reset
    // ========================================================================

    /// Drops every entry and restarts the queue at `start_sequence` with the
    /// initial capacity.
    pub fn reset(&mut self, start_sequence: SequenceNumber) {
        assert!(
            start_sequence.is_valid(),
            "queue {}: reset to invalid start {start_sequence}",
            self.name
        );

        self.slots.clear();
        self.head = start_sequence;
        self.tail = start_sequence;
        self.committed_head = start_sequence;
        self.completed_head = start_sequence;
        self.total_memory = 0;
        self.operation_count = 0;
        self.completed_memory = 0;
        self.completed_count = 0;

        self.capacity = self.initial_size;
        self.expanded_last = false;
        self.capacity_sum = self.capacity;
        self.capacity_change_count = 1;
        self.convergent_capacity = 0;
        self.mask = self.capacity as i64 - 1;
        self.slots.resize_with(self.capacity as usize, || None);
    }

    /// Drops slots in `[from, tail)`, truncating the tail and clamping the
    /// committed head.
    pub fn discard_pending(&mut self, from: SequenceNumber, now: Instant) {
        if from == self.tail {
            return;
        }
        assert!(
            from >= self.head,
            "queue {}: discard from {from} would drop completed items below head {}",
            self.name,
            self.head
        );

        warn!(
            queue = %self.name,
            from = %from,
            to = %self.tail.prev(),
            "discarding pending operations"
        );

        let mut lsn = from;
        while lsn < self.tail {
            self.remove_item(lsn, now);
            lsn = lsn.next();
        }

        self.tail = from;
        if self.committed_head > from {
            self.committed_head = from;
        }
        self.check_invariants();
    }

    /// Drops everything not yet committed.
    pub fn discard_uncommitted(&mut self, now: Instant) {
        self.discard_pending(self.committed_head, now);
        self.shrink(active_span(self.completed_head, self.tail), false, now);
    }

    /// Drops everything not yet completed.
    pub fn discard_uncompleted(&mut self, now: Instant) {
        self.discard_pending(self.head, now);
        self.shrink(active_span(self.completed_head, self.tail), false, now);
    }

    fn remove_item(&mut self, sequence_number: SequenceNumber, now: Instant) {
        let pos = self.position(sequence_number);
        if let Some(op) = self.slots[pos].take() {
            self.operation_count -= 1;
            self.total_memory -= op.data_size();
            if sequence_number < self.head {
                self.completed_memory -= op.data_size();
                self.completed_count -= 1;
            }
            op.mark_cleaned(now);
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn position(&self, sequence_number: SequenceNumber) -> usize {
        (sequence_number.as_i64() & self.mask) as usize
    }

    fn check_invariants(&self) {
        assert!(
            self.completed_head <= self.head
                && self.head <= self.committed_head
                && self.committed_head <= self.tail,
            "{:?}: marker order violated",
            self
        );
        assert!(
            !(self.clean_on_complete && self.completed_head != self.head),
            "{:?}: clean-on-complete queue retains completed items",
            self
        );
        assert!(
            self.max_size == 0 || self.operation_count <= self.max_size,
            "{:?}: operation count over the cap",
            self
        );
        debug_assert!(self.total_memory >= self.completed_memory);
        debug_assert!(self.operation_count >= self.completed_count);
        debug_assert!(
            !(self.completed_head == self.head && self.completed_memory > 0),
            "{:?}: empty completed window holds memory",
            self
        );
    }
}

/// Slots needed to hold the live span `[low, high)`.
fn active_span(low: SequenceNumber, high: SequenceNumber) -> u64 {
    (high - low).max(0) as u64
}

// ============================================================================
// Tests
// ============================================================================
