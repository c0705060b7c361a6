//! Replicator settings.
//!
//! One validated struct covers both roles; per-role differences (retention
//! of completed operations, service-ack requirement) are fields the role
//! objects read when constructing their queues. Defaults follow the
//! production defaults of the system this engine replicates.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReplicationError, ReplicationResult};

/// Tunable behavior of a replicator instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatorSettings {
    /// Interval at which unacknowledged operations are retransmitted.
    pub retry_interval: Duration,

    /// Interval at which a secondary flushes batched acknowledgments.
    pub batch_ack_interval: Duration,

    /// When set, completion on the secondary waits for the consumer's
    /// apply acknowledgment rather than dispatch alone.
    pub require_service_ack: bool,

    /// Enables stream fault reporting and explicit end-of-stream
    /// operations with acknowledgments.
    pub use_stream_faults_and_end_of_stream_acks: bool,

    /// Whether this partition's state provider persists state. Persisted
    /// replicas supply a copy context stream during build.
    pub has_persisted_state: bool,

    /// Initial replication queue capacity; a power of two greater than 1.
    pub initial_replication_queue_size: u64,

    /// Maximum replication queue capacity; a power of two, or 0 for
    /// unbounded item count (memory cap still applies).
    pub max_replication_queue_size: u64,

    /// Maximum bytes of live operations in the replication queue; 0 for
    /// unbounded (item cap must then be set).
    pub max_replication_queue_memory_size: u64,

    /// Initial copy queue capacity; a power of two greater than 1.
    pub initial_copy_queue_size: u64,

    /// Maximum copy queue capacity; a power of two.
    pub max_copy_queue_size: u64,

    /// Largest single replication message; operations above this fail with
    /// `MessageTooLarge`.
    pub max_replication_message_size: u64,

    /// Send-window cap per peer: operations in flight beyond the last
    /// receive-acked LSN.
    pub max_pending_unacked_operations: u64,

    /// Completed operations a secondary retains for retransmission to
    /// building idles; 0 disables the count cap.
    pub max_completed_operations_count: u64,

    /// Byte cap for retained completed operations; 0 disables it.
    pub max_completed_operations_memory_size: u64,

    /// Decay factor of the ack-duration averages, in (0, 1); 0 keeps only
    /// the last sample.
    pub ack_duration_decay_factor: f64,

    /// Interval over which one decay factor application is normalized.
    pub ack_duration_decay_interval: Duration,

    /// Queue fill percentage at which slow-peer mitigation engages.
    pub slow_restart_at_queue_usage_percent: u8,

    /// Minimum age of the oldest queued operation before an active
    /// secondary may be declared slow.
    pub slow_active_secondary_restart_at_operation_age: Duration,

    /// Replicas to keep beyond quorum before faulting a slow active.
    pub slow_active_secondary_additional_replicas_to_retain: u64,

    /// Master switches for slow-peer faulting.
    pub enable_slow_active_secondary_restart: bool,
    pub enable_slow_idle_restart: bool,

    /// Permits installing a new quorum set while a catch-up is running.
    pub allow_multiple_quorum_set: bool,

    /// How long close waits for in-flight replicate operations to reach
    /// quorum before canceling them; `None` cancels immediately.
    pub wait_for_quorum_timeout: Option<Duration>,

    /// When set, a build completes only after the secondary's replication
    /// acknowledgment covers the LSN recorded at enumeration completion.
    pub wait_for_replication_acks_on_copy: bool,
}

impl Default for ReplicatorSettings {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(5),
            batch_ack_interval: Duration::from_millis(15),
            require_service_ack: false,
            use_stream_faults_and_end_of_stream_acks: true,
            has_persisted_state: false,
            initial_replication_queue_size: 64,
            max_replication_queue_size: 1024,
            max_replication_queue_memory_size: 0,
            initial_copy_queue_size: 64,
            max_copy_queue_size: 1024,
            max_replication_message_size: 50 * 1024 * 1024,
            max_pending_unacked_operations: 1024,
            max_completed_operations_count: 0,
            max_completed_operations_memory_size: 0,
            ack_duration_decay_factor: 0.95,
            ack_duration_decay_interval: Duration::from_secs(5),
            slow_restart_at_queue_usage_percent: 80,
            slow_active_secondary_restart_at_operation_age: Duration::from_secs(30),
            slow_active_secondary_additional_replicas_to_retain: 1,
            enable_slow_active_secondary_restart: true,
            enable_slow_idle_restart: true,
            allow_multiple_quorum_set: true,
            wait_for_quorum_timeout: None,
            wait_for_replication_acks_on_copy: true,
        }
    }
}

impl ReplicatorSettings {
    /// Validates cross-field constraints. Called once when a replicator is
    /// constructed; the role objects may then assume them.
    pub fn validate(&self) -> ReplicationResult<()> {
        Self::check_queue_sizes(
            "replication",
            self.initial_replication_queue_size,
            self.max_replication_queue_size,
            self.max_replication_queue_memory_size,
        )?;
        Self::check_queue_sizes(
            "copy",
            self.initial_copy_queue_size,
            self.max_copy_queue_size,
            0,
        )?;

        if !(0.0..1.0).contains(&self.ack_duration_decay_factor) {
            return Err(ReplicationError::InvalidState(format!(
                "ack duration decay factor {} must be in [0, 1)",
                self.ack_duration_decay_factor
            )));
        }

        if self.slow_restart_at_queue_usage_percent > 100 {
            return Err(ReplicationError::InvalidState(format!(
                "queue usage percent {} must be at most 100",
                self.slow_restart_at_queue_usage_percent
            )));
        }

        if self.max_pending_unacked_operations == 0 {
            return Err(ReplicationError::InvalidState(
                "send window must allow at least one in-flight operation".into(),
            ));
        }

        Ok(())
    }

    fn check_queue_sizes(
        queue: &str,
        initial: u64,
        max: u64,
        max_memory: u64,
    ) -> ReplicationResult<()> {
        if initial <= 1 || !initial.is_power_of_two() {
            return Err(ReplicationError::InvalidState(format!(
                "{queue} queue initial size {initial} must be a power of two greater than 1"
            )));
        }
        if max > 0 && !max.is_power_of_two() {
            return Err(ReplicationError::InvalidState(format!(
                "{queue} queue max size {max} must be a power of two"
            )));
        }
        if max > 0 && initial > max {
            return Err(ReplicationError::InvalidState(format!(
                "{queue} queue initial size {initial} exceeds max size {max}"
            )));
        }
        if max == 0 && max_memory == 0 {
            return Err(ReplicationError::InvalidState(format!(
                "{queue} queue needs an item cap or a memory cap"
            )));
        }
        Ok(())
    }
}
