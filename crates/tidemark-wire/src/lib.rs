//! Wire protocol for the Tidemark replication engine.
//!
//! Every message exchanged between replicas is a [`Message`]: a set of fixed
//! headers plus an action-specific [`MessageBody`].
//!
//! ## Primary → Secondary
//! - [`ReplicationOperationBody`] - replicate these user operations
//! - [`CopyOperationBody`] - build-stream operation for an idle secondary
//! - [`StartCopyBody`] - begin building; replication starts at this LSN
//! - [`CopyContextAckBody`] - progress of the incremental-context stream
//! - [`RequestAckBody`] - solicit an immediate acknowledgment
//! - [`InduceFaultBody`] - convince a faulted peer to recycle itself
//!
//! ## Secondary → Primary
//! - [`AckBody`] - receive/quorum progress for replication and copy
//! - [`CopyContextOperationBody`] - incremental build context
//!
//! Bodies are encoded with `postcard`; operation payload segments ride as
//! [`Bytes`] so retransmits to N peers share one allocation.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tidemark_types::{
    Epoch, IncarnationId, ReplicaId, ReplicationEndpointId, SequenceNumber,
};

// ============================================================================
// Headers
// ============================================================================

/// Identifies the sender: where acknowledgments should be addressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FromHeader {
    /// Transport address of the sender's replication endpoint.
    pub address: String,

    /// Unique identity of the sending replica instance.
    pub endpoint_id: ReplicationEndpointId,
}

/// Identifies the receiving actor the transport should dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorHeader {
    pub endpoint_id: ReplicationEndpointId,
}

/// The action names carried on the wire.
///
/// Receivers route on this; unknown actions are dropped by the demuxer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    ReplicationOperation,
    CopyOperation,
    CopyContextOperation,
    StartCopy,
    ReplicationAck,
    CopyContextAck,
    RequestAck,
    InduceFault,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::ReplicationOperation => "ReplicationOperation",
            Action::CopyOperation => "CopyOperation",
            Action::CopyContextOperation => "CopyContextOperation",
            Action::StartCopy => "StartCopy",
            Action::ReplicationAck => "ReplicationAck",
            Action::CopyContextAck => "CopyContextAck",
            Action::RequestAck => "RequestAck",
            Action::InduceFault => "InduceFault",
        };
        write!(f, "{s}")
    }
}

/// Correlates retransmissions of the same logical message.
///
/// `id` is stable across retries of one send session; `index` increments per
/// transmission so receivers can trace duplicate delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageIdHeader {
    pub id: Uuid,
    pub index: u32,
}

impl MessageIdHeader {
    pub fn fresh() -> Self {
        Self {
            id: Uuid::new_v4(),
            index: 0,
        }
    }

    pub fn next_try(self) -> Self {
        Self {
            id: self.id,
            index: self.index + 1,
        }
    }
}

/// Length of the header prefix carried in the first body segment.
///
/// Operation headers can be large (segment-size tables for big batches);
/// rather than inflating the out-of-band headers, the sender may prepend the
/// serialized body header to the payload and record its length here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BodyPrefixHeader {
    pub prefix_len: u32,
}

// ============================================================================
// Message Envelope
// ============================================================================

/// A framed replication message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub from: FromHeader,
    pub actor: ActorHeader,
    pub message_id: MessageIdHeader,
    pub body: MessageBody,
}

impl Message {
    pub fn new(
        from: FromHeader,
        actor: ReplicationEndpointId,
        message_id: MessageIdHeader,
        body: MessageBody,
    ) -> Self {
        Self {
            from,
            actor: ActorHeader { endpoint_id: actor },
            message_id,
            body,
        }
    }

    pub fn action(&self) -> Action {
        self.body.action()
    }
}

/// Action-specific payload of a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    ReplicationOperation(ReplicationOperationBody),
    CopyOperation(CopyOperationBody),
    CopyContextOperation(CopyContextOperationBody),
    StartCopy(StartCopyBody),
    ReplicationAck(AckBody),
    CopyContextAck(CopyContextAckBody),
    RequestAck(RequestAckBody),
    InduceFault(InduceFaultBody),
}

impl MessageBody {
    pub fn action(&self) -> Action {
        match self {
            MessageBody::ReplicationOperation(_) => Action::ReplicationOperation,
            MessageBody::CopyOperation(_) => Action::CopyOperation,
            MessageBody::CopyContextOperation(_) => Action::CopyContextOperation,
            MessageBody::StartCopy(_) => Action::StartCopy,
            MessageBody::ReplicationAck(_) => Action::ReplicationAck,
            MessageBody::CopyContextAck(_) => Action::CopyContextAck,
            MessageBody::RequestAck(_) => Action::RequestAck,
            MessageBody::InduceFault(_) => Action::InduceFault,
        }
    }
}

// ============================================================================
// Operation payloads
// ============================================================================

/// Classifies an operation within its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OperationKind {
    /// A user operation.
    #[default]
    Normal,

    /// Synthetic terminator used to quiesce a stream.
    EndOfStream,

    /// Marks the replication start LSN during build.
    StartCopy,
}

/// Per-operation metadata replicated alongside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMetadata {
    pub kind: OperationKind,
    pub sequence_number: SequenceNumber,
    /// Groups operations that commit atomically; `NON_INITIALIZED` when the
    /// operation stands alone.
    pub atomic_group_id: SequenceNumber,
}

impl OperationMetadata {
    pub fn normal(sequence_number: SequenceNumber) -> Self {
        Self {
            kind: OperationKind::Normal,
            sequence_number,
            atomic_group_id: SequenceNumber::NON_INITIALIZED,
        }
    }

    pub fn end_of_stream(sequence_number: SequenceNumber) -> Self {
        Self {
            kind: OperationKind::EndOfStream,
            sequence_number,
            atomic_group_id: SequenceNumber::NON_INITIALIZED,
        }
    }
}

/// One replication operation as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireOperation {
    pub metadata: OperationMetadata,

    /// Epoch at which the operation was originated.
    pub epoch: Epoch,

    /// Sizes of the payload segments, in order.
    pub segment_sizes: Vec<u64>,

    /// Payload segments.
    #[serde(with = "segments_serde")]
    pub segments: Vec<Bytes>,
}

impl WireOperation {
    pub fn data_size(&self) -> u64 {
        self.segment_sizes.iter().sum()
    }
}

/// Body of a `ReplicationOperation` message: a batch of operations plus the
/// primary's progress piggyback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationOperationBody {
    pub operations: Vec<WireOperation>,

    /// Epoch of the primary sending the batch (not necessarily the epoch the
    /// operations were originated in).
    pub primary_epoch: Epoch,

    /// Primary's committed LSN at send, piggybacked so secondaries can
    /// dispatch without a separate commit message.
    pub completed_sequence_number: SequenceNumber,

    /// Set on the final message of a logical batch.
    pub last_in_batch: bool,
}

/// Body of a `CopyOperation` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyOperationBody {
    /// The idle replica being built.
    pub replica_id: ReplicaId,

    pub primary_epoch: Epoch,

    pub operation: WireOperation,

    /// Set on the final copy operation of the stream.
    pub is_last: bool,
}

/// Body of a `CopyContextOperation` message (building secondary → primary).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyContextOperationBody {
    pub replica_id: ReplicaId,

    pub operation: WireOperation,

    pub is_last: bool,
}

// ============================================================================
// Acknowledgments
// ============================================================================

/// Wire representation of a missing error; `0` is success.
pub type ErrorCodeValue = i32;

/// Combined replication + copy acknowledgment.
///
/// Unused copy fields are [`SequenceNumber::NON_INITIALIZED`]. `receive`
/// means the replication layer holds the operation; `quorum` means the
/// consumer applied it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckBody {
    pub replication_receive: SequenceNumber,
    pub replication_quorum: SequenceNumber,
    pub copy_receive: SequenceNumber,
    pub copy_quorum: SequenceNumber,
    pub error_code: ErrorCodeValue,
}

impl AckBody {
    /// Ack that carries replication progress only.
    pub fn replication(receive: SequenceNumber, quorum: SequenceNumber) -> Self {
        Self {
            replication_receive: receive,
            replication_quorum: quorum,
            copy_receive: SequenceNumber::NON_INITIALIZED,
            copy_quorum: SequenceNumber::NON_INITIALIZED,
            error_code: 0,
        }
    }

    pub fn with_copy(mut self, receive: SequenceNumber, quorum: SequenceNumber) -> Self {
        self.copy_receive = receive;
        self.copy_quorum = quorum;
        self
    }

    pub fn with_error(mut self, error_code: ErrorCodeValue) -> Self {
        self.error_code = error_code;
        self
    }

    pub fn has_copy_progress(&self) -> bool {
        self.copy_receive != SequenceNumber::NON_INITIALIZED
            || self.copy_quorum != SequenceNumber::NON_INITIALIZED
    }
}

/// Progress of the copy-context stream, sent primary → building secondary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyContextAckBody {
    /// Last context LSN the primary has consumed; `NON_INITIALIZED` if none.
    pub sequence_number: SequenceNumber,

    /// Non-zero when the primary failed processing the context stream.
    pub error_code: ErrorCodeValue,
}

/// Solicits an immediate acknowledgment from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RequestAckBody {}

// ============================================================================
// Control messages
// ============================================================================

/// Begin building an idle secondary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCopyBody {
    /// Epoch of the building primary.
    pub epoch: Epoch,

    /// The idle replica being addressed.
    pub replica_id: ReplicaId,

    /// First LSN the secondary will receive through the replication stream;
    /// everything below it arrives through copy.
    pub replication_start_sequence: SequenceNumber,
}

/// Asks a peer the primary has given up on to recycle itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InduceFaultBody {
    pub target_replica_id: ReplicaId,
    pub target_incarnation: IncarnationId,
    pub reason: String,
}

// ============================================================================
// Framing
// ============================================================================

/// Failed to decode an inbound frame.
#[derive(Debug, thiserror::Error)]
#[error("malformed replication frame: {0}")]
pub struct FrameError(#[from] postcard::Error);

/// Encodes a message to its canonical wire bytes.
pub fn encode(message: &Message) -> Vec<u8> {
    postcard::to_allocvec(message).expect("message serialization cannot fail")
}

/// Decodes a message from wire bytes.
pub fn decode(frame: &[u8]) -> Result<Message, FrameError> {
    Ok(postcard::from_bytes(frame)?)
}

// Bytes segments serialize as raw byte arrays.
mod segments_serde {
    use bytes::Bytes;
    use serde::de::Deserializer;
    use serde::ser::Serializer;
    use serde::{Deserialize, Serialize};

    pub fn serialize<S: Serializer>(segments: &[Bytes], ser: S) -> Result<S::Ok, S::Error> {
        let raw: Vec<&[u8]> = segments.iter().map(|b| b.as_ref()).collect();
        raw.serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<Bytes>, D::Error> {
        let raw: Vec<Vec<u8>> = Vec::deserialize(de)?;
        Ok(raw.into_iter().map(Bytes::from).collect())
    }
}

// ============================================================================
// Transport contract
// ============================================================================

/// Result of handing a message to the transport.
///
/// `Accepted` means queued for delivery, not delivered; the reliable senders
/// own end-to-end delivery through retries and acknowledgments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    Accepted,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No resolved connection for the target address.
    Unresolved,

    /// Transport is shutting down.
    Closed,

    /// Message exceeds the transport's frame limit.
    TooLarge,

    /// Send queue full; the retry tick will try again.
    Backpressure,
}

/// Best-effort datagram transport between replication endpoints.
///
/// Delivery is reliable per-connection but unreliable across reconnects; the
/// replication protocols tolerate duplicates, reorder across sessions, and
/// loss. Implementations multiplex connections across partitions and
/// dispatch inbound messages by [`ActorHeader`].
pub trait ReplicationTransport {
    /// Sends `message` toward `target_address`. Must not block.
    fn send(&self, target_address: &str, message: Message) -> SendStatus;

    /// Largest frame the transport will accept, in bytes.
    fn max_message_size(&self) -> u64;
}

// ============================================================================
// Tests
// ============================================================================
