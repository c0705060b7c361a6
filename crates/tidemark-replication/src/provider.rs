//! Contracts consumed from the hosted state provider.
//!
//! The replication core never touches storage itself; everything durable is
//! behind [`StateProvider`]. Streams are pull-based: `next()` yields the
//! segments of one operation, `None` terminates. When end-of-stream acks are
//! enabled the primary converts the terminator into an explicit
//! `EndOfStream` operation on the wire.

use bytes::Bytes;

use tidemark_types::{Epoch, SequenceNumber};

use crate::error::ReplicationResult;

/// An async sequence of operation payloads, pulled one at a time.
pub trait OperationDataStream: Send {
    /// Next operation's payload segments; `None` ends the stream.
    fn next(&mut self) -> ReplicationResult<Option<Vec<Bytes>>>;
}

/// The hosted service's durable state machine, as seen by the replicator.
pub trait StateProvider {
    /// Highest LSN the provider has applied.
    fn last_committed_sequence_number(&mut self) -> ReplicationResult<SequenceNumber>;

    /// Persists the new epoch. Called only after every operation of the
    /// previous epoch has been applied; `previous_epoch_last_lsn` is the
    /// last LSN of that epoch.
    fn update_epoch(
        &mut self,
        epoch: Epoch,
        previous_epoch_last_lsn: SequenceNumber,
    ) -> ReplicationResult<()>;

    /// Context a building secondary sends to its copy source. `None` for
    /// replicas without persisted state.
    fn copy_context(&mut self) -> ReplicationResult<Option<Box<dyn OperationDataStream>>>;

    /// The copy stream for building an idle replica up to `up_to_sequence`.
    /// `context` carries the idle's copy context when it has persisted
    /// state; context operations arrive over the wire, so the stream may be
    /// pending between pulls.
    fn copy_state(
        &mut self,
        up_to_sequence: SequenceNumber,
        context: Option<crate::stream::OperationStream>,
    ) -> ReplicationResult<Box<dyn OperationDataStream>>;

    /// Informs the provider that data loss may have occurred. Returns true
    /// if the provider changed its state in response (e.g. restored a
    /// backup), in which case the replicator re-reads the committed LSN.
    fn on_data_loss(&mut self) -> ReplicationResult<bool>;

    /// When set, copy enumerates up to the latest LSN instead of a fixed
    /// upper bound, and the engine selects the paged variant accordingly.
    fn supports_copy_until_latest_lsn(&self) -> bool;
}

/// A stream over a fixed set of buffers; the common case in tests and for
/// providers that snapshot their copy set up front.
pub struct VecDataStream {
    items: std::vec::IntoIter<Vec<Bytes>>,
}

impl VecDataStream {
    pub fn new(items: Vec<Vec<Bytes>>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl OperationDataStream for VecDataStream {
    fn next(&mut self) -> ReplicationResult<Option<Vec<Bytes>>> {
        Ok(self.items.next())
    }
}
