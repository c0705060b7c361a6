//! Shared test doubles.

use bytes::Bytes;

use tidemark_types::{Epoch, SequenceNumber};

use crate::error::{ReplicationError, ReplicationResult};
use crate::provider::{OperationDataStream, StateProvider, VecDataStream};
use crate::stream::OperationStream;

/// In-memory state provider recording every call.
pub struct MockStateProvider {
    pub last_committed: SequenceNumber,
    pub epoch_updates: Vec<(Epoch, SequenceNumber)>,
    pub copy_payloads: Vec<Vec<Bytes>>,
    pub context_payloads: Option<Vec<Vec<Bytes>>>,
    pub supports_latest: bool,
    pub fail_update_epoch: bool,
    pub data_loss_changed_state: bool,
}

impl Default for MockStateProvider {
    fn default() -> Self {
        Self {
            last_committed: SequenceNumber::INVALID,
            epoch_updates: Vec::new(),
            copy_payloads: Vec::new(),
            context_payloads: None,
            supports_latest: false,
            fail_update_epoch: false,
            data_loss_changed_state: false,
        }
    }
}

impl MockStateProvider {
    pub fn with_copy_payloads(count: usize) -> Self {
        Self {
            copy_payloads: (0..count)
                .map(|i| vec![Bytes::from(format!("copy-{i}"))])
                .collect(),
            ..Default::default()
        }
    }
}

impl StateProvider for MockStateProvider {
    fn last_committed_sequence_number(&mut self) -> ReplicationResult<SequenceNumber> {
        Ok(self.last_committed)
    }

    fn update_epoch(
        &mut self,
        epoch: Epoch,
        previous_epoch_last_lsn: SequenceNumber,
    ) -> ReplicationResult<()> {
        if self.fail_update_epoch {
            return Err(ReplicationError::OperationFailed);
        }
        self.epoch_updates.push((epoch, previous_epoch_last_lsn));
        Ok(())
    }

    fn copy_context(&mut self) -> ReplicationResult<Option<Box<dyn OperationDataStream>>> {
        Ok(self
            .context_payloads
            .clone()
            .map(|payloads| Box::new(VecDataStream::new(payloads)) as Box<dyn OperationDataStream>))
    }

    fn copy_state(
        &mut self,
        _up_to_sequence: SequenceNumber,
        _context: Option<OperationStream>,
    ) -> ReplicationResult<Box<dyn OperationDataStream>> {
        Ok(Box::new(VecDataStream::new(self.copy_payloads.clone())))
    }

    fn on_data_loss(&mut self) -> ReplicationResult<bool> {
        Ok(self.data_loss_changed_state)
    }

    fn supports_copy_until_latest_lsn(&self) -> bool {
        self.supports_latest
    }
}
