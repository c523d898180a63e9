// Replication transport contract
// The wire-level replicator is an external collaborator: it assigns LSNs
// to replicated operations and delivers copy/replication streams to
// secondaries. Only the contract lives here.

use crate::error::Result;
use crate::records::{CompletionSignal, Lsn};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Opaque multi-buffer operation payload handed to the transport.
#[derive(Debug, Clone, Default)]
pub struct OperationData {
    pub buffers: Vec<Bytes>,
}

impl OperationData {
    pub fn new(buffers: Vec<Bytes>) -> Self {
        Self { buffers }
    }

    pub fn single(buffer: Bytes) -> Self {
        Self {
            buffers: vec![buffer],
        }
    }

    pub fn total_len(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).sum()
    }

    /// Flatten into one contiguous buffer.
    pub fn concat(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        for buffer in &self.buffers {
            out.extend_from_slice(buffer);
        }
        out
    }
}

/// Completes when the operation is replicated to a write quorum
/// (or fails with the transport's error).
pub type ReplicationTicket = Arc<CompletionSignal>;

/// One operation pulled from a copy or replication stream.
pub struct StreamOperation {
    pub data: OperationData,
    /// LSN assigned by the source for replication operations; a frame
    /// counter for copy operations
    pub sequence_number: u64,
    ack: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamOperation {
    pub fn new(data: OperationData, sequence_number: u64) -> Self {
        Self {
            data,
            sequence_number,
            ack: None,
        }
    }

    pub fn with_ack(
        data: OperationData,
        sequence_number: u64,
        ack: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            data,
            sequence_number,
            ack: Some(ack),
        }
    }

    /// Tell the transport this operation is safely persisted locally.
    /// Second and later calls are no-ops.
    pub fn acknowledge(&mut self) {
        if let Some(ack) = self.ack.take() {
            ack();
        }
    }
}

impl std::fmt::Debug for StreamOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOperation")
            .field("sequence_number", &self.sequence_number)
            .field("bytes", &self.data.total_len())
            .finish()
    }
}

/// Pull interface over an operation stream; `None` marks stream end.
#[async_trait]
pub trait OperationStream: Send + Sync {
    async fn get_operation(&self) -> Result<Option<StreamOperation>>;
}

/// The replication transport consumed by the replicated log manager.
#[async_trait]
pub trait StateReplicator: Send + Sync {
    /// Hand an operation to the transport. The LSN is assigned
    /// synchronously and is unique and monotone per source; the ticket
    /// completes when the operation is quorum-replicated.
    fn replicate(&self, data: OperationData) -> Result<(Lsn, ReplicationTicket)>;

    /// Stream of copy operations for an idle secondary being built.
    fn get_copy_stream(&self) -> Result<Arc<dyn OperationStream>>;

    /// Stream of live replication operations for an active secondary.
    fn get_replication_stream(&self) -> Result<Arc<dyn OperationStream>>;
}
