// Transaction manager
// Public entry points for begin/add/commit/abort on the primary. Every
// path serializes a record, replicates and logs it through the
// replicated log manager, then awaits the applied and replicated
// outcomes in parallel. Either failure surfaces as TransactionAborted.

use crate::checkpoint::CheckpointManager;
use crate::config::ReplicatorConfig;
use crate::error::{ReplicatorError, Result};
use crate::processor::OperationProcessor;
use crate::records::{LogRecord, Lsn, OperationMode, RecordBody, RecordRef, TxId};
use crate::replicated::transport::ReplicationTicket;
use crate::replicated::ReplicatedLogManager;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Primary-side transaction entry points.
pub struct TransactionManager {
    log_manager: Arc<ReplicatedLogManager>,
    checkpoint_manager: Arc<CheckpointManager>,
    processor: Arc<OperationProcessor>,
    config: Arc<RwLock<ReplicatorConfig>>,
}

impl TransactionManager {
    pub fn new(
        log_manager: Arc<ReplicatedLogManager>,
        checkpoint_manager: Arc<CheckpointManager>,
        processor: Arc<OperationProcessor>,
        config: Arc<RwLock<ReplicatorConfig>>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            log_manager,
            checkpoint_manager: checkpoint_manager.clone(),
            processor: processor.clone(),
            config,
        });

        // Old pending transactions that block a checkpoint get aborted
        // in the background.
        let abort_manager = Arc::downgrade(&manager);
        processor.set_abort_candidate_handler(Box::new(move |candidates| {
            let Some(manager) = abort_manager.upgrade() else {
                return;
            };
            for begin in candidates {
                if let Some(tx_id) = begin.tx_id() {
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        debug!(tx_id, "aborting old transaction for checkpoint");
                        let _ = manager.abort_transaction(tx_id).await;
                    });
                }
            }
        }));

        manager
    }

    /// Throttle gate + replicate + log. The caller decides whether to
    /// await the outcomes.
    async fn submit(&self, record: RecordRef) -> Result<ReplicationTicket> {
        self.checkpoint_manager.error_if_throttled(&record)?;
        let ticket = self.log_manager.replicate_and_log(record.clone())?;

        // Records near the frame cap flush inline rather than waiting
        // for the next barrier.
        if record.body().approximate_size() >= self.config.read().max_record_size_bytes() {
            self.log_manager.flush("large-record").await?;
        }
        Ok(ticket)
    }

    async fn await_outcome(&self, record: &RecordRef, ticket: ReplicationTicket) -> Result<Lsn> {
        let (applied, replicated) = tokio::join!(record.applied().wait(), ticket.wait());
        match (applied, replicated) {
            (Ok(()), Ok(())) => Ok(record.lsn()),
            (applied, replicated) => {
                debug!(
                    applied_err = applied.is_err(),
                    replicated_err = replicated.is_err(),
                    "transaction record failed"
                );
                Err(ReplicatorError::TransactionAborted)
            }
        }
    }

    /// Start a multi-operation transaction. Returns once the begin
    /// record is replicating; its apply happens at commit.
    pub async fn begin_transaction(
        &self,
        tx_id: TxId,
        metadata: Vec<u8>,
        undo: Vec<u8>,
        redo: Vec<u8>,
    ) -> Result<RecordRef> {
        let record = LogRecord::new(RecordBody::BeginTx {
            tx_id,
            is_single_operation: false,
            metadata,
            undo,
            redo,
        });
        self.submit(record.clone()).await?;
        Ok(record)
    }

    /// Single-operation transaction: commit at begin. Resolves with the
    /// commit LSN once applied and replicated.
    pub async fn begin_transaction_single_op(
        &self,
        tx_id: TxId,
        metadata: Vec<u8>,
        undo: Vec<u8>,
        redo: Vec<u8>,
    ) -> Result<Lsn> {
        let record = LogRecord::new(RecordBody::BeginTx {
            tx_id,
            is_single_operation: true,
            metadata,
            undo,
            redo,
        });
        let ticket = self.submit(record.clone()).await?;
        self.checkpoint_manager.request_group_commit();
        self.await_outcome(&record, ticket).await
    }

    /// Add an operation to an open multi-operation transaction.
    pub async fn add_operation(
        &self,
        tx_id: TxId,
        metadata: Vec<u8>,
        undo: Vec<u8>,
        redo: Vec<u8>,
    ) -> Result<RecordRef> {
        let record = LogRecord::new(RecordBody::Operation {
            tx_id,
            mode: OperationMode::InTransaction,
            metadata,
            undo,
            redo,
        });
        self.submit(record.clone()).await?;
        Ok(record)
    }

    /// Standalone atomic operation with undo support.
    pub async fn add_operation_atomic(
        &self,
        tx_id: TxId,
        metadata: Vec<u8>,
        undo: Vec<u8>,
        redo: Vec<u8>,
    ) -> Result<Lsn> {
        self.add_atomic_inner(tx_id, OperationMode::Atomic, metadata, undo, redo)
            .await
    }

    /// Standalone redo-only operation.
    pub async fn add_operation_atomic_redo(
        &self,
        tx_id: TxId,
        metadata: Vec<u8>,
        redo: Vec<u8>,
    ) -> Result<Lsn> {
        self.add_atomic_inner(tx_id, OperationMode::AtomicRedo, metadata, Vec::new(), redo)
            .await
    }

    async fn add_atomic_inner(
        &self,
        tx_id: TxId,
        mode: OperationMode,
        metadata: Vec<u8>,
        undo: Vec<u8>,
        redo: Vec<u8>,
    ) -> Result<Lsn> {
        let record = LogRecord::new(RecordBody::Operation {
            tx_id,
            mode,
            metadata,
            undo,
            redo,
        });
        let ticket = self.submit(record.clone()).await?;
        self.checkpoint_manager.request_group_commit();
        self.await_outcome(&record, ticket).await
    }

    /// Commit an open transaction. Resolves with the commit LSN.
    pub async fn commit_transaction(&self, tx_id: TxId) -> Result<Lsn> {
        self.end_transaction(tx_id, true).await
    }

    /// Abort an open transaction.
    pub async fn abort_transaction(&self, tx_id: TxId) -> Result<Lsn> {
        self.end_transaction(tx_id, false).await
    }

    async fn end_transaction(&self, tx_id: TxId, committed: bool) -> Result<Lsn> {
        let record = LogRecord::new(RecordBody::EndTx { tx_id, committed });
        let ticket = self.submit(record.clone()).await?;
        self.checkpoint_manager.request_group_commit();
        self.await_outcome(&record, ticket).await
    }

    pub fn processor(&self) -> &Arc<OperationProcessor> {
        &self.processor
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager").finish()
    }
}
