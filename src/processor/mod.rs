// Operation processor
// Classifies every flushed record, drives state-provider apply and
// unlock, fires commit notifications, and tracks processing quiescence
// for shutdown. Barrier processing advances the stable LSN and gives the
// checkpoint manager its chance to index/checkpoint/truncate.

pub mod dispatcher;

use crate::checkpoint::CheckpointManager;
use crate::drain::role::RoleContextDrainState;
use crate::error::{ReplicatorError, Result};
use crate::recovery::transaction_map::TransactionMap;
use crate::records::{
    Lsn, OperationMode, RecordBody, RecordKind, RecordRef, TxId,
};
use crate::replicated::ReplicatedLogManager;
use crate::state_provider::{ApplyContext, ReplicaRole, StateProvider};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// How a flushed record is driven to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Through the dispatcher's barrier-bounded apply pipeline
    Normal,
    /// Applied inline off the flush thread, no dispatcher batching
    ApplyImmediately,
    /// Completed right after flush with no apply step
    ProcessImmediately,
}

/// Notification fired when a transaction commit becomes visible.
pub type CommitNotification = Box<dyn Fn(TxId, Lsn) + Send + Sync>;

/// Handler invoked with transactions the truncation policy wants
/// aborted before it will checkpoint.
pub type AbortCandidateHandler = Box<dyn Fn(Vec<RecordRef>) + Send + Sync>;

struct Counter {
    value: AtomicU64,
    quiesced: Notify,
}

impl Counter {
    /// Counters start at one; the extra count is surrendered by
    /// `wait_for_zero` so completion of in-flight work alone never
    /// reports quiescence before shutdown asks for it.
    fn new() -> Self {
        Self {
            value: AtomicU64::new(1),
            quiesced: Notify::new(),
        }
    }

    fn increment(&self) {
        self.value.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self) {
        if self.value.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.quiesced.notify_waiters();
        }
    }

    async fn wait_for_zero(&self, initial_surrendered: &AtomicBool) {
        if !initial_surrendered.swap(true, Ordering::SeqCst) {
            self.decrement();
        }
        loop {
            let waiter = self.quiesced.notified();
            if self.value.load(Ordering::SeqCst) == 0 {
                return;
            }
            waiter.await;
        }
    }
}

/// Applies flushed records against the state provider and completes
/// their lifecycle stages.
pub struct OperationProcessor {
    role: Arc<RoleContextDrainState>,
    state_provider: Arc<dyn StateProvider>,
    checkpoint_manager: Arc<CheckpointManager>,
    log_manager: Arc<ReplicatedLogManager>,
    tx_map: Arc<Mutex<TransactionMap>>,
    /// First state-provider failure; later applies short-circuit with it
    service_error: Mutex<Option<ReplicatorError>>,
    logical_records: Counter,
    physical_records: Counter,
    logical_surrendered: AtomicBool,
    physical_surrendered: AtomicBool,
    commit_notification: Mutex<Option<CommitNotification>>,
    abort_candidate_handler: Mutex<Option<AbortCandidateHandler>>,
}

impl OperationProcessor {
    pub fn new(
        role: Arc<RoleContextDrainState>,
        state_provider: Arc<dyn StateProvider>,
        checkpoint_manager: Arc<CheckpointManager>,
        log_manager: Arc<ReplicatedLogManager>,
        tx_map: Arc<Mutex<TransactionMap>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            role,
            state_provider,
            checkpoint_manager,
            log_manager,
            tx_map,
            service_error: Mutex::new(None),
            logical_records: Counter::new(),
            physical_records: Counter::new(),
            logical_surrendered: AtomicBool::new(false),
            physical_surrendered: AtomicBool::new(false),
            commit_notification: Mutex::new(None),
            abort_candidate_handler: Mutex::new(None),
        })
    }

    pub fn set_commit_notification(&self, callback: CommitNotification) {
        *self.commit_notification.lock() = Some(callback);
    }

    pub fn set_abort_candidate_handler(&self, handler: AbortCandidateHandler) {
        *self.abort_candidate_handler.lock() = Some(handler);
    }

    pub fn service_error(&self) -> Option<ReplicatorError> {
        self.service_error.lock().clone()
    }

    /// Processing mode of a record under the current role.
    pub fn classify(&self, record: &RecordRef) -> ProcessingMode {
        match record.kind() {
            RecordKind::BeginTx | RecordKind::Operation | RecordKind::EndTx | RecordKind::Backup => {
                ProcessingMode::Normal
            }
            RecordKind::BeginCheckpoint | RecordKind::TruncateHead => {
                ProcessingMode::ApplyImmediately
            }
            RecordKind::Barrier => {
                if self.role.role() == ReplicaRole::Unknown {
                    ProcessingMode::ProcessImmediately
                } else {
                    ProcessingMode::ApplyImmediately
                }
            }
            _ => ProcessingMode::ProcessImmediately,
        }
    }

    /// Maintain the transaction map from the flushed record stream.
    /// Runs for every Normal record on every role, so primaries and
    /// secondaries see the same pending/completed picture.
    pub fn track_transaction_record(&self, record: &RecordRef) {
        let result: Result<()> = match record.body() {
            RecordBody::BeginTx {
                is_single_operation: false,
                ..
            } => self.tx_map.lock().create(record.clone()),
            RecordBody::Operation {
                mode: OperationMode::InTransaction,
                ..
            } => self.tx_map.lock().add_operation(record.clone()),
            RecordBody::EndTx { .. } => {
                self.tx_map.lock().complete(record.clone()).map(|_| ())
            }
            _ => Ok(()),
        };
        if let Err(err) = result {
            warn!(error = %err, "transaction map update failed");
        }
    }

    /// Register a batch before any of it is processed.
    pub fn prepare_to_process_batch(&self, records: &[RecordRef]) {
        for record in records {
            if record.kind().is_logical() {
                self.logical_records.increment();
            } else {
                self.physical_records.increment();
            }
        }
    }

    fn record_done(&self, record: &RecordRef) {
        if record.kind().is_logical() {
            self.logical_records.decrement();
        } else {
            self.physical_records.decrement();
        }
    }

    /// A record whose flush failed: fail its remaining stages.
    pub fn process_failed_record(&self, record: &RecordRef, error: &ReplicatorError) {
        record.applied().complete(Err(error.clone()));
        record.processed().complete(Err(error.clone()));
        self.record_done(record);
    }

    /// ProcessImmediately records: done the moment they are durable.
    pub fn process_immediately(&self, record: &RecordRef) {
        record.applied().complete(Ok(()));
        record.processed().complete(Ok(()));
        self.record_done(record);
    }

    /// ApplyImmediately records other than barriers.
    pub async fn apply_immediately(&self, record: RecordRef) {
        match record.kind() {
            RecordKind::BeginCheckpoint => {
                self.checkpoint_manager
                    .apply_checkpoint_if_permitted(record.clone(), None)
                    .await;
            }
            RecordKind::TruncateHead => {
                self.checkpoint_manager
                    .apply_log_head_truncation_if_permitted(record.clone(), None)
                    .await;
            }
            other => {
                debug!(?other, "unexpected apply-immediate record");
                record.applied().complete(Ok(()));
                record.processed().complete(Ok(()));
            }
        }
        self.record_done(&record);
    }

    /// Barrier processing: advance stability, trim the transaction map,
    /// and let the checkpoint manager act on the new barrier.
    pub async fn process_barrier(&self, record: RecordRef) {
        if let RecordBody::Barrier { last_stable_lsn } = record.body() {
            self.log_manager.advance_stable_lsn(*last_stable_lsn);
            self.tx_map.lock().remove_stable(*last_stable_lsn);
        }

        let is_primary = self.role.role() == ReplicaRole::Primary;
        match self.checkpoint_manager.checkpoint_if_necessary(is_primary) {
            Ok(candidates) if !candidates.is_empty() => {
                if let Some(handler) = self.abort_candidate_handler.lock().as_ref() {
                    handler(candidates);
                }
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "barrier checkpoint pass failed"),
        }

        // Indexing/checkpoint/truncation records appended above must not
        // wait for the next commit to become durable.
        let log_manager = self.log_manager.clone();
        tokio::spawn(async move {
            let _ = log_manager.flush("post-barrier").await;
        });

        record.applied().complete(Ok(()));
        record.processed().complete(Ok(()));
        self.record_done(&record);
    }

    fn apply_context(&self) -> ApplyContext {
        self.role.apply_redo_context()
    }

    async fn call_apply(
        &self,
        record: &RecordRef,
        tx_id: Option<TxId>,
        metadata: &[u8],
        redo: &[u8],
    ) -> Result<()> {
        if let Some(err) = self.service_error() {
            return Err(err);
        }

        let context = self.apply_context();
        match self
            .state_provider
            .apply(record.lsn(), tx_id, context, metadata, redo)
            .await
        {
            Ok(Some(operation_context)) => {
                record.push_operation_context(operation_context);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                *self.service_error.lock() = Some(err.clone());
                if context != ApplyContext::RecoveryRedo {
                    self.role.report_fault("state provider apply failed");
                }
                Err(err)
            }
        }
    }

    /// Apply one logical record. Multi-operation transaction records
    /// defer their state-provider apply to commit time; everything that
    /// applies eagerly does so here.
    pub async fn apply_record(&self, record: RecordRef) {
        let result: Result<()> = match record.body().clone() {
            RecordBody::BeginTx {
                tx_id,
                is_single_operation,
                metadata,
                redo,
                ..
            } => {
                if is_single_operation {
                    self.call_apply(&record, Some(tx_id), &metadata, &redo).await
                } else {
                    Ok(())
                }
            }
            RecordBody::Operation {
                tx_id,
                mode,
                metadata,
                redo,
                ..
            } => match mode {
                OperationMode::InTransaction => Ok(()),
                OperationMode::Atomic | OperationMode::AtomicRedo => {
                    self.call_apply(&record, Some(tx_id), &metadata, &redo).await
                }
            },
            RecordBody::EndTx {
                tx_id, committed, ..
            } => {
                if committed {
                    self.apply_transaction_chain(tx_id, &record).await
                } else {
                    Ok(())
                }
            }
            // Backup records ride the Normal pipeline but have no
            // state-provider apply
            _ => Ok(()),
        };

        match result {
            Ok(()) => record.applied().complete(Ok(())),
            Err(err) => record.applied().complete(Err(err)),
        };
    }

    /// Commit-time apply of a multi-operation transaction: the begin
    /// and each contained operation, in chain order. Contexts land on
    /// the end record so unlock sees them all.
    async fn apply_transaction_chain(&self, tx_id: TxId, end_record: &RecordRef) -> Result<()> {
        let chain = {
            let tx = self.tx_map.lock();
            tx.completed_chain_by_end_lsn(end_record.lsn())
                .or_else(|| tx.get_pending(tx_id))
                .cloned()
        };
        let records: Vec<RecordRef> = match chain {
            Some(chain) => {
                // The end record itself is applied through its chain walk
                chain
                    .records()
                    .into_iter()
                    .filter(|r| r.psn() != end_record.psn())
                    .collect()
            }
            None => Vec::new(),
        };

        for record in &records {
            match record.body().clone() {
                RecordBody::BeginTx {
                    tx_id: chain_tx,
                    metadata,
                    redo,
                    is_single_operation,
                    ..
                } => {
                    if !is_single_operation {
                        self.call_apply_into(end_record, record, Some(chain_tx), &metadata, &redo)
                            .await?;
                    }
                }
                RecordBody::Operation {
                    tx_id: chain_tx,
                    metadata,
                    redo,
                    mode: OperationMode::InTransaction,
                    ..
                } => {
                    self.call_apply_into(end_record, record, Some(chain_tx), &metadata, &redo)
                        .await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn call_apply_into(
        &self,
        context_sink: &RecordRef,
        applied: &RecordRef,
        tx_id: Option<TxId>,
        metadata: &[u8],
        redo: &[u8],
    ) -> Result<()> {
        if let Some(err) = self.service_error() {
            return Err(err);
        }
        let context = self.apply_context();
        match self
            .state_provider
            .apply(applied.lsn(), tx_id, context, metadata, redo)
            .await
        {
            Ok(Some(operation_context)) => {
                context_sink.push_operation_context(operation_context);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                *self.service_error.lock() = Some(err.clone());
                if context != ApplyContext::RecoveryRedo {
                    self.role.report_fault("state provider apply failed");
                }
                Err(err)
            }
        }
    }

    /// Unlock side of a logical record: on the primary, replication must
    /// also be complete (observed through the stable LSN) before the
    /// provider's contexts are released. Fires the commit notification
    /// for committed transactions.
    pub async fn unlock_record(&self, record: RecordRef) {
        if self.role.role() == ReplicaRole::Primary
            && record.applied().try_result().map(|r| r.is_ok()).unwrap_or(false)
        {
            // A healthy primary reaches stability promptly; the cap only
            // matters when quorum is lost and the host is tearing the
            // replica down anyway.
            let _ = tokio::time::timeout(
                std::time::Duration::from_secs(10),
                self.log_manager.wait_for_stable(record.lsn()),
            )
            .await;
        }

        for context in record.take_operation_contexts() {
            self.state_provider.unlock(context);
        }

        if let RecordBody::EndTx {
            tx_id,
            committed: true,
        } = record.body()
        {
            if let Some(callback) = self.commit_notification.lock().as_ref() {
                callback(*tx_id, record.lsn());
            }
        }
        if let RecordBody::BeginTx {
            tx_id,
            is_single_operation: true,
            ..
        } = record.body()
        {
            if let Some(callback) = self.commit_notification.lock().as_ref() {
                callback(*tx_id, record.lsn());
            }
        }

        record.processed().complete(Ok(()));
        self.record_done(&record);
    }

    /// Await all in-flight logical record processing.
    pub async fn wait_for_logical_records_processing(&self) {
        self.logical_records
            .wait_for_zero(&self.logical_surrendered)
            .await;
    }

    /// Await all in-flight physical record processing.
    pub async fn wait_for_physical_records_processing(&self) {
        self.physical_records
            .wait_for_zero(&self.physical_surrendered)
            .await;
    }
}

impl std::fmt::Debug for OperationProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationProcessor")
            .field("service_error", &self.service_error())
            .finish()
    }
}
