// Log records dispatcher
// Receives flushed batches in FIFO order, forms barrier-bounded
// concurrent groups, and applies them: one bucket per transaction id
// (atomic operations share a bucket), buckets in parallel, apply before
// unlock within each bucket. Supports drain-and-pause for role changes.

use super::{OperationProcessor, ProcessingMode};
use crate::error::ReplicatorError;
use crate::records::{CompletionSignal, InformationEvent, RecordBody, RecordRef};
use crate::writer::{FlushProcessor, LoggedBatch};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

struct PauseState {
    paused: bool,
    /// Barrier most recently handed to processing; drain waits on it
    last_dispatched_barrier: Option<RecordRef>,
}

/// Orders concurrent records into barrier-bounded batches and fans
/// transaction processing out across tasks.
pub struct LogRecordsDispatcher {
    processor: Arc<OperationProcessor>,
    /// Normal records accumulated since the last barrier
    concurrent: Mutex<Vec<RecordRef>>,
    pause: Mutex<PauseState>,
    resume: Notify,
}

impl LogRecordsDispatcher {
    pub fn new(processor: Arc<OperationProcessor>) -> Arc<Self> {
        Arc::new(Self {
            processor,
            concurrent: Mutex::new(Vec::new()),
            pause: Mutex::new(PauseState {
                paused: false,
                last_dispatched_barrier: None,
            }),
            resume: Notify::new(),
        })
    }

    async fn pause_dispatching_if_needed(&self) {
        loop {
            let waiter = self.resume.notified();
            if !self.pause.lock().paused {
                return;
            }
            debug!("dispatch paused; waiting for resume");
            waiter.await;
        }
    }

    /// Apply the accumulated concurrent group: bucket by transaction id
    /// (atomic operations in one shared bucket), apply buckets in
    /// parallel, unlock each record after its apply.
    async fn apply_concurrent_group(&self) {
        let group = std::mem::take(&mut *self.concurrent.lock());
        if group.is_empty() {
            return;
        }

        let mut buckets: HashMap<u64, Vec<RecordRef>> = HashMap::new();
        for record in group {
            // Atomic operations and single-op begins process as bucket 0
            let bucket = match record.body() {
                RecordBody::BeginTx {
                    tx_id,
                    is_single_operation: false,
                    ..
                } => *tx_id,
                RecordBody::Operation {
                    tx_id,
                    mode: crate::records::OperationMode::InTransaction,
                    ..
                } => *tx_id,
                RecordBody::EndTx { tx_id, .. } => *tx_id,
                _ => 0,
            };
            buckets.entry(bucket).or_default().push(record);
        }

        if buckets.len() == 1 {
            // Single transaction: apply inline, no task overhead
            let (_, records) = buckets.into_iter().next().expect("one bucket");
            self.apply_bucket(records).await;
            return;
        }

        let mut handles = Vec::with_capacity(buckets.len());
        for (_, records) in buckets {
            let dispatcher_processor = self.processor.clone();
            handles.push(tokio::spawn(async move {
                for record in records {
                    dispatcher_processor.apply_record(record.clone()).await;
                    dispatcher_processor.unlock_record(record).await;
                }
            }));
        }
        futures::future::join_all(handles).await;
    }

    async fn apply_bucket(&self, records: Vec<RecordRef>) {
        for record in records {
            self.processor.apply_record(record.clone()).await;
            self.processor.unlock_record(record).await;
        }
    }

    /// Pause after the current barrier group and return a completion
    /// that resolves once the last dispatched barrier has been applied.
    pub fn drain_and_pause(&self) -> Arc<CompletionSignal> {
        let barrier = {
            let mut pause = self.pause.lock();
            pause.paused = true;
            pause.last_dispatched_barrier.clone()
        };

        let signal = Arc::new(CompletionSignal::new());
        match barrier {
            None => {
                signal.complete(Ok(()));
            }
            Some(record) => {
                let signal_clone = signal.clone();
                tokio::spawn(async move {
                    let result = record.processed().wait().await;
                    signal_clone.complete(result);
                });
            }
        }
        signal
    }

    /// Release a drain-and-pause.
    pub fn continue_dispatch(&self) {
        self.pause.lock().paused = false;
        self.resume.notify_waiters();
    }
}

#[async_trait]
impl FlushProcessor for LogRecordsDispatcher {
    async fn process_logged_records(&self, batch: LoggedBatch) {
        self.processor.prepare_to_process_batch(&batch.records);
        batch.complete_flush();

        if let Some(error) = &batch.error {
            // Failed flushes fail everything, including whatever was
            // waiting for a barrier that will never come.
            let abandoned = std::mem::take(&mut *self.concurrent.lock());
            for record in abandoned.iter().chain(batch.records.iter()) {
                self.processor.process_failed_record(record, error);
            }
            return;
        }

        for record in batch.records {
            match self.processor.classify(&record) {
                ProcessingMode::Normal => {
                    self.processor.track_transaction_record(&record);
                    self.concurrent.lock().push(record);
                }
                ProcessingMode::ProcessImmediately => {
                    if matches!(
                        record.body(),
                        RecordBody::Information {
                            event: InformationEvent::ClosingLog
                                | InformationEvent::RemovingState
                        }
                    ) {
                        // The log is sealing: nothing buffered will ever
                        // see another barrier.
                        let abandoned = std::mem::take(&mut *self.concurrent.lock());
                        for waiting in &abandoned {
                            self.processor
                                .process_failed_record(waiting, &ReplicatorError::Closed);
                        }
                    }
                    self.processor.process_immediately(&record);
                }
                ProcessingMode::ApplyImmediately => {
                    if record.kind() == crate::records::RecordKind::Barrier {
                        self.pause_dispatching_if_needed().await;
                        self.pause.lock().last_dispatched_barrier = Some(record.clone());
                        self.apply_concurrent_group().await;
                        self.processor.process_barrier(record).await;
                    } else {
                        // Off the dispatch loop: a checkpoint apply may
                        // wait for stability that only a later barrier
                        // can deliver.
                        let processor = self.processor.clone();
                        tokio::spawn(async move {
                            processor.apply_immediately(record).await;
                        });
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for LogRecordsDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRecordsDispatcher")
            .field("paused", &self.pause.lock().paused)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointManager, LogTruncationManager};
    use crate::config::ReplicatorConfig;
    use crate::drain::role::RoleContextDrainState;
    use crate::error::Result;
    use crate::io_monitor::IoHealthMonitor;
    use crate::log_stream::MemoryLogStream;
    use crate::records::{LogRecord, Lsn, OperationContext, TxId};
    use crate::recovery::transaction_map::TransactionMap;
    use crate::replicated::{LogManagerInit, ReplicatedLogManager};
    use crate::state_provider::{ApplyContext, ReplicaRole, StateProvider};
    use crate::writer::{FlushCallbackManager, FlushProcessor, PhysicalLogWriter, WriterInit};
    use parking_lot::RwLock;
    use std::path::Path;
    use std::time::Duration;

    struct NullProvider;

    #[async_trait]
    impl StateProvider for NullProvider {
        async fn apply(
            &self,
            _lsn: Lsn,
            _tx_id: Option<TxId>,
            _context: ApplyContext,
            _metadata: &[u8],
            _redo: &[u8],
        ) -> Result<Option<OperationContext>> {
            Ok(None)
        }
        fn unlock(&self, _context: OperationContext) {}
        async fn prepare_checkpoint(&self, _checkpoint_lsn: Lsn) -> Result<()> {
            Ok(())
        }
        async fn perform_checkpoint(&self) -> Result<()> {
            Ok(())
        }
        async fn complete_checkpoint(&self) -> Result<()> {
            Ok(())
        }
        async fn backup_checkpoint(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
        async fn restore_checkpoint(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
        async fn begin_setting_current_state(&self) -> Result<()> {
            Ok(())
        }
        async fn set_current_state(&self, _n: u64, _data: Vec<Vec<u8>>) -> Result<()> {
            Ok(())
        }
        async fn end_setting_current_state(&self) -> Result<()> {
            Ok(())
        }
        async fn change_role(&self, _role: ReplicaRole) -> Result<()> {
            Ok(())
        }
    }

    fn test_dispatcher() -> Arc<LogRecordsDispatcher> {
        let config = Arc::new(RwLock::new(ReplicatorConfig::default()));
        let role = Arc::new(RoleContextDrainState::new());
        role.change_role(ReplicaRole::Active);
        let writer = Arc::new(PhysicalLogWriter::new(
            Arc::new(MemoryLogStream::new(None)),
            FlushCallbackManager::new(),
            Arc::new(IoHealthMonitor::new(Duration::from_secs(10))),
            64 * 1024,
            WriterInit::default(),
        ));
        let log_manager =
            ReplicatedLogManager::new(writer, role.clone(), LogManagerInit::default());
        let tx_map = Arc::new(Mutex::new(TransactionMap::new()));
        let checkpoint_manager = CheckpointManager::new(
            log_manager.clone(),
            Arc::new(LogTruncationManager::new(config.clone())),
            Arc::new(NullProvider),
            tx_map.clone(),
            config,
        );
        let processor = OperationProcessor::new(
            role,
            Arc::new(NullProvider),
            checkpoint_manager,
            log_manager,
            tx_map,
        );
        LogRecordsDispatcher::new(processor)
    }

    fn barrier(lsn: Lsn) -> RecordRef {
        let record = LogRecord::new(RecordBody::Barrier {
            last_stable_lsn: lsn.saturating_sub(1),
        });
        record.set_lsn(lsn);
        record
    }

    #[tokio::test]
    async fn drain_with_no_dispatched_barrier_completes_immediately() {
        let dispatcher = test_dispatcher();
        let drained = dispatcher.drain_and_pause();
        drained.wait().await.unwrap();
        dispatcher.continue_dispatch();
    }

    #[tokio::test]
    async fn drain_resolves_after_last_barrier_processes() {
        let dispatcher = test_dispatcher();

        let first = barrier(1);
        dispatcher
            .process_logged_records(crate::writer::LoggedBatch::succeeded(vec![first.clone()]))
            .await;
        first.processed().wait().await.unwrap();

        let drained = dispatcher.drain_and_pause();
        drained.wait().await.unwrap();

        // While paused, a new barrier batch parks before applying
        let second = barrier(2);
        let dispatcher_clone = dispatcher.clone();
        let second_clone = second.clone();
        let pumping = tokio::spawn(async move {
            dispatcher_clone
                .process_logged_records(crate::writer::LoggedBatch::succeeded(vec![second_clone]))
                .await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.processed().is_completed());

        dispatcher.continue_dispatch();
        pumping.await.unwrap();
        second.processed().wait().await.unwrap();
    }
}
