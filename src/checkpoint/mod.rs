// Checkpoint manager
// Owns group commit, the checkpoint state machine, the log truncation
// policy hookup, and the periodic checkpoint/truncation cycle. Barriers
// come through here; every stable barrier is a chance to index,
// checkpoint, or truncate the head.

pub mod truncation;

pub use truncation::{CheckpointDecision, LogTruncationManager, LogUsage, TruncationPolicy};

use crate::config::ReplicatorConfig;
use crate::error::{ReplicatorError, Result};
use crate::recovery::transaction_map::TransactionMap;
use crate::records::{RecordBody, RecordRef};
use crate::replicated::ReplicatedLogManager;
use crate::state_provider::{ReplicaRole, StateProvider};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use tracing::{debug, info, warn};

/// Stages of the periodic checkpoint/truncation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodicStage {
    NotStarted,
    /// Timer fired: the next barrier must checkpoint
    Ready,
    CheckpointStarted,
    /// Checkpoint done: a head truncation is owed, size policy waived
    CheckpointCompleted,
    TruncationStarted,
}

struct PeriodicState {
    stage: PeriodicStage,
    last_checkpoint_time: SystemTime,
    last_truncation_time: SystemTime,
}

struct CheckpointState {
    /// BeginCheckpoint logged but its perform has not finished
    in_progress_checkpoint: Option<RecordRef>,
    last_completed_begin_checkpoint: Option<RecordRef>,
    last_completed_end_checkpoint: Option<RecordRef>,
    pending_truncate_head: Option<RecordRef>,
}

/// Group commits, checkpoints, and head truncation for one replica.
pub struct CheckpointManager {
    /// Self-handle for the timer and perform-checkpoint tasks
    weak_self: std::sync::Weak<CheckpointManager>,
    log_manager: Arc<ReplicatedLogManager>,
    truncation: Arc<LogTruncationManager>,
    state_provider: Arc<dyn StateProvider>,
    tx_map: Arc<Mutex<TransactionMap>>,
    config: Arc<RwLock<ReplicatorConfig>>,
    state: Mutex<CheckpointState>,
    periodic: Mutex<PeriodicState>,
    group_commit_armed: AtomicBool,
    /// Restore sets this so checkpoint pressure stops aborting old
    /// transactions while the log is being replaced.
    suspend_old_tx_aborts: AtomicBool,
    /// Readers: copy and backup log pins. Writer: the EndCheckpoint +
    /// CompleteCheckpoint sequence.
    backup_and_copy_consistency_lock: Arc<tokio::sync::RwLock<()>>,
    /// Serializes prepare/perform/backup against the state provider.
    state_manager_api_lock: Arc<tokio::sync::RwLock<()>>,
}

impl CheckpointManager {
    pub fn new(
        log_manager: Arc<ReplicatedLogManager>,
        truncation: Arc<LogTruncationManager>,
        state_provider: Arc<dyn StateProvider>,
        tx_map: Arc<Mutex<TransactionMap>>,
        config: Arc<RwLock<ReplicatorConfig>>,
    ) -> Arc<Self> {
        let now = SystemTime::now();
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            log_manager,
            truncation,
            state_provider,
            tx_map,
            config,
            state: Mutex::new(CheckpointState {
                in_progress_checkpoint: None,
                last_completed_begin_checkpoint: None,
                last_completed_end_checkpoint: None,
                pending_truncate_head: None,
            }),
            periodic: Mutex::new(PeriodicState {
                stage: PeriodicStage::NotStarted,
                last_checkpoint_time: now,
                last_truncation_time: now,
            }),
            group_commit_armed: AtomicBool::new(false),
            suspend_old_tx_aborts: AtomicBool::new(false),
            backup_and_copy_consistency_lock: Arc::new(tokio::sync::RwLock::new(())),
            state_manager_api_lock: Arc::new(tokio::sync::RwLock::new(())),
        })
    }

    pub fn truncation_manager(&self) -> &Arc<LogTruncationManager> {
        &self.truncation
    }

    pub fn last_completed_begin_checkpoint(&self) -> Option<RecordRef> {
        self.state.lock().last_completed_begin_checkpoint.clone()
    }

    pub fn last_completed_end_checkpoint(&self) -> Option<RecordRef> {
        self.state.lock().last_completed_end_checkpoint.clone()
    }

    pub fn periodic_stage(&self) -> PeriodicStage {
        self.periodic.lock().stage
    }

    /// Install recovered checkpoint records (recovery/restore seed).
    pub fn install_recovered_checkpoint(
        &self,
        begin: Option<RecordRef>,
        end: Option<RecordRef>,
    ) {
        let mut state = self.state.lock();
        state.last_completed_begin_checkpoint = begin;
        state.last_completed_end_checkpoint = end;
    }

    /// Recovery hook for the periodic cycle: an older truncation time
    /// means the last periodic truncation never ran; owe one now.
    pub fn recover_periodic_state(
        &self,
        recovered_checkpoint_time: SystemTime,
        recovered_truncation_time: SystemTime,
    ) {
        let mut periodic = self.periodic.lock();
        periodic.last_checkpoint_time = recovered_checkpoint_time;
        periodic.last_truncation_time = recovered_truncation_time;
        if recovered_truncation_time < recovered_checkpoint_time {
            info!("recovered periodic truncation incomplete; owing a head truncation");
            periodic.stage = PeriodicStage::CheckpointCompleted;
        }
    }

    /// Snapshot of live counters for the truncation policy.
    pub fn log_usage(&self) -> LogUsage {
        let state = self.state.lock();
        let periodic = self.periodic.lock();
        LogUsage {
            current_tail_position: self.log_manager.writer().current_tail_position(),
            head_position: self.log_manager.head_position(),
            last_index_position: self
                .log_manager
                .last_indexing_record()
                .and_then(|r| r.position()),
            last_completed_checkpoint_position: state
                .last_completed_begin_checkpoint
                .as_ref()
                .and_then(|r| r.position()),
            checkpoint_in_flight: state.in_progress_checkpoint.is_some(),
            truncation_in_flight: state.pending_truncate_head.is_some(),
            completed_checkpoint_exists: state.last_completed_end_checkpoint.is_some(),
            periodic_checkpoint_ready: periodic.stage == PeriodicStage::Ready,
            periodic_truncation_ready: periodic.stage == PeriodicStage::CheckpointCompleted,
        }
    }

    /// Refuse a new operation when the log is over the throttle
    /// threshold. Records that shrink the log (ends, barriers) pass.
    pub fn error_if_throttled(&self, record: &RecordRef) -> Result<()> {
        if matches!(
            record.body(),
            RecordBody::EndTx { .. } | RecordBody::Barrier { .. }
        ) {
            return Ok(());
        }
        if self
            .truncation
            .should_block_operations_on_primary(&self.log_usage())
        {
            return Err(ReplicatorError::Throttled);
        }
        Ok(())
    }

    /// Log a barrier received from the primary's stream without
    /// replicating it again. Returns whether it was inserted (a resent
    /// barrier at or below the tail is a duplicate).
    pub fn append_barrier_on_secondary(
        &self,
        record: RecordRef,
        lsn: crate::records::Lsn,
    ) -> Result<bool> {
        debug_assert!(matches!(record.body(), RecordBody::Barrier { .. }));
        self.log_manager.append_without_replication(record, lsn)
    }

    /// Replicate a Barrier carrying the current stable LSN and flush.
    pub async fn replicate_barrier(&self) -> Result<RecordRef> {
        let record = crate::records::LogRecord::new(RecordBody::Barrier {
            last_stable_lsn: self.log_manager.stable_lsn(),
        });
        self.log_manager.replicate_and_log(record.clone())?;
        self.log_manager.flush("barrier").await?;
        Ok(record)
    }

    /// Arm the group-commit timer; a short delay later one Barrier
    /// makes every commit since then stable. Re-arming while armed is
    /// a no-op.
    pub fn request_group_commit(&self) {
        if self.group_commit_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        let delay = self.config.read().group_commit_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.group_commit_armed.store(false, Ordering::SeqCst);
            if let Err(err) = manager.replicate_barrier().await {
                debug!(error = %err, "group commit barrier failed");
            }
        });
    }

    /// Barrier post-processing: index, checkpoint, and truncate-head
    /// decisions. Returns transactions that must be aborted before a
    /// checkpoint can proceed.
    pub fn checkpoint_if_necessary(&self, _is_primary: bool) -> Result<Vec<RecordRef>> {
        self.index_if_necessary()?;

        let usage = self.log_usage();
        let decision = {
            let tx = self.tx_map.lock();
            let earliest = tx.earliest_pending();
            self.truncation
                .should_checkpoint(&usage, earliest.as_ref(), |offset, out| {
                    tx.pending_older_than_position(offset, out)
                })
        };

        match decision {
            CheckpointDecision::Checkpoint => {
                let earliest_lsn = self.tx_map.lock().earliest_pending().map(|r| r.lsn());
                let begin = self.log_manager.append_begin_checkpoint(earliest_lsn)?;
                {
                    let mut state = self.state.lock();
                    state.in_progress_checkpoint = Some(begin.clone());
                }
                {
                    let mut periodic = self.periodic.lock();
                    if periodic.stage == PeriodicStage::Ready {
                        periodic.stage = PeriodicStage::CheckpointStarted;
                    }
                }
                info!(lsn = begin.lsn(), "begin checkpoint appended");
                Ok(Vec::new())
            }
            CheckpointDecision::AbortOldTransactions(candidates) => {
                if self.suspend_old_tx_aborts.load(Ordering::SeqCst) {
                    return Ok(Vec::new());
                }
                debug!(count = candidates.len(), "checkpoint deferred to old tx abort");
                Ok(candidates)
            }
            CheckpointDecision::No => {
                self.truncate_head_if_necessary()?;
                Ok(Vec::new())
            }
        }
    }

    fn index_if_necessary(&self) -> Result<()> {
        if self.truncation.should_index(&self.log_usage()) {
            self.log_manager.append_indexing()?;
        }
        Ok(())
    }

    /// Append a TruncateHead when policy says the log is worth
    /// shrinking and a good indexing candidate exists.
    pub fn truncate_head_if_necessary(&self) -> Result<Option<RecordRef>> {
        let usage = self.log_usage();
        if !self.truncation.should_truncate_head(&usage) {
            return Ok(None);
        }

        let periodic_active = usage.periodic_truncation_ready;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs() as i64;

        let truncation = self.truncation.clone();
        let usage_for_policy = usage.clone();
        let record = self.log_manager.try_append_truncate_head(
            periodic_active,
            timestamp,
            &move |indexing| {
                truncation.is_good_log_head_candidate(
                    &usage_for_policy,
                    indexing.position().unwrap_or(0),
                    periodic_active,
                )
            },
        )?;

        if let Some(record) = &record {
            self.state.lock().pending_truncate_head = Some(record.clone());
            let mut periodic = self.periodic.lock();
            if periodic.stage == PeriodicStage::CheckpointCompleted {
                periodic.stage = PeriodicStage::TruncationStarted;
            }
        }
        Ok(record)
    }

    /// Apply side of BeginCheckpoint: wait for stability, prepare the
    /// state provider, then hand off to an async perform task.
    pub async fn apply_checkpoint_if_permitted(
        &self,
        record: RecordRef,
        flush_error: Option<ReplicatorError>,
    ) {
        if let Some(err) = flush_error {
            record.applied().complete(Err(err.clone()));
            record.processed().complete(Err(err));
            return;
        }

        if let Err(err) = self.log_manager.wait_for_stable(record.lsn()).await {
            record.applied().complete(Err(err.clone()));
            record.processed().complete(Err(err));
            return;
        }

        let prepare_result = {
            let _api = self.state_manager_api_lock.clone().write_owned().await;
            self.state_provider.prepare_checkpoint(record.lsn()).await
        };
        if let Err(err) = prepare_result {
            self.log_manager.role().report_fault("prepare checkpoint failed");
            record.applied().complete(Err(err.clone()));
            record.processed().complete(Err(err));
            return;
        }

        record.applied().complete(Ok(()));

        let Some(manager) = self.weak_self.upgrade() else {
            record.processed().complete(Err(ReplicatorError::Closed));
            return;
        };
        tokio::spawn(async move {
            manager.perform_checkpoint(record).await;
        });
    }

    /// Perform + EndCheckpoint (+ CompleteCheckpoint on the primary).
    async fn perform_checkpoint(self: Arc<Self>, begin: RecordRef) {
        let result = self.perform_checkpoint_inner(&begin).await;
        match result {
            Ok(()) => begin.processed().complete(Ok(())),
            Err(err) => {
                self.log_manager.role().report_fault("perform checkpoint failed");
                self.state.lock().in_progress_checkpoint = None;
                begin.processed().complete(Err(err))
            }
        };
    }

    async fn perform_checkpoint_inner(&self, begin: &RecordRef) -> Result<()> {
        {
            let _api = self.state_manager_api_lock.clone().write_owned().await;
            self.state_provider.perform_checkpoint().await?;
        }

        let end = {
            let _consistency = self
                .backup_and_copy_consistency_lock
                .clone()
                .write_owned()
                .await;
            let end = self.log_manager.append_end_checkpoint(begin)?;
            self.log_manager.flush("end-checkpoint").await?;
            self.state_provider.complete_checkpoint().await?;

            if self.log_manager.role().role() == ReplicaRole::Primary {
                self.log_manager.append_complete_checkpoint()?;
                self.log_manager.flush("complete-checkpoint").await?;
            }
            end
        };

        {
            let mut state = self.state.lock();
            state.last_completed_begin_checkpoint = Some(begin.clone());
            state.last_completed_end_checkpoint = Some(end);
            state.in_progress_checkpoint = None;
        }
        {
            let mut periodic = self.periodic.lock();
            if periodic.stage == PeriodicStage::CheckpointStarted {
                periodic.stage = PeriodicStage::CheckpointCompleted;
                periodic.last_checkpoint_time = SystemTime::now();
            }
        }

        info!(lsn = begin.lsn(), "checkpoint completed");
        if self.truncate_head_if_necessary()?.is_some() {
            self.log_manager.flush("truncate-head").await?;
        }
        Ok(())
    }

    /// Apply side of TruncateHead: physically truncate, advance the
    /// head, and close out a periodic cycle.
    pub async fn apply_log_head_truncation_if_permitted(
        &self,
        record: RecordRef,
        flush_error: Option<ReplicatorError>,
    ) {
        if let Some(err) = flush_error {
            self.state.lock().pending_truncate_head = None;
            record.applied().complete(Err(err.clone()));
            record.processed().complete(Err(err));
            return;
        }

        let (head_psn, head_position, is_periodic, timestamp) = match record.body() {
            RecordBody::TruncateHead {
                head_indexing_psn,
                head_record_position,
                is_periodic,
                periodic_truncation_timestamp,
                ..
            } => (
                *head_indexing_psn,
                *head_record_position,
                *is_periodic,
                *periodic_truncation_timestamp,
            ),
            _ => {
                record
                    .applied()
                    .complete(Err(ReplicatorError::Internal(
                        "truncate head apply on wrong record kind".to_string(),
                    )));
                record.processed().complete(Ok(()));
                return;
            }
        };

        // A checkpoint completed since this truncation was scheduled:
        // let the provider square its checkpoint against the new head.
        if self.state.lock().last_completed_end_checkpoint.is_some() {
            if let Err(err) = self
                .state_provider
                .prepare_checkpoint(record.lsn())
                .await
            {
                warn!(error = %err, "prepare checkpoint before head truncation failed");
            }
        }

        let result = self
            .log_manager
            .writer()
            .truncate_log_head(head_position)
            .await;

        match result {
            Ok(()) => {
                if let Some(indexing) = self.log_manager.get_physical_record(head_psn) {
                    self.log_manager.set_head_record(indexing);
                }
                self.state.lock().pending_truncate_head = None;
                {
                    let mut periodic = self.periodic.lock();
                    if is_periodic || periodic.stage == PeriodicStage::TruncationStarted {
                        periodic.stage = PeriodicStage::NotStarted;
                        periodic.last_truncation_time = SystemTime::UNIX_EPOCH
                            + Duration::from_secs(timestamp.max(0) as u64);
                    }
                }
                info!(head_position, "log head truncated");
                record.applied().complete(Ok(()));
                record.processed().complete(Ok(()));
            }
            Err(err) => {
                self.state.lock().pending_truncate_head = None;
                record.applied().complete(Err(err.clone()));
                record.processed().complete(Err(err));
            }
        }
    }

    /// Secondary drain back-pressure: when a checkpoint or truncation
    /// is pending past the stable LSN and the log is over the throttle
    /// threshold, wait for it before pumping more records.
    pub async fn block_secondary_pump_if_needed(&self) {
        let pending = {
            let state = self.state.lock();
            state
                .in_progress_checkpoint
                .clone()
                .or_else(|| state.pending_truncate_head.clone())
        };
        let Some(record) = pending else { return };

        let usage = self.log_usage();
        let over_threshold =
            usage.bytes_used_from_head() > self.truncation.policy().throttle_at_log_usage_bytes;
        if record.lsn() > self.log_manager.stable_lsn() && over_threshold {
            debug!(lsn = record.lsn(), "secondary pump blocked on pending checkpoint");
            let _ = record.processed().wait().await;
        }
    }

    /// Start the periodic checkpoint/truncation timer. No-op when the
    /// interval is zero.
    pub fn start_periodic_timer(&self) {
        let interval = self
            .config
            .read()
            .periodic_checkpoint_truncation_interval;
        if interval.is_zero() {
            return;
        }

        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if manager.log_manager.writer().is_closed() {
                    break;
                }
                let mut periodic = manager.periodic.lock();
                let due = periodic
                    .last_checkpoint_time
                    .elapsed()
                    .map(|elapsed| elapsed >= interval)
                    .unwrap_or(true);
                if due && periodic.stage == PeriodicStage::NotStarted {
                    periodic.stage = PeriodicStage::Ready;
                    debug!("periodic checkpoint due");
                }
            }
        });
    }

    pub async fn acquire_backup_and_copy_consistency_lock(
        &self,
        who: &str,
        timeout: Duration,
    ) -> Result<OwnedRwLockWriteGuard<()>> {
        tokio::time::timeout(
            timeout,
            self.backup_and_copy_consistency_lock.clone().write_owned(),
        )
        .await
        .map_err(|_| ReplicatorError::Timeout(format!("backup/copy consistency lock: {}", who)))
    }

    pub async fn acquire_backup_and_copy_consistency_lock_shared(
        &self,
        who: &str,
        timeout: Duration,
    ) -> Result<OwnedRwLockReadGuard<()>> {
        tokio::time::timeout(
            timeout,
            self.backup_and_copy_consistency_lock.clone().read_owned(),
        )
        .await
        .map_err(|_| ReplicatorError::Timeout(format!("backup/copy consistency lock: {}", who)))
    }

    pub async fn acquire_state_manager_api_lock(
        &self,
        who: &str,
        timeout: Duration,
    ) -> Result<OwnedRwLockWriteGuard<()>> {
        tokio::time::timeout(timeout, self.state_manager_api_lock.clone().write_owned())
            .await
            .map_err(|_| ReplicatorError::Timeout(format!("state manager api lock: {}", who)))
    }

    /// Close-path cleanup: fail any checkpoint that never performed.
    pub fn abort_pending_checkpoint(&self) {
        if let Some(record) = self.state.lock().in_progress_checkpoint.take() {
            record.applied().complete(Err(ReplicatorError::Cancelled));
            record.processed().complete(Err(ReplicatorError::Cancelled));
        }
    }

    /// Close-path cleanup: fail a truncation that never applied.
    pub fn abort_pending_log_head_truncation(&self) {
        if let Some(record) = self.state.lock().pending_truncate_head.take() {
            record.applied().complete(Err(ReplicatorError::Cancelled));
            record.processed().complete(Err(ReplicatorError::Cancelled));
        }
    }

    /// Stop/resume abort-of-old-transactions pressure (restore path).
    pub fn set_old_tx_aborts_suspended(&self, suspended: bool) {
        self.suspend_old_tx_aborts.store(suspended, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("periodic_stage", &self.periodic_stage())
            .finish()
    }
}
