// Backup manager
// Coordinates full and incremental backups (pin the log, write the
// self-describing artifacts, make the backed-up range stable, log a
// Backup record) and drives deterministic restore from a validated
// backup chain.

pub mod folder;
pub mod incremental;
pub mod log_file;
pub mod metadata;

pub use folder::BackupFolderInfo;
pub use metadata::{BackupKind, BackupMetadata};

use crate::checkpoint::CheckpointManager;
use crate::config::ReplicatorConfig;
use crate::error::{ReplicatorError, Result};
use crate::io_monitor::IoHealthMonitor;
use crate::log_stream::LogStream;
use crate::records::{Epoch, LogRecord, Lsn, RecordBody, RecordRef};
use crate::recovery::{read_log_records, RecoveryManager, RecoveryOutcome};
use crate::replicated::ReplicatedLogManager;
use crate::state_provider::StateProvider;
use crate::writer::{FlushCallbackManager, PhysicalLogWriter, WriterInit};
use folder::{BACKUP_LOG_NAME, BACKUP_SUBFOLDER, FULL_METADATA_NAME, INCREMENTAL_METADATA_NAME, LOG_SUBFOLDER, STATE_SUBFOLDER};
use incremental::IncrementalBackupRecords;
use log_file::BackupLogFileWriter;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_RETRY_COUNT: u32 = 5;
const RETRY_BACKOFF_STEP: Duration = Duration::from_millis(500);
const MB: u64 = 1024 * 1024;

/// Handed to the registered backup callback before the backup is
/// committed with a Backup record.
#[derive(Debug, Clone)]
pub struct BackupInfo {
    pub backup_id: Uuid,
    pub parent_backup_id: Option<Uuid>,
    pub kind: BackupKind,
    pub folder: PathBuf,
    pub highest_backed_up_epoch: Epoch,
    pub highest_backed_up_lsn: Lsn,
}

/// User acceptance hook: returning false abandons the backup.
pub type BackupCallback = Box<dyn Fn(&BackupInfo) -> bool + Send + Sync>;

/// Restore safety policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePolicy {
    /// The backup must be strictly ahead of the current tail
    Safe,
    /// Take the backup regardless (data loss accepted)
    Force,
}

/// What restore rebuilt; the replica context finishes the promotion.
pub struct RestoreOutcome {
    pub recovery: RecoveryOutcome,
    pub restored_epoch: Epoch,
    pub restored_lsn: Lsn,
    /// The live replica's tail epoch captured before the log was
    /// replaced; the restored incarnation continues this lineage
    pub pre_restore_epoch: Epoch,
}

#[derive(Debug, Clone)]
struct CompletedBackup {
    backup_id: Uuid,
    highest_backed_up_epoch: Epoch,
    highest_backed_up_lsn: Lsn,
    accumulated_log_size_bytes: u64,
}

/// Full/incremental backup production and restore for one replica.
pub struct BackupManager {
    log_manager: Arc<ReplicatedLogManager>,
    checkpoint_manager: Arc<CheckpointManager>,
    state_provider: Arc<dyn StateProvider>,
    config: Arc<RwLock<ReplicatorConfig>>,
    partition_id: Uuid,
    replica_id: i64,
    /// Root for restore token files
    restore_root: PathBuf,
    /// One backup or restore at a time
    backup_api_lock: Arc<tokio::sync::Mutex<()>>,
    last_completed_backup: Mutex<Option<CompletedBackup>>,
}

impl BackupManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log_manager: Arc<ReplicatedLogManager>,
        checkpoint_manager: Arc<CheckpointManager>,
        state_provider: Arc<dyn StateProvider>,
        config: Arc<RwLock<ReplicatorConfig>>,
        partition_id: Uuid,
        replica_id: i64,
        restore_root: PathBuf,
    ) -> Self {
        Self {
            log_manager,
            checkpoint_manager,
            state_provider,
            config,
            partition_id,
            replica_id,
            restore_root,
            backup_api_lock: Arc::new(tokio::sync::Mutex::new(())),
            last_completed_backup: Mutex::new(None),
        }
    }

    pub fn restore_token_path(&self) -> PathBuf {
        self.restore_root
            .join("restore")
            .join(self.partition_id.to_string())
            .join(self.replica_id.to_string())
            .join("restore.token")
    }

    pub fn restore_token_exists(&self) -> bool {
        self.restore_token_path().is_file()
    }

    /// Remove the restore token once promotion has finished.
    pub fn delete_restore_token(&self) -> Result<()> {
        let path = self.restore_token_path();
        if path.is_file() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Take a full backup into `backup_folder`.
    pub async fn backup_full(
        &self,
        backup_folder: &Path,
        callback: &BackupCallback,
    ) -> Result<BackupInfo> {
        let _api = self
            .backup_api_lock
            .try_lock()
            .map_err(|_| ReplicatorError::BackupInProgress)?;

        let trbackup = backup_folder.join(BACKUP_SUBFOLDER);
        prepare_backup_folder(&trbackup).await?;
        let state_folder = trbackup.join(STATE_SUBFOLDER);
        std::fs::create_dir_all(&state_folder)?;

        // Pin the log and the provider checkpoint under the
        // consistency lock so they describe the same moment.
        let (pinned, indexing_epoch, indexing_lsn) = {
            let _consistency = self
                .checkpoint_manager
                .acquire_backup_and_copy_consistency_lock_shared("backup", Duration::from_secs(30))
                .await?;

            self.log_manager.flush("backup-pin").await?;
            let records = read_log_records(self.log_manager.writer().stream())?;
            let target_lsn = self.backup_pin_target_lsn();
            let start = records
                .iter()
                .rposition(|r| {
                    matches!(r.body(), RecordBody::Indexing { .. }) && r.lsn() <= target_lsn
                })
                .unwrap_or(0);
            let (epoch, lsn) = match records.get(start).map(|r| (r.body().clone(), r.lsn())) {
                Some((RecordBody::Indexing { current_epoch }, lsn)) => (current_epoch, lsn),
                _ => (self.log_manager.tail_epoch(), 0),
            };

            self.state_provider.backup_checkpoint(&state_folder).await?;
            (records[start..].to_vec(), epoch, lsn)
        };

        // Write the backup log
        let log_path = trbackup.join(LOG_SUBFOLDER).join(BACKUP_LOG_NAME);
        let mut writer = BackupLogFileWriter::create(&log_path, indexing_epoch)?;
        for record in &pinned {
            writer.write_record(record)?;
        }
        let properties = writer.finalize(indexing_epoch, indexing_lsn)?;

        self.enforce_backup_size_gate(std::fs::metadata(&log_path)?.len())?;

        // Metadata
        let backup_id = Uuid::new_v4();
        let backup_metadata = BackupMetadata {
            kind: BackupKind::Full,
            parent_backup_id: Uuid::nil(),
            backup_id,
            partition_id: self.partition_id,
            replica_id: self.replica_id,
            starting_epoch: properties.indexing_record_epoch,
            starting_lsn: properties.indexing_record_lsn,
            backup_epoch: properties.last_backed_up_epoch,
            backup_lsn: properties.last_backed_up_lsn,
            created_at: chrono::Utc::now(),
        };
        metadata::write_metadata_file(&trbackup.join(FULL_METADATA_NAME), &backup_metadata)?;

        let info = BackupInfo {
            backup_id,
            parent_backup_id: None,
            kind: BackupKind::Full,
            folder: backup_folder.to_path_buf(),
            highest_backed_up_epoch: properties.last_backed_up_epoch,
            highest_backed_up_lsn: properties.last_backed_up_lsn,
        };

        self.commit_backup(&info, callback).await?;

        *self.last_completed_backup.lock() = Some(CompletedBackup {
            backup_id,
            highest_backed_up_epoch: info.highest_backed_up_epoch,
            highest_backed_up_lsn: info.highest_backed_up_lsn,
            accumulated_log_size_bytes: std::fs::metadata(&log_path)?.len(),
        });
        info!(%backup_id, lsn = info.highest_backed_up_lsn, "full backup completed");
        Ok(info)
    }

    /// Take an incremental backup since the last completed backup.
    pub async fn backup_incremental(
        &self,
        backup_folder: &Path,
        callback: &BackupCallback,
    ) -> Result<BackupInfo> {
        let _api = self
            .backup_api_lock
            .try_lock()
            .map_err(|_| ReplicatorError::BackupInProgress)?;

        let previous = self
            .last_completed_backup
            .lock()
            .clone()
            .ok_or(ReplicatorError::MissingFullBackup)?;
        self.check_incremental_lineage(&previous)?;

        let trbackup = backup_folder.join(BACKUP_SUBFOLDER);
        prepare_backup_folder(&trbackup).await?;

        let pinned = {
            let _consistency = self
                .checkpoint_manager
                .acquire_backup_and_copy_consistency_lock_shared(
                    "incremental-backup",
                    Duration::from_secs(30),
                )
                .await?;
            self.log_manager.flush("backup-pin").await?;

            let start_position =
                self.incremental_start_position(previous.highest_backed_up_lsn);
            let records = read_log_records(self.log_manager.writer().stream())?;
            records
                .into_iter()
                .filter(|r| r.position().unwrap_or(0) >= start_position)
                .collect::<Vec<_>>()
        };

        let mut filter = IncrementalBackupRecords::new(
            previous.highest_backed_up_epoch,
            previous.highest_backed_up_lsn,
        );
        let log_path = trbackup.join(LOG_SUBFOLDER).join(BACKUP_LOG_NAME);
        let mut writer =
            BackupLogFileWriter::create(&log_path, previous.highest_backed_up_epoch)?;
        for record in &pinned {
            if filter.accepts(record) {
                writer.write_record(record)?;
            }
        }
        let (starting_epoch, starting_lsn) = filter
            .starting_point()
            .unwrap_or((previous.highest_backed_up_epoch, previous.highest_backed_up_lsn));
        let properties = writer.finalize(starting_epoch, starting_lsn)?;

        let log_size = std::fs::metadata(&log_path)?.len();
        self.enforce_backup_size_gate(previous.accumulated_log_size_bytes + log_size)?;

        let backup_id = Uuid::new_v4();
        let backup_metadata = BackupMetadata {
            kind: BackupKind::Incremental,
            parent_backup_id: previous.backup_id,
            backup_id,
            partition_id: self.partition_id,
            replica_id: self.replica_id,
            starting_epoch,
            starting_lsn,
            backup_epoch: properties.last_backed_up_epoch,
            backup_lsn: properties.last_backed_up_lsn,
            created_at: chrono::Utc::now(),
        };
        metadata::write_metadata_file(
            &trbackup.join(INCREMENTAL_METADATA_NAME),
            &backup_metadata,
        )?;

        let info = BackupInfo {
            backup_id,
            parent_backup_id: Some(previous.backup_id),
            kind: BackupKind::Incremental,
            folder: backup_folder.to_path_buf(),
            highest_backed_up_epoch: properties.last_backed_up_epoch,
            highest_backed_up_lsn: properties.last_backed_up_lsn,
        };

        self.commit_backup(&info, callback).await?;

        *self.last_completed_backup.lock() = Some(CompletedBackup {
            backup_id,
            highest_backed_up_epoch: info.highest_backed_up_epoch,
            highest_backed_up_lsn: info.highest_backed_up_lsn,
            accumulated_log_size_bytes: previous.accumulated_log_size_bytes + log_size,
        });
        info!(%backup_id, lsn = info.highest_backed_up_lsn, "incremental backup completed");
        Ok(info)
    }

    /// Target LSN for pinning a full backup: everything a restore would
    /// need, starting below the earliest transaction the last completed
    /// checkpoint left pending. Without a completed checkpoint the whole
    /// log is pinned so no transaction is ever cut mid-chain.
    fn backup_pin_target_lsn(&self) -> Lsn {
        match self.checkpoint_manager.last_completed_begin_checkpoint() {
            Some(begin) => match begin.body() {
                RecordBody::BeginCheckpoint {
                    earliest_pending_tx_lsn,
                    ..
                } => earliest_pending_tx_lsn.unwrap_or(begin.lsn()),
                _ => begin.lsn(),
            },
            None => 0,
        }
    }

    /// Incremental start: walk backward from the tail through physical
    /// back-links to the first physical record below the previous
    /// backup's highest LSN.
    fn incremental_start_position(&self, previous_highest_lsn: Lsn) -> u64 {
        let mut cursor = self
            .log_manager
            .writer()
            .current_tail_record()
            .filter(|r| r.kind().is_physical())
            .or_else(|| self.log_manager.last_linked_physical_record());

        while let Some(record) = cursor {
            if record.lsn() < previous_highest_lsn {
                return record.position().unwrap_or(0);
            }
            cursor = record
                .previous_physical_psn()
                .and_then(|psn| self.log_manager.get_physical_record(psn));
        }
        self.log_manager.head_position()
    }

    fn check_incremental_lineage(&self, previous: &CompletedBackup) -> Result<()> {
        let tail_epoch = self.log_manager.tail_epoch();
        if previous.highest_backed_up_epoch.data_loss_version == tail_epoch.data_loss_version {
            return Ok(());
        }
        if self.config.read().enable_incremental_backups_across_replicas
            && self
                .log_manager
                .progress_vector()
                .contains_epoch(previous.highest_backed_up_epoch)
        {
            return Ok(());
        }
        Err(ReplicatorError::InvalidOperation(
            "incremental backup crosses a data loss boundary".to_string(),
        ))
    }

    fn enforce_backup_size_gate(&self, accumulated_bytes: u64) -> Result<()> {
        let config = self.config.read();
        let cap_mb = config
            .max_stream_size_mb
            .min(config.max_accumulated_backup_log_size_mb);
        if accumulated_bytes / MB >= cap_mb {
            return Err(ReplicatorError::OutOfCapacity(format!(
                "accumulated backup log size {} MB at or above cap {} MB",
                accumulated_bytes / MB,
                cap_mb
            )));
        }
        Ok(())
    }

    /// Make the backed-up range stable, run the user callback, then
    /// commit the backup with a replicated Backup record.
    async fn commit_backup(&self, info: &BackupInfo, callback: &BackupCallback) -> Result<()> {
        // Stabilize: the backed-up range must be quorum-durable
        if info.highest_backed_up_lsn > self.log_manager.stable_lsn() {
            self.replicate_barrier_with_retry().await?;
        }

        if !callback(info) {
            return Err(ReplicatorError::InvalidOperation(
                "backup callback rejected the backup".to_string(),
            ));
        }

        // Log the Backup record and fence it with a barrier
        let record = LogRecord::new(RecordBody::Backup {
            backup_id: info.backup_id,
            highest_backed_up_epoch: info.highest_backed_up_epoch,
            highest_backed_up_lsn: info.highest_backed_up_lsn,
        });
        let ticket = self.log_manager.replicate_and_log(record.clone())?;
        self.replicate_barrier_with_retry().await?;

        let (applied, replicated) = tokio::join!(record.applied().wait(), ticket.wait());
        applied?;
        replicated?;
        Ok(())
    }

    async fn replicate_barrier_with_retry(&self) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.checkpoint_manager.replicate_barrier().await {
                Ok(record) => {
                    let _ = record.processed().wait().await;
                    return Ok(());
                }
                Err(ReplicatorError::ReconfigurationPending) if attempt < MAX_RETRY_COUNT => {
                    attempt += 1;
                    debug!(attempt, "barrier deferred by reconfiguration; retrying");
                    tokio::time::sleep(RETRY_BACKOFF_STEP * attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Restore from a validated backup folder into `target_stream`.
    /// The caller closes the old log before and finishes promotion
    /// after (UpdateEpoch, change role, token delete).
    pub async fn restore(
        &self,
        backup_folder: &Path,
        policy: RestorePolicy,
        current_tail: (Epoch, Lsn),
        target_stream: Arc<dyn LogStream>,
    ) -> Result<RestoreOutcome> {
        // 1. Analyze and verify before anything destructive
        let read_ahead = (self.config.read().read_ahead_cache_size_kb * 1024) as usize;
        let folder_info = BackupFolderInfo::analyze_with_read_ahead(backup_folder, read_ahead)?;
        let (restored_epoch, restored_lsn) = folder_info.highest_backed_up();

        if policy == RestorePolicy::Safe
            && (restored_epoch, restored_lsn) <= current_tail
        {
            return Err(ReplicatorError::InvalidParameter(format!(
                "backup at {:?}/{} is not ahead of current tail {:?}/{}",
                restored_epoch, restored_lsn, current_tail.0, current_tail.1
            )));
        }

        // 2. One restore at a time, and never on top of a broken one
        let _api = self
            .backup_api_lock
            .try_lock()
            .map_err(|_| ReplicatorError::BackupInProgress)?;
        if self.restore_token_exists() {
            return Err(ReplicatorError::InvalidOperation(
                "a previous restore never completed; manual cleanup required".to_string(),
            ));
        }
        let token = self.restore_token_path();
        if let Some(parent) = token.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&token, [])?;

        // 3. Quiet checkpoint-driven aborts while the log is replaced
        let pre_restore_epoch = current_tail.0;
        self.checkpoint_manager.set_old_tx_aborts_suspended(true);
        let result = self
            .restore_inner(&folder_info, pre_restore_epoch, target_stream)
            .await
            .map(|recovery| RestoreOutcome {
                recovery,
                restored_epoch,
                restored_lsn,
                pre_restore_epoch,
            });
        self.checkpoint_manager.set_old_tx_aborts_suspended(false);
        result
    }

    async fn restore_inner(
        &self,
        folder_info: &BackupFolderInfo,
        pre_restore_epoch: Epoch,
        target_stream: Arc<dyn LogStream>,
    ) -> Result<RecoveryOutcome> {
        // 4. Provider state from the full backup's checkpoint artifacts
        self.state_provider
            .restore_checkpoint(&folder_info.full_backup().state_folder)
            .await?;

        // 5. Seal the log being replaced; the restored incarnation owns
        // durability from here on
        self.log_manager
            .flush_information_record(
                crate::records::InformationEvent::ClosingLog,
                true,
                "restore",
            )
            .await?;

        // 6. Rebuild the log from the chain, skipping overlap between
        // consecutive artifacts
        let restore_writer = PhysicalLogWriter::new(
            target_stream.clone(),
            FlushCallbackManager::new(),
            Arc::new(IoHealthMonitor::new(
                self.config.read().slow_log_io_duration,
            )),
            self.config.read().max_write_cache_size_bytes(),
            WriterInit::default(),
        );

        let mut written_lsn: Option<Lsn> = None;
        let mut restored: Vec<RecordRef> = Vec::new();
        for artifact in &folder_info.chain {
            for frame in artifact.log_file.read_records()? {
                // Physical records inherit the tail LSN and never
                // collide; only logical records need overlap dedup.
                let keep = match frame.kind {
                    crate::records::RecordKind::UpdateEpoch => true,
                    kind if kind.is_logical() => {
                        written_lsn.map(|w| frame.lsn > w).unwrap_or(true)
                    }
                    _ => true,
                };
                if !keep {
                    continue;
                }
                if frame.kind.is_logical() {
                    written_lsn = Some(frame.lsn.max(written_lsn.unwrap_or(0)));
                }
                let record = LogRecord::from_frame(frame);
                restore_writer.insert_buffered_record(record.clone())?;
                restored.push(record);
            }
        }
        // The new incarnation's epoch numbering must continue the
        // replica's own lineage, not the backup file's: a forced
        // restore can reach behind a reconfiguration this replica
        // already lived through. Write the pre-restore epoch onto the
        // rebuilt tail so recovery settles it before promotion.
        let (chain_epoch, _) = folder_info.highest_backed_up();
        if pre_restore_epoch > chain_epoch {
            let lineage = LogRecord::new(RecordBody::UpdateEpoch {
                epoch: pre_restore_epoch,
                primary_replica_id: self.replica_id as u64,
            });
            lineage.set_lsn(written_lsn.unwrap_or(0));
            restore_writer.insert_buffered_record(lineage)?;
            info!(?pre_restore_epoch, "pre-restore epoch carried onto restored log");
        }

        // The marker also tells recovery this tail is intentional, not
        // false progress.
        let marker = LogRecord::new(RecordBody::Information {
            event: crate::records::InformationEvent::RestoredFromBackup,
        });
        marker.set_lsn(written_lsn.unwrap_or(0));
        restore_writer.insert_buffered_record(marker)?;
        restore_writer.flush("restore").await?;
        info!(records = restored.len(), "backup chain written to restore log");

        // 7. Recover from the rebuilt log
        RecoveryManager::recover(&target_stream).await
    }
}

impl std::fmt::Debug for BackupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupManager")
            .field("partition_id", &self.partition_id)
            .field("replica_id", &self.replica_id)
            .finish()
    }
}

/// Delete and recreate the backup staging folder, retrying transient
/// filesystem refusals with linear backoff.
async fn prepare_backup_folder(folder: &Path) -> Result<()> {
    let mut attempt = 0;
    loop {
        let result = (|| -> std::io::Result<()> {
            match std::fs::remove_dir_all(folder) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            std::fs::create_dir_all(folder)
        })();

        match result {
            Ok(()) => return Ok(()),
            Err(e) if attempt < MAX_RETRY_COUNT => {
                attempt += 1;
                warn!(error = %e, attempt, "backup folder preparation failed; retrying");
                tokio::time::sleep(RETRY_BACKOFF_STEP * attempt).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
