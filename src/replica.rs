// Logging replicator replica context
// Owns and wires the whole stack for one replica: stream, writer,
// callback pipeline, replicated log manager, checkpoint/truncation,
// processor/dispatcher, transactions, drain, and backup. No process
// globals; lifetime is explicit open -> roles -> close.

use crate::backup::{BackupManager, RestoreOutcome, RestorePolicy};
use crate::checkpoint::{CheckpointManager, LogTruncationManager};
use crate::config::ReplicatorConfig;
use crate::drain::role::RoleContextDrainState;
use crate::drain::SecondaryDrainManager;
use crate::error::Result;
use crate::io_monitor::IoHealthMonitor;
use crate::log_stream::{create_log_stream, LogStoreKind, LogStream};
use crate::processor::dispatcher::LogRecordsDispatcher;
use crate::processor::OperationProcessor;
use crate::records::{Epoch, InformationEvent, OperationMode, RecordBody, RecordRef, TxId};
use crate::recovery::{RecoveryInformation, RecoveryManager, RecoveryOutcome};
use crate::replicated::transport::StateReplicator;
use crate::replicated::ReplicatedLogManager;
use crate::state_provider::{ApplyContext, ReplicaRole, StateProvider};
use crate::transaction::TransactionManager;
use crate::writer::{FlushCallbackManager, PhysicalLogWriter};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Identity and storage choices for one replica.
#[derive(Debug, Clone)]
pub struct ReplicaSettings {
    pub partition_id: Uuid,
    pub replica_id: i64,
    pub store: LogStoreKind,
    pub restore_root: PathBuf,
    pub config: ReplicatorConfig,
}

/// The assembled logging replicator for a single replica.
pub struct LoggingReplicator {
    settings: ReplicaSettings,
    config: Arc<RwLock<ReplicatorConfig>>,
    state_provider: Arc<dyn StateProvider>,
    role: Arc<RoleContextDrainState>,
    log_manager: Arc<ReplicatedLogManager>,
    checkpoint_manager: Arc<CheckpointManager>,
    processor: Arc<OperationProcessor>,
    #[allow(dead_code)]
    dispatcher: Arc<LogRecordsDispatcher>,
    transaction_manager: Arc<TransactionManager>,
    backup_manager: Arc<BackupManager>,
    recovery_information: RecoveryInformation,
}

impl LoggingReplicator {
    /// Open the replica: recover the log, rebuild state, redo pending
    /// work against the state provider, and arm the periodic timer.
    pub async fn open(
        settings: ReplicaSettings,
        state_provider: Arc<dyn StateProvider>,
    ) -> Result<Arc<Self>> {
        let stream = create_log_stream(&settings.store)?;
        let recovery = RecoveryManager::recover(&stream).await?;
        Self::assemble(settings, state_provider, stream, recovery).await
    }

    async fn assemble(
        settings: ReplicaSettings,
        state_provider: Arc<dyn StateProvider>,
        stream: Arc<dyn LogStream>,
        mut recovery: RecoveryOutcome,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(RwLock::new(settings.config.clone()));
        let role = Arc::new(RoleContextDrainState::new());

        let callbacks = FlushCallbackManager::new();
        let io_monitor = Arc::new(IoHealthMonitor::new(config.read().slow_log_io_duration));
        let writer = Arc::new(PhysicalLogWriter::new(
            stream,
            callbacks.clone(),
            io_monitor,
            config.read().max_write_cache_size_bytes(),
            recovery.writer_init.clone(),
        ));

        let log_manager =
            ReplicatedLogManager::new(writer, role.clone(), recovery.log_init.clone());
        for record in &recovery.physical_records {
            log_manager.register_physical_record(record.clone());
        }
        if let Some(head) = recovery.head_indexing.clone() {
            log_manager.set_head_record(head);
        }

        let tx_map = Arc::new(Mutex::new(std::mem::take(&mut recovery.tx_map)));

        let truncation = Arc::new(LogTruncationManager::new(config.clone()));
        let checkpoint_manager = CheckpointManager::new(
            log_manager.clone(),
            truncation,
            state_provider.clone(),
            tx_map.clone(),
            config.clone(),
        );
        checkpoint_manager.install_recovered_checkpoint(
            recovery.last_completed_begin_checkpoint.clone(),
            recovery.last_completed_end_checkpoint.clone(),
        );

        let processor = OperationProcessor::new(
            role.clone(),
            state_provider.clone(),
            checkpoint_manager.clone(),
            log_manager.clone(),
            tx_map,
        );
        let dispatcher = LogRecordsDispatcher::new(processor.clone());
        callbacks.set_processor(dispatcher.clone());

        let transaction_manager = TransactionManager::new(
            log_manager.clone(),
            checkpoint_manager.clone(),
            processor.clone(),
            config.clone(),
        );

        let backup_manager = Arc::new(BackupManager::new(
            log_manager.clone(),
            checkpoint_manager.clone(),
            state_provider.clone(),
            config.clone(),
            settings.partition_id,
            settings.replica_id,
            settings.restore_root.clone(),
        ));

        let replica = Arc::new(Self {
            settings,
            config,
            state_provider,
            role,
            log_manager,
            checkpoint_manager,
            processor,
            dispatcher,
            transaction_manager,
            backup_manager,
            recovery_information: recovery.information.clone(),
        });

        if !recovery
            .information
            .should_skip_recovery_due_to_incomplete_change_role_none
        {
            replica.redo_recovered_records(&recovery).await?;
            replica
                .log_manager
                .flush_information_record(InformationEvent::Recovered, false, "recovered")
                .await?;
        }

        replica.checkpoint_manager.start_periodic_timer();
        info!(
            recovered_lsn = replica.recovery_information.recovered_lsn,
            "replica opened"
        );
        Ok(replica)
    }

    /// Redo dispatch: committed transactions and atomic operations past
    /// the recovered checkpoint replay into the state provider.
    async fn redo_recovered_records(&self, recovery: &RecoveryOutcome) -> Result<()> {
        self.role.on_recovery();

        let mut chains: HashMap<TxId, Vec<RecordRef>> = HashMap::new();
        for (record, dispatch) in &recovery.recovered_records {
            if !dispatch {
                continue;
            }
            match record.body().clone() {
                RecordBody::BeginTx {
                    tx_id,
                    is_single_operation,
                    metadata,
                    redo,
                    ..
                } => {
                    if is_single_operation {
                        self.redo_apply(record, tx_id, &metadata, &redo).await?;
                    } else {
                        chains.entry(tx_id).or_default().push(record.clone());
                    }
                }
                RecordBody::Operation {
                    tx_id,
                    mode,
                    metadata,
                    redo,
                    ..
                } => match mode {
                    OperationMode::InTransaction => {
                        chains.entry(tx_id).or_default().push(record.clone());
                    }
                    OperationMode::Atomic | OperationMode::AtomicRedo => {
                        self.redo_apply(record, tx_id, &metadata, &redo).await?;
                    }
                },
                RecordBody::EndTx { tx_id, committed } => {
                    let chain = chains.remove(&tx_id).unwrap_or_default();
                    if committed {
                        for chained in chain {
                            if let RecordBody::BeginTx { metadata, redo, .. }
                            | RecordBody::Operation { metadata, redo, .. } =
                                chained.body().clone()
                            {
                                self.redo_apply(&chained, tx_id, &metadata, &redo).await?;
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        self.role.on_recovery_completed();
        Ok(())
    }

    async fn redo_apply(
        &self,
        record: &RecordRef,
        tx_id: TxId,
        metadata: &[u8],
        redo: &[u8],
    ) -> Result<()> {
        if let Some(context) = self
            .state_provider
            .apply(
                record.lsn(),
                Some(tx_id),
                ApplyContext::RecoveryRedo,
                metadata,
                redo,
            )
            .await?
        {
            self.state_provider.unlock(context);
        }
        Ok(())
    }

    /// Promote to primary. After a restore the data-loss version bumps;
    /// a plain promotion bumps the configuration version only.
    pub async fn become_primary(
        &self,
        after_restore: bool,
        replicator: Arc<dyn StateReplicator>,
    ) -> Result<()> {
        self.log_manager.set_replicator(replicator);
        self.role.change_role(ReplicaRole::Primary);

        let current = self.log_manager.tail_epoch();
        let base = if current.is_valid() {
            current
        } else {
            Epoch::new(1, 0)
        };
        let new_epoch = Epoch::new(
            base.data_loss_version + u64::from(after_restore),
            base.configuration_version + 1,
        );
        let record = self
            .log_manager
            .append_update_epoch(new_epoch, self.settings.replica_id as u64)?;
        self.log_manager.flush("become-primary").await?;
        record.flushed().wait().await?;

        self.state_provider.change_role(ReplicaRole::Primary).await?;
        if after_restore {
            self.backup_manager.delete_restore_token()?;
        }
        info!(?new_epoch, "promoted to primary");
        Ok(())
    }

    /// Build this replica as a secondary from the given transport:
    /// drain copy + replication streams, then report Active.
    pub async fn build_secondary(&self, replicator: Arc<dyn StateReplicator>) -> Result<()> {
        self.log_manager.set_replicator(replicator.clone());
        self.role.change_role(ReplicaRole::Idle);
        self.state_provider.change_role(ReplicaRole::Idle).await?;

        let drain = SecondaryDrainManager::new(
            self.log_manager.clone(),
            self.checkpoint_manager.clone(),
            self.state_provider.clone(),
            self.role.clone(),
            replicator,
            self.config.clone(),
        );
        drain.build_secondary().await?;

        self.role.change_role(ReplicaRole::Active);
        self.state_provider.change_role(ReplicaRole::Active).await?;
        Ok(())
    }

    /// Clean close: stop accepting work, settle outstanding processing,
    /// and seal the log.
    pub async fn close(&self) -> Result<()> {
        self.role.on_closing();
        self.checkpoint_manager.abort_pending_checkpoint();
        self.checkpoint_manager.abort_pending_log_head_truncation();

        let seal = self
            .log_manager
            .flush_information_record(InformationEvent::ClosingLog, true, "close")
            .await;
        if let Err(err) = &seal {
            warn!(error = %err, "close flush failed");
        }

        self.processor.wait_for_logical_records_processing().await;
        self.processor.wait_for_physical_records_processing().await;
        self.state_provider.change_role(ReplicaRole::None).await?;
        info!("replica closed");
        seal.map(|_| ())
    }

    /// Restore this replica from a backup folder: close the current
    /// log, rebuild from the chain into a fresh store, re-open, and
    /// promote the new incarnation to primary.
    pub async fn restore_from_backup(
        &self,
        backup_folder: &std::path::Path,
        policy: RestorePolicy,
        target_store: LogStoreKind,
        replicator: Arc<dyn StateReplicator>,
    ) -> Result<Arc<LoggingReplicator>> {
        let current_tail = (self.log_manager.tail_epoch(), self.log_manager.tail_lsn());
        let target_stream = create_log_stream(&target_store)?;
        let RestoreOutcome {
            recovery,
            restored_epoch,
            restored_lsn,
            pre_restore_epoch,
        } = self
            .backup_manager
            .restore(backup_folder, policy, current_tail, target_stream.clone())
            .await?;
        info!(
            ?restored_epoch,
            restored_lsn,
            ?pre_restore_epoch,
            "restore recovery complete"
        );

        let mut settings = self.settings.clone();
        settings.store = target_store;
        let restored = Self::assemble(
            settings,
            self.state_provider.clone(),
            target_stream,
            recovery,
        )
        .await?;

        restored.become_primary(true, replicator).await?;
        Ok(restored)
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transaction_manager
    }

    pub fn backups(&self) -> &Arc<BackupManager> {
        &self.backup_manager
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoint_manager
    }

    pub fn log_manager(&self) -> &Arc<ReplicatedLogManager> {
        &self.log_manager
    }

    pub fn processor(&self) -> &Arc<OperationProcessor> {
        &self.processor
    }

    pub fn role(&self) -> &Arc<RoleContextDrainState> {
        &self.role
    }

    pub fn recovery_information(&self) -> &RecoveryInformation {
        &self.recovery_information
    }
}

impl std::fmt::Debug for LoggingReplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingReplicator")
            .field("partition_id", &self.settings.partition_id)
            .field("replica_id", &self.settings.replica_id)
            .finish()
    }
}
