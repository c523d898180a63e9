// Secondary drain manager
// Pumps the copy and replication streams on a secondary: opaque
// copy-state frames into the state provider, copy-log and replication
// records into the local log, with acknowledgements gated on durability
// and back-pressure from the writer and checkpoint manager.

pub mod role;

use crate::checkpoint::CheckpointManager;
use crate::config::ReplicatorConfig;
use crate::error::{ReplicatorError, Result};
use crate::log_stream::LogStream;
use crate::records::progress::ProgressVector;
use crate::records::{wire, InformationEvent, LogRecord, Lsn, RecordBody, RecordRef};
use crate::replicated::transport::{OperationData, StateReplicator};
use crate::replicated::ReplicatedLogManager;
use crate::state_provider::{ApplyContext, StateProvider};
use bytes::Bytes;
use parking_lot::RwLock;
use role::RoleContextDrainState;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Stage tag carried in the trailer buffer of every copy-stream frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CopyStage {
    CopyNone = 0,
    CopyState = 1,
    CopyProgressVector = 2,
    CopyFalseProgress = 3,
    CopyLog = 4,
}

impl CopyStage {
    pub fn from_byte(byte: u8) -> Result<Self> {
        Ok(match byte {
            0 => CopyStage::CopyNone,
            1 => CopyStage::CopyState,
            2 => CopyStage::CopyProgressVector,
            3 => CopyStage::CopyFalseProgress,
            4 => CopyStage::CopyLog,
            other => {
                return Err(ReplicatorError::Corruption(format!(
                    "unknown copy stage {}",
                    other
                )))
            }
        })
    }
}

/// Build a copy frame: payload buffers plus the one-byte stage trailer.
pub fn encode_copy_frame(stage: CopyStage, mut buffers: Vec<Bytes>) -> OperationData {
    buffers.push(Bytes::from(vec![stage as u8]));
    OperationData::new(buffers)
}

/// Split a copy frame into its stage and payload buffers.
pub fn decode_copy_frame(data: &OperationData) -> Result<(CopyStage, Vec<Bytes>)> {
    let trailer = data
        .buffers
        .last()
        .filter(|b| b.len() == 1)
        .ok_or_else(|| {
            ReplicatorError::Corruption("copy frame missing stage trailer".to_string())
        })?;
    let stage = CopyStage::from_byte(trailer[0])?;
    let payload = data.buffers[..data.buffers.len() - 1].to_vec();
    Ok((stage, payload))
}

/// Drain statistics, mostly for tests and tracing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrainStats {
    pub copy_state_frames: u64,
    pub copy_log_records: u64,
    pub replication_records: u64,
}

/// Consumes copy and replication streams and applies them in order.
pub struct SecondaryDrainManager {
    log_manager: Arc<ReplicatedLogManager>,
    checkpoint_manager: Arc<CheckpointManager>,
    state_provider: Arc<dyn StateProvider>,
    role: Arc<RoleContextDrainState>,
    replicator: Arc<dyn StateReplicator>,
    config: Arc<RwLock<ReplicatorConfig>>,
    stats: parking_lot::Mutex<DrainStats>,
}

impl SecondaryDrainManager {
    pub fn new(
        log_manager: Arc<ReplicatedLogManager>,
        checkpoint_manager: Arc<CheckpointManager>,
        state_provider: Arc<dyn StateProvider>,
        role: Arc<RoleContextDrainState>,
        replicator: Arc<dyn StateReplicator>,
        config: Arc<RwLock<ReplicatorConfig>>,
    ) -> Self {
        Self {
            log_manager,
            checkpoint_manager,
            state_provider,
            role,
            replicator,
            config,
            stats: parking_lot::Mutex::new(DrainStats::default()),
        }
    }

    pub fn stats(&self) -> DrainStats {
        *self.stats.lock()
    }

    /// Run the full secondary build: copy-state + copy-log, then the
    /// replication stream. Any failure reports a fault and surfaces.
    pub async fn build_secondary(&self) -> Result<()> {
        let result = self.build_secondary_inner().await;
        if let Err(err) = &result {
            warn!(error = %err, "secondary drain failed");
            self.role.report_fault("secondary drain failed");
        }
        result
    }

    async fn build_secondary_inner(&self) -> Result<()> {
        self.pump_copy_stream().await?;
        self.pump_replication_stream().await?;
        Ok(())
    }

    /// Phase 1+2: the copy stream delivers state frames, then the
    /// progress vector (or a false-progress marker), then copy-log
    /// record batches.
    async fn pump_copy_stream(&self) -> Result<()> {
        let stream = self.replicator.get_copy_stream()?;
        self.role.on_drain_state();

        let mut setting_state = false;
        let mut state_complete = false;
        let mut record_number: u64 = 0;
        let mut in_copy_log = false;

        loop {
            let operation = stream.get_operation().await?;
            let Some(mut operation) = operation else {
                if setting_state && !state_complete {
                    // The source went away mid-state: the provider never
                    // gets end_setting_current_state
                    return Err(ReplicatorError::Cancelled);
                }
                break;
            };

            let (stage, payload) = decode_copy_frame(&operation.data)?;
            match stage {
                CopyStage::CopyNone => {
                    operation.acknowledge();
                }
                CopyStage::CopyState => {
                    if !setting_state {
                        self.state_provider.begin_setting_current_state().await?;
                        setting_state = true;
                    }
                    let buffers: Vec<Vec<u8>> =
                        payload.iter().map(|b| b.to_vec()).collect();
                    self.state_provider
                        .set_current_state(record_number, buffers)
                        .await?;
                    record_number += 1;
                    self.stats.lock().copy_state_frames += 1;
                    operation.acknowledge();
                }
                CopyStage::CopyProgressVector => {
                    let bytes = OperationData::new(payload).concat();
                    let (progress, _) = bincode::serde::decode_from_slice::<ProgressVector, _>(
                        &bytes,
                        bincode::config::standard(),
                    )?;
                    for entry in progress.entries() {
                        self.log_manager.insert_progress_entry(*entry);
                    }
                    if setting_state {
                        self.state_provider.end_setting_current_state().await?;
                    }
                    state_complete = true;
                    self.role.on_drain_copy_log();
                    operation.acknowledge();
                }
                CopyStage::CopyFalseProgress => {
                    let bytes = OperationData::new(payload).concat();
                    if bytes.len() != 8 {
                        return Err(ReplicatorError::Corruption(
                            "false progress frame must carry a u64 lsn".to_string(),
                        ));
                    }
                    let source_starting_lsn =
                        u64::from_le_bytes(bytes[..8].try_into().expect("length checked"));
                    self.undo_false_progress(source_starting_lsn).await?;
                    state_complete = true;
                    self.role.on_drain_copy_log();
                    operation.acknowledge();
                }
                CopyStage::CopyLog => {
                    in_copy_log = true;
                    self.throttle_pump().await;
                    let inserted = self.log_copy_log_frame(&payload).await?;
                    self.stats.lock().copy_log_records += inserted.len() as u64;
                    self.log_manager.flush("copy-log").await?;
                    self.await_frame_durable(&inserted).await?;
                    operation.acknowledge();
                }
            }
        }

        if in_copy_log || state_complete {
            let record = self
                .log_manager
                .flush_information_record(InformationEvent::CopyFinished, false, "copy-finished")
                .await?;
            let _ = record.processed().wait().await;
            info!("copy drain finished");
        }
        Ok(())
    }

    /// Phase 3: live replication operations, one logical record each.
    async fn pump_replication_stream(&self) -> Result<()> {
        let stream = self.replicator.get_replication_stream()?;
        self.role.on_drain_replication();

        let mut records_outstanding: u64 = 0;
        let mut bytes_outstanding: u64 = 0;

        loop {
            let operation = stream.get_operation().await?;
            let Some(mut operation) = operation else { break };

            self.throttle_pump().await;
            self.checkpoint_manager.block_secondary_pump_if_needed().await;

            let payload = operation.data.concat();
            bytes_outstanding += payload.len() as u64;
            records_outstanding += 1;

            let body = wire::decode_operation_payload(&payload)?;
            let record = LogRecord::new(body);
            let inserted = self
                .log_manager
                .append_without_replication(record.clone(), operation.sequence_number)?;

            if inserted {
                self.log_manager.flush("replication").await?;
                self.await_frame_durable(std::slice::from_ref(&record)).await?;
                self.stats.lock().replication_records += 1;
            }

            bytes_outstanding = bytes_outstanding.saturating_sub(payload.len() as u64);
            records_outstanding -= 1;
            debug!(
                records_outstanding,
                bytes_outstanding, "replication operation acknowledged"
            );
            operation.acknowledge();
        }

        let record = self
            .log_manager
            .flush_information_record(
                InformationEvent::ReplicationFinished,
                false,
                "replication-finished",
            )
            .await?;
        let _ = record.processed().wait().await;
        self.role.on_drain_completed();
        info!("replication drain finished");
        Ok(())
    }

    /// Decode one copy-log frame (a batch of framed records as the
    /// primary's writer serialized them) and log every record locally.
    async fn log_copy_log_frame(&self, payload: &[Bytes]) -> Result<Vec<RecordRef>> {
        let bytes = OperationData::new(payload.to_vec()).concat();
        let mut inserted = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let (frame, used) = wire::decode_record(&bytes[offset..])?;
            offset += used;

            let lsn = frame.lsn;
            let record = LogRecord::new(frame.body);
            if self.log_manager.append_without_replication(record.clone(), lsn)? {
                inserted.push(record);
            }
        }
        Ok(inserted)
    }

    /// Frame acknowledgement gate: durable locally, and optionally
    /// applied for commits when the stricter ack mode is on.
    async fn await_frame_durable(&self, records: &[RecordRef]) -> Result<()> {
        for record in records {
            record.flushed().wait().await?;
        }
        if self.config.read().enable_secondary_commit_apply_acknowledgement {
            for record in records {
                if matches!(
                    record.body(),
                    RecordBody::EndTx {
                        committed: true,
                        ..
                    }
                ) {
                    let _ = record.applied().wait().await;
                }
            }
        }
        Ok(())
    }

    /// Writer back-pressure: wait out a pending flush before pumping
    /// more stream operations.
    async fn throttle_pump(&self) {
        if self.log_manager.writer().should_throttle_writes() {
            debug!("drain throttled on pending flush");
            self.log_manager.writer().wait_for_idle().await;
        }
    }

    /// Undo falsely-progressed records (tail beyond the source's start)
    /// and shrink the log to `source_starting_lsn`.
    async fn undo_false_progress(&self, source_starting_lsn: Lsn) -> Result<()> {
        let tail_lsn = self.log_manager.tail_lsn();
        if tail_lsn <= source_starting_lsn {
            return Ok(());
        }
        info!(
            tail_lsn,
            source_starting_lsn, "undoing false progress on secondary"
        );

        // Rebuild the record list from the stream to find the cut point
        // and the records being thrown away.
        let stream: &Arc<dyn LogStream> = self.log_manager.writer().stream();
        let records = crate::recovery::read_log_records(stream)?;

        let cut_index = records
            .iter()
            .rposition(|r| r.lsn() <= source_starting_lsn)
            .ok_or_else(|| {
                ReplicatorError::Corruption(format!(
                    "no record at or below false progress lsn {}",
                    source_starting_lsn
                ))
            })?;

        // Undo dropped logical records newest-first
        for record in records[cut_index + 1..].iter().rev() {
            match record.body() {
                RecordBody::BeginTx {
                    tx_id,
                    metadata,
                    undo,
                    ..
                }
                | RecordBody::Operation {
                    tx_id,
                    metadata,
                    undo,
                    ..
                } => {
                    if let Some(context) = self
                        .state_provider
                        .apply(
                            record.lsn(),
                            Some(*tx_id),
                            ApplyContext::SecondaryFalseProgress,
                            metadata,
                            undo,
                        )
                        .await?
                    {
                        self.state_provider.unlock(context);
                    }
                }
                _ => {}
            }
        }

        let cut_record = records[cut_index].clone();
        let cut_lsn = cut_record.lsn();
        self.log_manager
            .writer()
            .truncate_log_tail(cut_record)
            .await?;
        self.log_manager.reset_tail_lsn(cut_lsn);

        // Mark the event in the log so readers see the tail moved
        self.log_manager.append_truncate_tail()?;
        self.log_manager.flush("false-progress").await?;
        Ok(())
    }
}

impl std::fmt::Debug for SecondaryDrainManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryDrainManager")
            .field("stats", &self.stats())
            .finish()
    }
}
