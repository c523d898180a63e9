// Recovery manager
// Reads the log back from its head, rebuilds in-memory state through
// the log records map, and settles the tail: a clean close keeps
// everything, an unclean close discards records past the last stable
// barrier (false progress).

pub mod records_map;
pub mod transaction_map;

use crate::error::{ReplicatorError, Result};
use crate::log_stream::LogStream;
use crate::records::wire;
use crate::records::{InformationEvent, LogRecord, Lsn, RecordBody, RecordRef};
use crate::replicated::LogManagerInit;
use crate::writer::WriterInit;
use records_map::LogRecordsMap;
use std::sync::Arc;
use tracing::{info, warn};
use transaction_map::TransactionMap;

/// What the host needs to know after an open.
#[derive(Debug, Clone, Default)]
pub struct RecoveryInformation {
    /// The previous incarnation was mid-removal; skip recovery work and
    /// finish tearing the replica down instead.
    pub should_skip_recovery_due_to_incomplete_change_role_none: bool,
    pub recovered_lsn: Lsn,
}

/// Everything recovery rebuilds for the rest of the stack.
pub struct RecoveryOutcome {
    pub log_init: LogManagerInit,
    pub writer_init: WriterInit,
    pub tx_map: TransactionMap,
    /// Kept records in log order, paired with whether each should be
    /// dispatched to the state provider as recovery redo
    pub recovered_records: Vec<(RecordRef, bool)>,
    pub last_completed_begin_checkpoint: Option<RecordRef>,
    pub last_completed_end_checkpoint: Option<RecordRef>,
    pub head_indexing: Option<RecordRef>,
    pub last_indexing: Option<RecordRef>,
    pub physical_records: Vec<RecordRef>,
    pub last_periodic_truncation_time: i64,
    pub information: RecoveryInformation,
}

/// Replays a log stream into a `RecoveryOutcome`.
pub struct RecoveryManager;

impl RecoveryManager {
    /// Read every frame from the stream head, settle the tail, and
    /// rebuild state. The stream is tail-truncated in place when false
    /// progress is found.
    pub async fn recover(stream: &Arc<dyn LogStream>) -> Result<RecoveryOutcome> {
        let head = stream.head_position();

        // Phase 1: decode frames. A frame torn mid-write reads as a
        // clean end of log; a checksum mismatch is real corruption.
        let records = read_log_records(stream)?;

        // Phase 2: settle the tail. Clean closes end in an Information
        // record; otherwise everything past the last barrier is false
        // progress.
        let cut = match records.last() {
            None => None,
            Some(last) if matches!(last.body(), RecordBody::Information { .. }) => {
                Some(records.len() - 1)
            }
            _ => records
                .iter()
                .rposition(|r| matches!(r.body(), RecordBody::Barrier { .. })),
        };

        let kept: Vec<RecordRef> = match cut {
            Some(index) => {
                if index + 1 < records.len() {
                    info!(
                        dropped = records.len() - index - 1,
                        "discarding records past last stable barrier"
                    );
                    let keep_until = records[index].position().unwrap_or(head)
                        + records[index].serialized_size();
                    stream.truncate_tail(keep_until).await?;
                }
                records[..=index].to_vec()
            }
            None => {
                if !records.is_empty() {
                    warn!(
                        dropped = records.len(),
                        "no stable barrier in unclean log; discarding all records"
                    );
                    stream.truncate_tail(head).await?;
                }
                Vec::new()
            }
        };

        // Phase 3: replay the kept prefix.
        let mut map = LogRecordsMap::new(
            crate::records::Epoch::ZERO,
            crate::records::progress::ProgressVector::new(),
        );
        for record in &kept {
            map.process_record(record)?;
        }

        // Redo dispatch is gated on the last completed checkpoint, and
        // that checkpoint is only known once the whole prefix has been
        // replayed; decide per record here, after the map settled it.
        let recovered_checkpoint_lsn = map
            .last_completed_begin_checkpoint()
            .map(|r| r.lsn())
            .unwrap_or(0);

        let recovered_records: Vec<(RecordRef, bool)> = kept
            .iter()
            .map(|record| {
                let dispatch =
                    record.kind().is_logical() && record.lsn() > recovered_checkpoint_lsn;
                (record.clone(), dispatch)
            })
            .collect();

        let should_skip = matches!(
            kept.last().map(|r| r.body().clone()),
            Some(RecordBody::Information {
                event: InformationEvent::RemovingState
            })
        );

        let writer_init = match kept.last() {
            Some(last) => WriterInit {
                tail_position: last.position().unwrap_or(head) + last.serialized_size(),
                tail_psn: last.psn(),
                last_physical_psn: if last.kind().is_physical() {
                    Some(last.psn())
                } else {
                    last.previous_physical_psn()
                },
            },
            None => WriterInit {
                tail_position: head,
                ..Default::default()
            },
        };

        let tail_lsn = map.tail_lsn();
        let information = RecoveryInformation {
            should_skip_recovery_due_to_incomplete_change_role_none: should_skip,
            recovered_lsn: tail_lsn,
        };

        let last_completed_begin_checkpoint = map.last_completed_begin_checkpoint();
        let last_completed_end_checkpoint = map.last_completed_end_checkpoint();
        let head_indexing = map.head_indexing();
        let last_indexing = map.last_indexing();
        let physical_records = map.physical_records();
        let last_periodic_truncation_time = map.last_periodic_truncation_time();
        let tail_epoch = map.tail_epoch();
        let stable_lsn = map.last_stable_lsn();
        let (tx_map, progress_vector) = map.into_parts();

        info!(
            recovered_lsn = tail_lsn,
            stable_lsn,
            records = recovered_records.len(),
            "recovery replay complete"
        );

        Ok(RecoveryOutcome {
            log_init: LogManagerInit {
                tail_lsn,
                tail_epoch,
                stable_lsn,
                progress_vector,
                recovered_or_copied_checkpoint_lsn: recovered_checkpoint_lsn,
            },
            writer_init,
            tx_map,
            recovered_records,
            last_completed_begin_checkpoint,
            last_completed_end_checkpoint,
            head_indexing,
            last_indexing,
            physical_records,
            last_periodic_truncation_time,
            information,
        })
    }
}

/// Materialize every live frame of a log stream as records with their
/// positions and frame sizes set. Sizes are recomputed by re-encoding,
/// which is exact because the wire encoding is deterministic. Shared by
/// recovery, the drain's false-progress handling, and backup pinning.
pub fn read_log_records(stream: &Arc<dyn LogStream>) -> Result<Vec<RecordRef>> {
    let head = stream.head_position();
    let mut reader = stream.read_stream(head)?;
    let mut records: Vec<RecordRef> = Vec::new();
    let mut offset = head;
    loop {
        match wire::read_frame(&mut reader) {
            Ok(Some(frame)) => {
                let record = LogRecord::from_frame(frame);
                record.set_position(offset);
                let size = wire::encode_record(&record)?.len() as u64;
                record.set_serialized_size(size);
                offset += size;
                records.push(record);
            }
            Ok(None) => break,
            Err(ReplicatorError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                warn!("torn frame at log tail; treating as end of log");
                break;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_monitor::IoHealthMonitor;
    use crate::log_stream::MemoryLogStream;
    use crate::writer::{FlushCallbackManager, PhysicalLogWriter};
    use std::time::Duration;

    async fn write_records(
        stream: &Arc<dyn LogStream>,
        bodies: Vec<(RecordBody, Lsn)>,
    ) {
        let writer = PhysicalLogWriter::new(
            stream.clone(),
            FlushCallbackManager::new(),
            Arc::new(IoHealthMonitor::new(Duration::from_secs(10))),
            64 * 1024,
            WriterInit::default(),
        );
        for (body, lsn) in bodies {
            let record = LogRecord::new(body);
            record.set_lsn(lsn);
            writer.insert_buffered_record(record).unwrap();
        }
        writer.flush("test-setup").await.unwrap();
    }

    fn tx_bodies() -> Vec<(RecordBody, Lsn)> {
        vec![
            (
                RecordBody::BeginTx {
                    tx_id: 7,
                    is_single_operation: false,
                    metadata: vec![],
                    undo: vec![],
                    redo: vec![1, 2],
                },
                10,
            ),
            (
                RecordBody::Operation {
                    tx_id: 7,
                    mode: crate::records::OperationMode::InTransaction,
                    metadata: vec![],
                    undo: vec![],
                    redo: vec![3],
                },
                11,
            ),
            (
                RecordBody::EndTx {
                    tx_id: 7,
                    committed: true,
                },
                12,
            ),
            (RecordBody::Barrier { last_stable_lsn: 12 }, 13),
        ]
    }

    #[tokio::test]
    async fn clean_close_recovers_everything() {
        let stream: Arc<dyn LogStream> = Arc::new(MemoryLogStream::new(None));
        let mut bodies = tx_bodies();
        bodies.push((
            RecordBody::Information {
                event: InformationEvent::ClosingLog,
            },
            13,
        ));
        write_records(&stream, bodies).await;

        let outcome = RecoveryManager::recover(&stream).await.unwrap();
        assert_eq!(outcome.log_init.tail_lsn, 13);
        assert_eq!(outcome.log_init.stable_lsn, 12);
        assert_eq!(outcome.recovered_records.len(), 5);
        assert_eq!(outcome.writer_init.tail_position, stream.write_position());
    }

    #[tokio::test]
    async fn unclean_close_discards_past_last_barrier() {
        let stream: Arc<dyn LogStream> = Arc::new(MemoryLogStream::new(None));
        let mut bodies = tx_bodies();
        // False progress: records after the barrier, no clean close
        bodies.push((
            RecordBody::BeginTx {
                tx_id: 8,
                is_single_operation: false,
                metadata: vec![],
                undo: vec![],
                redo: vec![],
            },
            14,
        ));
        write_records(&stream, bodies).await;
        let full_tail = stream.write_position();

        let outcome = RecoveryManager::recover(&stream).await.unwrap();
        assert_eq!(outcome.log_init.tail_lsn, 13);
        assert_eq!(outcome.recovered_records.len(), 4);
        assert!(stream.write_position() < full_tail);
        assert!(outcome.tx_map.get_pending(8).is_none());
    }

    #[tokio::test]
    async fn torn_tail_is_tolerated() {
        let stream: Arc<dyn LogStream> = Arc::new(MemoryLogStream::new(None));
        let mut bodies = tx_bodies();
        bodies.push((
            RecordBody::Information {
                event: InformationEvent::ClosingLog,
            },
            13,
        ));
        write_records(&stream, bodies).await;

        // Simulate a crash mid-append: a frame whose body never made it
        stream.append(&42u32.to_le_bytes()).await.unwrap();
        stream.append(&[1, 2, 3]).await.unwrap();

        let outcome = RecoveryManager::recover(&stream).await.unwrap();
        assert_eq!(outcome.recovered_records.len(), 5);
    }

    #[tokio::test]
    async fn empty_log_recovers_fresh() {
        let stream: Arc<dyn LogStream> = Arc::new(MemoryLogStream::new(None));
        let outcome = RecoveryManager::recover(&stream).await.unwrap();
        assert_eq!(outcome.log_init.tail_lsn, 0);
        assert!(outcome.recovered_records.is_empty());
        assert!(!outcome
            .information
            .should_skip_recovery_due_to_incomplete_change_role_none);
    }

    #[tokio::test]
    async fn removing_state_marker_skips_recovery() {
        let stream: Arc<dyn LogStream> = Arc::new(MemoryLogStream::new(None));
        write_records(
            &stream,
            vec![(
                RecordBody::Information {
                    event: InformationEvent::RemovingState,
                },
                1,
            )],
        )
        .await;

        let outcome = RecoveryManager::recover(&stream).await.unwrap();
        assert!(outcome
            .information
            .should_skip_recovery_due_to_incomplete_change_role_none);
    }
}
