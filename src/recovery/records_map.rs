// Log records map
// Replay-driven reconstruction of in-memory state: progress vector,
// transaction map, checkpoint pointers, tail epoch, stable LSN. Fed one
// record at a time in log order by recovery and restore, both of which
// replay a freshly (re)opened log from an empty seed. Which records the
// caller redoes into the state provider is decided afterwards, against
// the last completed checkpoint this map discovered.

use super::transaction_map::TransactionMap;
use crate::error::{ReplicatorError, Result};
use crate::records::progress::{ProgressVector, ProgressVectorEntry};
use crate::records::{Epoch, Lsn, OperationMode, Psn, RecordBody, RecordRef};
use std::collections::BTreeMap;
use tracing::debug;

/// State accumulated while consuming the log in order.
pub struct LogRecordsMap {
    tail_lsn: Lsn,
    tail_epoch: Epoch,
    progress: ProgressVector,
    tx_map: TransactionMap,
    last_stable_lsn: Lsn,
    last_physical_psn: Option<Psn>,
    last_in_progress_checkpoint: Option<RecordRef>,
    last_completed_begin_checkpoint: Option<RecordRef>,
    last_completed_end_checkpoint: Option<RecordRef>,
    head_indexing: Option<RecordRef>,
    last_indexing: Option<RecordRef>,
    last_periodic_truncation_time: i64,
    last_recovered_atomic_redo_operation_lsn: Option<Lsn>,
    physical_by_psn: BTreeMap<Psn, RecordRef>,
}

impl LogRecordsMap {
    pub fn new(starting_epoch: Epoch, progress: ProgressVector) -> Self {
        Self {
            tail_lsn: 0,
            tail_epoch: starting_epoch,
            progress,
            tx_map: TransactionMap::new(),
            last_stable_lsn: 0,
            last_physical_psn: None,
            last_in_progress_checkpoint: None,
            last_completed_begin_checkpoint: None,
            last_completed_end_checkpoint: None,
            head_indexing: None,
            last_indexing: None,
            last_periodic_truncation_time: 0,
            last_recovered_atomic_redo_operation_lsn: None,
            physical_by_psn: BTreeMap::new(),
        }
    }

    /// Consume the next record and fold it into the rebuilt state.
    pub fn process_record(&mut self, record: &RecordRef) -> Result<()> {
        // Logical LSNs never move backwards in a well-formed log
        if record.kind().is_logical() && record.lsn() < self.tail_lsn {
            return Err(ReplicatorError::Corruption(format!(
                "logical lsn {} regressed below tail {} during replay",
                record.lsn(),
                self.tail_lsn
            )));
        }

        if record.kind().is_physical() {
            if record.previous_physical_psn().is_none() {
                if let Some(previous) = self.last_physical_psn {
                    record.set_previous_physical_psn(previous);
                }
            }
            self.last_physical_psn = Some(record.psn());
            self.physical_by_psn.insert(record.psn(), record.clone());
        }
        if record.kind().is_logical() {
            self.tail_lsn = record.lsn();
        }

        match record.body().clone() {
            RecordBody::BeginTx {
                is_single_operation,
                ..
            } => {
                if !is_single_operation {
                    self.tx_map.create(record.clone())?;
                }
            }
            RecordBody::Operation { mode, .. } => match mode {
                OperationMode::InTransaction => self.tx_map.add_operation(record.clone())?,
                OperationMode::AtomicRedo => {
                    self.last_recovered_atomic_redo_operation_lsn = Some(record.lsn());
                }
                OperationMode::Atomic => {}
            },
            RecordBody::EndTx { .. } => {
                self.tx_map.complete(record.clone())?;
            }
            RecordBody::Barrier { last_stable_lsn } => {
                if last_stable_lsn > self.last_stable_lsn {
                    self.last_stable_lsn = last_stable_lsn;
                }
                self.tx_map.remove_stable(self.last_stable_lsn);
            }
            RecordBody::BeginCheckpoint { .. } => {
                self.last_in_progress_checkpoint = Some(record.clone());
            }
            RecordBody::EndCheckpoint {
                last_completed_begin_checkpoint_lsn,
                last_completed_begin_checkpoint_psn,
                last_stable_lsn,
            } => {
                let begin = self
                    .physical_by_psn
                    .get(&last_completed_begin_checkpoint_psn)
                    .cloned()
                    .or_else(|| self.last_in_progress_checkpoint.clone());
                if let Some(begin) = &begin {
                    record.set_linked_physical_psn(begin.psn());
                }
                if last_stable_lsn < last_completed_begin_checkpoint_lsn {
                    return Err(ReplicatorError::Corruption(format!(
                        "end checkpoint stable lsn {} below its begin lsn {}",
                        last_stable_lsn, last_completed_begin_checkpoint_lsn
                    )));
                }
                if last_stable_lsn > self.last_stable_lsn {
                    self.last_stable_lsn = last_stable_lsn;
                }
                self.last_completed_begin_checkpoint = begin;
                self.last_completed_end_checkpoint = Some(record.clone());
                self.last_in_progress_checkpoint = None;
            }
            RecordBody::CompleteCheckpoint => {}
            RecordBody::Indexing { .. } => {
                self.last_indexing = Some(record.clone());
            }
            RecordBody::TruncateHead {
                head_indexing_psn,
                periodic_truncation_timestamp,
                ..
            } => {
                if let Some(indexing) = self.physical_by_psn.get(&head_indexing_psn) {
                    self.head_indexing = Some(indexing.clone());
                }
                self.last_periodic_truncation_time = periodic_truncation_timestamp;
            }
            RecordBody::TruncateTail => {}
            RecordBody::UpdateEpoch {
                epoch,
                primary_replica_id,
            } => {
                if epoch > self.tail_epoch {
                    self.tail_epoch = epoch;
                }
                let entry = ProgressVectorEntry::new(epoch, record.lsn(), primary_replica_id);
                match self.progress.last() {
                    Some(last) if (last.epoch, last.lsn) <= (epoch, record.lsn()) => {
                        self.progress.append(entry)
                    }
                    None => self.progress.append(entry),
                    _ => self.progress.insert(entry),
                }
            }
            RecordBody::Backup { .. } | RecordBody::Information { .. } => {}
        }

        Ok(())
    }

    pub fn tail_lsn(&self) -> Lsn {
        self.tail_lsn
    }

    pub fn tail_epoch(&self) -> Epoch {
        self.tail_epoch
    }

    pub fn last_stable_lsn(&self) -> Lsn {
        self.last_stable_lsn
    }

    pub fn last_periodic_truncation_time(&self) -> i64 {
        self.last_periodic_truncation_time
    }

    pub fn last_recovered_atomic_redo_operation_lsn(&self) -> Option<Lsn> {
        self.last_recovered_atomic_redo_operation_lsn
    }

    pub fn last_completed_begin_checkpoint(&self) -> Option<RecordRef> {
        self.last_completed_begin_checkpoint.clone()
    }

    pub fn last_completed_end_checkpoint(&self) -> Option<RecordRef> {
        self.last_completed_end_checkpoint.clone()
    }

    pub fn last_in_progress_checkpoint(&self) -> Option<RecordRef> {
        self.last_in_progress_checkpoint.clone()
    }

    pub fn head_indexing(&self) -> Option<RecordRef> {
        self.head_indexing.clone()
    }

    pub fn last_indexing(&self) -> Option<RecordRef> {
        self.last_indexing.clone()
    }

    pub fn physical_records(&self) -> Vec<RecordRef> {
        self.physical_by_psn.values().cloned().collect()
    }

    /// Hand out the rebuilt pieces at end of replay.
    pub fn into_parts(self) -> (TransactionMap, ProgressVector) {
        debug!(
            tail_lsn = self.tail_lsn,
            stable = self.last_stable_lsn,
            "log replay complete"
        );
        (self.tx_map, self.progress)
    }
}
