// Replicated log manager
// Accepts logical records from producers, replicates them through the
// transport, and inserts them into the writer in strict LSN order. Also
// the single author of physical records (indexing, checkpoints,
// truncations, information, update-epoch) which always append at the
// current tail under the ordering lock.

pub mod transport;

use crate::drain::role::RoleContextDrainState;
use crate::error::{ReplicatorError, Result};
use crate::records::progress::{ProgressVector, ProgressVectorEntry};
use crate::records::{
    wire, Epoch, InformationEvent, LogRecord, Lsn, Psn, RecordBody, RecordRef,
};
use crate::writer::PhysicalLogWriter;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use transport::{OperationData, ReplicationTicket, StateReplicator};

/// Where a (re)opened log manager starts from: recovery, copy, or a
/// fresh replica.
#[derive(Debug, Clone, Default)]
pub struct LogManagerInit {
    pub tail_lsn: Lsn,
    pub tail_epoch: Epoch,
    pub stable_lsn: Lsn,
    pub progress_vector: ProgressVector,
    pub recovered_or_copied_checkpoint_lsn: Lsn,
}

struct LsnOrdering {
    tail_lsn: Lsn,
    /// Records whose LSN arrived ahead of the contiguous tail
    parked: BTreeMap<Lsn, RecordRef>,
}

/// The ordered gateway between producers and the physical writer.
pub struct ReplicatedLogManager {
    /// Self-handle for the stability watcher tasks replicate spawns
    weak_self: std::sync::Weak<ReplicatedLogManager>,
    writer: Arc<PhysicalLogWriter>,
    role: Arc<RoleContextDrainState>,
    replicator: RwLock<Option<Arc<dyn StateReplicator>>>,
    /// Guards LSN ordering and every append to the writer
    lsn_state: Mutex<LsnOrdering>,
    /// Guards the progress vector only
    progress: Mutex<ProgressVector>,
    /// Live physical records keyed by PSN; pruned below the head after
    /// a completed head truncation
    arena: Mutex<BTreeMap<Psn, RecordRef>>,
    tail_epoch: Mutex<Epoch>,
    stable_lsn: AtomicU64,
    stable_notify: tokio::sync::Notify,
    recovered_or_copied_checkpoint_lsn: AtomicU64,
    /// Indexing record that delimits the usable start of the log
    head: Mutex<Option<RecordRef>>,
    last_indexing: Mutex<Option<RecordRef>>,
    /// Latest TruncateHead or CompleteCheckpoint, the skip-list anchor
    last_linked_physical: Mutex<Option<RecordRef>>,
}

impl ReplicatedLogManager {
    pub fn new(
        writer: Arc<PhysicalLogWriter>,
        role: Arc<RoleContextDrainState>,
        init: LogManagerInit,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            writer,
            role,
            replicator: RwLock::new(None),
            lsn_state: Mutex::new(LsnOrdering {
                tail_lsn: init.tail_lsn,
                parked: BTreeMap::new(),
            }),
            progress: Mutex::new(init.progress_vector),
            arena: Mutex::new(BTreeMap::new()),
            tail_epoch: Mutex::new(init.tail_epoch),
            stable_lsn: AtomicU64::new(init.stable_lsn),
            stable_notify: tokio::sync::Notify::new(),
            recovered_or_copied_checkpoint_lsn: AtomicU64::new(
                init.recovered_or_copied_checkpoint_lsn,
            ),
            head: Mutex::new(None),
            last_indexing: Mutex::new(None),
            last_linked_physical: Mutex::new(None),
        })
    }

    pub fn writer(&self) -> &Arc<PhysicalLogWriter> {
        &self.writer
    }

    pub fn role(&self) -> &Arc<RoleContextDrainState> {
        &self.role
    }

    pub fn set_replicator(&self, replicator: Arc<dyn StateReplicator>) {
        *self.replicator.write() = Some(replicator);
    }

    fn replicator(&self) -> Result<Arc<dyn StateReplicator>> {
        self.replicator
            .read()
            .clone()
            .ok_or(ReplicatorError::Closed)
    }

    pub fn tail_lsn(&self) -> Lsn {
        self.lsn_state.lock().tail_lsn
    }

    pub fn tail_epoch(&self) -> Epoch {
        *self.tail_epoch.lock()
    }

    pub fn set_tail_epoch(&self, epoch: Epoch) {
        let mut tail = self.tail_epoch.lock();
        if epoch > *tail {
            *tail = epoch;
        }
    }

    pub fn stable_lsn(&self) -> Lsn {
        self.stable_lsn.load(Ordering::SeqCst)
    }

    /// Monotone advance of the stable LSN.
    pub fn advance_stable_lsn(&self, lsn: Lsn) {
        self.stable_lsn.fetch_max(lsn, Ordering::SeqCst);
        self.stable_notify.notify_waiters();
    }

    /// Resolve once the stable LSN reaches `lsn`, or fail fast when the
    /// writer closes underneath us. Re-polls on a short tick so a close
    /// that races the notification cannot strand a waiter.
    pub async fn wait_for_stable(&self, lsn: Lsn) -> Result<()> {
        loop {
            let waiter = self.stable_notify.notified();
            if self.stable_lsn() >= lsn {
                return Ok(());
            }
            if let Some(err) = self.writer.closed_error() {
                return Err(err);
            }
            let _ = tokio::time::timeout(std::time::Duration::from_millis(100), waiter).await;
        }
    }

    pub fn recovered_or_copied_checkpoint_lsn(&self) -> Lsn {
        self.recovered_or_copied_checkpoint_lsn
            .load(Ordering::SeqCst)
    }

    pub fn set_recovered_or_copied_checkpoint_lsn(&self, lsn: Lsn) {
        self.recovered_or_copied_checkpoint_lsn
            .store(lsn, Ordering::SeqCst);
    }

    pub fn progress_vector(&self) -> ProgressVector {
        self.progress.lock().clone()
    }

    pub fn current_head_record(&self) -> Option<RecordRef> {
        self.head.lock().clone()
    }

    /// Byte position of the log head (0 for a log never truncated).
    pub fn head_position(&self) -> u64 {
        self.head
            .lock()
            .as_ref()
            .and_then(|r| r.position())
            .unwrap_or(0)
    }

    pub fn last_indexing_record(&self) -> Option<RecordRef> {
        self.last_indexing.lock().clone()
    }

    pub fn last_linked_physical_record(&self) -> Option<RecordRef> {
        self.last_linked_physical.lock().clone()
    }

    pub fn get_physical_record(&self, psn: Psn) -> Option<RecordRef> {
        self.arena.lock().get(&psn).cloned()
    }

    /// Register a physical record rebuilt by recovery so back-walks and
    /// head bookkeeping keep working.
    pub fn register_physical_record(&self, record: RecordRef) {
        debug_assert!(record.kind().is_physical());
        match record.body() {
            RecordBody::Indexing { .. } => {
                *self.last_indexing.lock() = Some(record.clone());
            }
            RecordBody::TruncateHead { .. } | RecordBody::CompleteCheckpoint => {
                *self.last_linked_physical.lock() = Some(record.clone());
            }
            _ => {}
        }
        self.arena.lock().insert(record.psn(), record);
    }

    /// Install the head indexing record (recovery seed or a completed
    /// head truncation) and release arena entries below it.
    pub fn set_head_record(&self, indexing: RecordRef) {
        let head_psn = indexing.psn();
        *self.head.lock() = Some(indexing);
        let mut arena = self.arena.lock();
        *arena = arena.split_off(&head_psn);
    }

    /// Replicate a logical record and insert it in LSN order. Returns
    /// the replication ticket; the record's own flush signal covers
    /// local durability.
    pub fn replicate_and_log(&self, record: RecordRef) -> Result<ReplicationTicket> {
        let payload = wire::encode_operation_payload(record.body())?;
        let replicate_result = self
            .replicator()?
            .replicate(OperationData::single(payload.into()));

        let (lsn, ticket) = match replicate_result {
            Ok(pair) => pair,
            Err(err) => {
                if !err.is_expected_replication_error() {
                    self.role.report_fault("unexpected replication error");
                }
                return Err(err);
            }
        };

        self.insert_logical_in_order(record.clone(), lsn)?;

        // Stability watcher: the record is stable once it is locally
        // durable and quorum-replicated.
        let manager = self.weak_self.clone();
        let watcher_ticket = ticket.clone();
        tokio::spawn(async move {
            let flushed = record.flushed().wait().await;
            let replicated = watcher_ticket.wait().await;
            if flushed.is_ok() && replicated.is_ok() {
                if let Some(manager) = manager.upgrade() {
                    manager.advance_stable_lsn(lsn);
                }
            }
        });

        Ok(ticket)
    }

    /// Insert a record whose LSN the transport already assigned. Called
    /// on replicate completion and by tests; parks non-contiguous LSNs.
    pub fn insert_logical_in_order(&self, record: RecordRef, lsn: Lsn) -> Result<()> {
        let mut state = self.lsn_state.lock();
        if lsn <= state.tail_lsn {
            return Err(ReplicatorError::Internal(format!(
                "logical record lsn {} not above tail {}",
                lsn, state.tail_lsn
            )));
        }

        record.set_lsn(lsn);
        if lsn != state.tail_lsn + 1 {
            debug!(lsn, tail = state.tail_lsn, "parking out-of-order record");
            state.parked.insert(lsn, record);
            return Ok(());
        }

        self.writer.insert_buffered_record(record)?;
        state.tail_lsn = lsn;

        // Drain everything that just became contiguous
        loop {
            let expected_next = state.tail_lsn + 1;
            let Some(entry) = state.parked.first_entry() else {
                break;
            };
            if *entry.key() != expected_next {
                break;
            }
            let (next_lsn, next_record) = entry.remove_entry();
            self.writer.insert_buffered_record(next_record)?;
            state.tail_lsn = next_lsn;
        }
        Ok(())
    }

    /// Log a record received from a copy or replication stream without
    /// replicating it again. Records at or below the tail are duplicates
    /// and skipped; returns whether the record was inserted.
    pub fn append_without_replication(&self, record: RecordRef, lsn: Lsn) -> Result<bool> {
        let mut state = self.lsn_state.lock();
        if lsn <= state.tail_lsn {
            debug!(lsn, tail = state.tail_lsn, "skipping duplicate stream record");
            return Ok(false);
        }
        record.set_lsn(lsn);
        self.writer.insert_buffered_record(record)?;
        state.tail_lsn = lsn;
        Ok(true)
    }

    fn insert_physical(&self, state: &mut LsnOrdering, record: RecordRef) -> Result<RecordRef> {
        record.set_lsn(state.tail_lsn);
        if let Some(linked) = self.last_linked_physical.lock().as_ref() {
            if record.linked_physical_psn().is_none() {
                record.set_linked_physical_psn(linked.psn());
            }
        }
        self.writer.insert_buffered_record(record.clone())?;
        self.arena.lock().insert(record.psn(), record.clone());
        Ok(record)
    }

    /// Append an Indexing record snapshotting the current epoch and LSN;
    /// it becomes the newest resync point.
    pub fn append_indexing(&self) -> Result<RecordRef> {
        let mut state = self.lsn_state.lock();
        let record = LogRecord::new(RecordBody::Indexing {
            current_epoch: self.tail_epoch(),
        });
        let record = self.insert_physical(&mut state, record)?;
        *self.last_indexing.lock() = Some(record.clone());
        Ok(record)
    }

    pub fn append_begin_checkpoint(
        &self,
        earliest_pending_tx_lsn: Option<Lsn>,
    ) -> Result<RecordRef> {
        let mut state = self.lsn_state.lock();
        let record = LogRecord::new(RecordBody::BeginCheckpoint {
            epoch: self.tail_epoch(),
            progress_vector: self.progress_vector(),
            earliest_pending_tx_lsn,
        });
        self.insert_physical(&mut state, record)
    }

    pub fn append_end_checkpoint(&self, begin_checkpoint: &RecordRef) -> Result<RecordRef> {
        let mut state = self.lsn_state.lock();
        let record = LogRecord::new(RecordBody::EndCheckpoint {
            last_completed_begin_checkpoint_lsn: begin_checkpoint.lsn(),
            last_completed_begin_checkpoint_psn: begin_checkpoint.psn(),
            last_stable_lsn: self.stable_lsn(),
        });
        record.set_linked_physical_psn(begin_checkpoint.psn());
        self.insert_physical(&mut state, record)
    }

    pub fn append_complete_checkpoint(&self) -> Result<RecordRef> {
        let mut state = self.lsn_state.lock();
        let record = LogRecord::new(RecordBody::CompleteCheckpoint);
        let record = self.insert_physical(&mut state, record)?;
        *self.last_linked_physical.lock() = Some(record.clone());
        Ok(record)
    }

    /// Append a TruncateHead targeting the newest indexing record the
    /// injected policy accepts as a head candidate.
    pub fn try_append_truncate_head(
        &self,
        is_periodic: bool,
        periodic_truncation_timestamp: i64,
        is_good_log_head_candidate: &dyn Fn(&RecordRef) -> bool,
    ) -> Result<Option<RecordRef>> {
        let indexing = {
            let arena = self.arena.lock();
            arena
                .values()
                .rev()
                .filter(|r| matches!(r.body(), RecordBody::Indexing { .. }))
                .filter(|r| r.position().is_some())
                .find(|r| is_good_log_head_candidate(r))
                .cloned()
        };
        let Some(indexing) = indexing else {
            return Ok(None);
        };

        let mut state = self.lsn_state.lock();
        let record = LogRecord::new(RecordBody::TruncateHead {
            head_indexing_psn: indexing.psn(),
            head_record_position: indexing.position().unwrap_or(0),
            head_lsn: indexing.lsn(),
            is_periodic,
            periodic_truncation_timestamp,
        });
        record.set_linked_physical_psn(indexing.psn());
        let record = self.insert_physical(&mut state, record)?;
        *self.last_linked_physical.lock() = Some(record.clone());
        info!(
            head_lsn = indexing.lsn(),
            head_position = indexing.position().unwrap_or(0),
            is_periodic,
            "truncate head appended"
        );
        Ok(Some(record))
    }

    pub fn append_truncate_tail(&self) -> Result<RecordRef> {
        let mut state = self.lsn_state.lock();
        let record = LogRecord::new(RecordBody::TruncateTail);
        self.insert_physical(&mut state, record)
    }

    pub fn append_information(&self, event: InformationEvent) -> Result<RecordRef> {
        let mut state = self.lsn_state.lock();
        let record = LogRecord::new(RecordBody::Information { event });
        self.insert_physical(&mut state, record)
    }

    /// Append an UpdateEpoch record. It is logical but shares the
    /// current tail LSN, and lands in the progress vector immediately.
    pub fn append_update_epoch(
        &self,
        epoch: Epoch,
        primary_replica_id: u64,
    ) -> Result<RecordRef> {
        let record = {
            let state = self.lsn_state.lock();
            let record = LogRecord::new(RecordBody::UpdateEpoch {
                epoch,
                primary_replica_id,
            });
            record.set_lsn(state.tail_lsn);
            self.writer.insert_buffered_record(record.clone())?;
            record
        };

        self.set_tail_epoch(epoch);
        self.progress.lock().append(ProgressVectorEntry::new(
            epoch,
            record.lsn(),
            primary_replica_id,
        ));
        info!(?epoch, lsn = record.lsn(), "epoch updated");
        Ok(record)
    }

    /// Insert a progress vector entry replayed from the log.
    pub fn insert_progress_entry(&self, entry: ProgressVectorEntry) {
        self.progress.lock().insert(entry);
    }

    /// Append an Information record and flush. With `close_log` the
    /// writer refuses all further inserts once the flush lands.
    pub async fn flush_information_record(
        &self,
        event: InformationEvent,
        close_log: bool,
        initiator: &str,
    ) -> Result<RecordRef> {
        let record = self.append_information(event)?;
        self.writer.flush(initiator).await?;
        if close_log {
            self.writer.close(ReplicatorError::Closed);
        }
        Ok(record)
    }

    pub async fn flush(&self, initiator: &str) -> Result<()> {
        self.writer.flush(initiator).await
    }

    /// Rewind the tail after a false-progress truncation.
    pub fn reset_tail_lsn(&self, lsn: Lsn) {
        let mut state = self.lsn_state.lock();
        state.tail_lsn = lsn;
        state.parked.clear();
    }
}

impl std::fmt::Debug for ReplicatedLogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedLogManager")
            .field("tail_lsn", &self.tail_lsn())
            .field("stable_lsn", &self.stable_lsn())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_monitor::IoHealthMonitor;
    use crate::log_stream::MemoryLogStream;
    use crate::writer::{FlushCallbackManager, WriterInit};
    use std::time::Duration;

    fn test_manager(tail_lsn: Lsn) -> Arc<ReplicatedLogManager> {
        let writer = Arc::new(PhysicalLogWriter::new(
            Arc::new(MemoryLogStream::new(None)),
            FlushCallbackManager::new(),
            Arc::new(IoHealthMonitor::new(Duration::from_secs(10))),
            64 * 1024,
            WriterInit::default(),
        ));
        ReplicatedLogManager::new(
            writer,
            Arc::new(RoleContextDrainState::new()),
            LogManagerInit {
                tail_lsn,
                ..Default::default()
            },
        )
    }

    fn barrier() -> RecordRef {
        LogRecord::new(RecordBody::Barrier { last_stable_lsn: 0 })
    }

    #[tokio::test]
    async fn out_of_order_lsns_park_then_drain() {
        let manager = test_manager(9);

        // Replicate completions arrive as 12, 10, 11 with tail at 9
        manager.insert_logical_in_order(barrier(), 12).unwrap();
        assert_eq!(manager.tail_lsn(), 9);

        manager.insert_logical_in_order(barrier(), 10).unwrap();
        assert_eq!(manager.tail_lsn(), 10);

        manager.insert_logical_in_order(barrier(), 11).unwrap();
        // 11 appended, then 12 drained from the park buffer
        assert_eq!(manager.tail_lsn(), 12);

        // PSNs reflect append order 10, 11, 12
        manager.flush("test").await.unwrap();
        let tail = manager.writer().current_tail_record().unwrap();
        assert_eq!(tail.lsn(), 12);
        assert_eq!(tail.psn(), 3);
    }

    #[tokio::test]
    async fn duplicate_lsn_is_rejected() {
        let manager = test_manager(9);
        manager.insert_logical_in_order(barrier(), 10).unwrap();
        assert!(manager.insert_logical_in_order(barrier(), 10).is_err());
        assert!(manager.insert_logical_in_order(barrier(), 5).is_err());
    }

    #[tokio::test]
    async fn physical_records_inherit_tail_lsn() {
        let manager = test_manager(9);
        manager.insert_logical_in_order(barrier(), 10).unwrap();

        let indexing = manager.append_indexing().unwrap();
        assert_eq!(indexing.lsn(), 10);
        assert_eq!(manager.tail_lsn(), 10);
        assert!(manager.last_indexing_record().is_some());
        assert!(manager.get_physical_record(indexing.psn()).is_some());
    }

    #[tokio::test]
    async fn end_checkpoint_links_to_begin() {
        let manager = test_manager(0);
        manager.insert_logical_in_order(barrier(), 1).unwrap();

        let begin = manager.append_begin_checkpoint(None).unwrap();
        let end = manager.append_end_checkpoint(&begin).unwrap();

        assert_eq!(end.linked_physical_psn(), Some(begin.psn()));
        match end.body() {
            RecordBody::EndCheckpoint {
                last_completed_begin_checkpoint_psn,
                ..
            } => assert_eq!(*last_completed_begin_checkpoint_psn, begin.psn()),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[tokio::test]
    async fn truncate_head_respects_candidate_policy() {
        let manager = test_manager(0);
        manager.insert_logical_in_order(barrier(), 1).unwrap();
        let indexing = manager.append_indexing().unwrap();
        manager.flush("test").await.unwrap();

        // Rejecting policy: nothing appended
        let none = manager
            .try_append_truncate_head(false, 0, &|_| false)
            .unwrap();
        assert!(none.is_none());

        let truncate = manager
            .try_append_truncate_head(false, 0, &|_| true)
            .unwrap()
            .expect("candidate accepted");
        assert_eq!(truncate.linked_physical_psn(), Some(indexing.psn()));
    }

    #[tokio::test]
    async fn update_epoch_shares_tail_lsn_and_extends_progress() {
        let manager = test_manager(5);
        let record = manager
            .append_update_epoch(Epoch::new(2, 7), 42)
            .unwrap();

        assert_eq!(record.lsn(), 5);
        assert_eq!(manager.tail_lsn(), 5);
        assert_eq!(manager.tail_epoch(), Epoch::new(2, 7));
        let pv = manager.progress_vector();
        assert_eq!(pv.last().unwrap().epoch, Epoch::new(2, 7));
        assert_eq!(pv.last().unwrap().primary_replica_id, 42);
    }

    #[tokio::test]
    async fn head_install_prunes_arena() {
        let manager = test_manager(0);
        manager.insert_logical_in_order(barrier(), 1).unwrap();
        let first = manager.append_indexing().unwrap();
        let second = manager.append_indexing().unwrap();
        manager.flush("test").await.unwrap();

        manager.set_head_record(second.clone());
        assert!(manager.get_physical_record(first.psn()).is_none());
        assert!(manager.get_physical_record(second.psn()).is_some());
        assert_eq!(manager.head_position(), second.position().unwrap());
    }

    #[tokio::test]
    async fn close_log_poisons_writer() {
        let manager = test_manager(0);
        manager
            .flush_information_record(InformationEvent::ClosingLog, true, "test")
            .await
            .unwrap();
        assert!(manager.writer().is_closed());
        assert!(manager.append_indexing().is_err());
    }
}
