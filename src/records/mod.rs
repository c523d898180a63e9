// Log record model
// Every durable entity in the log is a LogRecord: a kind tag, a shared
// header (LSN/PSN/position/back-links) and a kind-specific body. Logical
// records carry transport-assigned LSNs; physical records inherit the tail
// LSN at append time.

pub mod progress;
pub mod wire;

use crate::error::{ReplicatorError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use progress::ProgressVector;

/// Logical sequence number, assigned by the transport on replicate.
pub type Lsn = u64;

/// Physical sequence number, strictly monotone across all records.
pub type Psn = u64;

/// Transaction identifier.
pub type TxId = u64;

/// Sentinel for "not yet assigned" in atomic header fields.
pub const UNASSIGNED: u64 = u64::MAX;

/// Replica epoch: increments on data loss or reconfiguration.
/// Lexicographic order over (data_loss_version, configuration_version).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Epoch {
    pub data_loss_version: u64,
    pub configuration_version: u64,
}

impl Epoch {
    /// The zero epoch doubles as the invalid sentinel: no real primary
    /// ever produces it.
    pub const ZERO: Epoch = Epoch {
        data_loss_version: 0,
        configuration_version: 0,
    };

    pub fn new(data_loss_version: u64, configuration_version: u64) -> Self {
        Self {
            data_loss_version,
            configuration_version,
        }
    }

    pub fn is_valid(&self) -> bool {
        *self != Epoch::ZERO
    }
}

/// Record kind tag. The numeric values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordKind {
    Invalid = 0,
    BeginTx = 1,
    Operation = 2,
    EndTx = 3,
    Barrier = 4,
    Backup = 5,
    UpdateEpoch = 6,
    BeginCheckpoint = 7,
    EndCheckpoint = 8,
    CompleteCheckpoint = 9,
    TruncateHead = 10,
    TruncateTail = 11,
    Indexing = 12,
    Information = 13,
}

impl RecordKind {
    /// Logical records carry their own LSN; physical records inherit the
    /// tail LSN. UpdateEpoch is logical but shares the current tail LSN.
    pub fn is_logical(&self) -> bool {
        matches!(
            self,
            RecordKind::BeginTx
                | RecordKind::Operation
                | RecordKind::EndTx
                | RecordKind::Barrier
                | RecordKind::Backup
                | RecordKind::UpdateEpoch
        )
    }

    pub fn is_physical(&self) -> bool {
        !self.is_logical() && *self != RecordKind::Invalid
    }

    pub fn is_transaction_record(&self) -> bool {
        matches!(
            self,
            RecordKind::BeginTx | RecordKind::Operation | RecordKind::EndTx
        )
    }
}

/// Sub-event carried by an Information record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InformationEvent {
    Recovered,
    CopyFinished,
    ReplicationFinished,
    ClosingLog,
    RemovingState,
    RestoredFromBackup,
}

/// How an Operation record was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationMode {
    /// Part of a multi-operation transaction
    InTransaction,
    /// Standalone atomic operation with undo
    Atomic,
    /// Standalone redo-only operation
    AtomicRedo,
}

/// Kind-specific payload of a record. Application operation data is
/// opaque to the replicator and carried as raw byte vectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecordBody {
    BeginTx {
        tx_id: TxId,
        /// Single-operation transactions commit at begin
        is_single_operation: bool,
        metadata: Vec<u8>,
        undo: Vec<u8>,
        redo: Vec<u8>,
    },
    Operation {
        tx_id: TxId,
        mode: OperationMode,
        metadata: Vec<u8>,
        undo: Vec<u8>,
        redo: Vec<u8>,
    },
    EndTx {
        tx_id: TxId,
        committed: bool,
    },
    Barrier {
        last_stable_lsn: Lsn,
    },
    Backup {
        backup_id: Uuid,
        highest_backed_up_epoch: Epoch,
        highest_backed_up_lsn: Lsn,
    },
    UpdateEpoch {
        epoch: Epoch,
        primary_replica_id: u64,
    },
    Indexing {
        current_epoch: Epoch,
    },
    BeginCheckpoint {
        epoch: Epoch,
        progress_vector: ProgressVector,
        /// LSN of the oldest transaction still pending when the
        /// checkpoint began; bounds what the checkpoint covers
        earliest_pending_tx_lsn: Option<Lsn>,
    },
    EndCheckpoint {
        last_completed_begin_checkpoint_lsn: Lsn,
        last_completed_begin_checkpoint_psn: Psn,
        last_stable_lsn: Lsn,
    },
    CompleteCheckpoint,
    TruncateHead {
        /// PSN of the indexing record that becomes the new head
        head_indexing_psn: Psn,
        head_record_position: u64,
        head_lsn: Lsn,
        is_periodic: bool,
        /// Unix seconds of the periodic truncation that produced this
        /// record, carried forward through recovery
        periodic_truncation_timestamp: i64,
    },
    TruncateTail,
    Information {
        event: InformationEvent,
    },
}

impl RecordBody {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordBody::BeginTx { .. } => RecordKind::BeginTx,
            RecordBody::Operation { .. } => RecordKind::Operation,
            RecordBody::EndTx { .. } => RecordKind::EndTx,
            RecordBody::Barrier { .. } => RecordKind::Barrier,
            RecordBody::Backup { .. } => RecordKind::Backup,
            RecordBody::UpdateEpoch { .. } => RecordKind::UpdateEpoch,
            RecordBody::Indexing { .. } => RecordKind::Indexing,
            RecordBody::BeginCheckpoint { .. } => RecordKind::BeginCheckpoint,
            RecordBody::EndCheckpoint { .. } => RecordKind::EndCheckpoint,
            RecordBody::CompleteCheckpoint => RecordKind::CompleteCheckpoint,
            RecordBody::TruncateHead { .. } => RecordKind::TruncateHead,
            RecordBody::TruncateTail => RecordKind::TruncateTail,
            RecordBody::Information { .. } => RecordKind::Information,
        }
    }

    pub fn tx_id(&self) -> Option<TxId> {
        match self {
            RecordBody::BeginTx { tx_id, .. }
            | RecordBody::Operation { tx_id, .. }
            | RecordBody::EndTx { tx_id, .. } => Some(*tx_id),
            _ => None,
        }
    }

    /// Cheap upper-bound estimate of the serialized size, used for
    /// buffer accounting before the record is actually encoded.
    pub fn approximate_size(&self) -> u64 {
        const HEADER_ESTIMATE: u64 = 64;
        let payload = match self {
            RecordBody::BeginTx {
                metadata,
                undo,
                redo,
                ..
            }
            | RecordBody::Operation {
                metadata,
                undo,
                redo,
                ..
            } => (metadata.len() + undo.len() + redo.len()) as u64,
            RecordBody::BeginCheckpoint {
                progress_vector, ..
            } => progress_vector.entries().len() as u64 * 24,
            _ => 0,
        };
        HEADER_ESTIMATE + payload
    }
}

/// One-shot completion that any number of tasks can await.
///
/// The first `complete` wins; later completions are ignored. Used for the
/// flushed/applied/processed lifecycle stages of a record.
pub struct CompletionSignal {
    state: Mutex<Option<Result<()>>>,
    notify: Notify,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Complete with `result`. Returns false if already completed.
    pub fn complete(&self, result: Result<()>) -> bool {
        {
            let mut state = self.state.lock();
            if state.is_some() {
                return false;
            }
            *state = Some(result);
        }
        self.notify.notify_waiters();
        true
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Result if completed, None otherwise.
    pub fn try_result(&self) -> Option<Result<()>> {
        self.state.lock().clone()
    }

    /// Wait until completed and return the stored result.
    pub async fn wait(&self) -> Result<()> {
        loop {
            let waiter = self.notify.notified();
            if let Some(result) = self.state.lock().clone() {
                return result;
            }
            waiter.await;
        }
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Opaque per-operation context returned by the state provider's apply
/// and handed back on unlock.
pub type OperationContext = Box<dyn Any + Send>;

/// Shared handle to a log record.
pub type RecordRef = Arc<LogRecord>;

/// A log record and its in-memory lifecycle state.
///
/// The body is immutable after creation. Header fields assigned later
/// (LSN for physical records, PSN and position at insert/flush time,
/// physical back-links) are atomics with `UNASSIGNED` as the empty value.
pub struct LogRecord {
    kind: RecordKind,
    body: RecordBody,
    lsn: AtomicU64,
    psn: AtomicU64,
    /// Byte offset of the frame within the log stream
    position: AtomicU64,
    /// Serialized frame size, set when the record is flushed
    serialized_size: AtomicU64,
    /// PSN of the immediately preceding physical record
    previous_physical_psn: AtomicU64,
    /// Skip link: the physical record that was current when this one was
    /// appended (checkpoint / truncate-head chains)
    linked_physical_psn: AtomicU64,
    flushed: CompletionSignal,
    applied: CompletionSignal,
    processed: CompletionSignal,
    /// Contexts returned by apply, consumed by unlock (one per applied op)
    operation_contexts: Mutex<Vec<OperationContext>>,
}

impl LogRecord {
    pub fn new(body: RecordBody) -> RecordRef {
        Arc::new(Self {
            kind: body.kind(),
            lsn: AtomicU64::new(UNASSIGNED),
            psn: AtomicU64::new(UNASSIGNED),
            position: AtomicU64::new(UNASSIGNED),
            serialized_size: AtomicU64::new(0),
            previous_physical_psn: AtomicU64::new(UNASSIGNED),
            linked_physical_psn: AtomicU64::new(UNASSIGNED),
            flushed: CompletionSignal::new(),
            applied: CompletionSignal::new(),
            processed: CompletionSignal::new(),
            operation_contexts: Mutex::new(Vec::new()),
            body,
        })
    }

    /// Rebuild a record from a decoded wire frame (read path: recovery,
    /// copy-log, backup). Lifecycle signals start fresh.
    pub fn from_frame(frame: wire::RecordFrame) -> RecordRef {
        let record = Self::new(frame.body);
        record.lsn.store(frame.lsn, Ordering::SeqCst);
        record.psn.store(frame.psn, Ordering::SeqCst);
        record
            .previous_physical_psn
            .store(frame.previous_physical_psn, Ordering::SeqCst);
        record
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn body(&self) -> &RecordBody {
        &self.body
    }

    pub fn tx_id(&self) -> Option<TxId> {
        self.body.tx_id()
    }

    pub fn lsn(&self) -> Lsn {
        self.lsn.load(Ordering::SeqCst)
    }

    pub fn set_lsn(&self, lsn: Lsn) {
        self.lsn.store(lsn, Ordering::SeqCst);
    }

    pub fn psn(&self) -> Psn {
        self.psn.load(Ordering::SeqCst)
    }

    pub fn set_psn(&self, psn: Psn) {
        self.psn.store(psn, Ordering::SeqCst);
    }

    pub fn position(&self) -> Option<u64> {
        match self.position.load(Ordering::SeqCst) {
            UNASSIGNED => None,
            p => Some(p),
        }
    }

    pub fn set_position(&self, position: u64) {
        self.position.store(position, Ordering::SeqCst);
    }

    pub fn serialized_size(&self) -> u64 {
        self.serialized_size.load(Ordering::SeqCst)
    }

    pub fn set_serialized_size(&self, size: u64) {
        self.serialized_size.store(size, Ordering::SeqCst);
    }

    pub fn previous_physical_psn(&self) -> Option<Psn> {
        match self.previous_physical_psn.load(Ordering::SeqCst) {
            UNASSIGNED => None,
            p => Some(p),
        }
    }

    pub fn set_previous_physical_psn(&self, psn: Psn) {
        self.previous_physical_psn.store(psn, Ordering::SeqCst);
    }

    pub fn linked_physical_psn(&self) -> Option<Psn> {
        match self.linked_physical_psn.load(Ordering::SeqCst) {
            UNASSIGNED => None,
            p => Some(p),
        }
    }

    pub fn set_linked_physical_psn(&self, psn: Psn) {
        self.linked_physical_psn.store(psn, Ordering::SeqCst);
    }

    pub fn flushed(&self) -> &CompletionSignal {
        &self.flushed
    }

    pub fn applied(&self) -> &CompletionSignal {
        &self.applied
    }

    pub fn processed(&self) -> &CompletionSignal {
        &self.processed
    }

    pub fn push_operation_context(&self, context: OperationContext) {
        self.operation_contexts.lock().push(context);
    }

    /// Drain the contexts collected by apply, in apply order.
    pub fn take_operation_contexts(&self) -> Vec<OperationContext> {
        std::mem::take(&mut *self.operation_contexts.lock())
    }

    /// Fail every outstanding lifecycle stage with `error`.
    pub fn fail(&self, error: &ReplicatorError) {
        self.flushed.complete(Err(error.clone()));
        self.applied.complete(Err(error.clone()));
        self.processed.complete(Err(error.clone()));
    }
}

impl std::fmt::Debug for LogRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRecord")
            .field("kind", &self.kind)
            .field("lsn", &self.lsn.load(Ordering::SeqCst))
            .field("psn", &self.psn.load(Ordering::SeqCst))
            .finish()
    }
}
