// Shared fixtures: an in-memory state provider that records every
// callback, and a loopback transport that assigns LSNs locally and
// feeds canned copy/replication streams.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rusty_replog::error::{ReplicatorError, Result};
use rusty_replog::records::{CompletionSignal, Lsn, OperationContext, TxId};
use rusty_replog::replicated::transport::{
    OperationData, OperationStream, ReplicationTicket, StateReplicator, StreamOperation,
};
use rusty_replog::state_provider::{ApplyContext, ReplicaRole, StateProvider};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One apply the provider saw.
#[derive(Debug, Clone)]
pub struct AppliedOp {
    pub lsn: Lsn,
    pub tx_id: Option<TxId>,
    pub context: ApplyContext,
    pub redo: Vec<u8>,
}

/// State provider that records everything and hands back a context per
/// apply so unlock accounting is observable.
#[derive(Default)]
pub struct MemoryStateProvider {
    pub applied: Mutex<Vec<AppliedOp>>,
    pub unlocks: AtomicU64,
    pub prepared_checkpoints: Mutex<Vec<Lsn>>,
    pub performed_checkpoints: AtomicU64,
    pub completed_checkpoints: AtomicU64,
    pub backup_checkpoints: AtomicU64,
    pub restore_checkpoints: AtomicU64,
    pub copy_state_frames: Mutex<Vec<(u64, Vec<Vec<u8>>)>>,
    pub copy_state_completed: AtomicU64,
    pub roles: Mutex<Vec<ReplicaRole>>,
}

impl MemoryStateProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn applied_lsns(&self) -> Vec<Lsn> {
        self.applied.lock().iter().map(|op| op.lsn).collect()
    }
}

#[async_trait]
impl StateProvider for MemoryStateProvider {
    async fn apply(
        &self,
        lsn: Lsn,
        tx_id: Option<TxId>,
        context: ApplyContext,
        _metadata: &[u8],
        redo: &[u8],
    ) -> Result<Option<OperationContext>> {
        self.applied.lock().push(AppliedOp {
            lsn,
            tx_id,
            context,
            redo: redo.to_vec(),
        });
        Ok(Some(Box::new(lsn)))
    }

    fn unlock(&self, _context: OperationContext) {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
    }

    async fn prepare_checkpoint(&self, checkpoint_lsn: Lsn) -> Result<()> {
        self.prepared_checkpoints.lock().push(checkpoint_lsn);
        Ok(())
    }

    async fn perform_checkpoint(&self) -> Result<()> {
        self.performed_checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn complete_checkpoint(&self) -> Result<()> {
        self.completed_checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn backup_checkpoint(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)?;
        std::fs::write(path.join("state.checkpoint"), b"checkpoint")?;
        self.backup_checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn restore_checkpoint(&self, path: &Path) -> Result<()> {
        if !path.join("state.checkpoint").is_file() {
            return Err(ReplicatorError::InvalidParameter(format!(
                "no checkpoint artifacts in {}",
                path.display()
            )));
        }
        self.restore_checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn begin_setting_current_state(&self) -> Result<()> {
        Ok(())
    }

    async fn set_current_state(&self, record_number: u64, data: Vec<Vec<u8>>) -> Result<()> {
        self.copy_state_frames.lock().push((record_number, data));
        Ok(())
    }

    async fn end_setting_current_state(&self) -> Result<()> {
        self.copy_state_completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn change_role(&self, role: ReplicaRole) -> Result<()> {
        self.roles.lock().push(role);
        Ok(())
    }
}

/// Canned pull stream.
pub struct QueueStream {
    operations: Mutex<VecDeque<StreamOperation>>,
}

impl QueueStream {
    pub fn new(operations: Vec<StreamOperation>) -> Arc<Self> {
        Arc::new(Self {
            operations: Mutex::new(operations.into()),
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl OperationStream for QueueStream {
    async fn get_operation(&self) -> Result<Option<StreamOperation>> {
        Ok(self.operations.lock().pop_front())
    }
}

/// Loopback transport: assigns monotone LSNs and completes replication
/// immediately. Copy/replication streams are preset per test.
pub struct LoopbackReplicator {
    next_lsn: AtomicU64,
    pub replicated: Mutex<Vec<(Lsn, usize)>>,
    pub copy_stream: Mutex<Arc<QueueStream>>,
    pub replication_stream: Mutex<Arc<QueueStream>>,
}

impl LoopbackReplicator {
    pub fn new(starting_lsn: Lsn) -> Arc<Self> {
        Arc::new(Self {
            next_lsn: AtomicU64::new(starting_lsn + 1),
            replicated: Mutex::new(Vec::new()),
            copy_stream: Mutex::new(QueueStream::empty()),
            replication_stream: Mutex::new(QueueStream::empty()),
        })
    }

    pub fn set_copy_stream(&self, stream: Arc<QueueStream>) {
        *self.copy_stream.lock() = stream;
    }

    pub fn set_replication_stream(&self, stream: Arc<QueueStream>) {
        *self.replication_stream.lock() = stream;
    }
}

#[async_trait]
impl StateReplicator for LoopbackReplicator {
    fn replicate(&self, data: OperationData) -> Result<(Lsn, ReplicationTicket)> {
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        self.replicated.lock().push((lsn, data.total_len()));
        let ticket: ReplicationTicket = Arc::new(CompletionSignal::new());
        ticket.complete(Ok(()));
        Ok((lsn, ticket))
    }

    fn get_copy_stream(&self) -> Result<Arc<dyn OperationStream>> {
        Ok(self.copy_stream.lock().clone() as Arc<dyn OperationStream>)
    }

    fn get_replication_stream(&self) -> Result<Arc<dyn OperationStream>> {
        Ok(self.replication_stream.lock().clone() as Arc<dyn OperationStream>)
    }
}

/// Opt-in tracing for debugging a failing scenario:
/// `RUST_LOG=rusty_replog=debug cargo test -- --nocapture`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Poll until `predicate` holds or the timeout expires.
pub async fn wait_until<F: Fn() -> bool>(timeout: std::time::Duration, predicate: F) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    predicate()
}
