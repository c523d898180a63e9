// State-provider contract
// The application state machine consumed by the replicator: apply/unlock
// for operations, checkpoint lifecycle, backup/restore, copy-state
// ingestion, and role changes. Operation payloads are opaque bytes.

use crate::error::Result;
use crate::records::{Lsn, OperationContext, TxId};
use async_trait::async_trait;
use std::path::Path;

/// Replica role as seen by the state provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    Unknown,
    Idle,
    Active,
    Primary,
    None,
}

/// Why an apply is happening; the provider may treat redo during
/// recovery or false progress differently from live traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyContext {
    PrimaryRedo,
    SecondaryRedo,
    RecoveryRedo,
    SecondaryFalseProgress,
}

/// The opaque apply/checkpoint/backup callback surface of the
/// application state machine.
#[async_trait]
pub trait StateProvider: Send + Sync {
    /// Apply one operation. The returned context, if any, is handed back
    /// exactly once via `unlock` after both apply and replication finish.
    async fn apply(
        &self,
        lsn: Lsn,
        tx_id: Option<TxId>,
        context: ApplyContext,
        metadata: &[u8],
        redo: &[u8],
    ) -> Result<Option<OperationContext>>;

    /// Release an operation context returned by `apply`. Idempotent.
    fn unlock(&self, context: OperationContext);

    /// A checkpoint covering everything up to `checkpoint_lsn` is about
    /// to be taken.
    async fn prepare_checkpoint(&self, checkpoint_lsn: Lsn) -> Result<()>;

    /// Persist the prepared checkpoint.
    async fn perform_checkpoint(&self) -> Result<()>;

    /// The checkpoint is durable in the log; finalize it.
    async fn complete_checkpoint(&self) -> Result<()>;

    /// Write the provider's checkpoint artifacts into `path`.
    async fn backup_checkpoint(&self, path: &Path) -> Result<()>;

    /// Replace provider state from backup artifacts in `path`.
    async fn restore_checkpoint(&self, path: &Path) -> Result<()>;

    /// Copy-state ingestion on an idle secondary.
    async fn begin_setting_current_state(&self) -> Result<()>;
    async fn set_current_state(&self, record_number: u64, data: Vec<Vec<u8>>) -> Result<()>;
    async fn end_setting_current_state(&self) -> Result<()>;

    async fn change_role(&self, role: ReplicaRole) -> Result<()>;
}
