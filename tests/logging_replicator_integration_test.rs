// End-to-end primary pipeline: append, flush, stability, apply,
// unlock, commit notification, checkpoint and head truncation under
// write pressure, and the slow-flush health signal.

mod common;

use common::{wait_until, LoopbackReplicator, MemoryStateProvider};
use parking_lot::Mutex;
use rusty_replog::config::ReplicatorConfig;
use rusty_replog::error::ReplicatorError;
use rusty_replog::io_monitor::IoHealthMonitor;
use rusty_replog::log_stream::{LogStoreKind, MemoryLogStream};
use rusty_replog::records::{LogRecord, RecordBody};
use rusty_replog::replica::{LoggingReplicator, ReplicaSettings};
use rusty_replog::state_provider::ApplyContext;
use rusty_replog::writer::{FlushCallbackManager, PhysicalLogWriter, WriterInit};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn settings(config: ReplicatorConfig, restore_root: &std::path::Path) -> ReplicaSettings {
    ReplicaSettings {
        partition_id: Uuid::new_v4(),
        replica_id: 1,
        store: LogStoreKind::InMemory { max_chunks: None },
        restore_root: restore_root.to_path_buf(),
        config,
    }
}

async fn open_primary(
    config: ReplicatorConfig,
    restore_root: &std::path::Path,
) -> (
    Arc<LoggingReplicator>,
    Arc<MemoryStateProvider>,
    Arc<LoopbackReplicator>,
) {
    let provider = MemoryStateProvider::new();
    let replica = LoggingReplicator::open(settings(config, restore_root), provider.clone())
        .await
        .unwrap();
    let transport = LoopbackReplicator::new(replica.log_manager().tail_lsn());
    replica
        .become_primary(false, transport.clone())
        .await
        .unwrap();
    (replica, provider, transport)
}

#[tokio::test]
async fn commit_applies_unlocks_and_notifies() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (replica, provider, _transport) =
        open_primary(ReplicatorConfig::default(), dir.path()).await;

    let commits: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let commits_sink = commits.clone();
    replica
        .processor()
        .set_commit_notification(Box::new(move |tx_id, lsn| {
            commits_sink.lock().push((tx_id, lsn));
        }));

    let tx = replica.transactions();
    tx.begin_transaction(7, vec![], vec![], b"begin".to_vec())
        .await
        .unwrap();
    tx.add_operation(7, vec![], vec![], b"op".to_vec())
        .await
        .unwrap();
    let commit_lsn = tx.commit_transaction(7).await.unwrap();

    // Begin + operation applied at commit time, in chain order
    let applied = provider.applied_lsns();
    assert_eq!(applied.len(), 2);
    assert!(applied[0] < applied[1]);
    assert!(applied.iter().all(|lsn| *lsn < commit_lsn));

    // One unlock per context, after apply and replication
    assert!(
        wait_until(Duration::from_secs(2), || {
            provider.unlocks.load(Ordering::SeqCst) == 2
        })
        .await
    );

    // Exactly one commit notification for tx 7
    assert!(
        wait_until(Duration::from_secs(2), || !commits.lock().is_empty()).await
    );
    let seen = commits.lock().clone();
    assert_eq!(seen, vec![(7, commit_lsn)]);

    // The barrier made the commit stable
    assert!(replica.log_manager().stable_lsn() >= commit_lsn);
    replica.close().await.unwrap();
}

#[tokio::test]
async fn single_operation_transaction_commits_at_begin() {
    let dir = tempfile::tempdir().unwrap();
    let (replica, provider, _transport) =
        open_primary(ReplicatorConfig::default(), dir.path()).await;

    let lsn = replica
        .transactions()
        .begin_transaction_single_op(9, vec![], vec![], b"single".to_vec())
        .await
        .unwrap();

    let applied = provider.applied.lock().clone();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].lsn, lsn);
    assert_eq!(applied[0].context, ApplyContext::PrimaryRedo);
    assert_eq!(applied[0].redo, b"single".to_vec());
    replica.close().await.unwrap();
}

#[tokio::test]
async fn aborted_transaction_applies_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (replica, provider, _transport) =
        open_primary(ReplicatorConfig::default(), dir.path()).await;

    let tx = replica.transactions();
    tx.begin_transaction(3, vec![], vec![], b"begin".to_vec())
        .await
        .unwrap();
    tx.add_operation(3, vec![], vec![], b"op".to_vec())
        .await
        .unwrap();
    tx.abort_transaction(3).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(provider.applied.lock().is_empty());
    replica.close().await.unwrap();
}

#[tokio::test]
async fn write_pressure_drives_checkpoint_and_head_truncation() {
    let dir = tempfile::tempdir().unwrap();
    let config = ReplicatorConfig {
        checkpoint_threshold_mb: 1,
        min_log_size_mb: 1,
        truncation_threshold_factor: 2,
        throttling_threshold_factor: 4,
        ..Default::default()
    };
    let (replica, provider, _transport) = open_primary(config, dir.path()).await;

    // ~3 MiB of committed transactions against a 1 MiB checkpoint
    // interval
    let payload = vec![0xABu8; 64 * 1024];
    for tx_id in 1..=48u64 {
        replica
            .transactions()
            .begin_transaction_single_op(tx_id, vec![], vec![], payload.clone())
            .await
            .unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(5), || {
            replica.checkpoints().last_completed_end_checkpoint().is_some()
        })
        .await,
        "no checkpoint completed under write pressure"
    );
    assert!(provider.performed_checkpoints.load(Ordering::SeqCst) >= 1);
    assert!(provider.completed_checkpoints.load(Ordering::SeqCst) >= 1);

    // With the checkpoint done the log head eventually advances
    assert!(
        wait_until(Duration::from_secs(5), || {
            replica.log_manager().head_position() > 0
        })
        .await,
        "log head never advanced"
    );
    replica.close().await.unwrap();
}

#[tokio::test]
async fn old_pending_transaction_is_aborted_for_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = ReplicatorConfig {
        checkpoint_threshold_mb: 1,
        min_log_size_mb: 1,
        ..Default::default()
    };
    let (replica, _provider, _transport) = open_primary(config, dir.path()).await;

    // Open a transaction at the very start of the log and leave it
    let tx = replica.transactions();
    tx.begin_transaction(99, vec![], vec![], b"old".to_vec())
        .await
        .unwrap();

    // Push 1.2 MiB past it
    let payload = vec![0xCDu8; 64 * 1024];
    for tx_id in 1..=20u64 {
        tx.begin_transaction_single_op(tx_id, vec![], vec![], payload.clone())
            .await
            .unwrap();
    }

    // The abort-candidate machinery ends tx 99, unblocking checkpoints
    assert!(
        wait_until(Duration::from_secs(5), || {
            replica.checkpoints().last_completed_end_checkpoint().is_some()
        })
        .await,
        "checkpoint stayed blocked behind the old transaction"
    );
    replica.close().await.unwrap();
}

// Stream wrapper that makes every flush slow.
struct SlowFlushStream {
    inner: MemoryLogStream,
    delay: Duration,
}

#[async_trait::async_trait]
impl rusty_replog::log_stream::LogStream for SlowFlushStream {
    async fn append(&self, data: &[u8]) -> rusty_replog::Result<()> {
        self.inner.append(data).await
    }

    async fn flush_with_marker(&self) -> rusty_replog::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.flush_with_marker().await
    }

    async fn truncate_head(&self, offset: u64) -> rusty_replog::Result<()> {
        self.inner.truncate_head(offset).await
    }

    async fn truncate_tail(&self, offset: u64) -> rusty_replog::Result<()> {
        self.inner.truncate_tail(offset).await
    }

    fn read_stream(
        &self,
        at: u64,
    ) -> rusty_replog::Result<Box<dyn rusty_replog::log_stream::LogReadStream>> {
        self.inner.read_stream(at)
    }

    fn write_position(&self) -> u64 {
        self.inner.write_position()
    }

    fn head_position(&self) -> u64 {
        self.inner.head_position()
    }

    fn length(&self) -> u64 {
        self.inner.length()
    }
}

#[tokio::test]
async fn slow_flush_raises_health_signal() {
    let stream = Arc::new(SlowFlushStream {
        inner: MemoryLogStream::new(None),
        delay: Duration::from_millis(50),
    });
    let monitor = Arc::new(IoHealthMonitor::new(Duration::from_millis(10)));
    let writer = PhysicalLogWriter::new(
        stream,
        FlushCallbackManager::new(),
        monitor.clone(),
        64 * 1024,
        WriterInit::default(),
    );

    let record = LogRecord::new(RecordBody::Barrier { last_stable_lsn: 0 });
    record.set_lsn(1);
    writer.insert_buffered_record(record).unwrap();
    writer.flush("slow").await.unwrap();

    assert_eq!(monitor.report_count(), 1);
    let stats = writer.stats();
    assert!(stats.avg_flush_latency >= Duration::from_millis(10));
}

#[tokio::test]
async fn closed_replica_rejects_new_work() {
    let dir = tempfile::tempdir().unwrap();
    let (replica, _provider, _transport) =
        open_primary(ReplicatorConfig::default(), dir.path()).await;

    replica
        .transactions()
        .begin_transaction_single_op(1, vec![], vec![], b"pre-close".to_vec())
        .await
        .unwrap();
    replica.close().await.unwrap();

    let err = replica
        .transactions()
        .begin_transaction_single_op(2, vec![], vec![], b"post-close".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReplicatorError::Closed | ReplicatorError::TransactionAborted
    ));
}
