// Flush callback manager
// Serializes "logged" notifications out of flush completion. A single
// worker drains batches in flush order and hands each to the registered
// processor; without a processor, batches self-complete.

use crate::error::ReplicatorError;
use crate::records::RecordRef;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// The records of one flush, plus the flush outcome. A failed flush
/// fails every record of the batch; there is no partial success.
pub struct LoggedBatch {
    pub records: Vec<RecordRef>,
    pub error: Option<ReplicatorError>,
}

impl LoggedBatch {
    pub fn succeeded(records: Vec<RecordRef>) -> Self {
        Self {
            records,
            error: None,
        }
    }

    pub fn failed(records: Vec<RecordRef>, error: ReplicatorError) -> Self {
        Self {
            records,
            error: Some(error),
        }
    }

    /// Complete the flushed stage of every record with the batch outcome.
    pub fn complete_flush(&self) {
        for record in &self.records {
            match &self.error {
                None => record.flushed().complete(Ok(())),
                Some(error) => record.flushed().complete(Err(error.clone())),
            };
        }
    }
}

impl std::fmt::Debug for LoggedBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggedBatch")
            .field("records", &self.records.len())
            .field("error", &self.error)
            .finish()
    }
}

/// Downstream consumer of flushed batches (the operation processor).
/// Implementations must call `completed_flush` (via
/// `LoggedBatch::complete_flush` or per record) for every record.
#[async_trait]
pub trait FlushProcessor: Send + Sync {
    async fn process_logged_records(&self, batch: LoggedBatch);
}

/// Dispatches flush notifications on a dedicated worker so stream I/O is
/// never blocked behind apply work.
pub struct FlushCallbackManager {
    sender: mpsc::UnboundedSender<LoggedBatch>,
    processor: Arc<RwLock<Option<Arc<dyn FlushProcessor>>>>,
}

impl FlushCallbackManager {
    /// Must be created inside a tokio runtime: spawns the drain worker.
    pub fn new() -> Arc<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<LoggedBatch>();
        let processor: Arc<RwLock<Option<Arc<dyn FlushProcessor>>>> =
            Arc::new(RwLock::new(None));

        let worker_processor = processor.clone();
        tokio::spawn(async move {
            while let Some(batch) = receiver.recv().await {
                let current = worker_processor.read().clone();
                match current {
                    Some(processor) => processor.process_logged_records(batch).await,
                    None => batch.complete_flush(),
                }
            }
            debug!("flush callback worker drained");
        });

        Arc::new(Self { sender, processor })
    }

    /// Register the processor that receives every subsequent batch.
    pub fn set_processor(&self, processor: Arc<dyn FlushProcessor>) {
        *self.processor.write() = Some(processor);
    }

    /// Queue a batch for dispatch. Batches are processed in queue order.
    pub fn notify(&self, batch: LoggedBatch) {
        if self.sender.send(batch).is_err() {
            debug!("flush callback worker gone; batch dropped after completion");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{LogRecord, RecordBody};

    #[tokio::test]
    async fn batches_complete_without_processor() {
        let manager = FlushCallbackManager::new();
        let record = LogRecord::new(RecordBody::TruncateTail);
        manager.notify(LoggedBatch::succeeded(vec![record.clone()]));
        record.flushed().wait().await.unwrap();
    }

    #[tokio::test]
    async fn failed_batch_fails_every_record() {
        let manager = FlushCallbackManager::new();
        let a = LogRecord::new(RecordBody::TruncateTail);
        let b = LogRecord::new(RecordBody::CompleteCheckpoint);
        manager.notify(LoggedBatch::failed(
            vec![a.clone(), b.clone()],
            ReplicatorError::Closed,
        ));
        assert!(a.flushed().wait().await.is_err());
        assert!(b.flushed().wait().await.is_err());
    }

    #[tokio::test]
    async fn processor_receives_batches_in_order() {
        use parking_lot::Mutex;

        struct Recording {
            seen: Mutex<Vec<usize>>,
        }

        #[async_trait]
        impl FlushProcessor for Recording {
            async fn process_logged_records(&self, batch: LoggedBatch) {
                self.seen.lock().push(batch.records.len());
                batch.complete_flush();
            }
        }

        let manager = FlushCallbackManager::new();
        let recording = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
        });
        manager.set_processor(recording.clone());

        let one = LogRecord::new(RecordBody::TruncateTail);
        let two_a = LogRecord::new(RecordBody::TruncateTail);
        let two_b = LogRecord::new(RecordBody::CompleteCheckpoint);
        manager.notify(LoggedBatch::succeeded(vec![one.clone()]));
        manager.notify(LoggedBatch::succeeded(vec![two_a, two_b.clone()]));

        one.flushed().wait().await.unwrap();
        two_b.flushed().wait().await.unwrap();
        assert_eq!(*recording.seen.lock(), vec![1, 2]);
    }
}
