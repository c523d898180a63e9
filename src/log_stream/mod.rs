// Log stream abstraction
// An append-only byte stream with head/tail truncation and positional
// reads. Two interchangeable backings: a sparse file where head
// truncation punches holes, and an in-memory chunked store.

mod file_stream;
mod memory_stream;

pub use file_stream::FileLogStream;
pub use memory_stream::{MemoryLogStream, CHUNK_SIZE};

use crate::error::Result;
use async_trait::async_trait;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

/// Positional reader over a snapshot of the currently-valid byte range.
///
/// Reads clamp at the stream tail (clean EOF); reads that start below the
/// stream head fail with `Corruption` since those bytes are gone.
pub trait LogReadStream: Read + Send {
    /// Next byte offset this reader will return.
    fn position(&self) -> u64;
}

/// Append-only byte stream backing the physical log.
#[async_trait]
pub trait LogStream: Send + Sync {
    /// Append bytes at the write position, preserving call order.
    async fn append(&self, data: &[u8]) -> Result<()>;

    /// All bytes appended before this call are durable on return.
    async fn flush_with_marker(&self) -> Result<()>;

    /// Forget bytes below `offset`. Best-effort idempotent: offsets
    /// outside [head, tail] are accepted and ignored.
    async fn truncate_head(&self, offset: u64) -> Result<()>;

    /// Shrink the stream to `offset`. Idempotent for head <= offset <= tail.
    async fn truncate_tail(&self, offset: u64) -> Result<()>;

    /// Positional reader starting at byte offset `at`.
    fn read_stream(&self, at: u64) -> Result<Box<dyn LogReadStream>>;

    /// Offset at which the next append lands.
    fn write_position(&self) -> u64;

    /// Offset of the oldest live byte.
    fn head_position(&self) -> u64;

    /// Live byte count (tail - head).
    fn length(&self) -> u64;
}

/// Which backing store a replica's log uses.
///
/// The file store is the production default; the in-memory store serves
/// volatile replicas and tests, with an optional chunk budget that turns
/// allocation failures into `OutOfCapacity`.
#[derive(Debug, Clone)]
pub enum LogStoreKind {
    File { path: PathBuf },
    InMemory { max_chunks: Option<usize> },
}

/// Build a log stream for the configured backing.
pub fn create_log_stream(kind: &LogStoreKind) -> Result<Arc<dyn LogStream>> {
    match kind {
        LogStoreKind::File { path } => Ok(Arc::new(FileLogStream::open(path)?)),
        LogStoreKind::InMemory { max_chunks } => {
            Ok(Arc::new(MemoryLogStream::new(*max_chunks)))
        }
    }
}
