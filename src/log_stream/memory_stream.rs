// In-memory chunked log stream
// Fixed-size chunks addressed by (position / CHUNK_SIZE). Head/tail
// truncation drops whole chunks outside the live range. Appends span
// chunk boundaries; a fresh chunk is allocated exactly when the tail
// lands on a chunk boundary.

use super::{LogReadStream, LogStream};
use crate::error::{ReplicatorError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Chunk granularity of the in-memory store.
pub const CHUNK_SIZE: u64 = 64 * 1024;

struct Chunks {
    map: DashMap<u64, Vec<u8>>,
    max_chunks: Option<usize>,
}

impl Chunks {
    fn allocate(&self, index: u64) -> Result<()> {
        if let Some(max) = self.max_chunks {
            if self.map.len() >= max {
                return Err(ReplicatorError::OutOfCapacity(format!(
                    "memory log chunk budget of {} exhausted",
                    max
                )));
            }
        }
        self.map.insert(index, vec![0u8; CHUNK_SIZE as usize]);
        Ok(())
    }
}

/// Volatile log stream over a concurrent chunk table.
pub struct MemoryLogStream {
    chunks: Arc<Chunks>,
    head: AtomicU64,
    tail: AtomicU64,
    /// Serializes appends and truncations; reads go lock-free through
    /// the chunk table.
    write_lock: Mutex<()>,
}

impl MemoryLogStream {
    pub fn new(max_chunks: Option<usize>) -> Self {
        let chunks = Arc::new(Chunks {
            map: DashMap::new(),
            max_chunks,
        });
        chunks.map.insert(0, vec![0u8; CHUNK_SIZE as usize]);
        Self {
            chunks,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    fn copy_into_tail_chunk(&self, tail: u64, data: &[u8]) {
        let index = tail / CHUNK_SIZE;
        let offset = (tail % CHUNK_SIZE) as usize;
        let mut chunk = self
            .chunks
            .map
            .get_mut(&index)
            .expect("tail chunk must exist");
        chunk[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Advance the tail, allocating the next chunk when the new tail
    /// lands on a chunk boundary.
    fn update_tail(&self, append_size: u64) -> Result<()> {
        let tail = self.tail.load(Ordering::SeqCst) + append_size;
        self.tail.store(tail, Ordering::SeqCst);
        if tail % CHUNK_SIZE == 0 {
            self.chunks.allocate(tail / CHUNK_SIZE)?;
        }
        Ok(())
    }
}

#[async_trait]
impl LogStream for MemoryLogStream {
    async fn append(&self, data: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut remaining = data;
        while !remaining.is_empty() {
            let tail = self.tail.load(Ordering::SeqCst);
            let room_in_chunk = CHUNK_SIZE - (tail % CHUNK_SIZE);
            let take = remaining.len().min(room_in_chunk as usize);
            self.copy_into_tail_chunk(tail, &remaining[..take]);
            self.update_tail(take as u64)?;
            remaining = &remaining[take..];
        }
        Ok(())
    }

    async fn flush_with_marker(&self) -> Result<()> {
        // Nothing buffered beyond the chunk table
        Ok(())
    }

    async fn truncate_head(&self, offset: u64) -> Result<()> {
        let _guard = self.write_lock.lock();
        let head = self.head.load(Ordering::SeqCst);
        let tail = self.tail.load(Ordering::SeqCst);
        if offset < head || offset > tail {
            // Best effort: duplicate or stale request
            return Ok(());
        }

        let first_live_chunk = offset / CHUNK_SIZE;
        let mut index = head / CHUNK_SIZE;
        while index < first_live_chunk {
            self.chunks.map.remove(&index);
            index += 1;
        }
        self.head.store(offset, Ordering::SeqCst);
        Ok(())
    }

    async fn truncate_tail(&self, offset: u64) -> Result<()> {
        let _guard = self.write_lock.lock();
        let head = self.head.load(Ordering::SeqCst);
        let tail = self.tail.load(Ordering::SeqCst);
        if offset < head || offset > tail {
            return Ok(());
        }

        let last_live_chunk = offset / CHUNK_SIZE;
        let mut index = tail / CHUNK_SIZE;
        while index > last_live_chunk {
            self.chunks.map.remove(&index);
            index -= 1;
        }
        self.tail.store(offset, Ordering::SeqCst);
        // The tail chunk may have been dropped when offset sits exactly
        // on a chunk boundary; the next append expects it present.
        if !self.chunks.map.contains_key(&last_live_chunk) {
            self.chunks.allocate(last_live_chunk)?;
        }
        Ok(())
    }

    fn read_stream(&self, at: u64) -> Result<Box<dyn LogReadStream>> {
        let head = self.head.load(Ordering::SeqCst);
        let tail = self.tail.load(Ordering::SeqCst);
        if at < head {
            return Err(ReplicatorError::Corruption(format!(
                "read at {} below log head {}",
                at, head
            )));
        }
        Ok(Box::new(MemoryReadStream {
            chunks: self.chunks.clone(),
            position: at,
            tail,
        }))
    }

    fn write_position(&self) -> u64 {
        self.tail.load(Ordering::SeqCst)
    }

    fn head_position(&self) -> u64 {
        self.head.load(Ordering::SeqCst)
    }

    fn length(&self) -> u64 {
        self.tail.load(Ordering::SeqCst) - self.head.load(Ordering::SeqCst)
    }
}

struct MemoryReadStream {
    chunks: Arc<Chunks>,
    position: u64,
    /// Tail captured at reader creation; reads never see later appends
    tail: u64,
}

impl Read for MemoryReadStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.position >= self.tail || buf.is_empty() {
            return Ok(0);
        }

        let available = (self.tail - self.position).min(buf.len() as u64) as usize;
        let mut copied = 0;
        while copied < available {
            let index = self.position / CHUNK_SIZE;
            let offset = (self.position % CHUNK_SIZE) as usize;
            let take = (available - copied).min(CHUNK_SIZE as usize - offset);

            let chunk = self.chunks.map.get(&index).ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("log chunk {} truncated away during read", index),
                )
            })?;
            buf[copied..copied + take].copy_from_slice(&chunk[offset..offset + take]);

            copied += take;
            self.position += take as u64;
        }
        Ok(copied)
    }
}

impl LogReadStream for MemoryReadStream {
    fn position(&self) -> u64 {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_spans_chunk_boundaries() {
        let stream = MemoryLogStream::new(None);
        let data = vec![7u8; (CHUNK_SIZE + 100) as usize];
        stream.append(&data).await.unwrap();

        assert_eq!(stream.write_position(), CHUNK_SIZE + 100);
        assert_eq!(stream.length(), CHUNK_SIZE + 100);

        let mut reader = stream.read_stream(0).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn chunk_allocated_exactly_at_boundary() {
        let stream = MemoryLogStream::new(None);
        stream
            .append(&vec![1u8; CHUNK_SIZE as usize])
            .await
            .unwrap();
        // Chunks 0 and 1 exist; the next append goes into chunk 1
        assert_eq!(stream.chunks.map.len(), 2);
        stream.append(&[2u8]).await.unwrap();
        assert_eq!(stream.chunks.map.len(), 2);
    }

    #[tokio::test]
    async fn head_truncation_drops_chunks_and_is_best_effort() {
        let stream = MemoryLogStream::new(None);
        stream
            .append(&vec![3u8; (3 * CHUNK_SIZE) as usize])
            .await
            .unwrap();

        stream.truncate_head(2 * CHUNK_SIZE + 10).await.unwrap();
        assert_eq!(stream.head_position(), 2 * CHUNK_SIZE + 10);
        assert!(!stream.chunks.map.contains_key(&0));
        assert!(!stream.chunks.map.contains_key(&1));

        // Duplicate/stale offsets are accepted and ignored
        stream.truncate_head(10).await.unwrap();
        assert_eq!(stream.head_position(), 2 * CHUNK_SIZE + 10);

        assert!(stream.read_stream(0).is_err());
    }

    #[tokio::test]
    async fn tail_truncation_reopens_boundary_chunk() {
        let stream = MemoryLogStream::new(None);
        stream
            .append(&vec![4u8; (2 * CHUNK_SIZE) as usize])
            .await
            .unwrap();

        stream.truncate_tail(CHUNK_SIZE).await.unwrap();
        assert_eq!(stream.write_position(), CHUNK_SIZE);

        // Appends after a boundary truncation still land correctly
        stream.append(&[9u8; 16]).await.unwrap();
        assert_eq!(stream.write_position(), CHUNK_SIZE + 16);
    }

    #[tokio::test]
    async fn reader_clamps_at_snapshot_tail() {
        let stream = MemoryLogStream::new(None);
        stream.append(&[1, 2, 3, 4]).await.unwrap();

        let mut reader = stream.read_stream(0).unwrap();
        stream.append(&[5, 6]).await.unwrap();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn chunk_budget_reports_out_of_capacity() {
        let stream = MemoryLogStream::new(Some(2));
        stream
            .append(&vec![0u8; CHUNK_SIZE as usize])
            .await
            .unwrap();
        // Chunk 1 was allocated at the boundary; the next boundary fails
        let err = stream
            .append(&vec![0u8; CHUNK_SIZE as usize])
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicatorError::OutOfCapacity(_)));
    }
}
