// Sparse-file backed log stream
// Appends go through a buffered writer; flush syncs to disk. Head
// truncation punches a hole over the dead range (best effort) so the
// file stays sparse; tail truncation shrinks the file.

use super::{LogReadStream, LogStream};
use crate::error::{ReplicatorError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Durable log stream over a single sparse file.
pub struct FileLogStream {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    head: AtomicU64,
    tail: AtomicU64,
}

impl FileLogStream {
    /// Open (or create) the backing file. An existing file re-opens with
    /// its full length as the tail and the head restored from the
    /// sidecar head marker (punched holes read back as zeros, so the
    /// head offset must survive restarts on its own).
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let tail = file.metadata()?.len();
        let head = Self::read_head_marker(path).min(tail);

        debug!(path = %path.display(), head, tail, "opened log file");

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
            head: AtomicU64::new(head),
            tail: AtomicU64::new(tail),
        })
    }

    fn head_marker_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(".head");
        PathBuf::from(name)
    }

    fn read_head_marker(path: &Path) -> u64 {
        match std::fs::read(Self::head_marker_path(path)) {
            Ok(bytes) if bytes.len() == 8 => {
                u64::from_le_bytes(bytes.try_into().unwrap_or([0u8; 8]))
            }
            _ => 0,
        }
    }

    fn write_head_marker(&self, head: u64) {
        let _ = std::fs::write(Self::head_marker_path(&self.path), head.to_le_bytes());
    }

    #[cfg(unix)]
    fn punch_hole(file: &File, offset: u64, length: u64) {
        use std::os::unix::io::AsRawFd;
        // Best effort: not every filesystem supports hole punching, and
        // a dense dead range is only a space concern, not a correctness one.
        unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                length as libc::off_t,
            );
        }
    }

    #[cfg(not(unix))]
    fn punch_hole(_file: &File, _offset: u64, _length: u64) {}
}

#[async_trait]
impl LogStream for FileLogStream {
    async fn append(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(data)?;
        self.tail.fetch_add(data.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn flush_with_marker(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    async fn truncate_head(&self, offset: u64) -> Result<()> {
        let head = self.head.load(Ordering::SeqCst);
        let tail = self.tail.load(Ordering::SeqCst);
        if offset < head || offset > tail {
            // Best effort: duplicate or stale request
            return Ok(());
        }

        {
            let writer = self.writer.lock();
            Self::punch_hole(writer.get_ref(), head, offset - head);
        }
        self.head.store(offset, Ordering::SeqCst);
        self.write_head_marker(offset);
        debug!(offset, "log head truncated");
        Ok(())
    }

    async fn truncate_tail(&self, offset: u64) -> Result<()> {
        let head = self.head.load(Ordering::SeqCst);
        let tail = self.tail.load(Ordering::SeqCst);
        if offset < head || offset > tail {
            return Ok(());
        }

        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().set_len(offset)?;
        writer.get_ref().sync_all()?;
        writer.seek(SeekFrom::End(0))?;
        self.tail.store(offset, Ordering::SeqCst);
        debug!(offset, "log tail truncated");
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

        // Flush buffered appends so the reader sees everything up to tail
        {
            let mut writer = self.writer.lock();
            writer.flush()?;
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(at))?;
        Ok(Box::new(FileReadStream {
            reader: BufReader::new(file),
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

struct FileReadStream {
    reader: BufReader<File>,
    position: u64,
    /// Tail captured at reader creation; later appends are invisible
    tail: u64,
}

impl Read for FileReadStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.position >= self.tail || buf.is_empty() {
            return Ok(0);
        }
        let available = (self.tail - self.position).min(buf.len() as u64) as usize;
        let read = self.reader.read(&mut buf[..available])?;
        self.position += read as u64;
        Ok(read)
    }
}

impl LogReadStream for FileReadStream {
    fn position(&self) -> u64 {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn append_flush_read_round_trip() {
        let dir = tempdir().unwrap();
        let stream = FileLogStream::open(&dir.path().join("replica.log")).unwrap();

        stream.append(b"hello ").await.unwrap();
        stream.append(b"log").await.unwrap();
        stream.flush_with_marker().await.unwrap();

        assert_eq!(stream.write_position(), 9);

        let mut reader = stream.read_stream(6).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"log");
    }

    #[tokio::test]
    async fn reopen_restores_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replica.log");
        {
            let stream = FileLogStream::open(&path).unwrap();
            stream.append(&[1, 2, 3, 4, 5]).await.unwrap();
            stream.flush_with_marker().await.unwrap();
        }
        let reopened = FileLogStream::open(&path).unwrap();
        assert_eq!(reopened.write_position(), 5);
    }

    #[tokio::test]
    async fn tail_truncation_shrinks_and_allows_append() {
        let dir = tempdir().unwrap();
        let stream = FileLogStream::open(&dir.path().join("replica.log")).unwrap();

        stream.append(&[1, 2, 3, 4, 5, 6, 7, 8]).await.unwrap();
        stream.truncate_tail(4).await.unwrap();
        assert_eq!(stream.write_position(), 4);

        stream.append(&[9, 9]).await.unwrap();
        stream.flush_with_marker().await.unwrap();

        let mut reader = stream.read_stream(0).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 9, 9]);
    }

    #[tokio::test]
    async fn head_truncation_is_idempotent_and_guards_reads() {
        let dir = tempdir().unwrap();
        let stream = FileLogStream::open(&dir.path().join("replica.log")).unwrap();

        stream.append(&vec![0u8; 1024]).await.unwrap();
        stream.flush_with_marker().await.unwrap();

        stream.truncate_head(512).await.unwrap();
        stream.truncate_head(100).await.unwrap(); // stale, ignored
        assert_eq!(stream.head_position(), 512);
        assert_eq!(stream.length(), 512);

        assert!(stream.read_stream(511).is_err());
        assert!(stream.read_stream(512).is_ok());
    }
}
