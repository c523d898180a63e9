// Backup log file
// Self-describing container for a range of log records:
// [ blocks... | properties | footer | crc64 ]
// Each block is (size:u32, framed records..., crc64:u64); blocks close
// at the intermediate flush size or the u32 cap. The footer pins the
// properties handle so a reader can navigate from the file tail.

use crate::error::{ReplicatorError, Result};
use crate::records::wire::{self, Crc64, RecordFrame};
use crate::records::{Epoch, Lsn, RecordRef};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Close the current block once this much record data is buffered.
pub const MIN_INTERMEDIATE_BLOCK_SIZE: usize = 32 * 1024;
/// A block's size prefix is a u32; no block may exceed this.
pub const MAX_BLOCK_SIZE: u64 = u32::MAX as u64;

/// Fixed-size footer: properties offset, properties size, version.
const FOOTER_SIZE: u64 = 8 + 8 + 4;
const BACKUP_LOG_VERSION: u32 = 1;

/// Byte range of a section within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FileHandle {
    pub offset: u64,
    pub size: u64,
}

/// Trailing properties of a backup log file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BackupLogProperties {
    pub record_block_handle: FileHandle,
    pub record_count: u64,
    pub indexing_record_epoch: Epoch,
    pub indexing_record_lsn: Lsn,
    pub last_backed_up_epoch: Epoch,
    pub last_backed_up_lsn: Lsn,
}

impl BackupLogProperties {
    /// Properties serialize as key/value pairs with length-prefixed
    /// values so unknown keys stay skippable across versions.
    fn to_pairs(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let config = bincode::config::standard();
        Ok(vec![
            (
                "record_block_handle".to_string(),
                bincode::serde::encode_to_vec(self.record_block_handle, config)?,
            ),
            (
                "record_count".to_string(),
                bincode::serde::encode_to_vec(self.record_count, config)?,
            ),
            (
                "indexing_record_epoch".to_string(),
                bincode::serde::encode_to_vec(self.indexing_record_epoch, config)?,
            ),
            (
                "indexing_record_lsn".to_string(),
                bincode::serde::encode_to_vec(self.indexing_record_lsn, config)?,
            ),
            (
                "last_backed_up_epoch".to_string(),
                bincode::serde::encode_to_vec(self.last_backed_up_epoch, config)?,
            ),
            (
                "last_backed_up_lsn".to_string(),
                bincode::serde::encode_to_vec(self.last_backed_up_lsn, config)?,
            ),
        ])
    }

    fn from_pairs(pairs: Vec<(String, Vec<u8>)>) -> Result<Self> {
        let config = bincode::config::standard();
        let mut properties = BackupLogProperties::default();
        for (key, value) in pairs {
            match key.as_str() {
                "record_block_handle" => {
                    properties.record_block_handle =
                        bincode::serde::decode_from_slice(&value, config)?.0;
                }
                "record_count" => {
                    properties.record_count = bincode::serde::decode_from_slice(&value, config)?.0;
                }
                "indexing_record_epoch" => {
                    properties.indexing_record_epoch =
                        bincode::serde::decode_from_slice(&value, config)?.0;
                }
                "indexing_record_lsn" => {
                    properties.indexing_record_lsn =
                        bincode::serde::decode_from_slice(&value, config)?.0;
                }
                "last_backed_up_epoch" => {
                    properties.last_backed_up_epoch =
                        bincode::serde::decode_from_slice(&value, config)?.0;
                }
                "last_backed_up_lsn" => {
                    properties.last_backed_up_lsn =
                        bincode::serde::decode_from_slice(&value, config)?.0;
                }
                _ => debug!(key, "ignoring unknown backup log property"),
            }
        }
        Ok(properties)
    }
}

/// Streaming writer for a backup log file.
pub struct BackupLogFileWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    current_block: Vec<u8>,
    blocks_written_bytes: u64,
    record_count: u64,
    first_record: Option<(Epoch, Lsn)>,
    last_record: Option<(Epoch, Lsn)>,
    running_epoch: Epoch,
}

impl BackupLogFileWriter {
    pub fn create(path: &Path, starting_epoch: Epoch) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            current_block: Vec::with_capacity(MIN_INTERMEDIATE_BLOCK_SIZE),
            blocks_written_bytes: 0,
            record_count: 0,
            first_record: None,
            last_record: None,
            running_epoch: starting_epoch,
        })
    }

    /// Append one record to the file, closing the current block when it
    /// reaches the flush size.
    pub fn write_record(&mut self, record: &RecordRef) -> Result<()> {
        if let crate::records::RecordBody::UpdateEpoch { epoch, .. } = record.body() {
            if *epoch > self.running_epoch {
                self.running_epoch = *epoch;
            }
        }

        let frame = wire::encode_record(record)?;
        if self.current_block.len() + frame.len() > MAX_BLOCK_SIZE as usize {
            self.close_block()?;
        }
        self.current_block.extend_from_slice(&frame);
        self.record_count += 1;

        let stamp = (self.running_epoch, record.lsn());
        if self.first_record.is_none() {
            self.first_record = Some(stamp);
        }
        self.last_record = Some(stamp);

        if self.current_block.len() >= MIN_INTERMEDIATE_BLOCK_SIZE {
            self.close_block()?;
        }
        Ok(())
    }

    fn close_block(&mut self) -> Result<()> {
        if self.current_block.is_empty() {
            return Ok(());
        }
        let size = self.current_block.len() as u32;
        let mut crc = Crc64::new();
        crc.update(&size.to_le_bytes());
        crc.update(&self.current_block);

        self.writer.write_all(&size.to_le_bytes())?;
        self.writer.write_all(&self.current_block)?;
        self.writer.write_all(&crc.finish().to_le_bytes())?;
        self.blocks_written_bytes += 4 + self.current_block.len() as u64 + 8;
        self.current_block.clear();
        Ok(())
    }

    /// Close the record section and write properties, footer, and the
    /// terminating checksum. Returns the final properties.
    pub fn finalize(
        mut self,
        indexing_record_epoch: Epoch,
        indexing_record_lsn: Lsn,
    ) -> Result<BackupLogProperties> {
        self.close_block()?;

        let (last_epoch, last_lsn) = self.last_record.unwrap_or((indexing_record_epoch, 0));
        let properties = BackupLogProperties {
            record_block_handle: FileHandle {
                offset: 0,
                size: self.blocks_written_bytes,
            },
            record_count: self.record_count,
            indexing_record_epoch,
            indexing_record_lsn,
            last_backed_up_epoch: last_epoch,
            last_backed_up_lsn: last_lsn,
        };

        let properties_bytes = bincode::serde::encode_to_vec(
            properties.to_pairs()?,
            bincode::config::standard(),
        )?;
        let properties_handle = FileHandle {
            offset: self.blocks_written_bytes,
            size: properties_bytes.len() as u64,
        };
        self.writer.write_all(&properties_bytes)?;

        self.writer.write_all(&properties_handle.offset.to_le_bytes())?;
        self.writer.write_all(&properties_handle.size.to_le_bytes())?;
        self.writer.write_all(&BACKUP_LOG_VERSION.to_le_bytes())?;
        self.writer.flush()?;

        // Terminating checksum covers everything before it
        let mut file = self.writer.into_inner().map_err(|e| {
            ReplicatorError::IoError(format!("backup log flush failed: {}", e))
        })?;
        file.sync_all()?;
        let checksum = checksum_file_prefix(&self.path, None)?;
        file.seek(SeekFrom::End(0))?;
        file.write_all(&checksum.to_le_bytes())?;
        file.sync_all()?;

        debug!(
            path = %self.path.display(),
            records = properties.record_count,
            "backup log file written"
        );
        Ok(properties)
    }
}

fn checksum_file_prefix(path: &Path, length: Option<u64>) -> Result<u64> {
    let file = File::open(path)?;
    let limit = length.unwrap_or(file.metadata()?.len());
    let mut reader = BufReader::new(file).take(limit);
    let mut crc = Crc64::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        crc.update(&buffer[..read]);
    }
    Ok(crc.finish())
}

/// Default read-ahead when the operator has not tuned it.
pub const DEFAULT_READ_AHEAD_BYTES: usize = 1024 * 1024;

/// Read-side view of a backup log file.
#[derive(Debug)]
pub struct BackupLogFile {
    path: PathBuf,
    read_ahead_bytes: usize,
    pub properties: BackupLogProperties,
}

impl BackupLogFile {
    /// Open with the default read-ahead.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_read_ahead(path, DEFAULT_READ_AHEAD_BYTES)
    }

    /// Open and verify: footer, terminating checksum, then every block's
    /// CRC. Corrupt files never yield records.
    pub fn open_with_read_ahead(path: &Path, read_ahead_bytes: usize) -> Result<Self> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < FOOTER_SIZE + 8 {
            return Err(ReplicatorError::Corruption(format!(
                "backup log too small: {} bytes",
                len
            )));
        }

        // Terminating checksum
        let mut trailer = [0u8; 8];
        file.seek(SeekFrom::End(-8))?;
        file.read_exact(&mut trailer)?;
        let stored = u64::from_le_bytes(trailer);
        let computed = checksum_file_prefix(path, Some(len - 8))?;
        if stored != computed {
            return Err(ReplicatorError::Corruption(
                "backup log checksum mismatch".to_string(),
            ));
        }

        // Footer
        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.seek(SeekFrom::End(-8 - FOOTER_SIZE as i64))?;
        file.read_exact(&mut footer)?;
        let properties_offset = u64::from_le_bytes(footer[0..8].try_into().expect("fixed"));
        let properties_size = u64::from_le_bytes(footer[8..16].try_into().expect("fixed"));
        let version = u32::from_le_bytes(footer[16..20].try_into().expect("fixed"));
        if version != BACKUP_LOG_VERSION {
            return Err(ReplicatorError::InvalidParameter(format!(
                "unsupported backup log version {}",
                version
            )));
        }
        if properties_offset + properties_size > len {
            return Err(ReplicatorError::Corruption(
                "backup log properties handle out of range".to_string(),
            ));
        }

        // Properties
        let mut properties_bytes = vec![0u8; properties_size as usize];
        file.seek(SeekFrom::Start(properties_offset))?;
        file.read_exact(&mut properties_bytes)?;
        let (pairs, _) = bincode::serde::decode_from_slice::<Vec<(String, Vec<u8>)>, _>(
            &properties_bytes,
            bincode::config::standard(),
        )?;
        let properties = BackupLogProperties::from_pairs(pairs)?;

        let backup_log = Self {
            path: path.to_path_buf(),
            read_ahead_bytes: read_ahead_bytes.max(4 * 1024),
            properties,
        };
        // Full block verification up front: restore must never start
        // from a half-good file
        backup_log.read_records()?;
        Ok(backup_log)
    }

    /// Iterate every record, verifying block checksums.
    pub fn read_records(&self) -> Result<Vec<RecordFrame>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.properties.record_block_handle.offset))?;
        let mut reader = BufReader::with_capacity(self.read_ahead_bytes, file)
            .take(self.properties.record_block_handle.size);

        let mut frames = Vec::with_capacity(self.properties.record_count as usize);
        loop {
            let mut size_bytes = [0u8; 4];
            match reader.read_exact(&mut size_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let block_size = u32::from_le_bytes(size_bytes) as usize;
            let mut block = vec![0u8; block_size + 8];
            reader.read_exact(&mut block)?;

            let stored = u64::from_le_bytes(
                block[block_size..].try_into().expect("fixed trailer"),
            );
            let mut crc = Crc64::new();
            crc.update(&size_bytes);
            crc.update(&block[..block_size]);
            if crc.finish() != stored {
                return Err(ReplicatorError::Corruption(
                    "backup log block checksum mismatch".to_string(),
                ));
            }

            let mut offset = 0;
            while offset < block_size {
                let (frame, used) = wire::decode_record(&block[offset..block_size])?;
                frames.push(frame);
                offset += used;
            }
        }

        if frames.len() as u64 != self.properties.record_count {
            return Err(ReplicatorError::Corruption(format!(
                "backup log record count mismatch: {} read, {} declared",
                frames.len(),
                self.properties.record_count
            )));
        }
        Ok(frames)
    }
}
