// Backup metadata file
// Small self-describing file next to each backup's artifacts: what kind
// of backup, its lineage ids, and the epoch/LSN range it covers.
// Layout mirrors the backup log file: properties, footer, checksum.

use super::log_file::FileHandle;
use crate::error::{ReplicatorError, Result};
use crate::records::wire::Crc64;
use crate::records::{Epoch, Lsn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use uuid::Uuid;

const FOOTER_SIZE: u64 = 8 + 8 + 4;
const BACKUP_METADATA_VERSION: u32 = 1;

/// Full or incremental. On the wire the enum is stored with a +1
/// offset so zero stays an invalid marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    fn to_wire(self) -> i32 {
        match self {
            BackupKind::Full => 1,
            BackupKind::Incremental => 2,
        }
    }

    fn from_wire(value: i32) -> Result<Self> {
        match value {
            1 => Ok(BackupKind::Full),
            2 => Ok(BackupKind::Incremental),
            other => Err(ReplicatorError::Corruption(format!(
                "invalid backup option {}",
                other
            ))),
        }
    }
}

/// Everything a restore needs to know about one backup artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub kind: BackupKind,
    pub parent_backup_id: Uuid,
    pub backup_id: Uuid,
    pub partition_id: Uuid,
    pub replica_id: i64,
    pub starting_epoch: Epoch,
    pub starting_lsn: Lsn,
    pub backup_epoch: Epoch,
    pub backup_lsn: Lsn,
    /// When the backup was taken; informational, never part of chain
    /// validation
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Serializable property bag (kind carried with its wire offset).
#[derive(Debug, Serialize, Deserialize)]
struct MetadataProperties {
    option: i32,
    parent_backup_id: [u8; 16],
    backup_id: [u8; 16],
    partition_id: [u8; 16],
    replica_id: i64,
    starting_epoch: Epoch,
    starting_lsn: Lsn,
    backup_epoch: Epoch,
    backup_lsn: Lsn,
    created_at_micros: i64,
}

/// Write `metadata` to `path` with footer and checksum.
pub fn write_metadata_file(path: &Path, metadata: &BackupMetadata) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let properties = MetadataProperties {
        option: metadata.kind.to_wire(),
        parent_backup_id: *metadata.parent_backup_id.as_bytes(),
        backup_id: *metadata.backup_id.as_bytes(),
        partition_id: *metadata.partition_id.as_bytes(),
        replica_id: metadata.replica_id,
        starting_epoch: metadata.starting_epoch,
        starting_lsn: metadata.starting_lsn,
        backup_epoch: metadata.backup_epoch,
        backup_lsn: metadata.backup_lsn,
        created_at_micros: metadata.created_at.timestamp_micros(),
    };
    let properties_bytes =
        bincode::serde::encode_to_vec(&properties, bincode::config::standard())?;
    let handle = FileHandle {
        offset: 0,
        size: properties_bytes.len() as u64,
    };

    let mut body = Vec::with_capacity(properties_bytes.len() + FOOTER_SIZE as usize + 8);
    body.extend_from_slice(&properties_bytes);
    body.extend_from_slice(&handle.offset.to_le_bytes());
    body.extend_from_slice(&handle.size.to_le_bytes());
    body.extend_from_slice(&BACKUP_METADATA_VERSION.to_le_bytes());

    let mut crc = Crc64::new();
    crc.update(&body);
    body.extend_from_slice(&crc.finish().to_le_bytes());

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&body)?;
    file.sync_all()?;
    Ok(())
}

/// Read and verify a metadata file.
pub fn read_metadata_file(path: &Path) -> Result<BackupMetadata> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < FOOTER_SIZE + 8 {
        return Err(ReplicatorError::Corruption(format!(
            "backup metadata too small: {} bytes",
            len
        )));
    }

    let mut body = Vec::with_capacity(len as usize);
    file.read_to_end(&mut body)?;

    let stored = u64::from_le_bytes(
        body[body.len() - 8..]
            .try_into()
            .expect("fixed checksum width"),
    );
    let mut crc = Crc64::new();
    crc.update(&body[..body.len() - 8]);
    if crc.finish() != stored {
        return Err(ReplicatorError::Corruption(
            "backup metadata checksum mismatch".to_string(),
        ));
    }

    let footer_start = body.len() - 8 - FOOTER_SIZE as usize;
    let footer = &body[footer_start..body.len() - 8];
    let offset = u64::from_le_bytes(footer[0..8].try_into().expect("fixed"));
    let size = u64::from_le_bytes(footer[8..16].try_into().expect("fixed"));
    let version = u32::from_le_bytes(footer[16..20].try_into().expect("fixed"));
    if version != BACKUP_METADATA_VERSION {
        return Err(ReplicatorError::InvalidParameter(format!(
            "unsupported backup metadata version {}",
            version
        )));
    }
    if (offset + size) as usize > footer_start {
        return Err(ReplicatorError::Corruption(
            "backup metadata properties handle out of range".to_string(),
        ));
    }

    let (properties, _) = bincode::serde::decode_from_slice::<MetadataProperties, _>(
        &body[offset as usize..(offset + size) as usize],
        bincode::config::standard(),
    )?;

    Ok(BackupMetadata {
        kind: BackupKind::from_wire(properties.option)?,
        parent_backup_id: Uuid::from_bytes(properties.parent_backup_id),
        backup_id: Uuid::from_bytes(properties.backup_id),
        partition_id: Uuid::from_bytes(properties.partition_id),
        replica_id: properties.replica_id,
        starting_epoch: properties.starting_epoch,
        starting_lsn: properties.starting_lsn,
        backup_epoch: properties.backup_epoch,
        backup_lsn: properties.backup_lsn,
        created_at: chrono::DateTime::from_timestamp_micros(properties.created_at_micros)
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(kind: BackupKind) -> BackupMetadata {
        BackupMetadata {
            kind,
            parent_backup_id: Uuid::nil(),
            backup_id: Uuid::new_v4(),
            partition_id: Uuid::new_v4(),
            replica_id: 42,
            starting_epoch: Epoch::new(1, 1),
            starting_lsn: 0,
            backup_epoch: Epoch::new(1, 1),
            backup_lsn: 20,
            created_at: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn round_trip_full_and_incremental() {
        let dir = tempdir().unwrap();
        for kind in [BackupKind::Full, BackupKind::Incremental] {
            let path = dir.path().join(format!("{:?}.metadata", kind));
            let metadata = sample(kind);
            write_metadata_file(&path, &metadata).unwrap();
            assert_eq!(read_metadata_file(&path).unwrap(), metadata);
        }
    }

    #[test]
    fn corruption_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.metadata");
        write_metadata_file(&path, &sample(BackupKind::Full)).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[4] ^= 0x01;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            read_metadata_file(&path),
            Err(ReplicatorError::Corruption(_))
        ));
    }
}
