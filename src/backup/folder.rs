// Backup folder analysis
// Restore input validation: find every backup artifact under a folder,
// order the chain full -> incrementals, and verify lineage and file
// integrity before anything destructive happens.

use super::log_file::BackupLogFile;
use super::metadata::{read_metadata_file, BackupKind, BackupMetadata};
use crate::error::{ReplicatorError, Result};
use crate::records::{Epoch, Lsn};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Well-known names inside a backup folder.
pub const BACKUP_SUBFOLDER: &str = "trbackup";
pub const LOG_SUBFOLDER: &str = "lr";
pub const STATE_SUBFOLDER: &str = "sm";
pub const BACKUP_LOG_NAME: &str = "backup.log";
pub const FULL_METADATA_NAME: &str = "backup.metadata";
pub const INCREMENTAL_METADATA_NAME: &str = "incremental.metadata";

/// One verified backup artifact.
#[derive(Debug)]
pub struct BackupArtifact {
    pub metadata: BackupMetadata,
    pub log_file: BackupLogFile,
    /// `trbackup/sm` folder with the state provider's checkpoint files
    pub state_folder: PathBuf,
}

/// A validated restore chain: one full backup plus consecutive
/// incrementals, ordered by backup LSN.
#[derive(Debug)]
pub struct BackupFolderInfo {
    pub chain: Vec<BackupArtifact>,
}

impl BackupFolderInfo {
    /// Scan `folder` recursively for backup artifacts and validate the
    /// chain end to end.
    pub fn analyze(folder: &Path) -> Result<Self> {
        Self::analyze_with_read_ahead(folder, super::log_file::DEFAULT_READ_AHEAD_BYTES)
    }

    pub fn analyze_with_read_ahead(folder: &Path, read_ahead_bytes: usize) -> Result<Self> {
        let mut artifacts = Vec::new();
        scan_for_artifacts(folder, read_ahead_bytes, &mut artifacts)?;
        if artifacts.is_empty() {
            return Err(ReplicatorError::InvalidParameter(format!(
                "no backup artifacts under {}",
                folder.display()
            )));
        }

        artifacts.sort_by_key(|a| (a.metadata.backup_lsn, a.metadata.starting_lsn));

        // Exactly one full backup, and it must be the chain head
        let full_count = artifacts
            .iter()
            .filter(|a| a.metadata.kind == BackupKind::Full)
            .count();
        if full_count == 0 {
            return Err(ReplicatorError::MissingFullBackup);
        }
        if full_count > 1 || artifacts[0].metadata.kind != BackupKind::Full {
            return Err(ReplicatorError::InvalidParameter(
                "backup folder must contain one full backup at the chain head".to_string(),
            ));
        }

        // Parent linkage across consecutive incrementals
        for window in artifacts.windows(2) {
            let (previous, next) = (&window[0], &window[1]);
            if next.metadata.kind != BackupKind::Incremental {
                return Err(ReplicatorError::InvalidParameter(
                    "unexpected second full backup in chain".to_string(),
                ));
            }
            if next.metadata.parent_backup_id != previous.metadata.backup_id {
                return Err(ReplicatorError::InvalidParameter(format!(
                    "incremental {} does not chain to {}",
                    next.metadata.backup_id, previous.metadata.backup_id
                )));
            }
        }

        info!(
            artifacts = artifacts.len(),
            highest_lsn = artifacts.last().map(|a| a.metadata.backup_lsn),
            "backup folder analyzed"
        );
        Ok(Self { chain: artifacts })
    }

    pub fn full_backup(&self) -> &BackupArtifact {
        &self.chain[0]
    }

    /// Highest epoch/LSN the chain restores to.
    pub fn highest_backed_up(&self) -> (Epoch, Lsn) {
        let last = self.chain.last().expect("chain is never empty");
        (last.metadata.backup_epoch, last.metadata.backup_lsn)
    }
}

fn scan_for_artifacts(
    folder: &Path,
    read_ahead_bytes: usize,
    out: &mut Vec<BackupArtifact>,
) -> Result<()> {
    if !folder.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if path.file_name().and_then(|n| n.to_str()) == Some(BACKUP_SUBFOLDER) {
            if let Some(artifact) = load_artifact(&path, read_ahead_bytes)? {
                out.push(artifact);
            }
        } else {
            scan_for_artifacts(&path, read_ahead_bytes, out)?;
        }
    }
    Ok(())
}

fn load_artifact(trbackup: &Path, read_ahead_bytes: usize) -> Result<Option<BackupArtifact>> {
    let metadata_path = if trbackup.join(FULL_METADATA_NAME).is_file() {
        trbackup.join(FULL_METADATA_NAME)
    } else if trbackup.join(INCREMENTAL_METADATA_NAME).is_file() {
        trbackup.join(INCREMENTAL_METADATA_NAME)
    } else {
        debug!(path = %trbackup.display(), "trbackup folder without metadata; skipped");
        return Ok(None);
    };

    let metadata = read_metadata_file(&metadata_path)?;
    let expected_kind = if metadata_path.ends_with(FULL_METADATA_NAME) {
        BackupKind::Full
    } else {
        BackupKind::Incremental
    };
    if metadata.kind != expected_kind {
        return Err(ReplicatorError::InvalidParameter(format!(
            "metadata kind mismatch in {}",
            metadata_path.display()
        )));
    }

    // Opening verifies the footer and every block checksum
    let log_file = BackupLogFile::open_with_read_ahead(
        &trbackup.join(LOG_SUBFOLDER).join(BACKUP_LOG_NAME),
        read_ahead_bytes,
    )?;

    Ok(Some(BackupArtifact {
        metadata,
        log_file,
        state_folder: trbackup.join(STATE_SUBFOLDER),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::log_file::BackupLogFileWriter;
    use crate::backup::metadata::write_metadata_file;
    use crate::records::{LogRecord, RecordBody};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn write_backup(
        root: &Path,
        name: &str,
        kind: BackupKind,
        backup_id: Uuid,
        parent: Uuid,
        lsn_range: std::ops::RangeInclusive<Lsn>,
    ) {
        let trbackup = root.join(name).join(BACKUP_SUBFOLDER);
        std::fs::create_dir_all(trbackup.join(STATE_SUBFOLDER)).unwrap();

        let mut writer = BackupLogFileWriter::create(
            &trbackup.join(LOG_SUBFOLDER).join(BACKUP_LOG_NAME),
            Epoch::new(1, 1),
        )
        .unwrap();
        for lsn in lsn_range.clone() {
            let record = LogRecord::new(RecordBody::Barrier {
                last_stable_lsn: lsn - 1,
            });
            record.set_lsn(lsn);
            record.set_psn(lsn);
            writer.write_record(&record).unwrap();
        }
        writer.finalize(Epoch::new(1, 1), *lsn_range.start()).unwrap();

        let metadata = BackupMetadata {
            kind,
            parent_backup_id: parent,
            backup_id,
            partition_id: Uuid::nil(),
            replica_id: 1,
            starting_epoch: Epoch::new(1, 1),
            starting_lsn: *lsn_range.start(),
            backup_epoch: Epoch::new(1, 1),
            backup_lsn: *lsn_range.end(),
            created_at: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };
        let file_name = match kind {
            BackupKind::Full => FULL_METADATA_NAME,
            BackupKind::Incremental => INCREMENTAL_METADATA_NAME,
        };
        write_metadata_file(&trbackup.join(file_name), &metadata).unwrap();
    }

    #[test]
    fn valid_chain_analyzes_in_order() {
        let dir = tempdir().unwrap();
        let full_id = Uuid::new_v4();
        let inc_id = Uuid::new_v4();
        write_backup(dir.path(), "002-inc", BackupKind::Incremental, inc_id, full_id, 21..=40);
        write_backup(dir.path(), "001-full", BackupKind::Full, full_id, Uuid::nil(), 1..=20);

        let info = BackupFolderInfo::analyze(dir.path()).unwrap();
        assert_eq!(info.chain.len(), 2);
        assert_eq!(info.full_backup().metadata.backup_id, full_id);
        assert_eq!(info.highest_backed_up().1, 40);
    }

    #[test]
    fn broken_parent_linkage_fails() {
        let dir = tempdir().unwrap();
        write_backup(
            dir.path(),
            "001-full",
            BackupKind::Full,
            Uuid::new_v4(),
            Uuid::nil(),
            1..=20,
        );
        write_backup(
            dir.path(),
            "002-inc",
            BackupKind::Incremental,
            Uuid::new_v4(),
            Uuid::new_v4(), // wrong parent
            21..=40,
        );

        assert!(matches!(
            BackupFolderInfo::analyze(dir.path()),
            Err(ReplicatorError::InvalidParameter(_))
        ));
    }

    #[test]
    fn incremental_without_full_fails() {
        let dir = tempdir().unwrap();
        write_backup(
            dir.path(),
            "001-inc",
            BackupKind::Incremental,
            Uuid::new_v4(),
            Uuid::new_v4(),
            21..=40,
        );
        assert!(matches!(
            BackupFolderInfo::analyze(dir.path()),
            Err(ReplicatorError::MissingFullBackup)
        ));
    }

    #[test]
    fn empty_folder_fails() {
        let dir = tempdir().unwrap();
        assert!(BackupFolderInfo::analyze(dir.path()).is_err());
    }
}
