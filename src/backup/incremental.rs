// Incremental backup record filter
// Walks a record stream and keeps only what an incremental backup must
// carry: logical records beyond the previous highest-backed-up LSN,
// plus at most one UpdateEpoch at the boundary when the epoch actually
// changed.

use crate::records::{Epoch, Lsn, RecordBody, RecordRef};

/// Filter over records already read from the log, in log order.
pub struct IncrementalBackupRecords {
    previous_highest_backed_up_lsn: Lsn,
    previous_highest_backed_up_epoch: Epoch,
    /// Epoch/LSN of the first record this filter accepted
    starting_point: Option<(Epoch, Lsn)>,
    /// Highest epoch observed across accepted records
    highest_backed_up_epoch: Epoch,
    boundary_update_epoch_kept: bool,
}

impl IncrementalBackupRecords {
    pub fn new(previous_highest_backed_up_epoch: Epoch, previous_highest_backed_up_lsn: Lsn) -> Self {
        Self {
            previous_highest_backed_up_lsn,
            previous_highest_backed_up_epoch,
            starting_point: None,
            highest_backed_up_epoch: previous_highest_backed_up_epoch,
            boundary_update_epoch_kept: false,
        }
    }

    /// Decide whether `record` belongs in the incremental backup.
    pub fn accepts(&mut self, record: &RecordRef) -> bool {
        if !record.kind().is_logical() {
            return false;
        }

        let accepted = if record.lsn() > self.previous_highest_backed_up_lsn {
            true
        } else {
            // At or below the boundary only a single epoch change
            // survives, and only if it differs from what the previous
            // backup already covers
            match record.body() {
                RecordBody::UpdateEpoch { epoch, .. } => {
                    let keep = !self.boundary_update_epoch_kept
                        && *epoch != self.previous_highest_backed_up_epoch;
                    if keep {
                        self.boundary_update_epoch_kept = true;
                    }
                    keep
                }
                _ => false,
            }
        };

        if accepted {
            if let RecordBody::UpdateEpoch { epoch, .. } = record.body() {
                if *epoch > self.highest_backed_up_epoch {
                    self.highest_backed_up_epoch = *epoch;
                }
            }
            if self.starting_point.is_none() {
                self.starting_point = Some((self.highest_backed_up_epoch, record.lsn()));
            }
        }
        accepted
    }

    /// Epoch/LSN of the first accepted record.
    pub fn starting_point(&self) -> Option<(Epoch, Lsn)> {
        self.starting_point
    }

    pub fn highest_backed_up_epoch(&self) -> Epoch {
        self.highest_backed_up_epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{LogRecord, TxId};

    fn end_tx(tx_id: TxId, lsn: Lsn) -> RecordRef {
        let record = LogRecord::new(RecordBody::EndTx {
            tx_id,
            committed: true,
        });
        record.set_lsn(lsn);
        record
    }

    fn update_epoch(epoch: Epoch, lsn: Lsn) -> RecordRef {
        let record = LogRecord::new(RecordBody::UpdateEpoch {
            epoch,
            primary_replica_id: 1,
        });
        record.set_lsn(lsn);
        record
    }

    fn indexing(lsn: Lsn) -> RecordRef {
        let record = LogRecord::new(RecordBody::Indexing {
            current_epoch: Epoch::new(1, 1),
        });
        record.set_lsn(lsn);
        record
    }

    #[test]
    fn skips_physical_and_already_backed_up_records() {
        let mut filter = IncrementalBackupRecords::new(Epoch::new(1, 1), 20);
        assert!(!filter.accepts(&indexing(25)));
        assert!(!filter.accepts(&end_tx(1, 15)));
        assert!(filter.accepts(&end_tx(2, 21)));
        assert_eq!(filter.starting_point(), Some((Epoch::new(1, 1), 21)));
    }

    #[test]
    fn boundary_update_epoch_kept_once_when_changed() {
        let mut filter = IncrementalBackupRecords::new(Epoch::new(1, 1), 20);
        // Same epoch as previous backup: dropped
        assert!(!filter.accepts(&update_epoch(Epoch::new(1, 1), 18)));
        // Different epoch at the boundary: kept once
        assert!(filter.accepts(&update_epoch(Epoch::new(2, 2), 19)));
        assert!(!filter.accepts(&update_epoch(Epoch::new(3, 3), 19)));
        assert_eq!(filter.highest_backed_up_epoch(), Epoch::new(2, 2));
    }

    #[test]
    fn epoch_tracks_accepted_updates_past_boundary() {
        let mut filter = IncrementalBackupRecords::new(Epoch::new(1, 1), 20);
        assert!(filter.accepts(&end_tx(1, 21)));
        assert!(filter.accepts(&update_epoch(Epoch::new(2, 5), 22)));
        assert_eq!(filter.highest_backed_up_epoch(), Epoch::new(2, 5));
    }
}
