// Progress vector: the ordered history of epochs a replica has observed.

use super::{Epoch, Lsn};
use serde::{Deserialize, Serialize};

/// One epoch the replica has lived through: the epoch, the first LSN
/// produced under it, and the primary that owned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressVectorEntry {
    pub epoch: Epoch,
    pub lsn: Lsn,
    pub primary_replica_id: u64,
}

impl ProgressVectorEntry {
    pub fn new(epoch: Epoch, lsn: Lsn, primary_replica_id: u64) -> Self {
        Self {
            epoch,
            lsn,
            primary_replica_id,
        }
    }
}

/// Ordered sequence of progress entries, strictly non-decreasing by
/// (epoch, lsn). Insertion of a duplicate is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressVector {
    entries: Vec<ProgressVectorEntry>,
}

impl ProgressVector {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[ProgressVectorEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&ProgressVectorEntry> {
        self.entries.last()
    }

    pub fn last_epoch(&self) -> Epoch {
        self.entries.last().map(|e| e.epoch).unwrap_or(Epoch::ZERO)
    }

    /// Append an entry known to be newer than everything recorded.
    /// Duplicate of the last entry is ignored.
    pub fn append(&mut self, entry: ProgressVectorEntry) {
        if let Some(last) = self.entries.last() {
            if *last == entry {
                return;
            }
            debug_assert!(
                (last.epoch, last.lsn) <= (entry.epoch, entry.lsn),
                "progress vector must stay ordered"
            );
        }
        self.entries.push(entry);
    }

    /// Insert preserving (epoch, lsn) order; no-op when the entry is
    /// already present. Out-of-order inserts happen during recovery when
    /// UpdateEpoch records from older epochs are replayed.
    pub fn insert(&mut self, entry: ProgressVectorEntry) {
        match self
            .entries
            .binary_search_by_key(&(entry.epoch, entry.lsn), |e| (e.epoch, e.lsn))
        {
            Ok(_) => {}
            Err(index) => self.entries.insert(index, entry),
        }
    }

    /// The entry whose range covers `lsn`: the last entry with
    /// starting LSN <= `lsn`.
    pub fn find(&self, lsn: Lsn) -> Option<&ProgressVectorEntry> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.lsn <= lsn)
    }

    /// True when `epoch` appears anywhere in the history. Used by the
    /// cross-replica incremental backup policy.
    pub fn contains_epoch(&self, epoch: Epoch) -> bool {
        self.entries.iter().any(|entry| entry.epoch == epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(dl: u64, cfg: u64, lsn: Lsn) -> ProgressVectorEntry {
        ProgressVectorEntry::new(Epoch::new(dl, cfg), lsn, 1)
    }

    #[test]
    fn find_returns_covering_entry() {
        let mut pv = ProgressVector::new();
        pv.append(entry(1, 1, 0));
        pv.append(entry(1, 2, 50));
        pv.append(entry(2, 3, 120));

        assert_eq!(pv.find(10).unwrap().epoch, Epoch::new(1, 1));
        assert_eq!(pv.find(50).unwrap().epoch, Epoch::new(1, 2));
        assert_eq!(pv.find(119).unwrap().epoch, Epoch::new(1, 2));
        assert_eq!(pv.find(1000).unwrap().epoch, Epoch::new(2, 3));
    }

    #[test]
    fn insert_is_ordered_and_idempotent() {
        let mut pv = ProgressVector::new();
        pv.insert(entry(2, 1, 100));
        pv.insert(entry(1, 1, 0));
        pv.insert(entry(1, 1, 0));

        assert_eq!(pv.entries().len(), 2);
        assert_eq!(pv.entries()[0].lsn, 0);
        assert_eq!(pv.entries()[1].lsn, 100);
    }

    #[test]
    fn append_ignores_duplicate_tail() {
        let mut pv = ProgressVector::new();
        pv.append(entry(1, 1, 0));
        pv.append(entry(1, 1, 0));
        assert_eq!(pv.entries().len(), 1);
    }

    #[test]
    fn contains_epoch_over_history() {
        let mut pv = ProgressVector::new();
        pv.append(entry(1, 1, 0));
        pv.append(entry(2, 2, 10));
        assert!(pv.contains_epoch(Epoch::new(1, 1)));
        assert!(!pv.contains_epoch(Epoch::new(3, 1)));
    }
}
