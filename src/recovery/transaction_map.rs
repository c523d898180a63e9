// Transaction map
// Tracks in-flight transactions as chains of log records (begin -> ops
// -> end). Completed transactions wait in a stable-ordered list until
// the stable LSN passes their end record.

use crate::error::{ReplicatorError, Result};
use crate::records::{Lsn, RecordBody, RecordRef, TxId};
use std::collections::{BTreeMap, HashMap};

/// The record chain of one transaction.
#[derive(Debug, Clone)]
pub struct TransactionChain {
    pub begin: RecordRef,
    pub operations: Vec<RecordRef>,
    pub end: Option<RecordRef>,
}

impl TransactionChain {
    pub fn is_committed(&self) -> bool {
        matches!(
            self.end.as_deref().map(|r| r.body()),
            Some(RecordBody::EndTx {
                committed: true,
                ..
            })
        )
    }

    /// All records of the chain in log order.
    pub fn records(&self) -> Vec<RecordRef> {
        let mut out = Vec::with_capacity(2 + self.operations.len());
        out.push(self.begin.clone());
        out.extend(self.operations.iter().cloned());
        out.extend(self.end.iter().cloned());
        out
    }
}

/// In-flight and recently-completed transactions.
#[derive(Debug, Default)]
pub struct TransactionMap {
    pending: HashMap<TxId, TransactionChain>,
    /// Begin LSN -> tx id, for oldest-pending queries
    pending_by_begin_lsn: BTreeMap<Lsn, TxId>,
    /// Completed transactions keyed by end LSN, awaiting stability
    completed_by_end_lsn: BTreeMap<Lsn, TransactionChain>,
}

impl TransactionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a begin record. Duplicate tx ids are a producer bug.
    pub fn create(&mut self, begin: RecordRef) -> Result<()> {
        let tx_id = begin.tx_id().ok_or_else(|| {
            ReplicatorError::Internal("begin record without tx id".to_string())
        })?;
        if self.pending.contains_key(&tx_id) {
            return Err(ReplicatorError::Internal(format!(
                "transaction {} already exists",
                tx_id
            )));
        }
        self.pending_by_begin_lsn.insert(begin.lsn(), tx_id);
        self.pending.insert(
            tx_id,
            TransactionChain {
                begin,
                operations: Vec::new(),
                end: None,
            },
        );
        Ok(())
    }

    /// Append an operation to its transaction's chain.
    pub fn add_operation(&mut self, operation: RecordRef) -> Result<()> {
        let tx_id = operation.tx_id().ok_or_else(|| {
            ReplicatorError::Internal("operation record without tx id".to_string())
        })?;
        let chain = self.pending.get_mut(&tx_id).ok_or_else(|| {
            ReplicatorError::Internal(format!("operation for unknown transaction {}", tx_id))
        })?;
        chain.operations.push(operation);
        Ok(())
    }

    /// Finalize a chain with its end record and move it to the
    /// stable-ordered list. Returns the completed chain.
    pub fn complete(&mut self, end: RecordRef) -> Result<TransactionChain> {
        let tx_id = end.tx_id().ok_or_else(|| {
            ReplicatorError::Internal("end record without tx id".to_string())
        })?;
        let mut chain = self.pending.remove(&tx_id).ok_or_else(|| {
            ReplicatorError::Internal(format!("end for unknown transaction {}", tx_id))
        })?;
        self.pending_by_begin_lsn.remove(&chain.begin.lsn());
        chain.end = Some(end.clone());
        self.completed_by_end_lsn.insert(end.lsn(), chain.clone());
        Ok(chain)
    }

    /// Drop completed transactions whose end LSN is at or below the
    /// stable LSN; they can never be asked about again.
    pub fn remove_stable(&mut self, stable_lsn: Lsn) {
        let keep = self.completed_by_end_lsn.split_off(&(stable_lsn + 1));
        self.completed_by_end_lsn = keep;
    }

    /// The oldest begin record with no end record.
    pub fn earliest_pending(&self) -> Option<RecordRef> {
        self.pending_by_begin_lsn
            .values()
            .next()
            .and_then(|tx_id| self.pending.get(tx_id))
            .map(|chain| chain.begin.clone())
    }

    /// The oldest pending begin record whose LSN is at or below `lsn`.
    pub fn earliest_pending_at(&self, lsn: Lsn) -> Option<RecordRef> {
        self.pending_by_begin_lsn
            .range(..=lsn)
            .next()
            .map(|(_, tx_id)| self.pending[tx_id].begin.clone())
    }

    /// Append pending begin records positioned below `position` to `out`.
    pub fn pending_older_than_position(&self, position: u64, out: &mut Vec<RecordRef>) {
        for chain in self.pending.values() {
            match chain.begin.position() {
                Some(p) if p < position => out.push(chain.begin.clone()),
                _ => {}
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed_by_end_lsn.len()
    }

    pub fn get_pending(&self, tx_id: TxId) -> Option<&TransactionChain> {
        self.pending.get(&tx_id)
    }

    /// Completed-but-not-yet-stable chain, looked up by its end LSN.
    pub fn completed_chain_by_end_lsn(&self, end_lsn: Lsn) -> Option<&TransactionChain> {
        self.completed_by_end_lsn.get(&end_lsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{LogRecord, OperationMode};

    fn begin(tx_id: TxId, lsn: Lsn) -> RecordRef {
        let record = LogRecord::new(RecordBody::BeginTx {
            tx_id,
            is_single_operation: false,
            metadata: Vec::new(),
            undo: Vec::new(),
            redo: Vec::new(),
        });
        record.set_lsn(lsn);
        record
    }

    fn operation(tx_id: TxId, lsn: Lsn) -> RecordRef {
        let record = LogRecord::new(RecordBody::Operation {
            tx_id,
            mode: OperationMode::InTransaction,
            metadata: Vec::new(),
            undo: Vec::new(),
            redo: Vec::new(),
        });
        record.set_lsn(lsn);
        record
    }

    fn end(tx_id: TxId, lsn: Lsn, committed: bool) -> RecordRef {
        let record = LogRecord::new(RecordBody::EndTx { tx_id, committed });
        record.set_lsn(lsn);
        record
    }

    #[test]
    fn chain_lifecycle() {
        let mut map = TransactionMap::new();
        map.create(begin(7, 10)).unwrap();
        map.add_operation(operation(7, 11)).unwrap();
        let chain = map.complete(end(7, 12, true)).unwrap();

        assert!(chain.is_committed());
        assert_eq!(chain.records().len(), 3);
        assert_eq!(map.pending_count(), 0);
        assert_eq!(map.completed_count(), 1);
    }

    #[test]
    fn operation_for_unknown_tx_fails() {
        let mut map = TransactionMap::new();
        assert!(map.add_operation(operation(99, 5)).is_err());
    }

    #[test]
    fn remove_stable_keeps_unstable_ends() {
        let mut map = TransactionMap::new();
        for (tx, begin_lsn, end_lsn) in [(1, 1, 3), (2, 2, 8)] {
            map.create(begin(tx, begin_lsn)).unwrap();
            map.complete(end(tx, end_lsn, true)).unwrap();
        }

        map.remove_stable(5);
        assert_eq!(map.completed_count(), 1);
        map.remove_stable(8);
        assert_eq!(map.completed_count(), 0);
    }

    #[test]
    fn earliest_pending_queries() {
        let mut map = TransactionMap::new();
        map.create(begin(1, 10)).unwrap();
        map.create(begin(2, 20)).unwrap();

        assert_eq!(map.earliest_pending().unwrap().lsn(), 10);
        assert_eq!(map.earliest_pending_at(15).unwrap().lsn(), 10);
        assert!(map.earliest_pending_at(5).is_none());

        map.complete(end(1, 30, false)).unwrap();
        assert_eq!(map.earliest_pending().unwrap().lsn(), 20);
    }

    #[test]
    fn pending_older_than_position_filters() {
        let mut map = TransactionMap::new();
        let old = begin(1, 10);
        old.set_position(100);
        let young = begin(2, 20);
        young.set_position(5000);
        map.create(old).unwrap();
        map.create(young).unwrap();

        let mut out = Vec::new();
        map.pending_older_than_position(1000, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].lsn(), 10);
    }
}
