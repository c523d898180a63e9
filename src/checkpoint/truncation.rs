// Log truncation manager
// Holds the refreshable byte-threshold policy and answers the pure
// policy questions: when to checkpoint, when to drop an indexing record,
// when to truncate the head, and when to throttle producers.

use crate::config::ReplicatorConfig;
use crate::records::RecordRef;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

const MB: u64 = 1024 * 1024;
/// A pending transaction older than checkpoint-interval / this factor
/// blocks checkpoints and becomes an abort candidate.
const ABORT_OLD_TX_FACTOR: u64 = 2;
/// Minimum truncation = checkpoint-interval / this factor.
const MIN_TRUNCATION_FACTOR: u64 = 2;
/// One indexing record roughly every checkpoint-interval / this factor.
const INDEX_INTERVAL_FACTOR: u64 = 50;

/// Derived byte thresholds, snapshotted from the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationPolicy {
    pub checkpoint_interval_bytes: u64,
    pub min_log_size_bytes: u64,
    pub truncation_threshold_bytes: u64,
    pub throttle_at_log_usage_bytes: u64,
    pub min_truncation_amount_bytes: u64,
    pub index_interval_bytes: u64,
    pub tx_abort_threshold_bytes: u64,
}

impl TruncationPolicy {
    pub fn derive(config: &ReplicatorConfig) -> Self {
        let checkpoint_interval_bytes = config.checkpoint_threshold_mb * MB;
        let min_log_size_bytes = config.min_log_size_mb * MB;
        let truncation_threshold_bytes = config.truncation_threshold_factor * min_log_size_bytes;
        let throttle_at_log_usage_bytes = u64::max(
            config.throttling_threshold_factor * checkpoint_interval_bytes,
            config.throttling_threshold_factor * min_log_size_bytes,
        );
        Self {
            checkpoint_interval_bytes,
            min_log_size_bytes,
            truncation_threshold_bytes,
            throttle_at_log_usage_bytes,
            min_truncation_amount_bytes: checkpoint_interval_bytes / MIN_TRUNCATION_FACTOR,
            index_interval_bytes: checkpoint_interval_bytes / INDEX_INTERVAL_FACTOR,
            tx_abort_threshold_bytes: checkpoint_interval_bytes / ABORT_OLD_TX_FACTOR,
        }
    }
}

/// Live log counters the policy decisions run against. All byte values
/// are stream offsets.
#[derive(Debug, Clone, Default)]
pub struct LogUsage {
    pub current_tail_position: u64,
    pub head_position: u64,
    pub last_index_position: Option<u64>,
    pub last_completed_checkpoint_position: Option<u64>,
    pub checkpoint_in_flight: bool,
    pub truncation_in_flight: bool,
    pub completed_checkpoint_exists: bool,
    /// The periodic timer fired and forces the next checkpoint
    pub periodic_checkpoint_ready: bool,
    /// A periodic checkpoint completed and its truncation is still owed
    pub periodic_truncation_ready: bool,
}

impl LogUsage {
    pub fn bytes_used_from_head(&self) -> u64 {
        self.current_tail_position.saturating_sub(self.head_position)
    }

    pub fn bytes_since_last_index(&self) -> u64 {
        match self.last_index_position {
            Some(p) => self.current_tail_position.saturating_sub(p),
            None => self.current_tail_position,
        }
    }

    pub fn bytes_since_last_checkpoint(&self) -> u64 {
        match self.last_completed_checkpoint_position {
            Some(p) => self.current_tail_position.saturating_sub(p),
            None => self.current_tail_position,
        }
    }
}

/// Why `should_checkpoint` said no, when it matters to the caller.
#[derive(Debug)]
pub enum CheckpointDecision {
    /// Append a BeginCheckpoint now
    Checkpoint,
    /// Old transactions block the checkpoint; abort these first
    AbortOldTransactions(Vec<RecordRef>),
    No,
}

struct PolicyCell {
    policy: TruncationPolicy,
    refreshed_at: Instant,
}

/// Policy snapshot holder with periodic refresh and dirty override.
pub struct LogTruncationManager {
    config: Arc<RwLock<ReplicatorConfig>>,
    cell: Mutex<PolicyCell>,
    dirty: AtomicBool,
}

impl LogTruncationManager {
    pub fn new(config: Arc<RwLock<ReplicatorConfig>>) -> Self {
        let policy = TruncationPolicy::derive(&config.read());
        Self {
            config,
            cell: Mutex::new(PolicyCell {
                policy,
                refreshed_at: Instant::now(),
            }),
            dirty: AtomicBool::new(false),
        }
    }

    /// Force the next `policy()` call to re-derive from the config.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Current policy snapshot, re-derived when dirty or stale.
    pub fn policy(&self) -> TruncationPolicy {
        let refresh_interval = self.config.read().policy_refresh_interval;
        let mut cell = self.cell.lock();
        let stale = cell.refreshed_at.elapsed() >= refresh_interval;
        if stale || self.dirty.swap(false, Ordering::SeqCst) {
            cell.policy = TruncationPolicy::derive(&self.config.read());
            cell.refreshed_at = Instant::now();
            debug!(?cell.policy, "truncation policy refreshed");
        }
        cell.policy
    }

    /// Back-pressure: the log has outgrown the throttle threshold.
    pub fn should_block_operations_on_primary(&self, usage: &LogUsage) -> bool {
        usage.bytes_used_from_head() > self.policy().throttle_at_log_usage_bytes
    }

    /// Time for a fresh indexing record.
    pub fn should_index(&self, usage: &LogUsage) -> bool {
        match usage.last_index_position {
            None => true,
            Some(_) => usage.bytes_since_last_index() >= self.policy().index_interval_bytes,
        }
    }

    /// Head truncation: only with a completed checkpoint behind it, and
    /// only when the log is actually worth shrinking (or a periodic
    /// cycle owes one).
    pub fn should_truncate_head(&self, usage: &LogUsage) -> bool {
        if usage.truncation_in_flight || !usage.completed_checkpoint_exists {
            return false;
        }
        usage.periodic_truncation_ready
            || usage.bytes_used_from_head() >= self.policy().truncation_threshold_bytes
    }

    /// Checkpoint policy. A pending transaction that began more than
    /// the abort threshold behind the tail defers the checkpoint and is
    /// reported for abort instead.
    pub fn should_checkpoint(
        &self,
        usage: &LogUsage,
        earliest_pending: Option<&RecordRef>,
        mut old_pending: impl FnMut(u64, &mut Vec<RecordRef>),
    ) -> CheckpointDecision {
        if usage.checkpoint_in_flight {
            return CheckpointDecision::No;
        }

        let policy = self.policy();
        let wants_checkpoint = usage.periodic_checkpoint_ready
            || usage.bytes_since_last_checkpoint() > policy.checkpoint_interval_bytes;
        if !wants_checkpoint {
            return CheckpointDecision::No;
        }

        // The tail has not yet outgrown the abort threshold: nothing can
        // be "too old" yet.
        if usage.current_tail_position > policy.tx_abort_threshold_bytes {
            let old_tx_offset = usage.current_tail_position - policy.tx_abort_threshold_bytes - 1;
            let too_old = earliest_pending
                .and_then(|record| record.position())
                .map(|position| position <= old_tx_offset)
                .unwrap_or(false);
            if too_old {
                let mut candidates = Vec::new();
                old_pending(old_tx_offset, &mut candidates);
                return CheckpointDecision::AbortOldTransactions(candidates);
            }
        }

        CheckpointDecision::Checkpoint
    }

    /// Is this indexing record an acceptable new log head? Periodic
    /// truncation waives the size requirements so small logs still
    /// truncate on schedule.
    pub fn is_good_log_head_candidate(
        &self,
        usage: &LogUsage,
        indexing_position: u64,
        periodic_truncation_active: bool,
    ) -> bool {
        if periodic_truncation_active {
            return true;
        }
        let policy = self.policy();
        let truncated = indexing_position.saturating_sub(usage.head_position);
        let remaining = usage.current_tail_position.saturating_sub(indexing_position);
        truncated >= policy.min_truncation_amount_bytes && remaining >= policy.min_log_size_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{LogRecord, RecordBody};
    use std::time::Duration;

    fn config_mb(checkpoint_mb: u64, min_log_mb: u64) -> Arc<RwLock<ReplicatorConfig>> {
        Arc::new(RwLock::new(ReplicatorConfig {
            checkpoint_threshold_mb: checkpoint_mb,
            min_log_size_mb: min_log_mb,
            truncation_threshold_factor: 2,
            throttling_threshold_factor: 4,
            ..Default::default()
        }))
    }

    #[test]
    fn policy_derivation_matches_config() {
        let manager = LogTruncationManager::new(config_mb(50, 2));
        let policy = manager.policy();

        assert_eq!(policy.checkpoint_interval_bytes, 50 * MB);
        assert_eq!(policy.min_log_size_bytes, 2 * MB);
        assert_eq!(policy.truncation_threshold_bytes, 4 * MB);
        assert_eq!(policy.throttle_at_log_usage_bytes, 200 * MB);
        assert_eq!(policy.min_truncation_amount_bytes, 25 * MB);
        assert_eq!(policy.index_interval_bytes, MB);
        assert_eq!(policy.tx_abort_threshold_bytes, 25 * MB);
    }

    #[test]
    fn dirty_override_refreshes_policy() {
        let config = config_mb(50, 2);
        let manager = LogTruncationManager::new(config.clone());
        assert_eq!(manager.policy().checkpoint_interval_bytes, 50 * MB);

        config.write().checkpoint_threshold_mb = 100;
        // Not refreshed yet: snapshot is fresh and not dirty
        assert_eq!(manager.policy().checkpoint_interval_bytes, 50 * MB);

        manager.mark_dirty();
        assert_eq!(manager.policy().checkpoint_interval_bytes, 100 * MB);
    }

    #[test]
    fn throttle_decision() {
        let manager = LogTruncationManager::new(config_mb(1, 1));
        let mut usage = LogUsage {
            current_tail_position: 3 * MB,
            ..Default::default()
        };
        assert!(!manager.should_block_operations_on_primary(&usage));
        usage.current_tail_position = 5 * MB;
        assert!(manager.should_block_operations_on_primary(&usage));
    }

    #[test]
    fn index_decision() {
        let manager = LogTruncationManager::new(config_mb(50, 2));
        let mut usage = LogUsage::default();
        assert!(manager.should_index(&usage));

        usage.last_index_position = Some(0);
        usage.current_tail_position = MB / 2;
        assert!(!manager.should_index(&usage));
        usage.current_tail_position = MB;
        assert!(manager.should_index(&usage));
    }

    #[test]
    fn truncate_head_requires_completed_checkpoint() {
        let manager = LogTruncationManager::new(config_mb(1, 1));
        let mut usage = LogUsage {
            current_tail_position: 10 * MB,
            completed_checkpoint_exists: false,
            ..Default::default()
        };
        assert!(!manager.should_truncate_head(&usage));
        usage.completed_checkpoint_exists = true;
        assert!(manager.should_truncate_head(&usage));
        usage.truncation_in_flight = true;
        assert!(!manager.should_truncate_head(&usage));
    }

    #[test]
    fn checkpoint_defers_to_old_transaction_abort() {
        let manager = LogTruncationManager::new(config_mb(1, 1));

        let begin = LogRecord::new(RecordBody::BeginTx {
            tx_id: 7,
            is_single_operation: false,
            metadata: Vec::new(),
            undo: Vec::new(),
            redo: Vec::new(),
        });
        begin.set_position(0);

        let usage = LogUsage {
            // 1.2 MiB written against a 1 MiB checkpoint interval
            current_tail_position: MB + MB / 5,
            ..Default::default()
        };

        let begin_for_closure = begin.clone();
        let decision = manager.should_checkpoint(&usage, Some(&begin), move |offset, out| {
            if begin_for_closure.position().unwrap() <= offset {
                out.push(begin_for_closure.clone());
            }
        });
        match decision {
            CheckpointDecision::AbortOldTransactions(candidates) => {
                assert_eq!(candidates.len(), 1);
                assert_eq!(candidates[0].tx_id(), Some(7));
            }
            other => panic!("expected abort candidates, got {:?}", other),
        }

        // Once the old transaction is gone the checkpoint proceeds
        let decision = manager.should_checkpoint(&usage, None, |_, _| {});
        assert!(matches!(decision, CheckpointDecision::Checkpoint));
    }

    #[test]
    fn head_candidate_policy() {
        let manager = LogTruncationManager::new(config_mb(1, 1));
        let usage = LogUsage {
            current_tail_position: 10 * MB,
            head_position: 0,
            ..Default::default()
        };

        // Not enough reclaimed
        assert!(!manager.is_good_log_head_candidate(&usage, 100, false));
        // Good: reclaims >= 512 KiB and leaves >= 1 MiB
        assert!(manager.is_good_log_head_candidate(&usage, 2 * MB, false));
        // Leaves too little behind
        assert!(!manager.is_good_log_head_candidate(&usage, 10 * MB - 100, false));
        // Periodic truncation waives both checks
        assert!(manager.is_good_log_head_candidate(&usage, 100, true));
    }

    #[test]
    fn stale_snapshot_refreshes_after_interval() {
        let config = config_mb(50, 2);
        config.write().policy_refresh_interval = Duration::ZERO;
        let manager = LogTruncationManager::new(config.clone());
        config.write().checkpoint_threshold_mb = 10;
        // Zero refresh interval means every call re-derives
        assert_eq!(manager.policy().checkpoint_interval_bytes, 10 * MB);
    }
}
