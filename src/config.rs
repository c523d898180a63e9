// Replicator configuration
// Knobs consumed by the writer, checkpoint/truncation policy, drain and
// backup pipelines. Derived byte thresholds live in checkpoint::truncation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the logging replicator.
///
/// Sizes are expressed the way operators configure them (MB/KB); the
/// truncation manager derives the byte thresholds it actually compares
/// against. A shared `Arc<RwLock<ReplicatorConfig>>` may be mutated at
/// runtime; consumers refresh snapshots on their own cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Bytes of log growth between automatic checkpoints (MB)
    pub checkpoint_threshold_mb: u64,
    /// Log size below which head truncation is not worthwhile (MB)
    pub min_log_size_mb: u64,
    /// Multiplier on min log size that triggers head truncation
    pub truncation_threshold_factor: u64,
    /// Multiplier applied to checkpoint/min-log size to derive the
    /// throttling threshold
    pub throttling_threshold_factor: u64,
    /// Maximum size of a single backup stream (MB)
    pub max_stream_size_mb: u64,
    /// Maximum accumulated backup log size across a backup chain (MB)
    pub max_accumulated_backup_log_size_mb: u64,
    /// Records larger than this trigger an inline flush on the primary (KB)
    pub max_record_size_kb: u64,
    /// Writer back-pressure threshold: pending flush bytes above this
    /// report `should_throttle_writes`
    pub max_write_cache_size_kb: u64,
    /// Read-ahead for the backup log reader (KB)
    pub read_ahead_cache_size_kb: u64,
    /// Stream flushes slower than this raise a health signal
    pub slow_log_io_duration: Duration,
    /// Require apply (not just flush) before acking commits on a secondary.
    /// Opt-in: slows the drain and can grow the dispatch queue.
    pub enable_secondary_commit_apply_acknowledgement: bool,
    /// Allow incremental backups to chain across replicas as long as the
    /// progress vector still contains the previous backup epoch
    pub enable_incremental_backups_across_replicas: bool,
    /// Interval of the periodic checkpoint/truncation state machine.
    /// Zero disables the periodic cycle entirely.
    pub periodic_checkpoint_truncation_interval: Duration,
    /// Group commit delay: time between a commit request and the barrier
    /// that makes it stable
    pub group_commit_delay: Duration,
    /// Cadence at which the truncation manager re-derives its policy
    /// snapshot from this config
    pub policy_refresh_interval: Duration,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            checkpoint_threshold_mb: 50,
            min_log_size_mb: 2,
            truncation_threshold_factor: 2,
            throttling_threshold_factor: 4,
            max_stream_size_mb: 1024,
            max_accumulated_backup_log_size_mb: 800,
            max_record_size_kb: 1024,
            max_write_cache_size_kb: 512,
            read_ahead_cache_size_kb: 1024,
            slow_log_io_duration: Duration::from_secs(10),
            enable_secondary_commit_apply_acknowledgement: false,
            enable_incremental_backups_across_replicas: false,
            periodic_checkpoint_truncation_interval: Duration::from_secs(0),
            group_commit_delay: Duration::from_millis(2),
            policy_refresh_interval: Duration::from_secs(30),
        }
    }
}

impl ReplicatorConfig {
    pub fn max_record_size_bytes(&self) -> u64 {
        self.max_record_size_kb * 1024
    }

    pub fn max_write_cache_size_bytes(&self) -> u64 {
        self.max_write_cache_size_kb * 1024
    }

    /// Periodic checkpointing is off when the interval is zero.
    pub fn periodic_checkpointing_enabled(&self) -> bool {
        !self.periodic_checkpoint_truncation_interval.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = ReplicatorConfig::default();
        assert!(config.truncation_threshold_factor >= 1);
        assert!(config.throttling_threshold_factor > config.truncation_threshold_factor);
        assert!(!config.periodic_checkpointing_enabled());
    }
}
