// Physical log writer
// Single logical appender for all records. Producers insert into a
// buffered queue; one flush is in flight at a time, serializing records
// to the stream in PSN order. Records arriving during a flush collect in
// a pending batch that the in-flight flush promotes when it finishes, so
// group commit happens naturally under load.

pub mod callback;

pub use callback::{FlushCallbackManager, FlushProcessor, LoggedBatch};

use crate::error::{ReplicatorError, Result};
use crate::io_monitor::IoHealthMonitor;
use crate::log_stream::LogStream;
use crate::records::wire;
use crate::records::{CompletionSignal, InformationEvent, Psn, RecordBody, RecordRef, UNASSIGNED};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error};

/// Samples kept for the flush latency / write speed moving averages.
const FLUSH_STATS_WINDOW: usize = 32;

/// Starting point for a writer: where the log tail currently is.
/// A fresh log starts at zero; recovery and restore seed from the
/// recovered tail record.
#[derive(Debug, Clone, Default)]
pub struct WriterInit {
    pub tail_position: u64,
    pub tail_psn: Psn,
    pub last_physical_psn: Option<Psn>,
}

/// Observability snapshot of flush behavior.
#[derive(Debug, Clone, Default)]
pub struct FlushStats {
    pub flush_count: u64,
    pub total_bytes: u64,
    pub avg_flush_latency: Duration,
    pub avg_write_speed_bytes_per_sec: f64,
}

struct StatsWindow {
    samples: VecDeque<(Duration, u64)>,
    flush_count: u64,
    total_bytes: u64,
}

impl StatsWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(FLUSH_STATS_WINDOW),
            flush_count: 0,
            total_bytes: 0,
        }
    }

    fn record(&mut self, latency: Duration, bytes: u64) {
        if self.samples.len() == FLUSH_STATS_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back((latency, bytes));
        self.flush_count += 1;
        self.total_bytes += bytes;
    }

    fn snapshot(&self) -> FlushStats {
        let window = self.samples.len().max(1) as u32;
        let total_latency: Duration = self.samples.iter().map(|(l, _)| *l).sum();
        let window_bytes: u64 = self.samples.iter().map(|(_, b)| *b).sum();
        let window_secs = total_latency.as_secs_f64();
        FlushStats {
            flush_count: self.flush_count,
            total_bytes: self.total_bytes,
            avg_flush_latency: total_latency / window,
            avg_write_speed_bytes_per_sec: if window_secs > 0.0 {
                window_bytes as f64 / window_secs
            } else {
                0.0
            },
        }
    }
}

struct WriterState {
    buffered_records: Vec<RecordRef>,
    pending_flush_records: Vec<RecordRef>,
    /// Shared completion for every producer whose records sit in the
    /// pending batch; completed when that batch has been written
    pending_flush_waiter: Option<Arc<CompletionSignal>>,
    buffered_bytes: u64,
    pending_flush_bytes: u64,
    flush_in_progress: bool,
    current_tail_position: u64,
    current_tail_record: Option<RecordRef>,
    /// Last PSN handed out by insert
    last_assigned_psn: Psn,
    last_physical_psn: Option<Psn>,
    closed_error: Option<ReplicatorError>,
    logging_error: Option<ReplicatorError>,
    /// Set once an Information(RemovingState) record is buffered;
    /// nothing may follow it into the log
    removing_state_seen: bool,
}

/// The single appender that turns records into durable stream bytes.
pub struct PhysicalLogWriter {
    stream: Arc<dyn LogStream>,
    callbacks: Arc<FlushCallbackManager>,
    io_monitor: Arc<IoHealthMonitor>,
    max_write_cache_bytes: u64,
    state: Mutex<WriterState>,
    /// Serializes stream I/O: the in-flight flush vs head/tail truncation.
    /// Never taken while holding `state`.
    io_lock: tokio::sync::Mutex<()>,
    /// Signalled whenever the writer drains to idle (no flush in flight)
    idle: Notify,
    stats: Mutex<StatsWindow>,
}

impl PhysicalLogWriter {
    pub fn new(
        stream: Arc<dyn LogStream>,
        callbacks: Arc<FlushCallbackManager>,
        io_monitor: Arc<IoHealthMonitor>,
        max_write_cache_bytes: u64,
        init: WriterInit,
    ) -> Self {
        Self {
            stream,
            callbacks,
            io_monitor,
            max_write_cache_bytes,
            state: Mutex::new(WriterState {
                buffered_records: Vec::new(),
                pending_flush_records: Vec::new(),
                pending_flush_waiter: None,
                buffered_bytes: 0,
                pending_flush_bytes: 0,
                flush_in_progress: false,
                current_tail_position: init.tail_position,
                current_tail_record: None,
                last_assigned_psn: init.tail_psn,
                last_physical_psn: init.last_physical_psn,
                closed_error: None,
                logging_error: None,
                removing_state_seen: false,
            }),
            io_lock: tokio::sync::Mutex::new(()),
            idle: Notify::new(),
            stats: Mutex::new(StatsWindow::new()),
        }
    }

    pub fn stream(&self) -> &Arc<dyn LogStream> {
        &self.stream
    }

    /// Assign the next PSN, link physical back-pointers, and queue the
    /// record for the next flush. Returns the buffered byte total so the
    /// caller can decide whether to flush eagerly.
    ///
    /// Not async: producers call this under their own ordering locks.
    pub fn insert_buffered_record(&self, record: RecordRef) -> Result<u64> {
        let rejection = {
            let mut state = self.state.lock();
            if let Some(err) = &state.closed_error {
                Some(err.clone())
            } else if state.removing_state_seen {
                Some(ReplicatorError::Closed)
            } else {
                let psn = state.last_assigned_psn + 1;
                state.last_assigned_psn = psn;
                record.set_psn(psn);

                // Unconditional: a record rebuilt from another log may
                // carry a stale link that must not survive re-logging
                record.set_previous_physical_psn(
                    state.last_physical_psn.unwrap_or(UNASSIGNED),
                );
                if record.kind().is_physical() {
                    state.last_physical_psn = Some(psn);
                }
                if matches!(
                    record.body(),
                    RecordBody::Information {
                        event: InformationEvent::RemovingState
                    }
                ) {
                    state.removing_state_seen = true;
                }

                state.buffered_bytes += record.body().approximate_size();
                state.buffered_records.push(record.clone());
                return Ok(state.buffered_bytes);
            }
        };

        // Rejected: complete the record with the error and tell the
        // callback pipeline so downstream bookkeeping still runs.
        let err = rejection.expect("rejection path always carries an error");
        record.fail(&err);
        self.callbacks
            .notify(LoggedBatch::failed(vec![record], err.clone()));
        Err(err)
    }

    /// Flush buffered records. If a flush is already in flight the
    /// caller's records join the pending batch and this call resolves
    /// when that batch is durable.
    pub async fn flush(&self, initiator: &str) -> Result<()> {
        enum Role {
            Leader(Vec<RecordRef>),
            Follower(Arc<CompletionSignal>),
            Idle,
        }

        let role = {
            let mut state = self.state.lock();
            if let Some(err) = &state.closed_error {
                return Err(err.clone());
            }
            if state.flush_in_progress {
                if !state.buffered_records.is_empty() {
                    let moved = std::mem::take(&mut state.buffered_records);
                    state.pending_flush_bytes += state.buffered_bytes;
                    state.buffered_bytes = 0;
                    state.pending_flush_records.extend(moved);
                }
                if state.pending_flush_records.is_empty() {
                    Role::Idle
                } else {
                    let waiter = state
                        .pending_flush_waiter
                        .get_or_insert_with(|| Arc::new(CompletionSignal::new()))
                        .clone();
                    Role::Follower(waiter)
                }
            } else if state.buffered_records.is_empty() {
                Role::Idle
            } else {
                state.flush_in_progress = true;
                state.buffered_bytes = 0;
                Role::Leader(std::mem::take(&mut state.buffered_records))
            }
        };

        match role {
            Role::Idle => Ok(()),
            Role::Follower(waiter) => waiter.wait().await,
            Role::Leader(batch) => self.run_flush_loop(batch, initiator).await,
        }
    }

    /// Leader side of the flush protocol: write the batch, then keep
    /// promoting pending batches until the queues drain.
    async fn run_flush_loop(&self, first_batch: Vec<RecordRef>, initiator: &str) -> Result<()> {
        let mut batch = first_batch;
        let mut batch_waiter: Option<Arc<CompletionSignal>> = None;
        let mut first_result: Option<Result<()>> = None;

        loop {
            let poisoned = self.state.lock().logging_error.clone();
            let result = match poisoned {
                Some(err) => Err(err),
                None => self.write_batch(&batch, initiator).await,
            };

            match &result {
                Ok(()) => self.callbacks.notify(LoggedBatch::succeeded(batch.clone())),
                Err(err) => {
                    error!(initiator, error = %err, "log flush failed");
                    self.callbacks
                        .notify(LoggedBatch::failed(batch.clone(), err.clone()));
                }
            }
            if let Some(waiter) = batch_waiter.take() {
                waiter.complete(result.clone());
            }
            if first_result.is_none() {
                first_result = Some(result.clone());
            }

            let next = {
                let mut state = self.state.lock();
                if let Err(err) = &result {
                    state.logging_error = Some(err.clone());
                    state.closed_error = Some(err.clone());
                    // Producers racing the failure may still have queued
                    // records; fold them into the failed drain.
                    if !state.buffered_records.is_empty() {
                        let moved = std::mem::take(&mut state.buffered_records);
                        state.buffered_bytes = 0;
                        state.pending_flush_records.extend(moved);
                    }
                }
                if state.pending_flush_records.is_empty() {
                    state.flush_in_progress = false;
                    state.pending_flush_bytes = 0;
                    None
                } else {
                    batch_waiter = state.pending_flush_waiter.take();
                    state.pending_flush_bytes = 0;
                    Some(std::mem::take(&mut state.pending_flush_records))
                }
            };

            match next {
                Some(next_batch) => batch = next_batch,
                None => {
                    self.idle.notify_waiters();
                    break;
                }
            }
        }

        first_result.expect("flush loop ran at least once")
    }

    /// Serialize and append one batch, then flush the stream. On success
    /// the tail advances atomically to the last record of the batch.
    async fn write_batch(&self, records: &[RecordRef], initiator: &str) -> Result<()> {
        let _io = self.io_lock.lock().await;

        let start_position = self.state.lock().current_tail_position;
        let started = Instant::now();
        let mut written: u64 = 0;

        for record in records {
            let block = wire::encode_record(record)?;
            record.set_position(start_position + written);
            record.set_serialized_size(block.len() as u64);
            self.stream.append(&block).await?;
            written += block.len() as u64;
        }

        self.stream.flush_with_marker().await?;
        let latency = started.elapsed();

        {
            let mut state = self.state.lock();
            state.current_tail_position = start_position + written;
            state.current_tail_record = records.last().cloned();
        }

        self.stats.lock().record(latency, written);
        self.io_monitor.observe_flush(latency, written);

        debug!(
            initiator,
            records = records.len(),
            bytes = written,
            latency_us = latency.as_micros() as u64,
            "flushed log batch"
        );
        Ok(())
    }

    /// Dispatch a head truncation to the stream, serialized against any
    /// in-flight flush.
    pub async fn truncate_log_head(&self, position: u64) -> Result<()> {
        let _io = self.io_lock.lock().await;
        self.stream.truncate_head(position).await
    }

    /// Abandon everything after `new_tail_record`: shrink the stream and
    /// rewind the tail bookkeeping to it.
    pub async fn truncate_log_tail(&self, new_tail_record: RecordRef) -> Result<()> {
        let _io = self.io_lock.lock().await;

        let record_end = new_tail_record
            .position()
            .ok_or_else(|| {
                ReplicatorError::Internal(
                    "truncate tail target has no recorded position".to_string(),
                )
            })?
            + new_tail_record.serialized_size();

        self.stream.truncate_tail(record_end).await?;

        let mut state = self.state.lock();
        state.current_tail_position = record_end;
        state.last_assigned_psn = new_tail_record.psn();
        state.last_physical_psn = if new_tail_record.kind().is_physical() {
            Some(new_tail_record.psn())
        } else {
            new_tail_record.previous_physical_psn()
        };
        state.current_tail_record = Some(new_tail_record);
        Ok(())
    }

    /// Back-pressure signal: pending flush bytes above the configured
    /// write cache mean producers should slow down.
    pub fn should_throttle_writes(&self) -> bool {
        self.state.lock().pending_flush_bytes > self.max_write_cache_bytes
    }

    /// Wait until no flush is in flight.
    pub async fn wait_for_idle(&self) {
        loop {
            let waiter = self.idle.notified();
            if !self.state.lock().flush_in_progress {
                return;
            }
            waiter.await;
        }
    }

    /// Refuse further inserts and fail everything still queued.
    pub fn close(&self, error: ReplicatorError) {
        let drained = {
            let mut state = self.state.lock();
            if state.closed_error.is_none() {
                state.closed_error = Some(error.clone());
            }
            let mut drained = std::mem::take(&mut state.buffered_records);
            drained.extend(std::mem::take(&mut state.pending_flush_records));
            state.buffered_bytes = 0;
            state.pending_flush_bytes = 0;
            drained
        };
        if !drained.is_empty() {
            for record in &drained {
                record.fail(&error);
            }
            self.callbacks.notify(LoggedBatch::failed(drained, error));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed_error.is_some()
    }

    pub fn closed_error(&self) -> Option<ReplicatorError> {
        self.state.lock().closed_error.clone()
    }

    pub fn current_tail_position(&self) -> u64 {
        self.state.lock().current_tail_position
    }

    pub fn current_tail_psn(&self) -> Psn {
        self.state.lock().last_assigned_psn
    }

    pub fn current_tail_record(&self) -> Option<RecordRef> {
        self.state.lock().current_tail_record.clone()
    }

    pub fn last_physical_psn(&self) -> Option<Psn> {
        self.state.lock().last_physical_psn
    }

    pub fn pending_flush_bytes(&self) -> u64 {
        self.state.lock().pending_flush_bytes
    }

    pub fn stats(&self) -> FlushStats {
        self.stats.lock().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_stream::MemoryLogStream;
    use crate::records::wire::decode_record;
    use crate::records::{LogRecord, RecordKind};
    use std::io::Read;

    fn test_writer() -> Arc<PhysicalLogWriter> {
        let stream = Arc::new(MemoryLogStream::new(None));
        Arc::new(PhysicalLogWriter::new(
            stream,
            FlushCallbackManager::new(),
            Arc::new(IoHealthMonitor::new(Duration::from_secs(10))),
            64 * 1024,
            WriterInit::default(),
        ))
    }

    fn barrier(last_stable_lsn: u64) -> RecordRef {
        let record = LogRecord::new(RecordBody::Barrier { last_stable_lsn });
        record.set_lsn(last_stable_lsn + 1);
        record
    }

    #[tokio::test]
    async fn psn_assignment_is_strictly_sequential() {
        let writer = test_writer();
        let a = barrier(1);
        let b = barrier(2);
        let c = LogRecord::new(RecordBody::TruncateTail);
        c.set_lsn(3);

        writer.insert_buffered_record(a.clone()).unwrap();
        writer.insert_buffered_record(b.clone()).unwrap();
        writer.insert_buffered_record(c.clone()).unwrap();

        assert_eq!(a.psn(), 1);
        assert_eq!(b.psn(), 2);
        assert_eq!(c.psn(), 3);
        // The physical record links back to nothing yet; the next insert
        // links to it
        assert_eq!(c.previous_physical_psn(), None);
        let d = barrier(4);
        writer.insert_buffered_record(d.clone()).unwrap();
        assert_eq!(d.previous_physical_psn(), Some(3));
    }

    #[tokio::test]
    async fn flush_makes_records_durable_in_insert_order() {
        let writer = test_writer();
        let records: Vec<RecordRef> = (0..5).map(barrier).collect();
        for record in &records {
            writer.insert_buffered_record(record.clone()).unwrap();
        }
        writer.flush("test").await.unwrap();

        for record in &records {
            record.flushed().wait().await.unwrap();
        }

        // Positions are contiguous
        let mut expected = 0;
        for record in &records {
            assert_eq!(record.position(), Some(expected));
            expected += record.serialized_size();
        }
        assert_eq!(writer.current_tail_position(), expected);

        // And the stream replays in the same order
        let mut reader = writer.stream().read_stream(0).unwrap();
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).unwrap();
        let mut offset = 0;
        let mut psn = 1;
        while offset < bytes.len() {
            let (frame, used) = decode_record(&bytes[offset..]).unwrap();
            assert_eq!(frame.kind, RecordKind::Barrier);
            assert_eq!(frame.psn, psn);
            offset += used;
            psn += 1;
        }
        assert_eq!(psn, 6);
    }

    #[tokio::test]
    async fn concurrent_flush_joins_pending_batch() {
        let writer = test_writer();
        let first = barrier(1);
        writer.insert_buffered_record(first.clone()).unwrap();

        let leader = {
            let writer = writer.clone();
            tokio::spawn(async move { writer.flush("leader").await })
        };

        let second = barrier(2);
        writer.insert_buffered_record(second.clone()).unwrap();
        writer.flush("follower").await.unwrap();

        leader.await.unwrap().unwrap();
        first.flushed().wait().await.unwrap();
        second.flushed().wait().await.unwrap();
        assert!(second.position().unwrap() > first.position().unwrap());
    }

    #[tokio::test]
    async fn inserts_rejected_after_removing_state() {
        let writer = test_writer();
        let removing = LogRecord::new(RecordBody::Information {
            event: InformationEvent::RemovingState,
        });
        removing.set_lsn(1);
        writer.insert_buffered_record(removing).unwrap();

        let late = barrier(9);
        let err = writer.insert_buffered_record(late.clone()).unwrap_err();
        assert!(matches!(err, ReplicatorError::Closed));
        assert!(late.flushed().wait().await.is_err());
    }

    #[tokio::test]
    async fn close_fails_queued_records() {
        let writer = test_writer();
        let queued = barrier(1);
        writer.insert_buffered_record(queued.clone()).unwrap();
        writer.close(ReplicatorError::Closed);

        assert!(queued.flushed().wait().await.is_err());
        assert!(writer.flush("after-close").await.is_err());
        assert!(writer.insert_buffered_record(barrier(2)).is_err());
    }

    #[tokio::test]
    async fn tail_truncation_rewinds_bookkeeping() {
        let writer = test_writer();
        let keep = barrier(1);
        let drop_a = barrier(2);
        let drop_b = barrier(3);
        for record in [&keep, &drop_a, &drop_b] {
            writer.insert_buffered_record((*record).clone()).unwrap();
        }
        writer.flush("test").await.unwrap();

        writer.truncate_log_tail(keep.clone()).await.unwrap();

        assert_eq!(writer.current_tail_psn(), keep.psn());
        assert_eq!(
            writer.current_tail_position(),
            keep.position().unwrap() + keep.serialized_size()
        );
        assert_eq!(
            writer.stream().write_position(),
            writer.current_tail_position()
        );

        // New inserts continue from the rewound PSN
        let next = barrier(2);
        writer.insert_buffered_record(next.clone()).unwrap();
        assert_eq!(next.psn(), keep.psn() + 1);
    }

    #[tokio::test]
    async fn flush_stats_track_moving_window() {
        let writer = test_writer();
        for lsn in 0..3 {
            writer.insert_buffered_record(barrier(lsn)).unwrap();
            writer.flush("stats").await.unwrap();
        }
        let stats = writer.stats();
        assert_eq!(stats.flush_count, 3);
        assert!(stats.total_bytes > 0);
    }
}
