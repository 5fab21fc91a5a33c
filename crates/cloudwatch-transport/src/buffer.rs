// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pending-record buffer enforcing the CloudWatch batch quotas.
//!
//! # Batching Strategy
//!
//! Records accumulate until one of these signals a flush:
//! 1. **Count limit**: the buffer holds [`MAX_BUFFER_LENGTH`] records
//! 2. **Periodic**: more than the flush interval passed since the last check
//! 3. **First record**: the first record after startup or a stream rotation,
//!    so the destination stream gets resolved promptly
//!
//! # Overflow
//!
//! A record that would push the aggregate size to [`MAX_BUFFER_SIZE`] (or the
//! count past [`MAX_BUFFER_LENGTH`]) is not inserted. It waits in a bounded
//! FIFO overflow queue and moves into the buffer on the next [`drain`].
//! While the overflow queue is non-empty every new record queues behind it,
//! so arrival order is kept. When the overflow queue is full too, the record
//! is handed back as [`BufferFull`] and the caller has to wait for a flush.
//!
//! [`drain`]: RecordBuffer::drain

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::constants::{
    DEFAULT_FLUSH_INTERVAL, MAX_BUFFER_LENGTH, MAX_BUFFER_SIZE, MAX_EVENT_SIZE,
};
use crate::error::BufferFull;
use crate::record::LogRecord;

/// Accumulates records between flushes.
///
/// Not synchronized on its own: the transport keeps it behind a mutex and
/// never holds that mutex across a remote call.
#[derive(Debug)]
pub struct RecordBuffer {
    /// Records accepted for the next batch, in arrival order.
    pub(crate) records: Vec<LogRecord>,
    /// Running `sum(message + overhead)` of `records`.
    pub(crate) size: usize,
    /// Records waiting for room, in arrival order.
    pub(crate) overflow: VecDeque<LogRecord>,
    pub(crate) overflow_size: usize,
    pub(crate) max_event_size: usize,
    pub(crate) max_buffer_size: usize,
    pub(crate) max_buffer_length: usize,
    pub(crate) flush_interval: Duration,
    pub(crate) last_flush: Instant,
    /// Set at startup and after each rotation until a record is accepted.
    pub(crate) awaiting_first: bool,
}

impl Default for RecordBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_FLUSH_INTERVAL)
    }
}

impl RecordBuffer {
    /// Creates a buffer with the CloudWatch quota limits.
    #[must_use]
    pub fn new(flush_interval: Duration) -> Self {
        Self::with_limits(
            flush_interval,
            MAX_EVENT_SIZE,
            MAX_BUFFER_SIZE,
            MAX_BUFFER_LENGTH,
        )
    }

    /// Creates a buffer with custom limits.
    ///
    /// Only useful for tests; production code should use [`RecordBuffer::new`].
    #[must_use]
    pub fn with_limits(
        flush_interval: Duration,
        max_event_size: usize,
        max_buffer_size: usize,
        max_buffer_length: usize,
    ) -> Self {
        RecordBuffer {
            records: Vec::new(),
            size: 0,
            overflow: VecDeque::new(),
            overflow_size: 0,
            max_event_size,
            max_buffer_size,
            max_buffer_length,
            flush_interval,
            last_flush: Instant::now(),
            awaiting_first: true,
        }
    }

    /// Adds a record and reports whether a flush should be requested.
    ///
    /// # Returns
    ///
    /// - `Ok(false)` if the record was accepted (or dropped for being
    ///   oversized) and no flush is due
    /// - `Ok(true)` if a flush is due, including when the record was deferred
    ///   to the overflow queue
    /// - `Err(BufferFull)` carrying the record back if neither the buffer nor
    ///   the overflow queue has room
    pub fn add(&mut self, record: LogRecord) -> Result<bool, BufferFull> {
        if record.message.len() >= self.max_event_size {
            debug!(
                "BUFFER | Dropping record of {} bytes, over the {} byte event limit",
                record.message.len(),
                self.max_event_size
            );
            return Ok(false);
        }

        if !self.overflow.is_empty() || !self.fits(&record) {
            return self.defer(record);
        }

        self.size += record.batch_size();
        self.records.push(record);

        let reached_length_limit = self.records.len() >= self.max_buffer_length;
        let periodic = self.periodic_flush_due();
        let first = std::mem::take(&mut self.awaiting_first);

        Ok(reached_length_limit || periodic || first)
    }

    /// Returns the buffered records sorted by timestamp.
    ///
    /// The sort is stable, so records sharing a timestamp keep arrival order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LogRecord> {
        let mut records = self.records.clone();
        records.sort_by_key(|record| record.timestamp);
        records
    }

    /// Empties the buffer. Deferred records stay in the overflow queue.
    pub fn clear(&mut self) {
        self.records.clear();
        self.size = 0;
    }

    /// Takes the current batch sorted by timestamp and leaves the buffer
    /// empty, then moves deferred records in.
    pub fn drain(&mut self) -> Vec<LogRecord> {
        let mut batch = std::mem::take(&mut self.records);
        self.size = 0;
        batch.sort_by_key(|record| record.timestamp);
        self.refill();
        batch
    }

    /// Makes the next accepted record request a flush again.
    pub fn mark_rotated(&mut self) {
        self.awaiting_first = true;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Aggregate batch size of the buffered records.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of records waiting in the overflow queue.
    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.overflow.len()
    }

    /// True when neither the buffer nor the overflow queue holds anything.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.records.is_empty() && self.overflow.is_empty()
    }

    fn fits(&self, record: &LogRecord) -> bool {
        self.records.len() < self.max_buffer_length
            && self.size + record.batch_size() < self.max_buffer_size
    }

    fn defer(&mut self, record: LogRecord) -> Result<bool, BufferFull> {
        let overflow_has_room = self.overflow.len() < self.max_buffer_length
            && self.overflow_size + record.batch_size() < self.max_buffer_size;
        if !overflow_has_room {
            warn!(
                "BUFFER | Overflow queue full ({} records), applying backpressure",
                self.overflow.len()
            );
            return Err(BufferFull(record));
        }

        self.overflow_size += record.batch_size();
        self.overflow.push_back(record);
        Ok(true)
    }

    fn refill(&mut self) {
        while let Some(front) = self.overflow.front() {
            if !self.fits(front) {
                break;
            }
            let Some(record) = self.overflow.pop_front() else {
                break;
            };
            self.overflow_size -= record.batch_size();
            self.size += record.batch_size();
            self.records.push(record);
        }
    }

    fn periodic_flush_due(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_flush);
        self.last_flush = now;
        elapsed > self.flush_interval
    }
}
