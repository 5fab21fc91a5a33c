// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The running transport: ingestion, background timers and shutdown.
//!
//! ```text
//!  ingest ──> RecordBuffer ──(flush due)──> FlushScheduler ──> Shipper::flush
//!                  ^                                               │
//!                  │                       drain, resolve stream,  │
//!                  └──── error records ─── put via SinkAdapter <───┘
//!
//!  timer task: rotation tick ──> force flush, rotate stream
//!              flush tick    ──> nudge scheduler if anything is buffered
//! ```
//!
//! Delivery failures never reach the producer. They are logged and shipped
//! as error records alongside the application's own logs.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::RecordBuffer;
use crate::config::TransportConfig;
use crate::error::{BufferFull, ConfigError, TransportError};
use crate::record::LogRecord;
use crate::scheduler::{Flush, FlushScheduler, FlushSchedulerHandle};
use crate::sink::{LogSink, SinkAdapter};
use crate::stream::StreamManager;

const INITIALIZATION_ERROR: &str = "cloudwatch-transport initialization error";
const FLUSHING_ERROR: &str = "cloudwatch-transport flushing error";
const ROTATION_ERROR: &str = "cloudwatch-transport rotation error";

const FLUSH_EVENT_CAPACITY: usize = 16;

/// Sent to subscribers each time a flush requested by ingestion executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushEvent;

type SharedBuffer = Arc<Mutex<RecordBuffer>>;

fn lock(buffer: &Mutex<RecordBuffer>) -> MutexGuard<'_, RecordBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Buffers an error record produced by the transport itself.
///
/// Nudges the scheduler when the record makes a flush due. A record that
/// finds the buffer full is dropped with a warning.
fn push_error_record(
    buffer: &Mutex<RecordBuffer>,
    scheduler: Option<&FlushSchedulerHandle>,
    record: LogRecord,
) {
    let added = lock(buffer).add(record);
    match added {
        Ok(true) => {
            if let Some(scheduler) = scheduler {
                if let Err(e) = scheduler.nudge() {
                    warn!("TRANSPORT | Unable to request flush for error record: {e}");
                }
            }
        }
        Ok(false) => {}
        Err(BufferFull(dropped)) => warn!(
            "TRANSPORT | Buffer full, dropping error record: {}",
            dropped.message
        ),
    }
}

/// Flush body run by the scheduler.
struct Shipper {
    group: String,
    buffer: SharedBuffer,
    streams: Arc<StreamManager>,
    sink: SinkAdapter,
    /// Set once the scheduler running this body exists.
    scheduler: OnceLock<FlushSchedulerHandle>,
}

#[async_trait]
impl Flush for Shipper {
    async fn flush(&self) {
        let batch = lock(&self.buffer).drain();
        if batch.is_empty() {
            debug!("FLUSH | Nothing to flush");
            return;
        }

        let stream = match self.streams.resolve_active_name().await {
            Ok(stream) => stream,
            Err(e) => {
                error!(
                    "FLUSH | Unable to resolve log stream, dropping {} records: {e}",
                    batch.len()
                );
                push_error_record(
                    &self.buffer,
                    self.scheduler.get(),
                    LogRecord::error(FLUSHING_ERROR, &e.to_string()),
                );
                return;
            }
        };

        debug!("FLUSH | Flushing {} records to {stream}", batch.len());
        self.sink.put(&self.group, &stream, &batch).await;
    }
}

/// A running transport.
///
/// Call [`Transport::close`] to ship what is still buffered. Dropping it
/// instead stops the background tasks after one last flush of whatever is
/// pending, without waiting for it.
pub struct Transport {
    buffer: SharedBuffer,
    scheduler: FlushSchedulerHandle,
    scheduler_task: Option<JoinHandle<()>>,
    timer_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    flushed_tx: broadcast::Sender<FlushEvent>,
    sink: Option<Arc<dyn LogSink>>,
}

impl Transport {
    /// Prepares the destination and starts the background tasks.
    ///
    /// Fails only on invalid configuration. Remote failures while creating
    /// the group or the first stream are recorded as error records and
    /// startup continues.
    pub async fn start(
        config: &TransportConfig,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let adapter = SinkAdapter::new(Arc::clone(&sink));
        let buffer: SharedBuffer = Arc::new(Mutex::new(RecordBuffer::new(config.flush_interval)));
        let streams = Arc::new(StreamManager::new(
            config.log_group_name.clone(),
            config.log_stream_name.clone(),
            config.rotation_interval.is_some(),
            adapter.clone(),
        ));

        let mut startup_errors = Vec::new();
        if let Err(e) = adapter.create_group(&config.log_group_name).await {
            error!(
                "TRANSPORT | Failed to create log group {}: {e}",
                config.log_group_name
            );
            startup_errors.push(LogRecord::error(INITIALIZATION_ERROR, &e.to_string()));
        }
        match streams.resolve_active_name().await {
            Ok(stream) => info!(
                "TRANSPORT | Shipping to {}/{stream}",
                config.log_group_name
            ),
            Err(e) => {
                error!("TRANSPORT | Failed to create initial log stream: {e}");
                startup_errors.push(LogRecord::error(INITIALIZATION_ERROR, &e.to_string()));
            }
        }

        let shipper = Arc::new(Shipper {
            group: config.log_group_name.clone(),
            buffer: Arc::clone(&buffer),
            streams: Arc::clone(&streams),
            sink: adapter,
            scheduler: OnceLock::new(),
        });
        let (scheduler, handle) = FlushScheduler::new(
            Arc::clone(&shipper) as Arc<dyn Flush>,
            config.debounce,
            config.max_wait,
        );
        let _ = shipper.scheduler.set(handle.clone());
        let scheduler_task = tokio::spawn(scheduler.run());

        let cancel = CancellationToken::new();
        let timer = Timer {
            rotation: config.rotation_interval.map(repeating),
            flush: repeating(config.flush_interval),
            buffer: Arc::clone(&buffer),
            streams,
            scheduler: handle.clone(),
            cancel: cancel.clone(),
        };
        let timer_task = tokio::spawn(timer.run());

        let (flushed_tx, _) = broadcast::channel(FLUSH_EVENT_CAPACITY);
        let transport = Self {
            buffer,
            scheduler: handle,
            scheduler_task: Some(scheduler_task),
            timer_task: Some(timer_task),
            cancel,
            flushed_tx,
            sink: Some(sink),
        };

        for record in startup_errors {
            if let Err(e) = transport.ingest(record).await {
                error!("TRANSPORT | Unable to queue initialization error: {e}");
            }
        }

        Ok(transport)
    }

    /// Buffers a record, requesting a flush when one is due.
    ///
    /// Waits only when the buffer and its overflow queue are both full, until
    /// a flush has made room.
    pub async fn ingest(&self, record: LogRecord) -> Result<(), TransportError> {
        let mut record = record;
        loop {
            let added = lock(&self.buffer).add(record);
            match added {
                Ok(false) => return Ok(()),
                Ok(true) => {
                    let ticket = self.scheduler.trigger()?;
                    let flushed_tx = self.flushed_tx.clone();
                    tokio::spawn(async move {
                        if ticket.executed().await.is_ok() {
                            // No subscribers is fine
                            let _ = flushed_tx.send(FlushEvent);
                        }
                    });
                    return Ok(());
                }
                Err(BufferFull(returned)) => {
                    debug!("TRANSPORT | Buffer full, waiting for a flush");
                    self.scheduler.trigger()?.executed().await?;
                    record = returned;
                }
            }
        }
    }

    /// Flushes the buffer, immediately when `force` is set and after the
    /// debounce period otherwise. Returns once the flush has executed.
    pub async fn flush(&self, force: bool) -> Result<(), TransportError> {
        if force {
            self.scheduler.force().await
        } else {
            self.scheduler.trigger()?.executed().await
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FlushEvent> {
        self.flushed_tx.subscribe()
    }

    /// Records buffered or deferred and not yet handed to the sink.
    #[must_use]
    pub fn pending(&self) -> usize {
        let buffer = lock(&self.buffer);
        buffer.len() + buffer.deferred_len()
    }

    /// Stops the timers, flushes everything, stops the scheduler and
    /// releases the sink, in that order.
    pub async fn close(mut self) -> Result<(), TransportError> {
        self.cancel.cancel();
        if let Some(timer_task) = self.timer_task.take() {
            if let Err(e) = timer_task.await {
                error!("TRANSPORT | Timer task failed: {e}");
            }
        }

        let mut flushed = self.scheduler.force().await;
        // A drain refills the buffer from the overflow queue.
        if flushed.is_ok() && !lock(&self.buffer).is_idle() {
            flushed = self.scheduler.force().await;
        }

        if let Err(e) = self.scheduler.shutdown() {
            warn!("TRANSPORT | Scheduler already stopped: {e}");
        }
        if let Some(scheduler_task) = self.scheduler_task.take() {
            if let Err(e) = scheduler_task.await {
                error!("TRANSPORT | Scheduler task failed: {e}");
            }
        }

        drop(self.sink.take());
        info!("TRANSPORT | Closed");
        flushed
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if self.scheduler_task.is_none() {
            return;
        }
        debug!("TRANSPORT | Dropped without close, stopping background tasks");
        self.cancel.cancel();
        // The scheduler runs any pending flush before it stops.
        let _ = self.scheduler.shutdown();
    }
}

fn repeating(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Background task driving stream rotation and idle flushes.
struct Timer {
    rotation: Option<Interval>,
    flush: Interval,
    buffer: SharedBuffer,
    streams: Arc<StreamManager>,
    scheduler: FlushSchedulerHandle,
    cancel: CancellationToken,
}

impl Timer {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = next_tick(self.rotation.as_mut()) => self.rotate().await,
                _ = self.flush.tick() => {
                    let buffered = !lock(&self.buffer).is_idle();
                    if buffered {
                        if let Err(e) = self.scheduler.nudge() {
                            warn!("TRANSPORT | Unable to request idle flush: {e}");
                        }
                    }
                }
            }
        }
        debug!("TRANSPORT | Timer task stopped");
    }

    /// Ships what was buffered under the old name, then switches streams.
    async fn rotate(&self) {
        let has_stream = self.streams.current().await.is_some();
        if has_stream && !lock(&self.buffer).is_idle() {
            if let Err(e) = self.scheduler.force().await {
                warn!("TRANSPORT | Flush before rotation failed: {e}");
            }
        }

        match self.streams.rotate().await {
            Ok(_) => lock(&self.buffer).mark_rotated(),
            Err(e) => {
                error!("TRANSPORT | Failed to rotate log stream: {e}");
                push_error_record(
                    &self.buffer,
                    Some(&self.scheduler),
                    LogRecord::error(ROTATION_ERROR, &e.to_string()),
                );
            }
        }
    }
}

async fn next_tick(interval: Option<&mut Interval>) -> Instant {
    match interval {
        Some(interval) => interval.tick().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    #[derive(Default)]
    struct CountingSink {
        puts: AtomicUsize,
        streams: AtomicUsize,
        records: AtomicUsize,
    }

    #[async_trait]
    impl LogSink for CountingSink {
        async fn create_log_group(&self, _group: &str) -> Result<(), SinkError> {
            Ok(())
        }

        async fn create_log_stream(&self, _group: &str, _stream: &str) -> Result<(), SinkError> {
            self.streams.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn put_log_events(
            &self,
            _group: &str,
            _stream: &str,
            events: &[LogRecord],
        ) -> Result<(), SinkError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.records.fetch_add(events.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> TransportConfig {
        TransportConfig {
            rotation_interval: None,
            ..TransportConfig::new("group", "stream")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_flush_on_empty_buffer_is_noop() {
        let sink = Arc::new(CountingSink::default());
        let transport = Transport::start(&config(), Arc::clone(&sink) as Arc<dyn LogSink>)
            .await
            .unwrap();

        transport.flush(true).await.unwrap();

        assert_eq!(transport.pending(), 0);
        assert_eq!(sink.puts.load(Ordering::SeqCst), 0);
        transport.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rejects_invalid_config() {
        let sink = Arc::new(CountingSink::default());
        let config = TransportConfig {
            debounce: Duration::ZERO,
            ..config()
        };

        assert!(Transport::start(&config, sink).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_tick_flushes_trailing_record() {
        let sink = Arc::new(CountingSink::default());
        let config = TransportConfig {
            flush_interval: Duration::from_secs(10),
            debounce: Duration::from_millis(100),
            max_wait: Duration::from_millis(500),
            ..config()
        };
        let transport = Transport::start(&config, Arc::clone(&sink) as Arc<dyn LogSink>)
            .await
            .unwrap();

        // The first record triggers a flush; the second lands after it and
        // does not request one.
        transport.ingest(LogRecord::new(1, "first")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.records.load(Ordering::SeqCst), 1);

        transport.ingest(LogRecord::new(2, "second")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.pending(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(sink.records.load(Ordering::SeqCst), 2);
        assert_eq!(transport.pending(), 0);
        transport.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_creates_new_stream() {
        let sink = Arc::new(CountingSink::default());
        let config = TransportConfig {
            rotation_interval: Some(Duration::from_secs(60)),
            ..TransportConfig::new("group", "app")
        };
        let transport = Transport::start(&config, Arc::clone(&sink) as Arc<dyn LogSink>)
            .await
            .unwrap();
        assert_eq!(sink.streams.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(sink.streams.load(Ordering::SeqCst), 2);
        transport.close().await.unwrap();
    }

    #[derive(Default)]
    struct CountingFlush {
        executions: AtomicUsize,
    }

    #[async_trait]
    impl Flush for CountingFlush {
        async fn flush(&self) {
            self.executions.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_record_requests_flush() {
        let body = Arc::new(CountingFlush::default());
        let (scheduler, handle) = FlushScheduler::new(
            Arc::clone(&body) as Arc<dyn Flush>,
            Duration::from_millis(100),
            Duration::from_millis(500),
        );
        let task = tokio::spawn(scheduler.run());
        let buffer = Mutex::new(RecordBuffer::new(Duration::from_secs(3_600)));

        // First record after startup makes a flush due.
        push_error_record(&buffer, Some(&handle), LogRecord::error(ROTATION_ERROR, "denied"));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(body.executions.load(Ordering::SeqCst), 1);
        assert_eq!(lock(&buffer).len(), 1);
        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[test]
    #[traced_test]
    fn test_error_record_dropped_when_buffer_full() {
        let buffer = Mutex::new(RecordBuffer::with_limits(
            Duration::from_secs(3_600),
            1_000,
            10_000,
            1,
        ));
        lock(&buffer).add(LogRecord::new(1, "kept")).unwrap();
        lock(&buffer).add(LogRecord::new(2, "deferred")).unwrap();

        push_error_record(&buffer, None, LogRecord::error(FLUSHING_ERROR, "denied"));

        assert_eq!(lock(&buffer).len(), 1);
        assert_eq!(lock(&buffer).deferred_len(), 1);
        assert!(logs_contain("Buffer full, dropping error record"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_without_close_stops_tasks() {
        let sink = Arc::new(CountingSink::default());
        let transport = Transport::start(&config(), Arc::clone(&sink) as Arc<dyn LogSink>)
            .await
            .unwrap();
        transport.ingest(LogRecord::new(1, "hello")).await.unwrap();

        drop(transport);
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The pending flush ran and every task released its sink handle.
        assert_eq!(sink.puts.load(Ordering::SeqCst), 1);
        assert_eq!(Arc::strong_count(&sink), 1);
    }
}
