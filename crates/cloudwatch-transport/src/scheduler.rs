// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Debounce-with-max-wait flush scheduling.
//!
//! The scheduler is an actor: handles send commands over a channel and a
//! single task owns the flush state and runs the flush body. Because only
//! that task ever runs the body, two flushes can never overlap.
//!
//! ```text
//!              trigger                      timer fires
//!   ┌──────┐ ──────────> ┌─────────┐ ───────────────────> ┌───────────┐
//!   │ Idle │             │ Pending │                      │ Executing │
//!   └──────┘ <────────── └─────────┘ <──── trigger        └─────┬─────┘
//!      ^        (none)       │  (restarts debounce,             │
//!      │                     │   max-wait keeps running)        │
//!      └────────────────────────────────────────────────────────┘
//!                         execution complete
//! ```
//!
//! - **Debounce**: a pending flush runs once `debounce` passes without a new
//!   trigger.
//! - **Max wait**: a pending flush runs at most `max_wait` after the previous
//!   execution started, however often triggers keep arriving. After a quiet
//!   spell longer than `max_wait` the window starts at the first trigger.
//! - **Triggers during execution** stay queued in the channel and start a new
//!   pending period once the body returns, so none is lost.
//! - **Nudge** starts a pending period when there is none and is ignored
//!   otherwise, so periodic nudges cannot keep postponing a flush.
//! - **Force** skips the pending period: the body runs as soon as the current
//!   execution (if any) finishes and the caller waits for it.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error};

use crate::constants::{DEFAULT_DEBOUNCE, DEFAULT_MAX_WAIT};
use crate::error::TransportError;

/// The work a scheduled flush performs.
#[async_trait]
pub trait Flush: Send + Sync {
    async fn flush(&self);
}

#[derive(Debug)]
pub enum SchedulerCommand {
    /// Request a coalesced flush; the sender fires once it has executed.
    Trigger(oneshot::Sender<()>),
    /// Run a flush now; the sender fires once it has executed.
    Force(oneshot::Sender<()>),
    /// Start a pending period if none is running. Never postpones one.
    Nudge,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    Idle,
    Pending {
        first_trigger: Instant,
        last_trigger: Instant,
    },
    Executing,
}

/// Resolves once the flush covering a trigger has executed.
#[derive(Debug)]
pub struct FlushTicket(oneshot::Receiver<()>);

impl FlushTicket {
    /// Fails only if the scheduler stopped without executing the flush.
    pub async fn executed(self) -> Result<(), TransportError> {
        self.0.await.map_err(|_| TransportError::SchedulerStopped)
    }
}

#[derive(Clone, Debug)]
pub struct FlushSchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
}

impl FlushSchedulerHandle {
    /// Requests a coalesced flush without waiting for it.
    pub fn trigger(&self) -> Result<FlushTicket, TransportError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Trigger(response_tx))
            .map_err(|_| TransportError::SchedulerStopped)?;
        Ok(FlushTicket(response_rx))
    }

    /// Runs a flush immediately and waits for it to complete.
    pub async fn force(&self) -> Result<(), TransportError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Force(response_tx))
            .map_err(|_| TransportError::SchedulerStopped)?;
        response_rx
            .await
            .map_err(|_| TransportError::SchedulerStopped)
    }

    /// Requests a flush unless one is already pending.
    pub fn nudge(&self) -> Result<(), TransportError> {
        self.tx
            .send(SchedulerCommand::Nudge)
            .map_err(|_| TransportError::SchedulerStopped)
    }

    pub fn shutdown(&self) -> Result<(), TransportError> {
        self.tx
            .send(SchedulerCommand::Shutdown)
            .map_err(|_| TransportError::SchedulerStopped)
    }
}

pub struct FlushScheduler {
    body: Arc<dyn Flush>,
    rx: mpsc::UnboundedReceiver<SchedulerCommand>,
    debounce: Duration,
    max_wait: Duration,
    state: FlushState,
    last_execution: Option<Instant>,
    /// Tickets to resolve when the next execution completes.
    waiters: Vec<oneshot::Sender<()>>,
}

impl FlushScheduler {
    #[must_use]
    pub fn new(
        body: Arc<dyn Flush>,
        debounce: Duration,
        max_wait: Duration,
    ) -> (Self, FlushSchedulerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            body,
            rx,
            debounce,
            max_wait: max_wait.max(debounce),
            state: FlushState::Idle,
            last_execution: None,
            waiters: Vec::new(),
        };
        (scheduler, FlushSchedulerHandle { tx })
    }

    /// Creates a scheduler with the default debounce and max wait.
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn default(body: Arc<dyn Flush>) -> (Self, FlushSchedulerHandle) {
        Self::new(body, DEFAULT_DEBOUNCE, DEFAULT_MAX_WAIT)
    }

    pub async fn run(mut self) {
        debug!("FLUSH | Scheduler started");

        loop {
            let command = match self.state {
                FlushState::Pending {
                    first_trigger,
                    last_trigger,
                } => {
                    let deadline = self.deadline(first_trigger, last_trigger);
                    tokio::select! {
                        command = self.rx.recv() => command,
                        () = sleep_until(deadline) => {
                            self.execute().await;
                            continue;
                        }
                    }
                }
                FlushState::Idle | FlushState::Executing => self.rx.recv().await,
            };

            match command {
                Some(SchedulerCommand::Trigger(response_tx)) => {
                    self.waiters.push(response_tx);
                    let now = Instant::now();
                    self.state = match self.state {
                        FlushState::Pending { first_trigger, .. } => FlushState::Pending {
                            first_trigger,
                            last_trigger: now,
                        },
                        FlushState::Idle | FlushState::Executing => FlushState::Pending {
                            first_trigger: now,
                            last_trigger: now,
                        },
                    };
                }
                Some(SchedulerCommand::Nudge) => {
                    if !matches!(self.state, FlushState::Pending { .. }) {
                        let now = Instant::now();
                        self.state = FlushState::Pending {
                            first_trigger: now,
                            last_trigger: now,
                        };
                    }
                }
                Some(SchedulerCommand::Force(response_tx)) => {
                    debug!("FLUSH | Forced flush requested");
                    self.waiters.push(response_tx);
                    self.execute().await;
                }
                Some(SchedulerCommand::Shutdown) | None => {
                    if matches!(self.state, FlushState::Pending { .. }) {
                        debug!("FLUSH | Running pending flush before stopping");
                        self.execute().await;
                    }
                    break;
                }
            }
        }

        debug!("FLUSH | Scheduler stopped");
    }

    fn deadline(&self, first_trigger: Instant, last_trigger: Instant) -> Instant {
        let window_start = match self.last_execution {
            Some(previous) if first_trigger < previous + self.max_wait => previous,
            _ => first_trigger,
        };
        (last_trigger + self.debounce).min(window_start + self.max_wait)
    }

    async fn execute(&mut self) {
        self.state = FlushState::Executing;
        self.last_execution = Some(Instant::now());
        self.body.flush().await;
        self.state = FlushState::Idle;

        for waiter in self.waiters.drain(..) {
            if waiter.send(()).is_err() {
                error!("FLUSH | Failed to notify flush completion - receiver dropped");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingFlush {
        executions: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
        duration: Duration,
    }

    #[async_trait]
    impl Flush for CountingFlush {
        async fn flush(&self) {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            if !self.duration.is_zero() {
                tokio::time::sleep(self.duration).await;
            }
            self.executions.fetch_add(1, Ordering::SeqCst);
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn start(
        body: &Arc<CountingFlush>,
        debounce_ms: u64,
        max_wait_ms: u64,
    ) -> (FlushSchedulerHandle, tokio::task::JoinHandle<()>) {
        let (scheduler, handle) = FlushScheduler::new(
            Arc::clone(body) as Arc<dyn Flush>,
            Duration::from_millis(debounce_ms),
            Duration::from_millis(max_wait_ms),
        );
        (handle, tokio::spawn(scheduler.run()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_one_execution() {
        let body = Arc::new(CountingFlush::default());
        let (handle, task) = start(&body, 1_000, 5_000);

        let tickets: Vec<FlushTicket> = (0..100).map(|_| handle.trigger().unwrap()).collect();
        for ticket in tickets {
            ticket.executed().await.unwrap();
        }

        assert_eq!(body.executions.load(Ordering::SeqCst), 1);

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_waits_for_quiet_period() {
        let body = Arc::new(CountingFlush::default());
        let (handle, task) = start(&body, 1_000, 5_000);

        let started = Instant::now();
        handle.trigger().unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        let ticket = handle.trigger().unwrap();
        ticket.executed().await.unwrap();

        assert_eq!(body.executions.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::from_millis(1_600));

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_wait_bounds_continuous_triggers() {
        let body = Arc::new(CountingFlush::default());
        let (handle, task) = start(&body, 1_000, 2_000);

        // 10 seconds of triggers every 100ms never leave a quiet second
        for _ in 0..100 {
            handle.trigger().unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // Let the execution due at the 10s mark run
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(body.executions.load(Ordering::SeqCst) >= 10_000 / 2_000);

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_during_execution_runs_again() {
        let body = Arc::new(CountingFlush {
            duration: Duration::from_millis(500),
            ..Default::default()
        });
        let (handle, task) = start(&body, 100, 1_000);

        let first = handle.trigger().unwrap();
        // Execution runs from 100ms to 600ms
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(body.running.load(Ordering::SeqCst), 1);
        let second = handle.trigger().unwrap();

        first.executed().await.unwrap();
        second.executed().await.unwrap();

        assert_eq!(body.executions.load(Ordering::SeqCst), 2);
        assert_eq!(body.max_running.load(Ordering::SeqCst), 1);

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_nudge_does_not_postpone_pending_flush() {
        let body = Arc::new(CountingFlush::default());
        let (handle, task) = start(&body, 1_000, 5_000);

        let started = Instant::now();
        let ticket = handle.trigger().unwrap();
        tokio::time::sleep(Duration::from_millis(900)).await;
        handle.nudge().unwrap();
        ticket.executed().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(1_000));

        // From idle a nudge starts a debounced flush of its own
        handle.nudge().unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(body.executions.load(Ordering::SeqCst), 2);

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_bypasses_debounce() {
        let body = Arc::new(CountingFlush::default());
        let (handle, task) = start(&body, 1_000, 5_000);

        let pending = handle.trigger().unwrap();
        let started = Instant::now();
        handle.force().await.unwrap();

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(body.executions.load(Ordering::SeqCst), 1);
        // The forced run covered the pending trigger too
        pending.executed().await.unwrap();
        assert_eq!(body.executions.load(Ordering::SeqCst), 1);

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_triggers_never_overlap() {
        let body = Arc::new(CountingFlush {
            duration: Duration::from_millis(250),
            ..Default::default()
        });
        let (handle, task) = start(&body, 50, 200);

        let mut producers = Vec::new();
        for _ in 0..4 {
            let handle = handle.clone();
            producers.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let _ = handle.trigger();
                    tokio::time::sleep(Duration::from_millis(30)).await;
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }
        handle.force().await.unwrap();

        assert!(body.executions.load(Ordering::SeqCst) >= 2);
        assert_eq!(body.max_running.load(Ordering::SeqCst), 1);

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_runs_pending_flush() {
        let body = Arc::new(CountingFlush::default());
        let (handle, task) = start(&body, 1_000, 5_000);

        let ticket = handle.trigger().unwrap();
        handle.shutdown().unwrap();
        task.await.unwrap();

        ticket.executed().await.unwrap();
        assert_eq!(body.executions.load(Ordering::SeqCst), 1);
        assert!(handle.trigger().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_shutdown_does_not_flush() {
        let body = Arc::new(CountingFlush::default());
        let (handle, task) = start(&body, 1_000, 5_000);

        handle.shutdown().unwrap();
        task.await.unwrap();

        assert_eq!(body.executions.load(Ordering::SeqCst), 0);
        assert!(matches!(
            handle.force().await,
            Err(TransportError::SchedulerStopped)
        ));
    }
}
