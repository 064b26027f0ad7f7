//! Fixed-rate tick scheduler.
//!
//! A [`Scheduler`] drives an ordered list of [`TickHandler`]s at a fixed
//! interval. Each tick:
//!
//! 1. The tick counter advances (the first tick is 1).
//! 2. Every handler runs, either all concurrently ([`DispatchMode::Parallel`])
//!    or one at a time in registration order ([`DispatchMode::Sequential`]).
//! 3. The loop sleeps for whatever is left of the interval. A tick that ran
//!    longer than the interval logs an overrun and the next tick starts
//!    immediately; missed ticks are not replayed.
//!
//! Handlers run in their own tasks, so an error or a panic in one handler is
//! logged for that tick and never stops the loop.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Handler panics are caught through their `JoinHandle`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ============================================================================
// Handler Trait
// ============================================================================

/// How a scheduler runs its handlers within one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// All handlers run concurrently; the tick waits for all of them.
    Parallel,
    /// Handlers run one after another in registration order.
    Sequential,
}

/// Work invoked once per tick.
#[async_trait]
pub trait TickHandler: Send + Sync + 'static {
    /// Name used in log entries.
    fn name(&self) -> &str;

    /// Runs the handler for `tick`.
    async fn on_tick(&self, tick: u64) -> Result<(), SchedulerError>;
}

/// Errors produced by the scheduler and its handlers.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduler {name} has already been started")]
    AlreadyStarted { name: String },

    #[error("Tick handler failed: {0}")]
    HandlerFailed(String),
}

// ============================================================================
// Scheduler
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

/// Runs registered handlers at a fixed interval until cancelled.
pub struct Scheduler {
    name: String,
    interval: Duration,
    mode: DispatchMode,
    handlers: Vec<Arc<dyn TickHandler>>,
    state: SchedulerState,
    tick: Arc<AtomicU64>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Creates an idle scheduler.
    pub fn new(name: impl Into<String>, interval: Duration, mode: DispatchMode) -> Self {
        Self {
            name: name.into(),
            interval,
            mode,
            handlers: Vec::new(),
            state: SchedulerState::Idle,
            tick: Arc::new(AtomicU64::new(0)),
            cancel: None,
            task: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Appends a handler. Only allowed before the scheduler is started.
    pub fn add_handler(&mut self, handler: Arc<dyn TickHandler>) -> Result<(), SchedulerError> {
        if self.state != SchedulerState::Idle {
            return Err(SchedulerError::AlreadyStarted {
                name: self.name.clone(),
            });
        }
        self.handlers.push(handler);
        Ok(())
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// The last tick dispatched, or 0 before the first tick.
    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    /// Returns true between a successful `start` and the next stop.
    pub fn is_running(&self) -> bool {
        self.state == SchedulerState::Running
    }

    /// Starts the tick loop under a child of `scope`.
    ///
    /// A scheduler runs at most once; starting it again is an error.
    pub fn start(&mut self, scope: &CancellationToken) -> Result<(), SchedulerError> {
        if self.state != SchedulerState::Idle {
            return Err(SchedulerError::AlreadyStarted {
                name: self.name.clone(),
            });
        }

        let cancel = scope.child_token();
        let tick_loop = TickLoop {
            name: self.name.clone(),
            interval: self.interval,
            mode: self.mode,
            handlers: self.handlers.clone(),
            tick: Arc::clone(&self.tick),
            cancel: cancel.clone(),
        };

        info!(
            scheduler = %self.name,
            interval_ms = self.interval.as_millis() as u64,
            mode = ?self.mode,
            handlers = self.handlers.len(),
            "Scheduler starting"
        );

        self.task = Some(tokio::spawn(tick_loop.run()));
        self.cancel = Some(cancel);
        self.state = SchedulerState::Running;
        Ok(())
    }

    /// Signals the loop to stop without waiting for it.
    pub fn stop(&mut self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
        if self.state == SchedulerState::Running {
            self.state = SchedulerState::Stopped;
        }
    }

    /// Signals the loop to stop and waits for it to exit.
    pub async fn stop_async(&mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(scheduler = %self.name, error = %e, "Tick loop terminated abnormally");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }
}

// ============================================================================
// Tick Loop
// ============================================================================

/// State moved into the spawned loop task.
struct TickLoop {
    name: String,
    interval: Duration,
    mode: DispatchMode,
    handlers: Vec<Arc<dyn TickHandler>>,
    tick: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl TickLoop {
    async fn run(self) {
        let mut tick: u64 = 0;

        while !self.cancel.is_cancelled() {
            tick += 1;
            self.tick.store(tick, Ordering::Release);
            let started = Instant::now();

            match self.mode {
                DispatchMode::Parallel => self.dispatch_parallel(tick).await,
                DispatchMode::Sequential => self.dispatch_sequential(tick).await,
            }

            let elapsed = started.elapsed();
            if elapsed < self.interval {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.interval - elapsed) => {}
                }
            } else {
                warn!(
                    scheduler = %self.name,
                    tick,
                    elapsed_ms = elapsed.as_millis() as u64,
                    interval_ms = self.interval.as_millis() as u64,
                    "Tick overran its interval"
                );
            }
        }

        debug!(scheduler = %self.name, last_tick = tick, "Tick loop exited");
    }

    async fn dispatch_parallel(&self, tick: u64) {
        let mut set = JoinSet::new();
        for handler in &self.handlers {
            let handler = Arc::clone(handler);
            set.spawn(async move {
                let result = handler.on_tick(tick).await;
                (handler, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((handler, result)) => self.report(handler.name(), tick, result),
                Err(e) => self.report_panic("<parallel>", tick, e),
            }
        }
    }

    async fn dispatch_sequential(&self, tick: u64) {
        for handler in &self.handlers {
            let task = {
                let handler = Arc::clone(handler);
                tokio::spawn(async move { handler.on_tick(tick).await })
            };
            match task.await {
                Ok(result) => self.report(handler.name(), tick, result),
                Err(e) => self.report_panic(handler.name(), tick, e),
            }
        }
    }

    fn report(&self, handler: &str, tick: u64, result: Result<(), SchedulerError>) {
        if let Err(e) = result {
            error!(scheduler = %self.name, handler, tick, error = %e, "Tick handler failed");
        }
    }

    fn report_panic(&self, handler: &str, tick: u64, e: JoinError) {
        error!(scheduler = %self.name, handler, tick, error = %e, "Tick handler panicked");
    }
}
