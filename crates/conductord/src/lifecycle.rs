//! Start/stop state machine shared by the long-running components.
//!
//! Every component with an orderly startup and shutdown (the listener and the
//! registry) implements [`CoreProcess`]. The trait supplies
//! `request_start`/`request_stop`, which drive the state machine around the
//! implementor's `on_start`/`on_stop` hooks:
//!
//! ```text
//!            request_start              on_start ok
//!  Stopped ─────────────────▶ Starting ─────────────▶ Running
//!     ▲                          │ on_start err          │
//!     │◀─────────────────────────┘                       │ request_stop
//!     │            on_stop ok / err                      ▼
//!     └────────────────────────────────────────────── Stopping
//! ```
//!
//! A failing hook never escapes to the caller. The error is logged and the
//! state is forced to `Stopped`, so callers only ever observe a stable state.
//!
//! A stop requested while the process is `Starting` waits for the start to
//! settle and then stops it; a start requested while `Stopping` waits the
//! same way. The two hooks never run at the same time.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Hook failures become log entries and a `Stopped` state

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::scheduler::SchedulerError;

// ============================================================================
// Process State
// ============================================================================

/// Lifecycle state of a [`CoreProcess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ProcessState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

/// Atomically readable and updatable [`ProcessState`].
///
/// Tick handlers read it on every tick, so reads are lock-free. Every change
/// wakes the tasks parked in [`ProcessStateCell::wait_while`].
#[derive(Debug)]
pub struct ProcessStateCell {
    state: AtomicU8,
    changed: Notify,
}

impl ProcessStateCell {
    /// Creates a cell in the `Stopped` state.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ProcessState::Stopped as u8),
            changed: Notify::new(),
        }
    }

    /// Returns the current state.
    pub fn get(&self) -> ProcessState {
        ProcessState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Unconditionally sets the state.
    pub fn set(&self, state: ProcessState) {
        self.state.store(state as u8, Ordering::Release);
        self.changed.notify_waiters();
    }

    /// Moves from `from` to `to` if the current state is still `from`.
    ///
    /// Returns the state observed before the attempt.
    pub fn transition(&self, from: ProcessState, to: ProcessState) -> Result<(), ProcessState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| self.changed.notify_waiters())
            .map_err(ProcessState::from_u8)
    }

    /// Waits until the state is no longer `state` and returns the new one.
    pub async fn wait_while(&self, state: ProcessState) -> ProcessState {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            // Registered before the check so a change in between is not missed.
            changed.as_mut().enable();

            let current = self.get();
            if current != state {
                return current;
            }
            changed.await;
        }
    }

    /// Returns true while the state is `Running`.
    pub fn is_running(&self) -> bool {
        self.get() == ProcessState::Running
    }
}

impl Default for ProcessStateCell {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Core Process
// ============================================================================

/// A component with a managed start/stop lifecycle.
///
/// Implementors provide a name, a state cell and the two hooks; the
/// provided methods implement the state machine.
#[async_trait]
pub trait CoreProcess: Send + Sync {
    /// Human-readable name used in log entries.
    fn name(&self) -> &str;

    /// The cell holding this process's lifecycle state.
    fn state_cell(&self) -> &ProcessStateCell;

    /// Brings the process up. Runs while the state is `Starting`.
    async fn on_start(&self) -> Result<(), ProcessError>;

    /// Tears the process down. Runs while the state is `Stopping`.
    async fn on_stop(&self) -> Result<(), ProcessError>;

    /// Returns the current lifecycle state.
    fn state(&self) -> ProcessState {
        self.state_cell().get()
    }

    /// Starts the process unless it is already running or starting.
    ///
    /// A stop in progress is allowed to finish first.
    async fn request_start(&self) {
        let cell = self.state_cell();
        let mut current = cell.get();
        loop {
            if matches!(current, ProcessState::Running | ProcessState::Starting) {
                warn!(process = self.name(), state = %current, "Start requested but process is already up");
                return;
            }
            if current == ProcessState::Stopping {
                debug!(process = self.name(), "Start requested while stopping, waiting");
                current = cell.wait_while(ProcessState::Stopping).await;
                continue;
            }
            match cell.transition(current, ProcessState::Starting) {
                Ok(()) => break,
                Err(observed) => current = observed,
            }
        }

        info!(process = self.name(), "Starting");

        match self.on_start().await {
            Ok(()) => {
                cell.set(ProcessState::Running);
                info!(process = self.name(), "Running");
            }
            Err(e) => {
                cell.set(ProcessState::Stopped);
                error!(process = self.name(), error = %e, "Failed to start");
            }
        }
    }

    /// Stops the process unless it is already stopped or stopping.
    ///
    /// A start in progress is allowed to finish first, then undone.
    async fn request_stop(&self) {
        let cell = self.state_cell();
        let mut current = cell.get();
        loop {
            if matches!(current, ProcessState::Stopped | ProcessState::Stopping) {
                warn!(process = self.name(), state = %current, "Stop requested but process is already down");
                return;
            }
            if current == ProcessState::Starting {
                debug!(process = self.name(), "Stop requested while starting, waiting");
                current = cell.wait_while(ProcessState::Starting).await;
                continue;
            }
            match cell.transition(current, ProcessState::Stopping) {
                Ok(()) => break,
                Err(observed) => current = observed,
            }
        }

        info!(process = self.name(), "Stopping");

        match self.on_stop().await {
            Ok(()) => info!(process = self.name(), "Stopped"),
            Err(e) => error!(process = self.name(), error = %e, "Failed to stop cleanly"),
        }
        cell.set(ProcessState::Stopped);
    }
}

/// Errors returned by lifecycle hooks.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Invalid bind address {0}")]
    InvalidAddress(String),

    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: String, error: String },

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("{0}")]
    Other(String),
}
