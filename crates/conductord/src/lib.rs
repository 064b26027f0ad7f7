//! Conductor daemon library.
//!
//! This crate provides the server behind the `conductord` binary:
//! - TCP listener handing accepted connections to sessions
//! - Session registry with heartbeat and command-processing tick loops
//! - Fixed-rate scheduler with parallel or sequential dispatch
//! - Start/stop lifecycle shared by the long-running components
//!
//! # Architecture
//!
//! ```text
//!                        root CancellationToken
//!                 ┌──────────────┴──────────────┐
//!                 ▼                             ▼
//!         ┌──────────────┐              ┌──────────────┐
//!         │   Listener   │─ register ──▶│   Registry   │
//!         │ accept loop  │              │  schedulers  │
//!         └──────────────┘              └──────┬───────┘
//!                                              │ session scope
//!                                              ▼
//!                                       ┌──────────────┐
//!                                       │   Sessions   │
//!                                       │ reader tasks │
//!                                       └──────────────┘
//! ```
//!
//! [`Conductor`] wires the pieces together and is the usual entry point.

pub mod conductor;
pub mod lifecycle;
pub mod registry;
pub mod scheduler;
pub mod server;

pub use conductor::{Conductor, ServerError};
pub use lifecycle::{CoreProcess, ProcessError, ProcessState, ProcessStateCell};
pub use registry::Registry;
pub use scheduler::{DispatchMode, Scheduler, SchedulerError, TickHandler};
pub use server::{Listener, Session, SessionError, SessionOwner};
