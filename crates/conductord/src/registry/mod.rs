//! Session registry and tick orchestration.
//!
//! The registry is the hub of a running server:
//! - it holds the set of live sessions, keyed and ordered by [`SessionId`]
//! - it owns the identity counter the listener draws from
//! - it runs the two tick loops that give the server its rhythm
//!
//! # Architecture
//!
//! ```text
//!                ┌──────────────────────────────┐
//!   Listener ───▶│           Registry           │
//!   register()   │                              │
//!                │  sessions: BTreeMap<Id, ..>  │
//!                │                              │
//!                │  communication scheduler ────┼──▶ heartbeat to every session
//!                │  (parallel, CommTickRateMs)  │
//!                │                              │
//!                │  state scheduler ────────────┼──▶ drain inbound queues,
//!                │  (sequential, StateTickRate) │    echo / quit
//!                └──────────────────────────────┘
//! ```
//!
//! Registration and removal are only honoured while the registry is
//! accepting, which is exactly the span between a completed start and the
//! beginning of a stop.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Poisoned locks are recovered with `into_inner`

mod handlers;

pub use handlers::{drain_inbound, HeartbeatHandler, InboundHandler};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use conductor_core::{SessionId, Settings};
use conductor_protocol::ServerMessage;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::lifecycle::{CoreProcess, ProcessError, ProcessStateCell};
use crate::scheduler::{DispatchMode, Scheduler};
use crate::server::{Session, SessionOwner};

/// Name of the heartbeat scheduler.
pub const COMMUNICATION_SCHEDULER: &str = "communication";

/// Name of the command-processing scheduler.
pub const STATE_SCHEDULER: &str = "state";

/// Tracks connected sessions and drives the periodic work on them.
pub struct Registry {
    settings: Settings,
    self_ref: Weak<Registry>,
    sessions: Mutex<BTreeMap<SessionId, Arc<Session>>>,
    accepting: AtomicBool,
    state: ProcessStateCell,
    root: CancellationToken,
    scope: Mutex<CancellationToken>,
    schedulers: AsyncMutex<Vec<Scheduler>>,
    next_id: AtomicU64,
}

impl Registry {
    /// Creates a stopped registry whose scopes descend from `root`.
    pub fn new(settings: Settings, root: &CancellationToken) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            settings,
            self_ref: self_ref.clone(),
            sessions: Mutex::new(BTreeMap::new()),
            accepting: AtomicBool::new(false),
            state: ProcessStateCell::new(),
            root: root.clone(),
            scope: Mutex::new(root.child_token()),
            schedulers: AsyncMutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Hands out the next session identity. Identities start at 1 and are
    /// never reused for the lifetime of the registry.
    pub fn next_session_id(&self) -> SessionId {
        SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// The scope new sessions should hang their cancellation off.
    pub fn session_scope(&self) -> CancellationToken {
        lock(&self.scope).clone()
    }

    /// A weak handle sessions use to unregister themselves.
    pub fn session_owner(&self) -> Weak<dyn SessionOwner> {
        self.self_ref.clone()
    }

    /// True while new sessions are admitted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Session Set
    // ------------------------------------------------------------------------

    /// Adds `session` if the registry is accepting, the session is still
    /// live and the identity is new.
    ///
    /// Returns whether the session was added.
    pub fn register(&self, session: Arc<Session>) -> bool {
        let mut sessions = lock(&self.sessions);
        if !self.is_accepting() {
            debug!(session = %session.id(), "Registry not accepting, registration ignored");
            return false;
        }
        // Disconnect raises the flag before it unregisters under this lock,
        // so a session seen live here is removed again by its own teardown.
        if session.is_disconnecting() {
            debug!(session = %session.id(), "Session already disconnecting, registration ignored");
            return false;
        }
        if sessions.contains_key(&session.id()) {
            return false;
        }

        let id = session.id();
        sessions.insert(id, session);
        debug!(session = %id, total = sessions.len(), "Session registered");
        true
    }

    /// Removes `session` if the registry is accepting.
    ///
    /// Returns whether a session was removed.
    pub fn unregister(&self, session: &Session) -> bool {
        let mut sessions = lock(&self.sessions);
        if !self.is_accepting() {
            return false;
        }

        let removed = sessions.remove(&session.id()).is_some();
        if removed {
            debug!(session = %session.id(), total = sessions.len(), "Session unregistered");
        }
        removed
    }

    /// Copies the current members, ordered by identity.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        lock(&self.sessions).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        lock(&self.sessions).contains_key(&id)
    }

    /// Sends `Broadcast: {message}` to every current session in identity
    /// order. A failing session only takes itself down.
    pub async fn broadcast(&self, message: &str) {
        let line = ServerMessage::broadcast(message).to_string();
        let recipients = self.snapshot();
        debug!(recipients = recipients.len(), "Broadcasting");

        for session in recipients {
            session.send(&line).await;
        }
    }
}

#[async_trait]
impl CoreProcess for Registry {
    fn name(&self) -> &str {
        "registry"
    }

    fn state_cell(&self) -> &ProcessStateCell {
        &self.state
    }

    async fn on_start(&self) -> Result<(), ProcessError> {
        let scope = self.root.child_token();
        *lock(&self.scope) = scope.clone();

        let mut communication = Scheduler::new(
            COMMUNICATION_SCHEDULER,
            self.settings.comm_tick_rate,
            DispatchMode::Parallel,
        );
        communication.add_handler(Arc::new(HeartbeatHandler::new(self.self_ref.clone())))?;

        let mut state = Scheduler::new(
            STATE_SCHEDULER,
            self.settings.state_tick_rate,
            DispatchMode::Sequential,
        );
        state.add_handler(Arc::new(InboundHandler::new(self.self_ref.clone())))?;

        communication.start(&scope)?;
        state.start(&scope)?;
        *self.schedulers.lock().await = vec![communication, state];

        self.accepting.store(true, Ordering::Release);
        info!(
            comm_tick_ms = self.settings.comm_tick_rate.as_millis() as u64,
            state_tick_ms = self.settings.state_tick_rate.as_millis() as u64,
            "Registry accepting sessions"
        );
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), ProcessError> {
        self.accepting.store(false, Ordering::Release);

        let schedulers = std::mem::take(&mut *self.schedulers.lock().await);
        for mut scheduler in schedulers {
            scheduler.stop_async().await;
        }

        lock(&self.scope).cancel();

        let drained = std::mem::take(&mut *lock(&self.sessions));
        info!(sessions = drained.len(), "Registry cleared");
        for session in drained.into_values() {
            session.disconnect().await;
        }
        Ok(())
    }
}

impl SessionOwner for Registry {
    fn unregister(&self, session: &Session) {
        Registry::unregister(self, session);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
