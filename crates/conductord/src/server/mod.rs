//! TCP listener for the conductor daemon.
//!
//! The listener:
//! - Binds the configured address (port 0 picks an ephemeral port)
//! - Accepts connections until its scope is cancelled
//! - Sets each connection up in its own task, so a slow reverse lookup never
//!   holds up the next accept
//! - Hands finished sessions to the [`Registry`] and greets them
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Listener     │
//! │                 │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │  setup task     │────▶│    Registry     │
//! │ (per connection)│     │   register()    │
//! └───────┬─────────┘     └─────────────────┘
//!         │ greeting
//!         ▼
//! ┌─────────────────┐
//! │     Session     │
//! │  (reader task)  │
//! └─────────────────┘
//! ```
//!
//! Stopping the listener closes the socket but leaves accepted sessions to
//! the registry.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and the loop keeps going

mod resolve;
mod session;

pub use resolve::resolve_display_name;
pub use session::{Session, SessionError, SessionOwner, MAX_LINE_LENGTH, WRITE_TIMEOUT};

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use conductor_core::Settings;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::lifecycle::{CoreProcess, ProcessError, ProcessStateCell};
use crate::registry::Registry;

/// Accepts TCP connections and turns them into registered sessions.
pub struct Listener {
    settings: Settings,
    registry: Arc<Registry>,
    root: CancellationToken,
    state: ProcessStateCell,
    scope: Mutex<CancellationToken>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// Creates a stopped listener whose scope descends from `root`.
    pub fn new(settings: Settings, registry: Arc<Registry>, root: &CancellationToken) -> Self {
        Self {
            settings,
            registry,
            root: root.clone(),
            state: ProcessStateCell::new(),
            scope: Mutex::new(root.child_token()),
            local_addr: Mutex::new(None),
            accept_task: AsyncMutex::new(None),
        }
    }

    /// The address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }
}

#[async_trait]
impl CoreProcess for Listener {
    fn name(&self) -> &str {
        "listener"
    }

    fn state_cell(&self) -> &ProcessStateCell {
        &self.state
    }

    async fn on_start(&self) -> Result<(), ProcessError> {
        if self.settings.host_address.trim().is_empty() {
            return Err(ProcessError::InvalidAddress(self.settings.host_address.clone()));
        }

        let addr = self.settings.bind_address();
        let listener = TcpListener::bind(&addr).await.map_err(|e| ProcessError::Bind {
            addr: addr.clone(),
            error: e.to_string(),
        })?;
        let local = listener.local_addr().map_err(|e| ProcessError::Bind {
            addr: addr.clone(),
            error: e.to_string(),
        })?;
        *lock(&self.local_addr) = Some(local);

        let scope = self.root.child_token();
        *lock(&self.scope) = scope.clone();

        let accept = AcceptLoop {
            listener,
            registry: Arc::clone(&self.registry),
            greeting: self.settings.greeting_line(),
            resolve_timeout: self.settings.resolve_timeout,
            cancel: scope,
        };
        *self.accept_task.lock().await = Some(tokio::spawn(accept.run()));

        info!(address = %local, "Listening");
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), ProcessError> {
        lock(&self.scope).cancel();

        if let Some(task) = self.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Accept loop terminated abnormally");
            }
        }
        *lock(&self.local_addr) = None;
        Ok(())
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

struct AcceptLoop {
    listener: TcpListener,
    registry: Arc<Registry>,
    greeting: Option<String>,
    resolve_timeout: Duration,
    cancel: CancellationToken,
}

impl AcceptLoop {
    async fn run(self) {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!("Accept loop cancelled");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!(peer = %addr, "Accepted connection");
                            tokio::spawn(setup_session(
                                stream,
                                Arc::clone(&self.registry),
                                self.greeting.clone(),
                                self.resolve_timeout,
                            ));
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            // Continue accepting other connections
                        }
                    }
                }
            }
        }
        // Dropping `self.listener` here closes the socket.
    }
}

/// Builds, registers and greets one accepted connection.
async fn setup_session(
    stream: TcpStream,
    registry: Arc<Registry>,
    greeting: Option<String>,
    resolve_timeout: Duration,
) {
    let id = registry.next_session_id();
    let scope = registry.session_scope();

    let session = match Session::spawn(id, stream, registry.session_owner(), &scope, resolve_timeout).await {
        Ok(session) => session,
        Err(e) => {
            warn!(session = %id, error = %e, "Failed to set up session");
            return;
        }
    };

    if !registry.register(Arc::clone(&session)) {
        warn!(session = %id, "Registry refused session, disconnecting");
        session.disconnect().await;
        return;
    }

    if let Some(greeting) = greeting {
        session.send_raw(&format!("{greeting}\r\n")).await;
    }

    info!(
        session = %id,
        name = %session.name(),
        endpoint = %session.endpoint(),
        "Client connected"
    );
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
