//! One connected client.
//!
//! A [`Session`] owns both halves of a TCP stream. Right after construction a
//! reader task starts pulling lines off the socket and queueing them; the
//! registry's state tick drains that queue later. Writes go straight to the
//! socket under a timeout.
//!
//! Teardown is centralised in [`Session::disconnect`], guarded by an atomic
//! flag so that the reader task, a failed write and an explicit `quit` can
//! all race to it safely. Only the first caller does the work.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Transport failures are logged and end the session, never the caller
//! - Poisoned locks are recovered with `into_inner`

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use conductor_core::SessionId;
use conductor_protocol::{ensure_terminated, strip_terminator};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::resolve::resolve_display_name;

// ============================================================================
// Constants
// ============================================================================

/// Maximum accepted line length in bytes, terminator excluded.
///
/// `\n` and `\r\n` terminated lines get the same budget.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Extra bytes read past [`MAX_LINE_LENGTH`]: a stray leading `\r` plus `\r\n`.
const TERMINATOR_SLACK: u64 = 3;

/// Timeout for a single write, including the flush.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Session Owner
// ============================================================================

/// Whoever tracks sessions and must forget them on disconnect.
pub trait SessionOwner: Send + Sync {
    fn unregister(&self, session: &Session);
}

// ============================================================================
// Session
// ============================================================================

/// A connected client.
pub struct Session {
    id: SessionId,
    endpoint: SocketAddr,
    name: String,
    connected_at: DateTime<Utc>,
    reader: AsyncMutex<BufReader<OwnedReadHalf>>,
    writer: AsyncMutex<Option<BufWriter<OwnedWriteHalf>>>,
    inbound_tx: mpsc::UnboundedSender<String>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    disconnecting: AtomicBool,
    cancel: CancellationToken,
    owner: Weak<dyn SessionOwner>,
}

impl Session {
    /// Wraps an accepted stream and starts its reader task.
    ///
    /// The session's cancellation scope is a child of `scope`, so cancelling
    /// `scope` tears the session down. A zero `resolve_timeout` skips the
    /// reverse lookup.
    pub async fn spawn(
        id: SessionId,
        stream: TcpStream,
        owner: Weak<dyn SessionOwner>,
        scope: &CancellationToken,
        resolve_timeout: Duration,
    ) -> std::io::Result<Arc<Self>> {
        let endpoint = stream.peer_addr()?;
        let name = resolve_display_name(endpoint.ip(), resolve_timeout).await;
        let (read_half, write_half) = stream.into_split();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let session = Arc::new(Self {
            id,
            endpoint,
            name,
            connected_at: Utc::now(),
            reader: AsyncMutex::new(BufReader::new(read_half)),
            writer: AsyncMutex::new(Some(BufWriter::new(write_half))),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            disconnecting: AtomicBool::new(false),
            cancel: scope.child_token(),
            owner,
        });

        debug!(session = %id, %endpoint, name = %session.name, "Session created");
        tokio::spawn(Arc::clone(&session).reader_loop());

        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Remote address of the peer.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Reverse-resolved host name, or the literal address.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// True once teardown has begun.
    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Sends one line, appending the terminator if missing.
    ///
    /// Failures disconnect the session and are not reported to the caller.
    pub async fn send(&self, line: &str) {
        let line = ensure_terminated(line);
        self.write(line.as_ref()).await;
    }

    /// Sends `text` exactly as given.
    pub async fn send_raw(&self, text: &str) {
        self.write(text).await;
    }

    async fn write(&self, text: &str) {
        if self.is_disconnecting() {
            return;
        }

        // The writer lock is released before disconnect() takes it again.
        if let Err(e) = self.try_write(text).await {
            match e {
                SessionError::Io(_) | SessionError::WriteTimeout => {
                    warn!(session = %self.id, name = %self.name, error = %e, "Write failed");
                }
                _ => {
                    error!(session = %self.id, name = %self.name, error = %e, "Unexpected write failure");
                }
            }
            self.disconnect().await;
        }
    }

    async fn try_write(&self, text: &str) -> Result<(), SessionError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Ok(());
        };

        let write = async {
            writer.write_all(text.as_bytes()).await?;
            writer.flush().await
        };

        match timeout(WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::Io(e.to_string())),
            Err(_) => Err(SessionError::WriteTimeout),
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Reads one line with its terminator stripped.
    ///
    /// Returns an empty string on EOF, read failure or cancellation. EOF and
    /// failures disconnect the session.
    pub async fn receive(&self) -> String {
        match self.read_line().await {
            Ok(ReadEvent::Line(line)) => line,
            Ok(ReadEvent::Cancelled) => String::new(),
            Ok(ReadEvent::Closed) => {
                debug!(session = %self.id, "Connection closed by peer");
                self.disconnect().await;
                String::new()
            }
            Err(e) => {
                match e {
                    SessionError::Io(_) | SessionError::LineTooLong { .. } => {
                        warn!(session = %self.id, name = %self.name, error = %e, "Read failed");
                    }
                    _ => {
                        error!(session = %self.id, name = %self.name, error = %e, "Unexpected read failure");
                    }
                }
                self.disconnect().await;
                String::new()
            }
        }
    }

    async fn read_line(&self) -> Result<ReadEvent, SessionError> {
        let mut reader = self.reader.lock().await;
        let mut buf = Vec::new();
        let mut limited = (&mut *reader).take(MAX_LINE_LENGTH as u64 + TERMINATOR_SLACK);

        let read = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(ReadEvent::Cancelled),
            read = limited.read_until(b'\n', &mut buf) => read,
        };

        let n = read.map_err(|e| SessionError::Io(e.to_string()))?;
        if n == 0 {
            return Ok(ReadEvent::Closed);
        }

        let content = strip_terminator(&buf);
        if content.len() > MAX_LINE_LENGTH {
            return Err(SessionError::LineTooLong {
                size: content.len(),
                max: MAX_LINE_LENGTH,
            });
        }

        Ok(ReadEvent::Line(String::from_utf8_lossy(content).into_owned()))
    }

    /// Takes the next queued inbound line without waiting.
    pub fn try_dequeue(&self) -> Option<String> {
        let mut rx = match self.inbound_rx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        rx.try_recv().ok()
    }

    async fn reader_loop(self: Arc<Self>) {
        while !self.cancel.is_cancelled() && !self.is_disconnecting() {
            let line = self.receive().await;
            if line.trim().is_empty() {
                continue;
            }
            if self.inbound_tx.send(line).is_err() {
                break;
            }
        }

        self.disconnect().await;
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Tears the session down. Only the first call has any effect.
    pub async fn disconnect(&self) {
        if self
            .disconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if let Some(owner) = self.owner.upgrade() {
            owner.unregister(self);
        }
        self.cancel.cancel();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            match timeout(WRITE_TIMEOUT, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(session = %self.id, error = %e, "Transport shutdown failed"),
                Err(_) => debug!(session = %self.id, "Transport shutdown timed out"),
            }
        }

        let connected = Utc::now() - self.connected_at;
        info!(
            session = %self.id,
            name = %self.name,
            connected_secs = connected.num_seconds(),
            "Session disconnected"
        );
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("name", &self.name)
            .field("disconnecting", &self.is_disconnecting())
            .finish()
    }
}

enum ReadEvent {
    Line(String),
    Closed,
    Cancelled,
}

/// Session transport and protocol errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Write timed out")]
    WriteTimeout,

    #[error("Line too long: {size} bytes (max {max})")]
    LineTooLong { size: usize, max: usize },
}
