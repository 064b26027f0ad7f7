//! Tick handlers installed by the registry.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use conductor_protocol::{ClientCommand, ServerMessage};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::Registry;
use crate::scheduler::{SchedulerError, TickHandler};
use crate::server::Session;

/// Sends `Tick {n} from {ServerName}.` to every session every
/// `HeartbeatEvery` communication ticks.
pub struct HeartbeatHandler {
    registry: Weak<Registry>,
}

impl HeartbeatHandler {
    pub fn new(registry: Weak<Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl TickHandler for HeartbeatHandler {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn on_tick(&self, tick: u64) -> Result<(), SchedulerError> {
        let Some(registry) = self.registry.upgrade() else {
            return Ok(());
        };
        if !registry.state.is_running() {
            return Ok(());
        }

        let every = registry.settings.heartbeat_every.max(1);
        if tick % every != 0 {
            return Ok(());
        }

        let line: Arc<str> =
            ServerMessage::heartbeat(tick, registry.settings.server_name.as_str())
                .to_string()
                .into();
        let sessions = registry.snapshot();
        debug!(tick, sessions = sessions.len(), "Sending heartbeat");

        let mut sends = JoinSet::new();
        for session in sessions {
            let line = Arc::clone(&line);
            sends.spawn(async move { session.send(&line).await });
        }
        while let Some(joined) = sends.join_next().await {
            if let Err(e) = joined {
                error!(tick, error = %e, "Heartbeat send task failed");
            }
        }
        Ok(())
    }
}

/// Drains each session's inbound queue and answers it.
pub struct InboundHandler {
    registry: Weak<Registry>,
}

impl InboundHandler {
    pub fn new(registry: Weak<Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl TickHandler for InboundHandler {
    fn name(&self) -> &str {
        "inbound"
    }

    async fn on_tick(&self, tick: u64) -> Result<(), SchedulerError> {
        let Some(registry) = self.registry.upgrade() else {
            return Ok(());
        };
        if !registry.state.is_running() {
            return Ok(());
        }

        for session in registry.snapshot() {
            // A fault in one session's processing must not reach the others.
            let drained = tokio::spawn({
                let session = Arc::clone(&session);
                async move { drain_inbound(&session).await }
            })
            .await;

            if let Err(e) = drained {
                error!(
                    tick,
                    session = %session.id(),
                    name = %session.name(),
                    error = %e,
                    "Failed to process inbound lines, disconnecting"
                );
                session.disconnect().await;
            }
        }
        Ok(())
    }
}

/// Processes every queued line of `session` in arrival order.
///
/// `quit` disconnects the session and leaves the rest of its queue unread.
/// Every other non-blank line is echoed back, whatever bytes it carries.
pub async fn drain_inbound(session: &Session) {
    while let Some(line) = session.try_dequeue() {
        match ClientCommand::parse(&line) {
            ClientCommand::Blank => continue,
            ClientCommand::Quit => {
                info!(session = %session.id(), name = %session.name(), "Client quit");
                session.disconnect().await;
                break;
            }
            ClientCommand::Text(text) => {
                session.send(&ServerMessage::echo(text).to_string()).await;
            }
        }

        if session.is_disconnecting() {
            break;
        }
    }
}
