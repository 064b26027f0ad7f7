//! Composition root: builds and wires the long-lived components.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use conductor_core::Settings;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::lifecycle::{CoreProcess, ProcessState};
use crate::registry::Registry;
use crate::server::Listener;

/// A complete server: registry plus listener under one root scope.
pub struct Conductor {
    settings: Settings,
    root: CancellationToken,
    registry: Arc<Registry>,
    listener: Listener,
}

impl Conductor {
    pub fn new(settings: Settings) -> Self {
        let root = CancellationToken::new();
        let registry = Registry::new(settings.clone(), &root);
        let listener = Listener::new(settings.clone(), Arc::clone(&registry), &root);

        Self {
            settings,
            root,
            registry,
            listener,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The listener's bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Starts the registry, then the listener.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::NotRunning` naming the first component that
    /// failed to come up. Anything already started is stopped again.
    pub async fn start(&self) -> Result<(), ServerError> {
        self.registry.request_start().await;
        if self.registry.state() != ProcessState::Running {
            return Err(ServerError::NotRunning {
                process: self.registry.name().to_string(),
            });
        }

        self.listener.request_start().await;
        if self.listener.state() != ProcessState::Running {
            self.registry.request_stop().await;
            return Err(ServerError::NotRunning {
                process: self.listener.name().to_string(),
            });
        }

        info!(
            server = %self.settings.server_name,
            address = ?self.local_addr(),
            "Conductor started"
        );
        Ok(())
    }

    /// Stops the listener, then the registry, then cancels the root scope.
    pub async fn shutdown(&self) {
        self.listener.request_stop().await;
        self.registry.request_stop().await;
        self.root.cancel();
        info!(server = %self.settings.server_name, "Conductor stopped");
    }

    /// Starts, waits for `shutdown_signal`, then shuts down.
    pub async fn run<F>(&self, shutdown_signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown_signal.await;
        self.shutdown().await;
        Ok(())
    }
}

/// Errors from starting the composed server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{process} did not reach the running state")]
    NotRunning { process: String },
}
