use std::{fmt::Display, future::Future, time::Duration};

use thiserror::Error;
use tokio::{
    signal,
    sync::{mpsc, watch},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::utils::{AcceptSource, AdmissionGate};

/// Lifecycle of the process as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    /// Terminal.
    Stopped,
}

/// Why shutdown started. Only the first observed cause is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    /// External stop event (SIGINT, SIGTERM or a synthetic source)
    StopRequested,
    /// The server failed to start or stopped serving on its own
    ServerFailed(String),
}

/// Errors reported by the shutdown sequence. None of them are fatal.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ShutdownError {
    #[error("graceful shutdown did not complete within {0:?}")]
    Timeout(Duration),
}

/// Outcome of [`ShutdownCoordinator::run`].
#[derive(Debug)]
pub struct ShutdownReport {
    pub cause: ShutdownCause,
    pub error: Option<ShutdownError>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.cause == ShutdownCause::StopRequested && self.error.is_none()
    }
}

/// Races an external stop event against a fatal server error and drives a
/// bounded graceful close of the server and the admission gate.
pub struct ShutdownCoordinator {
    state_tx: watch::Sender<ShutdownState>,
    /// Cancelled when the server should stop accepting and drain
    serve_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator with the default 5-second close deadline
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(5))
    }

    pub fn with_timeout(shutdown_timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(ShutdownState::Running);
        Self {
            state_tx,
            serve_token: CancellationToken::new(),
            shutdown_timeout,
        }
    }

    /// Token the server loop waits on for its graceful shutdown trigger.
    pub fn serve_token(&self) -> CancellationToken {
        self.serve_token.child_token()
    }

    pub fn state(&self) -> ShutdownState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state_tx.subscribe()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Move from `Running` to `ShuttingDown`. Returns `false` if shutdown had
    /// already started.
    pub fn begin_shutdown(&self, cause: &ShutdownCause) -> bool {
        let started = self.state_tx.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::ShuttingDown;
                true
            } else {
                false
            }
        });

        if started {
            tracing::info!(cause = ?cause, "Shutdown initiated");
        } else {
            tracing::warn!(cause = ?cause, "Shutdown already initiated, ignoring");
        }
        started
    }

    /// Wait until the coordinator has reached `Stopped`.
    pub async fn wait_stopped(&self) {
        let mut receiver = self.subscribe();
        // The sender lives in `self`, so the channel cannot close underneath us.
        let _ = receiver
            .wait_for(|state| *state == ShutdownState::Stopped)
            .await;
    }

    /// Run the shutdown sequence.
    ///
    /// Waits for the first of `stop` or a value on `server_errors`, then
    /// closes `gate`, cancels the serve token and gives `server` at most the
    /// configured deadline to finish draining. The coordinator always ends in
    /// `Stopped`, whether or not the deadline was met.
    pub async fn run<S, E, F, L>(
        &self,
        stop: S,
        mut server_errors: mpsc::Receiver<E>,
        gate: &AdmissionGate<L>,
        server: F,
    ) -> ShutdownReport
    where
        L: AcceptSource,
        S: Future<Output = ()>,
        E: Display,
        F: Future<Output = ()>,
    {
        let cause = tokio::select! {
            _ = stop => {
                tracing::info!("Stop requested, initiating graceful shutdown...");
                ShutdownCause::StopRequested
            }
            Some(err) = server_errors.recv() => {
                tracing::error!(error = %err, "HTTP server error");
                ShutdownCause::ServerFailed(err.to_string())
            }
        };

        if !self.begin_shutdown(&cause) {
            self.wait_stopped().await;
            return ShutdownReport { cause, error: None };
        }

        let drain = async {
            gate.close();
            self.serve_token.cancel();
            server.await;
        };

        let error = match timeout(self.shutdown_timeout, drain).await {
            Ok(()) => {
                tracing::info!("HTTP server shut down successfully");
                None
            }
            Err(_) => {
                let err = ShutdownError::Timeout(self.shutdown_timeout);
                tracing::error!(error = %err, in_use = gate.in_use(), "HTTP server shutdown error");
                Some(err)
            }
        };

        self.state_tx.send_replace(ShutdownState::Stopped);
        tracing::info!("Application stopped");

        ShutdownReport { cause, error }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves on the first SIGINT or SIGTERM (Ctrl+C only on non-Unix).
pub async fn os_stop_signal() {
    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => tracing::info!("Received SIGINT (Ctrl+C)"),
            Err(e) => {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        },
        _ = wait_for_sigterm() => {
            tracing::info!("Received SIGTERM");
        }
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix systems, we only have Ctrl+C
    std::future::pending::<()>().await;
}
