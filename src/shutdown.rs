//! Signal-driven graceful shutdown.

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Listens for SIGTERM/SIGINT and flips a cancellation token, letting the
/// HTTP server finish in-flight requests before the process exits.
pub struct Shutdown {
    _listener: TaskTracker,
    token: CancellationToken,
}

impl Shutdown {
    /// Register the signal handlers. Fails only if signal registration is
    /// unavailable.
    pub fn listen() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let token = CancellationToken::new();
        let trigger = token.clone();
        let listener = TaskTracker::new();
        listener.spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => trigger.cancel(),
                _ = sigint.recv() => trigger.cancel(),
            }
        });
        listener.close();
        Ok(Shutdown {
            _listener: listener,
            token,
        })
    }

    /// Token to hand to subsystems that should stop on shutdown.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}
