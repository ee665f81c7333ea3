//! Shutdown signal handling.
//!
//! On Unix the gateway stops on SIGTERM or SIGINT, on Windows on Ctrl+C.
//! Both the HTTP server and any background work watch the same
//! [`CancellationToken`].

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Cancels a token when the process is asked to stop.
#[allow(missing_debug_implementations)] // TaskTracker doesn't impl Debug
pub struct ShutdownSignal {
    listener: TaskTracker,
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Installs the signal listeners.
    ///
    /// # Errors
    ///
    /// Returns an [`std::io::Error`] if signal registration fails.
    #[allow(clippy::unnecessary_wraps)] // Result needed on Unix for signal registration
    pub fn install() -> Result<Self, std::io::Error> {
        let token = CancellationToken::new();
        let listener = TaskTracker::new();

        #[cfg(unix)]
        {
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            let cancel = token.clone();
            listener.spawn(async move {
                let name = tokio::select! {
                    _ = sigterm.recv() => "SIGTERM",
                    _ = sigint.recv() => "SIGINT",
                };
                tracing::info!(signal = name, "Shutdown requested");
                cancel.cancel();
            });
        }

        #[cfg(windows)]
        {
            let cancel = token.clone();
            listener.spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!(signal = "ctrl-c", "Shutdown requested");
                cancel.cancel();
            });
        }

        listener.close();
        Ok(Self { listener, token })
    }

    /// A token cancelled on shutdown.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Waits until shutdown was requested and the listener task has ended.
    pub async fn wait(&self) {
        self.token.cancelled().await;
        self.listener.wait().await;
    }
}
