//! Shutdown signal handling

use std::io;
#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::info;

/// Signals the exporter shuts down on (SIGINT, SIGTERM, or SIGQUIT on Unix)
pub struct ShutdownSignals {
    #[cfg(unix)]
    sigint: Signal,
    #[cfg(unix)]
    sigterm: Signal,
    #[cfg(unix)]
    sigquit: Signal,
}

impl ShutdownSignals {
    /// Register the handlers; must run inside the Tokio runtime
    ///
    /// Signals arriving after this call are held until [`recv`](Self::recv)
    /// is awaited, so install before starting any work.
    #[cfg(unix)]
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigquit: signal(SignalKind::quit())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> io::Result<Self> {
        Ok(Self {})
    }

    /// Wait for the next shutdown signal and return its name
    #[cfg(unix)]
    pub async fn recv(&mut self) -> &'static str {
        let name = tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigquit.recv() => "SIGQUIT",
        };
        info!(signal = name, "Signal received");
        name
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> &'static str {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        info!(signal = "ctrl-c", "Signal received");
        "ctrl-c"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sigterm_triggers_shutdown() {
        let mut signals = ShutdownSignals::install().unwrap();

        let status = Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let name = tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .unwrap();
        assert_eq!(name, "SIGTERM");
    }
}
