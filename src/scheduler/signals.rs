//! Shutdown signals shared by every reconciliation unit.
//!
//! Two tokens drive shutdown. `stop` interrupts watches that are blocked
//! on the backend; `done` tells every unit to exit at its next loop check.
//! A sync cycle that is already running is never interrupted.

use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// OS signal that started a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM received.
    Sigterm,
    /// SIGINT received (Ctrl+C).
    Sigint,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sigterm => write!(f, "SIGTERM"),
            Self::Sigint => write!(f, "SIGINT"),
        }
    }
}

/// The stop and done tokens.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignals {
    stop: CancellationToken,
    done: CancellationToken,
}

impl ShutdownSignals {
    /// Creates a fresh pair of tokens.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token observed by blocking watch calls.
    #[must_use]
    pub const fn stop(&self) -> &CancellationToken {
        &self.stop
    }

    /// Token observed at every loop check.
    #[must_use]
    pub const fn done(&self) -> &CancellationToken {
        &self.done
    }

    /// Returns true once shutdown has begun.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Begins shutdown: interrupts watches, then marks every unit done.
    pub fn shutdown(&self) {
        self.stop.cancel();
        self.done.cancel();
    }
}

/// Listens for SIGINT and SIGTERM.
#[derive(Debug)]
pub struct SignalListener {
    sigterm: Signal,
    sigint: Signal,
}

impl SignalListener {
    /// Installs the signal handlers.
    ///
    /// # Errors
    ///
    /// Returns an error if the handlers cannot be installed.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    /// Waits for the next signal.
    pub async fn recv(&mut self) -> ShutdownSignal {
        let received = tokio::select! {
            _ = self.sigterm.recv() => ShutdownSignal::Sigterm,
            _ = self.sigint.recv() => ShutdownSignal::Sigint,
        };

        info!("Received {received}");
        received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_fires_both_tokens() {
        let signals = ShutdownSignals::new();
        let unit = signals.clone();
        assert!(!unit.is_done());

        signals.shutdown();

        assert!(unit.stop().is_cancelled());
        assert!(unit.is_done());
    }

    #[tokio::test]
    async fn test_listener_installs() {
        assert!(SignalListener::install().is_ok());
    }

    #[test]
    fn test_signal_display() {
        assert_eq!(ShutdownSignal::Sigterm.to_string(), "SIGTERM");
        assert_eq!(ShutdownSignal::Sigint.to_string(), "SIGINT");
    }
}
