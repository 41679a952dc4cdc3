//! Error reports from reconciliation units.
//!
//! Units publish into a bounded broadcast channel and never block on it.
//! When the coordinator falls behind, the oldest reports are dropped and
//! the coordinator is told how many it missed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::error::{BackendError, ErrorKind, SyncError};

/// One error raised by a reconciliation unit.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    /// Identity of the resource, if the error belongs to one.
    pub resource: Option<String>,
    /// Error classification.
    pub kind: ErrorKind,
    /// Rendered error message, naming the resource when there is one.
    pub message: String,
    /// When the error was reported.
    pub reported_at: DateTime<Utc>,
}

impl ErrorReport {
    /// Creates a report.
    #[must_use]
    pub fn new(resource: Option<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            resource,
            kind,
            message: message.into(),
            reported_at: Utc::now(),
        }
    }

    /// Creates a report for a failed sync.
    #[must_use]
    pub fn from_sync(error: &SyncError) -> Self {
        Self::new(Some(error.resource().to_string()), error.kind(), error.to_string())
    }

    /// Creates a report for a failed watch.
    #[must_use]
    pub fn from_backend(resource: &str, error: &BackendError) -> Self {
        Self::new(
            Some(resource.to_string()),
            error.kind(),
            format!("{resource}: {error}"),
        )
    }
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Sending half of the error channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    sender: broadcast::Sender<ErrorReport>,
}

/// Receiving half of the error channel.
#[derive(Debug)]
pub struct ErrorReceiver {
    receiver: broadcast::Receiver<ErrorReport>,
    dropped: u64,
}

impl ErrorReporter {
    /// Creates a channel holding at most `capacity` unread reports.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, ErrorReceiver) {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        (
            Self { sender },
            ErrorReceiver {
                receiver,
                dropped: 0,
            },
        )
    }

    /// Publishes a report. Never blocks; a report sent with no receiver
    /// left is discarded.
    pub fn report(&self, report: ErrorReport) {
        // Only fails when the receiver is gone, which happens at shutdown.
        let _ = self.sender.send(report);
    }
}

impl ErrorReceiver {
    /// Waits for the next report. Returns `None` once every reporter is gone.
    pub async fn recv(&mut self) -> Option<ErrorReport> {
        loop {
            match self.receiver.recv().await {
                Ok(report) => return Some(report),
                Err(RecvError::Lagged(missed)) => {
                    warn!("Error channel full, dropped {missed} oldest report(s)");
                    self.dropped += missed;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next report if one is ready.
    pub fn try_recv(&mut self) -> Option<ErrorReport> {
        use broadcast::error::TryRecvError;

        loop {
            match self.receiver.try_recv() {
                Ok(report) => return Some(report),
                Err(TryRecvError::Lagged(missed)) => {
                    warn!("Error channel full, dropped {missed} oldest report(s)");
                    self.dropped += missed;
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Number of reports dropped so far because the channel was full.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(n: usize) -> ErrorReport {
        ErrorReport::new(Some(format!("r{n}")), ErrorKind::Backend, "down")
    }

    #[tokio::test]
    async fn test_full_channel_drops_oldest() {
        let (reporter, mut receiver) = ErrorReporter::channel(2);

        for n in 0..5 {
            reporter.report(report(n));
        }

        let first = receiver.recv().await.expect("report");
        let second = receiver.recv().await.expect("report");
        assert_eq!(first.resource.as_deref(), Some("r3"));
        assert_eq!(second.resource.as_deref(), Some("r4"));
        assert_eq!(receiver.dropped(), 3);
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_closed_channel_ends_receiver() {
        let (reporter, mut receiver) = ErrorReporter::channel(4);
        reporter.report(report(1));
        drop(reporter);

        assert!(receiver.recv().await.is_some());
        assert!(receiver.recv().await.is_none());
    }

    #[test]
    fn test_report_from_sync_error() {
        let err = SyncError::Render {
            resource: String::from("a.tmpl => /etc/a"),
            message: String::from("undefined value"),
        };
        let report = ErrorReport::from_sync(&err);

        assert_eq!(report.kind, ErrorKind::Render);
        assert!(report.to_string().starts_with("[render] a.tmpl => /etc/a:"));
    }
}
