//! Watch-mode reconciler.
//!
//! One `Reconciler` owns one resource for the lifetime of the agent. It
//! blocks on the backend watch, syncs whenever the watch reports a newer
//! index, and backs off for a fixed delay after a failed watch. Errors are
//! published to the coordinator and never end the loop; only coordinated
//! shutdown (or a backend that cannot watch at all) does.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::resource::Resource;
use crate::scheduler::{ErrorReport, ErrorReporter, ShutdownSignals};
use crate::sync::SyncPipeline;

/// Delay between a failed watch and the next attempt.
pub const WATCH_BACKOFF: Duration = Duration::from_secs(1);

/// Where a reconciler is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcilerState {
    /// Blocked on the backend watch.
    Waiting,
    /// Running the sync pipeline.
    Syncing,
    /// Sleeping after a failed watch.
    Backoff,
}

/// Keeps one resource in sync with the backend.
#[derive(Debug)]
pub struct Reconciler {
    resource: Resource,
    pipeline: SyncPipeline,
    reporter: ErrorReporter,
    signals: ShutdownSignals,
    backoff: Duration,
    state: ReconcilerState,
}

impl Reconciler {
    /// Creates a reconciler for `resource`.
    #[must_use]
    pub fn new(
        resource: Resource,
        pipeline: SyncPipeline,
        reporter: ErrorReporter,
        signals: ShutdownSignals,
    ) -> Self {
        Self {
            resource,
            pipeline,
            reporter,
            signals,
            backoff: WATCH_BACKOFF,
            state: ReconcilerState::Waiting,
        }
    }

    /// Sets the delay after a failed watch.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs until shutdown. Returns the resource so callers can inspect
    /// its final cursor and snapshot.
    pub async fn run(mut self) -> Resource {
        let id = self.resource.id();
        let keys = self.resource.prefixed_keys();
        info!("Watching {id}");

        while !self.signals.is_done() {
            self.enter(&id, ReconcilerState::Waiting);

            let watched = self
                .pipeline
                .client()
                .watch_prefix(
                    &self.resource.prefix,
                    &keys,
                    self.resource.cursor(),
                    self.signals.stop(),
                )
                .await;

            if self.signals.is_done() {
                break;
            }

            match watched {
                Ok(index) => {
                    if !self.resource.advance_cursor(index) {
                        debug!("{id}: no change at index {index}");
                        continue;
                    }
                    self.sync(&id).await;
                }
                Err(e) if !e.is_retryable() => {
                    error!("{id}: {e}, giving up");
                    self.reporter.report(ErrorReport::from_backend(&id, &e));
                    break;
                }
                Err(e) => {
                    warn!("{id}: watch failed: {e}");
                    self.reporter.report(ErrorReport::from_backend(&id, &e));

                    self.enter(&id, ReconcilerState::Backoff);
                    tokio::select! {
                        () = self.signals.done().cancelled() => break,
                        () = tokio::time::sleep(self.backoff) => {}
                    }
                }
            }
        }

        info!("Stopped watching {id}");
        self.resource
    }

    fn enter(&mut self, id: &str, state: ReconcilerState) {
        if self.state != state {
            trace!("{id}: {:?} -> {state:?}", self.state);
            self.state = state;
        }
    }

    async fn sync(&mut self, id: &str) {
        self.enter(id, ReconcilerState::Syncing);
        debug!("{id}: change at index {}", self.resource.cursor());

        match self.pipeline.run(&mut self.resource).await {
            Ok(outcome) => debug!("{id}: {outcome}"),
            Err(e) => {
                error!("{e}");
                self.reporter.report(ErrorReport::from_sync(&e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use tempfile::TempDir;
    use tokio::time::Instant;

    use super::*;
    use crate::backend::{MemoryStore, MockStoreClient, StoreClient};
    use crate::error::{BackendError, ErrorKind};
    use crate::scheduler::ErrorReceiver;

    fn resource(dir: &Path, name: &str) -> Resource {
        let src = dir.join(format!("{name}.tmpl"));
        std::fs::write(&src, "host={{ getv(\"/db/host\") }}\n").expect("write template");
        Resource::new(src, dir.join(name), "/app", vec![String::from("/db")])
    }

    async fn wait_for_contents(path: &Path, expected: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if std::fs::read_to_string(path).ok().as_deref() == Some(expected) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("destination never reached expected contents");
    }

    fn channel() -> (ErrorReporter, ErrorReceiver) {
        ErrorReporter::channel(16)
    }

    #[tokio::test]
    async fn test_change_triggers_sync() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(MemoryStore::with_values([("/app/db/host", "10.0.0.1")]).await);
        let client: Arc<dyn StoreClient> = store.clone();
        let (reporter, mut receiver) = channel();
        let signals = ShutdownSignals::new();

        let resource = resource(dir.path(), "app.conf");
        let dest = resource.dest.clone();
        let unit = Reconciler::new(resource, SyncPipeline::new(client), reporter, signals.clone());
        let handle = tokio::spawn(unit.run());

        wait_for_contents(&dest, "host=10.0.0.1\n").await;
        store.set("/app/db/host", "10.0.0.2").await;
        wait_for_contents(&dest, "host=10.0.0.2\n").await;

        signals.shutdown();
        let resource = handle.await.expect("reconciler panicked");
        assert_eq!(resource.snapshot().value("/db/host"), Some("10.0.0.2"));
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unsupported_watch_reports_once_and_exits() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut mock = MockStoreClient::new();
        mock.expect_watch_prefix()
            .times(1)
            .returning(|_, _, _, _| Err(BackendError::unsupported("mock", "watch_prefix")));
        mock.expect_backend_type().return_const("mock");

        let (reporter, mut receiver) = channel();
        let unit = Reconciler::new(
            resource(dir.path(), "app.conf"),
            SyncPipeline::new(Arc::new(mock)),
            reporter,
            ShutdownSignals::new(),
        );

        let resource = tokio::time::timeout(Duration::from_secs(5), unit.run())
            .await
            .expect("reconciler did not exit");

        assert_eq!(resource.cursor(), 0);
        let report = receiver.try_recv().expect("report");
        assert_eq!(report.kind, ErrorKind::Unsupported);
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_failing_watch_does_not_delay_other_resources() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        let mut failing = MockStoreClient::new();
        failing
            .expect_watch_prefix()
            .returning(|_, _, _, _| Err(BackendError::connection("mock", "connection refused")));
        failing.expect_backend_type().return_const("mock");

        let healthy: Arc<dyn StoreClient> =
            Arc::new(MemoryStore::with_values([("/app/db/host", "10.0.0.1")]).await);

        let (reporter, mut receiver) = channel();
        let signals = ShutdownSignals::new();

        let broken = Reconciler::new(
            resource(dir.path(), "broken.conf"),
            SyncPipeline::new(Arc::new(failing)),
            reporter.clone(),
            signals.clone(),
        )
        .with_backoff(Duration::from_millis(20));
        let working = resource(dir.path(), "working.conf");
        let working_dest = working.dest.clone();
        let working = Reconciler::new(working, SyncPipeline::new(healthy), reporter, signals.clone());

        let broken = tokio::spawn(broken.run());
        let working = tokio::spawn(working.run());

        wait_for_contents(&working_dest, "host=10.0.0.1\n").await;
        let first = receiver.recv().await.expect("report");
        let second = receiver.recv().await.expect("report");
        assert_eq!(first.kind, ErrorKind::Backend);
        assert_eq!(second.kind, ErrorKind::Backend);
        assert!(first.message.starts_with("broken.conf.tmpl =>"));

        signals.shutdown();
        let broken = broken.await.expect("reconciler panicked");
        working.await.expect("reconciler panicked");
        assert_eq!(broken.cursor(), 0);
        assert!(!dir.path().join("broken.conf").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_watches_are_spaced_by_backoff() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let calls: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));

        let mut failing = MockStoreClient::new();
        let recorded = Arc::clone(&calls);
        failing.expect_watch_prefix().returning(move |_, _, _, _| {
            recorded.lock().expect("lock").push(Instant::now());
            Err(BackendError::connection("mock", "connection refused"))
        });
        failing.expect_backend_type().return_const("mock");

        let (reporter, _receiver) = channel();
        let signals = ShutdownSignals::new();
        let unit = Reconciler::new(
            resource(dir.path(), "app.conf"),
            SyncPipeline::new(Arc::new(failing)),
            reporter,
            signals.clone(),
        );
        let handle = tokio::spawn(unit.run());

        while calls.lock().expect("lock").len() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        signals.shutdown();
        handle.await.expect("reconciler panicked");

        let calls = calls.lock().expect("lock");
        for pair in calls.windows(2) {
            assert!(pair[1] - pair[0] >= WATCH_BACKOFF, "retried after {:?}", pair[1] - pair[0]);
        }
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_blocked_watch() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let client: Arc<dyn StoreClient> = Arc::new(
            MemoryStore::with_values([("/app/db/host", "10.0.0.1")])
                .await
                .with_watch_timeout(Duration::from_secs(3600)),
        );
        let (reporter, _receiver) = channel();
        let signals = ShutdownSignals::new();

        let resource = resource(dir.path(), "app.conf");
        let dest = resource.dest.clone();
        let unit = Reconciler::new(resource, SyncPipeline::new(client), reporter, signals.clone());
        let handle = tokio::spawn(unit.run());

        wait_for_contents(&dest, "host=10.0.0.1\n").await;
        signals.shutdown();

        let resource = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reconciler did not stop")
            .expect("reconciler panicked");
        assert!(resource.cursor() > 0);
    }

    #[test]
    fn test_new_reconciler_is_waiting() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (reporter, _receiver) = channel();
        let unit = Reconciler::new(
            resource(dir.path(), "app.conf"),
            SyncPipeline::new(Arc::new(MemoryStore::new())),
            reporter,
            ShutdownSignals::new(),
        );

        assert_eq!(unit.state, ReconcilerState::Waiting);
        assert_eq!(unit.resource.cursor(), 0);
    }
}
