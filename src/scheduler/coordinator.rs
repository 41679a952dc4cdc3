//! Scheduling modes and the coordinator that owns them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backend::StoreClient;
use crate::config::{AgentConfig, ScheduleMode};
use crate::error::{ConfigError, ConfweaveError, Result, SyncError};
use crate::reconciler::Reconciler;
use crate::resource::Resource;
use crate::sync::{SyncOutcome, SyncPipeline};

use super::reporter::{ErrorReceiver, ErrorReport, ErrorReporter};
use super::signals::{ShutdownSignals, SignalListener};

/// Result of one sequential pass over the resources.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassSummary {
    /// Destinations replaced.
    pub applied: usize,
    /// Destinations already in sync.
    pub unchanged: usize,
    /// Destinations left alone by no-op mode.
    pub dry_run: usize,
    /// Resources whose sync failed.
    pub failed: usize,
    /// One report per failure.
    pub failures: Vec<ErrorReport>,
}

impl PassSummary {
    /// Records the result of one pipeline execution.
    pub fn record(&mut self, result: &std::result::Result<SyncOutcome, SyncError>) {
        match result {
            Ok(SyncOutcome::Applied { .. }) => self.applied += 1,
            Ok(SyncOutcome::Unchanged) => self.unchanged += 1,
            Ok(SyncOutcome::DryRun) => self.dry_run += 1,
            Err(e) => {
                self.failed += 1;
                self.failures.push(ErrorReport::from_sync(e));
            }
        }
    }

    /// Number of resources visited.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.applied + self.unchanged + self.dry_run + self.failed
    }

    /// Returns true if no resource failed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.failed == 0
    }
}

impl std::fmt::Display for PassSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} applied, {} unchanged, {} dry-run, {} failed",
            self.applied, self.unchanged, self.dry_run, self.failed
        )
    }
}

/// Runs the resources in the configured mode.
#[derive(Debug)]
pub struct Scheduler {
    mode: ScheduleMode,
    interval: Duration,
    pipeline: SyncPipeline,
    resources: Vec<Resource>,
    reporter: ErrorReporter,
    signals: ShutdownSignals,
}

impl Scheduler {
    /// Creates a scheduler.
    ///
    /// # Errors
    ///
    /// Returns an error if watch mode is requested for a backend that
    /// cannot watch.
    pub fn new(
        mode: ScheduleMode,
        interval: Duration,
        pipeline: SyncPipeline,
        resources: Vec<Resource>,
        reporter: ErrorReporter,
        signals: ShutdownSignals,
    ) -> Result<Self> {
        if mode == ScheduleMode::Watch && !pipeline.client().supports_watch() {
            return Err(ConfigError::WatchUnsupported {
                backend: pipeline.client().backend_type(),
            }
            .into());
        }

        Ok(Self {
            mode,
            interval,
            pipeline,
            resources,
            reporter,
            signals,
        })
    }

    /// Returns the scheduling mode.
    #[must_use]
    pub const fn mode(&self) -> ScheduleMode {
        self.mode
    }

    /// Runs until shutdown, or after one pass in one-shot mode.
    ///
    /// Returns the last pass summary; watch mode has none.
    pub async fn run(self) -> Option<PassSummary> {
        if self.resources.is_empty() {
            warn!("No template resources loaded");
        }
        info!("Starting {} mode with {} resource(s)", self.mode, self.resources.len());

        match self.mode {
            ScheduleMode::Onetime => {
                let mut resources = self.resources;
                Some(run_pass(&self.pipeline, &mut resources, &self.reporter, &self.signals).await)
            }
            ScheduleMode::Interval => Some(self.run_interval().await),
            ScheduleMode::Watch => {
                self.run_watch().await;
                None
            }
        }
    }

    async fn run_interval(self) -> PassSummary {
        let Self {
            interval,
            pipeline,
            mut resources,
            reporter,
            signals,
            ..
        } = self;

        loop {
            let summary = run_pass(&pipeline, &mut resources, &reporter, &signals).await;
            info!("Pass finished: {summary}");

            tokio::select! {
                () = signals.done().cancelled() => return summary,
                () = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn run_watch(self) {
        let mut units = JoinSet::new();
        for resource in self.resources {
            let unit = Reconciler::new(
                resource,
                self.pipeline.clone(),
                self.reporter.clone(),
                self.signals.clone(),
            );
            units.spawn(unit.run());
        }

        while let Some(joined) = units.join_next().await {
            match joined {
                Ok(resource) => debug!("Reconciler for {} exited", resource.id()),
                Err(e) => error!("Reconciler task failed: {e}"),
            }
        }
    }
}

/// Syncs every resource once, in order. A failure is reported and the
/// pass moves on to the next resource.
pub async fn run_pass(
    pipeline: &SyncPipeline,
    resources: &mut [Resource],
    reporter: &ErrorReporter,
    signals: &ShutdownSignals,
) -> PassSummary {
    let mut summary = PassSummary::default();

    for resource in resources.iter_mut() {
        if signals.is_done() {
            break;
        }

        let result = pipeline.run(resource).await;
        match &result {
            Ok(outcome) => debug!("{}: {outcome}", resource.id()),
            Err(e) => reporter.report(ErrorReport::from_sync(e)),
        }
        summary.record(&result);
    }

    summary
}

/// Owns the scheduler task, the error channel and shutdown.
#[derive(Debug)]
pub struct Coordinator {
    scheduler: Scheduler,
    receiver: ErrorReceiver,
    signals: ShutdownSignals,
}

impl Coordinator {
    /// Creates a coordinator for the loaded resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler refuses the configured mode.
    pub fn new(
        config: &AgentConfig,
        client: Arc<dyn StoreClient>,
        resources: Vec<Resource>,
    ) -> Result<Self> {
        let (reporter, receiver) = ErrorReporter::channel(config.error_buffer);
        let signals = ShutdownSignals::new();
        let scheduler = Scheduler::new(
            config.mode,
            config.interval(),
            SyncPipeline::new(client),
            resources,
            reporter,
            signals.clone(),
        )?;

        Ok(Self {
            scheduler,
            receiver,
            signals,
        })
    }

    /// Returns the shutdown tokens.
    #[must_use]
    pub const fn signals(&self) -> &ShutdownSignals {
        &self.signals
    }

    /// Runs until SIGINT or SIGTERM, or until a one-shot pass finishes.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal handlers cannot be installed or the
    /// scheduler task fails.
    pub async fn run(self) -> Result<Option<PassSummary>> {
        let mut listener = SignalListener::install()?;
        self.run_until(async move {
            listener.recv().await;
        })
        .await
    }

    /// Runs until `shutdown` completes, or until a one-shot pass finishes.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler task fails.
    pub async fn run_until<F>(self, shutdown: F) -> Result<Option<PassSummary>>
    where
        F: Future<Output = ()> + Send,
    {
        let Self {
            scheduler,
            mut receiver,
            signals,
        } = self;

        let mut task = tokio::spawn(scheduler.run());
        tokio::pin!(shutdown);
        let mut shutting_down = false;

        let joined = loop {
            tokio::select! {
                joined = &mut task => break joined,
                () = &mut shutdown, if !shutting_down => {
                    info!("Shutting down");
                    signals.shutdown();
                    shutting_down = true;
                }
                Some(report) = receiver.recv() => error!("{report}"),
            }
        };

        while let Some(report) = receiver.try_recv() {
            error!("{report}");
        }
        if receiver.dropped() > 0 {
            warn!("{} error report(s) were dropped", receiver.dropped());
        }

        joined.map_err(|e| ConfweaveError::internal(format!("scheduler task failed: {e}")))
    }
}
