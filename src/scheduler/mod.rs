//! Reconciliation scheduling.
//!
//! This module provides:
//! - The interval, one-shot and watch scheduling modes
//! - The coordinator owning shutdown and the error channel
//! - Shutdown tokens and OS signal handling

mod coordinator;
mod reporter;
mod signals;

pub use coordinator::{run_pass, Coordinator, PassSummary, Scheduler};
pub use reporter::{ErrorReceiver, ErrorReport, ErrorReporter};
pub use signals::{ShutdownSignal, ShutdownSignals, SignalListener};
